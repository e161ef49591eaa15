//! Signing and verification of atoms.

use std::sync::Arc;

use base64ct::{Base64, Encoding};
use serde::Serialize;
use tracing::trace;

use super::crypto::{Ed25519Crypto, PrivateKey, PublicKey, SigningCrypto};
use crate::{Result, atom::Atom};

/// Signs and verifies atoms through a [`SigningCrypto`] implementation.
///
/// Signatures cover the same canonical bytes as the atom checksum, so a
/// signature also vouches for the atom's id, cause, and value.
#[derive(Clone, Debug)]
pub struct AtomValidator {
    crypto: Arc<dyn SigningCrypto>,
}

impl Default for AtomValidator {
    fn default() -> Self {
        Self::ed25519()
    }
}

impl AtomValidator {
    /// Creates a validator using the given crypto implementation.
    pub fn new(crypto: Arc<dyn SigningCrypto>) -> Self {
        Self { crypto }
    }

    /// Creates a validator using [`Ed25519Crypto`].
    pub fn ed25519() -> Self {
        Self::new(Arc::new(Ed25519Crypto))
    }

    /// The underlying crypto implementation.
    pub fn crypto(&self) -> &dyn SigningCrypto {
        self.crypto.as_ref()
    }

    /// Returns a copy of `atom` carrying a base64 signature made with `key`.
    pub fn sign<Op: Serialize>(&self, key: &PrivateKey, atom: Atom<Op>) -> Result<Atom<Op>> {
        let bytes = atom.signing_bytes()?;
        let signature = self.crypto.sign(key, &bytes)?;
        trace!(atom = %atom.id(), "Signed atom");
        Ok(atom.with_signature(Base64::encode_string(&signature)))
    }

    /// Check an atom's signature against `key`.
    ///
    /// Unsigned atoms, undecodable signatures, and atoms whose content cannot
    /// be serialized all fail verification.
    pub fn verify<Op: Serialize>(&self, key: &PublicKey, atom: &Atom<Op>) -> bool {
        match Self::signed_parts(atom) {
            Some((signature, bytes)) => self.crypto.verify(key, &signature, &bytes),
            None => false,
        }
    }

    /// Verify many atoms against one key. Results are in input order.
    pub fn verify_batch<'a, Op: Serialize + 'a>(
        &self,
        key: &PublicKey,
        atoms: impl IntoIterator<Item = &'a Atom<Op>>,
    ) -> Vec<bool> {
        let parts: Vec<Option<(Vec<u8>, Vec<u8>)>> =
            atoms.into_iter().map(Self::signed_parts).collect();
        let items: Vec<(&[u8], &[u8])> = parts
            .iter()
            .flatten()
            .map(|(signature, bytes)| (signature.as_slice(), bytes.as_slice()))
            .collect();
        let mut verified = self.crypto.verify_batch(key, &items).into_iter();
        parts
            .iter()
            .map(|part| part.is_some() && verified.next().unwrap_or(false))
            .collect()
    }

    fn signed_parts<Op: Serialize>(atom: &Atom<Op>) -> Option<(Vec<u8>, Vec<u8>)> {
        let signature = Base64::decode_vec(atom.signature()?).ok()?;
        let bytes = atom.signing_bytes().ok()?;
        Some((signature, bytes))
    }
}
