//! Signing keys and the pluggable signing-crypto contract.
//!
//! `PublicKey` and `PrivateKey` wrap algorithm-specific key types so that the
//! rest of the crate can stay algorithm-agnostic. The [`SigningCrypto`] trait
//! is the seam an [`AtomValidator`](super::AtomValidator) signs and verifies
//! through; [`Ed25519Crypto`] is the implementation shipped with the crate.

use base64ct::{Base64, Encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{ZeroizeOnDrop, Zeroizing};

use super::errors::AuthError;

/// Size of Ed25519 public keys in bytes
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 private keys in bytes
pub const ED25519_PRIVATE_KEY_SIZE: usize = 32;

/// Size of Ed25519 signatures in bytes
pub const ED25519_SIGNATURE_SIZE: usize = 64;

/// A named signature algorithm.
///
/// Sites advertise the algorithm of their public key in their `SiteInfo`, so
/// the name is part of the stored and wire formats.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    /// Ed25519 (RFC 8032)
    Ed25519,
}

impl SignatureAlgorithm {
    /// The algorithm name used as a key prefix (e.g. `"ed25519"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm-agnostic public key for signature verification.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublicKey {
    /// Ed25519 public key (32 bytes)
    Ed25519(VerifyingKey),
}

impl PublicKey {
    /// Verify a signature over the given data.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), AuthError> {
        match self {
            PublicKey::Ed25519(key) => {
                let sig_array: [u8; ED25519_SIGNATURE_SIZE] = signature
                    .try_into()
                    .map_err(|_| AuthError::InvalidSignature)?;
                key.verify(data, &Signature::from_bytes(&sig_array))
                    .map_err(|_| AuthError::InvalidSignature)
            }
        }
    }

    /// Format the public key as a prefixed string (e.g. `"ed25519:base64..."`).
    pub fn to_prefixed_string(&self) -> String {
        match self {
            PublicKey::Ed25519(key) => {
                format!("ed25519:{}", Base64::encode_string(&key.to_bytes()))
            }
        }
    }

    /// Parse a public key from a prefixed string (e.g. `"ed25519:base64..."`).
    pub fn from_prefixed_string(s: &str) -> Result<Self, AuthError> {
        let (algorithm, key_data) = split_prefixed(s)?;
        match algorithm {
            SignatureAlgorithm::Ed25519 => {
                let key_bytes = decode_key(key_data)?;
                let key_array: [u8; ED25519_PUBLIC_KEY_SIZE] = key_bytes.try_into().map_err(
                    |v: Vec<u8>| AuthError::InvalidKeyFormat {
                        reason: format!(
                            "Ed25519 public key must be {ED25519_PUBLIC_KEY_SIZE} bytes, got {}",
                            v.len()
                        ),
                    },
                )?;
                let verifying_key = VerifyingKey::from_bytes(&key_array).map_err(|e| {
                    AuthError::KeyParsingFailed {
                        reason: e.to_string(),
                    }
                })?;
                Ok(PublicKey::Ed25519(verifying_key))
            }
        }
    }

    /// Get the algorithm of this key.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PublicKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_prefixed_string())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_prefixed_string())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_prefixed_string(&s).map_err(serde::de::Error::custom)
    }
}

/// Algorithm-agnostic signing key.
///
/// Secret material is volatile-zeroed on drop via the inner key types'
/// [`ZeroizeOnDrop`] implementations.
#[non_exhaustive]
pub enum PrivateKey {
    /// Ed25519 signing key (32 bytes)
    Ed25519(SigningKey),
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivateKey::Ed25519(_) => f.write_str("PrivateKey::Ed25519([REDACTED])"),
        }
    }
}

impl PrivateKey {
    /// Generate a new Ed25519 key.
    pub fn generate() -> Self {
        PrivateKey::Ed25519(SigningKey::generate(&mut OsRng))
    }

    /// Sign the given data and return the raw signature bytes.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        match self {
            PrivateKey::Ed25519(key) => {
                let signature: Signature = key.sign(data);
                signature.to_bytes().to_vec()
            }
        }
    }

    /// Derive the corresponding public key.
    pub fn public_key(&self) -> PublicKey {
        match self {
            PrivateKey::Ed25519(key) => PublicKey::Ed25519(key.verifying_key()),
        }
    }

    /// Get the algorithm of this key.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self {
            PrivateKey::Ed25519(_) => SignatureAlgorithm::Ed25519,
        }
    }

    /// Format the private key as a prefixed string.
    ///
    /// The returned string is cleared from memory when dropped.
    pub fn to_prefixed_string(&self) -> Zeroizing<String> {
        match self {
            PrivateKey::Ed25519(key) => {
                let bytes = Zeroizing::new(key.to_bytes());
                Zeroizing::new(format!("ed25519:{}", Base64::encode_string(&bytes[..])))
            }
        }
    }

    /// Parse a private key from a prefixed string (e.g. `"ed25519:base64..."`).
    pub fn from_prefixed_string(s: &str) -> Result<Self, AuthError> {
        let (algorithm, key_data) = split_prefixed(s)?;
        match algorithm {
            SignatureAlgorithm::Ed25519 => {
                let key_bytes = Zeroizing::new(decode_key(key_data)?);
                let key_array: [u8; ED25519_PRIVATE_KEY_SIZE] = key_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| AuthError::InvalidKeyFormat {
                        reason: format!(
                            "Ed25519 private key must be {ED25519_PRIVATE_KEY_SIZE} bytes, got {}",
                            key_bytes.len()
                        ),
                    })?;
                Ok(PrivateKey::Ed25519(SigningKey::from_bytes(&key_array)))
            }
        }
    }
}

/// **Invariant:** all inner key types must implement [`ZeroizeOnDrop`].
impl ZeroizeOnDrop for PrivateKey {}

impl Serialize for PrivateKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_prefixed_string())
    }
}

impl<'de> Deserialize<'de> for PrivateKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = Zeroizing::new(String::deserialize(deserializer)?);
        PrivateKey::from_prefixed_string(&s).map_err(serde::de::Error::custom)
    }
}

fn split_prefixed(s: &str) -> Result<(SignatureAlgorithm, &str), AuthError> {
    let (prefix, key_data) = s
        .split_once(':')
        .ok_or_else(|| AuthError::InvalidKeyFormat {
            reason: "Expected 'algorithm:key' format".to_string(),
        })?;
    match prefix {
        "ed25519" => Ok((SignatureAlgorithm::Ed25519, key_data)),
        _ => Err(AuthError::InvalidKeyFormat {
            reason: format!("Unknown key algorithm prefix: '{prefix}'"),
        }),
    }
}

fn decode_key(key_data: &str) -> Result<Vec<u8>, AuthError> {
    Base64::decode_vec(key_data).map_err(|e| AuthError::InvalidKeyFormat {
        reason: format!("Invalid base64 for key: {e}"),
    })
}

/// A pluggable signing implementation for one named algorithm.
///
/// Keys are exchanged between sites in their exported string form, so every
/// implementation must be able to round-trip its own keys through
/// [`export_public_key`](Self::export_public_key) and
/// [`import_public_key`](Self::import_public_key).
pub trait SigningCrypto: Send + Sync + std::fmt::Debug {
    /// The algorithm this implementation signs with.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Sign `data`, returning the raw signature bytes.
    fn sign(&self, key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>, AuthError>;

    /// Verify a raw signature over `data`.
    fn verify(&self, key: &PublicKey, signature: &[u8], data: &[u8]) -> bool;

    /// Verify many `(signature, data)` pairs against one key.
    fn verify_batch(&self, key: &PublicKey, items: &[(&[u8], &[u8])]) -> Vec<bool> {
        items
            .iter()
            .map(|(signature, data)| self.verify(key, signature, data))
            .collect()
    }

    /// Export a public key to its string form.
    fn export_public_key(&self, key: &PublicKey) -> String;

    /// Export a private key to its string form.
    fn export_private_key(&self, key: &PrivateKey) -> Zeroizing<String>;

    /// Import a public key from its string form.
    fn import_public_key(&self, key: &str) -> Result<PublicKey, AuthError>;

    /// Import a private key from its string form.
    fn import_private_key(&self, key: &str) -> Result<PrivateKey, AuthError>;

    /// Generate a fresh key pair.
    fn generate_key_pair(&self) -> (PublicKey, PrivateKey);
}

/// [`SigningCrypto`] backed by `ed25519-dalek`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Crypto;

impl Ed25519Crypto {
    fn check_public(key: &PublicKey) -> Result<(), AuthError> {
        match key.algorithm() {
            SignatureAlgorithm::Ed25519 => Ok(()),
        }
    }

    fn check_private(key: &PrivateKey) -> Result<(), AuthError> {
        match key.algorithm() {
            SignatureAlgorithm::Ed25519 => Ok(()),
        }
    }
}

impl SigningCrypto for Ed25519Crypto {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn sign(&self, key: &PrivateKey, data: &[u8]) -> Result<Vec<u8>, AuthError> {
        Self::check_private(key)?;
        Ok(key.sign(data))
    }

    fn verify(&self, key: &PublicKey, signature: &[u8], data: &[u8]) -> bool {
        Self::check_public(key).is_ok() && key.verify(data, signature).is_ok()
    }

    fn export_public_key(&self, key: &PublicKey) -> String {
        key.to_prefixed_string()
    }

    fn export_private_key(&self, key: &PrivateKey) -> Zeroizing<String> {
        key.to_prefixed_string()
    }

    fn import_public_key(&self, key: &str) -> Result<PublicKey, AuthError> {
        let key = PublicKey::from_prefixed_string(key)?;
        Self::check_public(&key)?;
        Ok(key)
    }

    fn import_private_key(&self, key: &str) -> Result<PrivateKey, AuthError> {
        let key = PrivateKey::from_prefixed_string(key)?;
        Self::check_private(&key)?;
        Ok(key)
    }

    fn generate_key_pair(&self) -> (PublicKey, PrivateKey) {
        let private = PrivateKey::generate();
        (private.public_key(), private)
    }
}
