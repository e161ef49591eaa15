//! Authentication for causal trees.
//!
//! Sites may register a public key; atoms from such sites must then carry a
//! valid signature to be admitted. Verification failures are reported as
//! [`RejectedAtom`]s rather than errors.

pub mod crypto;
pub mod errors;
pub mod validator;

pub use crate::rejection::{RejectedAtom, RejectionReason};
pub use crypto::{Ed25519Crypto, PrivateKey, PublicKey, SignatureAlgorithm, SigningCrypto};
pub use errors::AuthError;
pub use validator::AtomValidator;
