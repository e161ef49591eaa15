//! Error types for atom signing and key handling.

use thiserror::Error as ThisError;

/// Errors that can occur while handling signing keys.
///
/// Signature *verification* failures are not errors: they become
/// `signature_failed` rejections on the tree.
#[non_exhaustive]
#[derive(Debug, ThisError)]
pub enum AuthError {
    /// Invalid key format or encoding.
    #[error("Invalid key format: {reason}")]
    InvalidKeyFormat {
        /// Description of why the key format is invalid
        reason: String,
    },

    /// Key parsing failed in the cryptographic library.
    #[error("Key parsing failed: {reason}")]
    KeyParsingFailed {
        /// Description of the parsing failure
        reason: String,
    },

    /// The key belongs to an algorithm this crypto implementation does not handle.
    #[error("Unsupported signature algorithm: {algorithm}")]
    UnsupportedAlgorithm {
        /// The algorithm that was requested
        algorithm: String,
    },

    /// Signature bytes were malformed.
    #[error("Invalid signature")]
    InvalidSignature,
}

impl AuthError {
    /// Check if this error is about a malformed or unparseable key.
    pub fn is_key_error(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidKeyFormat { .. } | AuthError::KeyParsingFailed { .. }
        )
    }

    /// Check if this error is about an algorithm mismatch.
    pub fn is_unsupported_algorithm(&self) -> bool {
        matches!(self, AuthError::UnsupportedAlgorithm { .. })
    }
}

impl From<AuthError> for crate::Error {
    fn from(err: AuthError) -> Self {
        crate::Error::Auth(err)
    }
}
