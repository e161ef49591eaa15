//! Error types for causal tree operations.

use thiserror::Error;

use crate::weave::WeaveViolation;

/// Errors that can occur while operating on a causal tree.
///
/// These cover structural problems that indicate a bug or corrupt input.
/// Atoms refused during normal replication are reported on the tree's
/// rejection stream instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TreeError {
    /// A foreign weave failed structural validation before merging.
    #[error("Invalid weave at atom {index}: {reason}")]
    InvalidWeave {
        /// Position of the offending atom
        index: usize,
        /// What is wrong with it
        reason: &'static str,
    },

    /// No reducer is registered for a tree type.
    #[error("Unknown tree type: {tree_type}")]
    UnknownTreeType {
        /// The requested tree type
        tree_type: String,
    },

    /// A stored tree carried a format version this build cannot read.
    #[error("Unsupported stored tree format version {version}")]
    UnsupportedFormatVersion {
        /// The version found
        version: u32,
    },
}

impl TreeError {
    /// Check if this error indicates a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TreeError::UnknownTreeType { .. })
    }

    /// Check if this error indicates invalid input data.
    pub fn is_validation_error(&self) -> bool {
        matches!(
            self,
            TreeError::InvalidWeave { .. } | TreeError::UnsupportedFormatVersion { .. }
        )
    }
}

impl From<WeaveViolation> for TreeError {
    fn from(violation: WeaveViolation) -> Self {
        TreeError::InvalidWeave {
            index: violation.index,
            reason: violation.reason,
        }
    }
}

impl From<TreeError> for crate::Error {
    fn from(err: TreeError) -> Self {
        crate::Error::Tree(err)
    }
}

impl From<WeaveViolation> for crate::Error {
    fn from(violation: WeaveViolation) -> Self {
        crate::Error::Tree(violation.into())
    }
}
