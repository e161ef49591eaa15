//! Error types for causal tree stores.

use thiserror::Error;

/// Errors that can occur while persisting causal trees.
///
/// # Stability
///
/// - New variants may be added in minor versions (enum is `#[non_exhaustive]`)
/// - Helper methods like `is_*()` provide stable APIs
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store was used before `init` was called.
    #[error("Store has not been initialized")]
    NotInitialized,

    /// Serializing the store contents failed.
    #[error("Failed to serialize store: {source}")]
    SerializationFailed {
        /// The underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Deserializing stored contents failed.
    #[error("Failed to deserialize store: {source}")]
    DeserializationFailed {
        /// The underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// Reading or writing the backing file failed.
    #[error("Store file I/O failed: {source}")]
    FileIo {
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    /// Check if the store was used before initialization.
    pub fn is_not_initialized(&self) -> bool {
        matches!(self, StoreError::NotInitialized)
    }

    /// Check if this error came from file I/O.
    pub fn is_io_error(&self) -> bool {
        matches!(self, StoreError::FileIo { .. })
    }

    /// Check if this error came from (de)serialization.
    pub fn is_serialization_error(&self) -> bool {
        matches!(
            self,
            StoreError::SerializationFailed { .. } | StoreError::DeserializationFailed { .. }
        )
    }
}

impl From<StoreError> for crate::Error {
    fn from(err: StoreError) -> Self {
        crate::Error::Store(err)
    }
}
