//!
//! Causal trees: a replicated, conflict-free operation log.
//!
//! ## Core Concepts
//!
//! * **Atoms (`atom::Atom`)**: Immutable, checksummed (and optionally signed) operations, each pointing at the atom that caused it.
//! * **Weaves (`weave::Weave`)**: The depth-first preorder of the causal tree formed by atoms. Every replica holding the same atoms holds the same weave.
//! * **Reducers (`reducer::AtomReducer`)**: Fold a weave into an application value, incrementally where possible.
//! * **Causal trees (`tree::CausalTree`)**: Tie a weave, a Lamport clock, a reducer, and site authentication together, and publish what was added, archived, or rejected.
//! * **Stores (`store::CausalTreeStore`)**: Persist trees in the versioned stored format.
//! * **Realtime (`realtime::RealtimeCausalTree`)**: Keeps a tree in sync with peers over a `RealtimeChannel`.

pub mod atom;
pub mod auth;
pub mod realtime;
pub mod reducer;
pub mod rejection;
pub mod store;
pub mod tree;
pub mod weave;

pub use atom::{Atom, AtomFactory, AtomId, PrecalculatedOp};
pub use rejection::{RejectedAtom, RejectionReason};
pub use tree::{CausalTree, CausalTreeOptions};
pub use weave::Weave;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Structured key handling errors from the auth module
    #[error(transparent)]
    Auth(auth::AuthError),

    /// Structured tree errors from the tree module
    #[error(transparent)]
    Tree(tree::TreeError),

    /// Structured storage errors from the store module
    #[error(transparent)]
    Store(store::StoreError),

    /// Structured sync errors from the realtime module
    #[error(transparent)]
    Realtime(realtime::RealtimeError),
}

impl Error {
    /// Get the originating module for this error.
    pub fn module(&self) -> &'static str {
        match self {
            Error::Auth(_) => "auth",
            Error::Tree(_) => "tree",
            Error::Store(_) => "store",
            Error::Realtime(_) => "realtime",
            Error::Io(_) => "io",
            Error::Serialize(_) => "serialize",
        }
    }

    /// Check if this error indicates a resource was not found.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::Tree(tree_err) => tree_err.is_not_found(),
            _ => false,
        }
    }

    /// Check if this error is validation-related.
    pub fn is_validation_error(&self) -> bool {
        match self {
            Error::Tree(tree_err) => tree_err.is_validation_error(),
            Error::Auth(_) => true,
            _ => false,
        }
    }

    /// Check if this error came from the connection layer.
    pub fn is_network_error(&self) -> bool {
        match self {
            Error::Realtime(realtime_err) => realtime_err.is_network_error(),
            _ => false,
        }
    }

    /// Check if this error is I/O related.
    pub fn is_io_error(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::Store(store_err) => store_err.is_io_error(),
            _ => false,
        }
    }

    /// Check if this error is serialization-related.
    pub fn is_serialization_error(&self) -> bool {
        match self {
            Error::Serialize(_) => true,
            Error::Store(store_err) => store_err.is_serialization_error(),
            _ => false,
        }
    }
}
