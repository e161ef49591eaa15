//! Persistence for causal trees.
//!
//! A [`CausalTreeStore`] keeps the stored form of trees by id, and optionally
//! the atoms garbage collection removed from them.

mod errors;
mod in_memory;

use async_trait::async_trait;

pub use errors::StoreError;
pub use in_memory::InMemoryStore;

use crate::{Result, atom::Atom, atom::AtomOp, tree::StoredCausalTree};

/// Storage for causal trees, keyed by tree id.
#[async_trait]
pub trait CausalTreeStore<Op: AtomOp>: Send + Sync {
    /// Prepares the store for use.
    async fn init(&self) -> Result<()>;

    /// Loads a tree, or `None` if nothing is stored under `id`.
    async fn get(&self, id: &str) -> Result<Option<StoredCausalTree<Op>>>;

    /// Replaces the tree stored under `id`.
    async fn update(&self, id: &str, tree: StoredCausalTree<Op>) -> Result<()>;

    /// Keeps atoms removed from the tree `id` by garbage collection.
    ///
    /// Stores without an archive discard them.
    async fn add_archived_atoms(&self, id: &str, atoms: Vec<Atom<Op>>) -> Result<()> {
        let _ = (id, atoms);
        Ok(())
    }
}
