//! Garbage collection policies.
//!
//! A policy runs after every accepted batch of atoms and may remove atoms
//! from the weave. Whatever it removes is published on the tree's
//! `atoms_archived` stream so a store can keep it.

use crate::{atom::Atom, weave::Weave};

/// Decides which atoms to drop from the live weave.
pub trait GarbageCollector<Op>: Send + Sync + std::fmt::Debug {
    /// Collects garbage after `added` were inserted. Returns the removed atoms.
    fn collect(&self, weave: &mut Weave<Op>, added: &[Atom<Op>]) -> Vec<Atom<Op>>;
}

/// Keeps only the newest sibling under each cause that received new atoms.
///
/// For each added atom the siblings it supersedes are removed with
/// [`Weave::remove_before`], so the atom's own children survive.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl<Op: Clone> GarbageCollector<Op> for LastWriteWins {
    fn collect(&self, weave: &mut Weave<Op>, added: &[Atom<Op>]) -> Vec<Atom<Op>> {
        added
            .iter()
            .flat_map(|atom| weave.remove_before(atom.id()))
            .collect()
    }
}
