//! The reducer contract that folds a weave into an application value.
//!
//! A reducer is evaluated every time atoms are admitted. It receives the
//! current weave, the atoms that were just added, and the previous value and
//! metadata, and must produce the new pair without side effects: the same
//! weave state may be evaluated more than once during batched operations.
//!
//! Incremental reducers keep per-atom partial results in their metadata. An
//! [`AtomCache`] keyed by [`AtomId`] is provided for that purpose: atom ids are
//! unique and stable for the lifetime of an atom, so they serve as the handle
//! a cache entry is bound to.

use std::collections::HashMap;

use crate::{
    atom::{Atom, AtomId},
    weave::Weave,
};

/// Folds a weave into a value.
///
/// # Example
///
/// ```
/// use causal_trees::{atom::Atom, reducer::AtomReducer, weave::Weave};
///
/// /// Counts every atom ever evaluated.
/// struct Counter;
///
/// impl AtomReducer<String> for Counter {
///     type Value = usize;
///     type Metadata = ();
///
///     fn eval(
///         &self,
///         weave: &Weave<String>,
///         refs: Option<&[Atom<String>]>,
///         value: Option<usize>,
///         _metadata: Option<()>,
///     ) -> (usize, ()) {
///         match (refs, value) {
///             (Some(refs), Some(value)) => (value + refs.len(), ()),
///             _ => (weave.len(), ()),
///         }
///     }
/// }
/// ```
pub trait AtomReducer<Op>: Send {
    /// The application value produced from the weave.
    type Value: Send;
    /// Reducer-private state carried between evaluations.
    type Metadata: Send;

    /// Evaluates the weave.
    ///
    /// `refs` is `None` when the whole weave must be evaluated from scratch
    /// (for example after loading), otherwise the atoms added since the last
    /// evaluation. `value` and `metadata` are the results of that evaluation.
    fn eval(
        &self,
        weave: &Weave<Op>,
        refs: Option<&[Atom<Op>]>,
        value: Option<Self::Value>,
        metadata: Option<Self::Metadata>,
    ) -> (Self::Value, Self::Metadata);
}

impl<Op, R: AtomReducer<Op> + ?Sized> AtomReducer<Op> for Box<R> {
    type Value = R::Value;
    type Metadata = R::Metadata;

    fn eval(
        &self,
        weave: &Weave<Op>,
        refs: Option<&[Atom<Op>]>,
        value: Option<Self::Value>,
        metadata: Option<Self::Metadata>,
    ) -> (Self::Value, Self::Metadata) {
        (**self).eval(weave, refs, value, metadata)
    }
}

/// Per-atom partial results for incremental reducers.
///
/// When a new atom arrives, every ancestor's cached result may be stale, so
/// [`AtomCache::invalidate_causes`] drops the entries along its cause chain.
#[derive(Debug, Clone)]
pub struct AtomCache<T> {
    entries: HashMap<AtomId, T>,
}

impl<T> Default for AtomCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> AtomCache<T> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for an atom.
    pub fn get(&self, id: &AtomId) -> Option<&T> {
        self.entries.get(id)
    }

    /// Stores the result for an atom.
    pub fn insert(&mut self, id: AtomId, value: T) {
        self.entries.insert(id, value);
    }

    /// Returns the cached result or computes and stores it.
    pub fn get_or_insert_with(&mut self, id: AtomId, compute: impl FnOnce() -> T) -> &T {
        self.entries.entry(id).or_insert_with(compute)
    }

    /// Drops the entries of `atom` and every ancestor reachable in `weave`.
    ///
    /// Returns how many entries were dropped.
    pub fn invalidate_causes<Op>(&mut self, weave: &Weave<Op>, atom: &Atom<Op>) -> usize {
        let mut dropped = usize::from(self.entries.remove(atom.id()).is_some());
        let mut current = atom.cause().copied();
        while let Some(id) = current {
            if self.entries.remove(&id).is_some() {
                dropped += 1;
            }
            current = weave.get_atom(&id).and_then(|a| a.cause().copied());
        }
        dropped
    }

    /// Drops entries for atoms that are no longer in the weave.
    pub fn retain_present<Op>(&mut self, weave: &Weave<Op>) {
        self.entries.retain(|id, _| weave.contains(id));
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
