//! Construction of trees by type name.

use std::{collections::HashMap, sync::Arc};

use super::{CausalTree, CausalTreeOptions, StoredCausalTree, TreeError};
use crate::{Result, atom::AtomOp, reducer::AtomReducer};

/// Creates causal trees for a named tree type.
///
/// The type name travels with a realtime channel, so peers agree on how a
/// tree's atoms are reduced.
pub trait CausalTreeFactory<Op: AtomOp>: Send + Sync {
    /// The reducer of the trees this factory builds.
    type Reducer: AtomReducer<Op>;

    /// Creates a tree of `tree_type` from its stored form.
    fn create(
        &self,
        tree_type: &str,
        stored: StoredCausalTree<Op>,
        options: CausalTreeOptions<Op>,
    ) -> Result<CausalTree<Op, Self::Reducer>>;
}

type ReducerConstructor<R> = Arc<dyn Fn() -> R + Send + Sync>;

/// A [`CausalTreeFactory`] mapping type names to reducer constructors.
///
/// Registries holding different reducers can use a boxed reducer type, e.g.
/// `ReducerRegistry<Box<dyn AtomReducer<Op, Value = V, Metadata = M>>>`.
pub struct ReducerRegistry<R> {
    constructors: HashMap<String, ReducerConstructor<R>>,
}

impl<R> Default for ReducerRegistry<R> {
    fn default() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }
}

impl<R> Clone for ReducerRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            constructors: self.constructors.clone(),
        }
    }
}

impl<R> std::fmt::Debug for ReducerRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReducerRegistry")
            .field("types", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<R> ReducerRegistry<R> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reducer constructor for `tree_type`, replacing any previous one.
    pub fn register(
        mut self,
        tree_type: impl Into<String>,
        constructor: impl Fn() -> R + Send + Sync + 'static,
    ) -> Self {
        self.constructors
            .insert(tree_type.into(), Arc::new(constructor));
        self
    }

    /// Whether a constructor is registered for `tree_type`.
    pub fn contains(&self, tree_type: &str) -> bool {
        self.constructors.contains_key(tree_type)
    }
}

impl<Op: AtomOp, R: AtomReducer<Op>> CausalTreeFactory<Op> for ReducerRegistry<R> {
    type Reducer = R;

    fn create(
        &self,
        tree_type: &str,
        stored: StoredCausalTree<Op>,
        options: CausalTreeOptions<Op>,
    ) -> Result<CausalTree<Op, R>> {
        let constructor =
            self.constructors
                .get(tree_type)
                .ok_or_else(|| TreeError::UnknownTreeType {
                    tree_type: tree_type.to_string(),
                })?;
        CausalTree::new(stored, constructor(), options)
    }
}
