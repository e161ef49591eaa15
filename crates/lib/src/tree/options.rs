//! Configuration for causal trees.

use std::sync::Arc;

use super::gc::{GarbageCollector, LastWriteWins};
use crate::auth::{AtomValidator, PrivateKey};

/// Options for constructing a [`CausalTree`](super::CausalTree).
///
/// ```
/// use causal_trees::{auth::{AtomValidator, PrivateKey}, tree::CausalTreeOptions};
///
/// let options = CausalTreeOptions::<String>::default()
///     .with_validator(AtomValidator::ed25519())
///     .with_signing_key(PrivateKey::generate())
///     .with_garbage_collection(true);
/// assert!(options.garbage_collect);
/// ```
#[derive(Debug)]
pub struct CausalTreeOptions<Op> {
    /// Run the garbage collection policy after every accepted batch.
    pub garbage_collect: bool,
    /// Validator used to verify incoming atoms. Without one, signatures are
    /// not checked.
    pub validator: Option<AtomValidator>,
    /// Key used to sign locally created atoms. Requires a validator.
    pub signing_key: Option<Arc<PrivateKey>>,
    /// Policy to use when `garbage_collect` is set. Defaults to [`LastWriteWins`].
    pub garbage_collector: Option<Arc<dyn GarbageCollector<Op>>>,
}

impl<Op> Default for CausalTreeOptions<Op> {
    fn default() -> Self {
        Self {
            garbage_collect: false,
            validator: None,
            signing_key: None,
            garbage_collector: None,
        }
    }
}

impl<Op> Clone for CausalTreeOptions<Op> {
    fn clone(&self) -> Self {
        Self {
            garbage_collect: self.garbage_collect,
            validator: self.validator.clone(),
            signing_key: self.signing_key.clone(),
            garbage_collector: self.garbage_collector.clone(),
        }
    }
}

impl<Op> CausalTreeOptions<Op> {
    /// Enables or disables garbage collection.
    pub fn with_garbage_collection(mut self, enabled: bool) -> Self {
        self.garbage_collect = enabled;
        self
    }

    /// Sets the validator.
    pub fn with_validator(mut self, validator: AtomValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Sets the key for signing local atoms.
    pub fn with_signing_key(mut self, key: impl Into<Arc<PrivateKey>>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Sets the garbage collection policy and enables collection.
    pub fn with_garbage_collector(mut self, collector: Arc<dyn GarbageCollector<Op>>) -> Self {
        self.garbage_collect = true;
        self.garbage_collector = Some(collector);
        self
    }

    /// The policy to run, if collection is enabled.
    pub(crate) fn collector(&self) -> Option<Arc<dyn GarbageCollector<Op>>>
    where
        Op: Clone + 'static,
    {
        if !self.garbage_collect {
            return None;
        }
        Some(
            self.garbage_collector
                .clone()
                .unwrap_or_else(|| Arc::new(LastWriteWins) as Arc<dyn GarbageCollector<Op>>),
        )
    }
}
