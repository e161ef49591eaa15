//! In-memory store implementation.

use std::{
    collections::HashMap,
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, trace};

use super::{CausalTreeStore, StoreError};
use crate::{
    Result,
    atom::{Atom, AtomOp},
    tree::StoredCausalTree,
};

/// The current persistence file format version.
/// v0 indicates this is an unstable format subject to breaking changes.
const PERSISTENCE_VERSION: u8 = 0;

fn is_v0(v: &u8) -> bool {
    *v == 0
}

fn validate_persistence_version<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let version = u8::deserialize(deserializer)?;
    if version != PERSISTENCE_VERSION {
        return Err(serde::de::Error::custom(format!(
            "unsupported persistence version {version}; only version {PERSISTENCE_VERSION} is supported"
        )));
    }
    Ok(version)
}

/// File layout of a saved [`InMemoryStore`].
#[derive(Serialize, Deserialize)]
#[serde(bound = "Op: AtomOp")]
struct SerializableStore<Op> {
    #[serde(
        rename = "_v",
        default,
        skip_serializing_if = "is_v0",
        deserialize_with = "validate_persistence_version"
    )]
    version: u8,
    trees: HashMap<String, StoredCausalTree<Op>>,
    #[serde(default)]
    archived: HashMap<String, Vec<Atom<Op>>>,
}

/// A [`CausalTreeStore`] holding everything in memory.
///
/// Suitable for tests and for single-process setups that save the whole
/// store to a JSON file with [`save_to_file`](Self::save_to_file).
#[derive(Debug)]
pub struct InMemoryStore<Op> {
    initialized: AtomicBool,
    trees: RwLock<HashMap<String, StoredCausalTree<Op>>>,
    archived: RwLock<HashMap<String, Vec<Atom<Op>>>>,
}

impl<Op> Default for InMemoryStore<Op> {
    fn default() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            trees: RwLock::new(HashMap::new()),
            archived: RwLock::new(HashMap::new()),
        }
    }
}

impl<Op: AtomOp> InMemoryStore<Op> {
    /// Creates an empty store. Call [`CausalTreeStore::init`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of all stored trees, sorted.
    pub async fn tree_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.trees.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Atoms archived for the tree `id`, oldest first.
    pub async fn archived_atoms(&self, id: &str) -> Vec<Atom<Op>> {
        self.archived
            .read()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Saves all trees and archived atoms to `path` as JSON.
    pub async fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let serializable = SerializableStore {
            version: PERSISTENCE_VERSION,
            trees: self.trees.read().await.clone(),
            archived: self.archived.read().await.clone(),
        };
        let json = serde_json::to_string_pretty(&serializable)
            .map_err(|source| StoreError::SerializationFailed { source })?;
        tokio::fs::write(path.as_ref(), json)
            .await
            .map_err(|source| StoreError::FileIo { source })?;
        debug!(path = %path.as_ref().display(), "Saved store");
        Ok(())
    }

    /// Loads a store saved with [`save_to_file`](Self::save_to_file).
    ///
    /// A missing file yields an empty store. The loaded store still needs
    /// [`CausalTreeStore::init`].
    pub async fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        match tokio::fs::read_to_string(path.as_ref()).await {
            Ok(json) => {
                let stored: SerializableStore<Op> = serde_json::from_str(&json)
                    .map_err(|source| StoreError::DeserializationFailed { source })?;
                Ok(Self {
                    initialized: AtomicBool::new(false),
                    trees: RwLock::new(stored.trees),
                    archived: RwLock::new(stored.archived),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(source) => Err(StoreError::FileIo { source }.into()),
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized.into())
        }
    }
}

#[async_trait]
impl<Op: AtomOp> CausalTreeStore<Op> for InMemoryStore<Op> {
    async fn init(&self) -> Result<()> {
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<StoredCausalTree<Op>>> {
        self.ensure_initialized()?;
        Ok(self.trees.read().await.get(id).cloned())
    }

    async fn update(&self, id: &str, tree: StoredCausalTree<Op>) -> Result<()> {
        self.ensure_initialized()?;
        trace!(id, "Updating stored tree");
        self.trees.write().await.insert(id.to_string(), tree);
        Ok(())
    }

    async fn add_archived_atoms(&self, id: &str, atoms: Vec<Atom<Op>>) -> Result<()> {
        self.ensure_initialized()?;
        debug!(id, count = atoms.len(), "Archiving atoms");
        self.archived
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .extend(atoms);
        Ok(())
    }
}
