//!
//! Defines the fundamental unit of a causal tree (`Atom`) and related types.
//!
//! An `Atom` is an immutable record of one operation: its identity, the atom
//! it was caused by, the operation value itself, a checksum over those three,
//! and an optional signature. Atoms are created by an `AtomFactory`, which
//! stamps them with its site's Lamport clock.

pub mod factory;
pub mod id;

pub use factory::AtomFactory;
pub use id::AtomId;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Marker trait for operation values that can be carried by atoms.
///
/// Operations must serialize deterministically to JSON, since the checksum and
/// signature of an atom are computed over its serialized form.
pub trait AtomOp:
    Clone + std::fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> AtomOp for T where
    T: Clone + std::fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// One operation in a causal tree.
///
/// `Atom` instances are immutable once created. Attaching a signature with
/// [`Atom::with_signature`] produces a new atom value.
///
/// # Example
///
/// ```
/// use causal_trees::atom::{Atom, AtomId};
///
/// let root = Atom::new(AtomId::new(1, 1), None, "root".to_string()).unwrap();
/// let child = Atom::new(AtomId::new(1, 2), Some(*root.id()), "child".to_string()).unwrap();
/// assert!(child.matches_checksum());
/// assert_eq!(child.cause(), Some(root.id()));
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Atom<Op> {
    id: AtomId,
    cause: Option<AtomId>,
    value: Op,
    checksum: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// The signed and checksummed content of an atom.
#[derive(Serialize)]
struct AtomContent<'a, Op> {
    id: &'a AtomId,
    cause: Option<&'a AtomId>,
    value: &'a Op,
}

impl<Op: Serialize> Atom<Op> {
    /// Creates an atom, computing its checksum.
    pub fn new(id: AtomId, cause: Option<AtomId>, value: Op) -> Result<Self> {
        let checksum = checksum_of(&content_bytes(&id, cause.as_ref(), &value)?);
        Ok(Self {
            id,
            cause,
            value,
            checksum,
            signature: None,
        })
    }

    /// The canonical bytes covered by the checksum and the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        content_bytes(&self.id, self.cause.as_ref(), &self.value)
    }

    /// Check whether the stored checksum matches the atom's content.
    pub fn matches_checksum(&self) -> bool {
        self.signing_bytes()
            .map(|bytes| checksum_of(&bytes) == self.checksum)
            .unwrap_or(false)
    }
}

impl<Op> Atom<Op> {
    /// Assembles an atom from raw parts without recomputing anything.
    ///
    /// Use this for atoms read back from storage or the network; their
    /// integrity is checked when they are added to a tree.
    pub fn from_parts(
        id: AtomId,
        cause: Option<AtomId>,
        value: Op,
        checksum: u32,
        signature: Option<String>,
    ) -> Self {
        Self {
            id,
            cause,
            value,
            checksum,
            signature,
        }
    }

    /// Get the id of the atom.
    pub fn id(&self) -> &AtomId {
        &self.id
    }

    /// Get the id of the atom this atom was caused by. `None` for a root.
    pub fn cause(&self) -> Option<&AtomId> {
        self.cause.as_ref()
    }

    /// Get the operation value.
    pub fn value(&self) -> &Op {
        &self.value
    }

    /// Get the checksum over `(id, cause, value)`.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Get the base64 signature, if the atom is signed.
    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// Check whether this atom is a root (has no cause).
    pub fn is_root(&self) -> bool {
        self.cause.is_none()
    }

    /// Returns a copy of this atom carrying the given signature.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

/// Check whether an atom's checksum matches its content.
pub fn atom_matches_checksum<Op: Serialize>(atom: &Atom<Op>) -> bool {
    atom.matches_checksum()
}

fn content_bytes<Op: Serialize>(id: &AtomId, cause: Option<&AtomId>, value: &Op) -> Result<Vec<u8>> {
    serde_json::to_vec(&AtomContent { id, cause, value }).map_err(Error::Serialize)
}

/// The first four bytes of the SHA-256 digest, big-endian.
fn checksum_of(bytes: &[u8]) -> u32 {
    let digest = Sha256::digest(bytes);
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// An operation whose causal placement has been decided ahead of creation.
///
/// Callers that compute a set of operations before touching the tree build
/// these and hand them to `CausalTree::create_from_precalculated`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PrecalculatedOp<Op> {
    /// The operation to create.
    pub op: Op,
    /// The atom the new atom is caused by.
    pub cause: Option<AtomId>,
    /// Priority among siblings.
    #[serde(default)]
    pub priority: u32,
}

impl<Op> PrecalculatedOp<Op> {
    /// Creates a precalculated operation with the default priority.
    pub fn new(op: Op, cause: Option<AtomId>) -> Self {
        Self {
            op,
            cause,
            priority: 0,
        }
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}
