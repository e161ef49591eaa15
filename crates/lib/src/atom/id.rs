//! Identifier type for atoms.
//!
//! An `AtomId` names one operation by the site that created it, the Lamport
//! timestamp it was stamped with, and an optional priority. Its `Ord` impl is
//! the sibling order used by the weave.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// The identity of an `Atom`.
///
/// `(site, timestamp)` is unique for every atom a well-behaved site creates,
/// because each site's factory increments its clock for every atom.
///
/// # Ordering
///
/// `AtomId` is ordered the way siblings are laid out in a weave: higher
/// priority first, then higher timestamp first, then lower site first.
/// `a < b` means `a` appears before `b` when both share a cause.
///
/// ```
/// use causal_trees::atom::AtomId;
///
/// let older = AtomId::new(1, 2);
/// let newer = AtomId::new(2, 3);
/// assert!(newer < older);
/// assert!(AtomId::new(1, 2).with_priority(1) < newer);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AtomId {
    /// The site that created the atom.
    pub site: u64,
    /// The Lamport timestamp the atom was created at.
    pub timestamp: u64,
    /// Priority among siblings. Higher priorities sort first.
    #[serde(default)]
    pub priority: u32,
}

impl AtomId {
    /// Creates an id with the default priority of zero.
    pub fn new(site: u64, timestamp: u64) -> Self {
        Self {
            site,
            timestamp,
            priority: 0,
        }
    }

    /// Returns a copy of this id with the given priority.
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl Ord for AtomId {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| self.site.cmp(&other.site))
    }
}

impl PartialOrd for AtomId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for AtomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.priority == 0 {
            write!(f, "{}@{}", self.site, self.timestamp)
        } else {
            write!(f, "{}@{}!{}", self.site, self.timestamp, self.priority)
        }
    }
}
