//! The weave: a causal tree of atoms stored as its depth-first preorder.
//!
//! Every replica lays out the same set of atoms in the same order, because
//! siblings are always sorted by [`AtomId`]'s ordering (priority desc,
//! timestamp desc, site asc). Newer siblings sort earlier, which lets an
//! atom learned late be spliced in without disturbing anything after it.
//!
//! Besides the ordered array the weave keeps two indexes:
//! - a per-site sparse index `site -> timestamp -> atom` for O(1) lookups, and
//! - a subtree size map `atom id -> 1 + number of descendants`, so the span
//!   of any subtree is known without walking it.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, trace, warn};

use crate::{
    atom::{Atom, AtomId},
    rejection::RejectionReason,
};


/// The outcome of [`Weave::insert`].
#[derive(Debug, Clone, PartialEq)]
pub enum WeaveInsert<Op> {
    /// The atom was new and has been placed in the weave.
    Inserted(Atom<Op>),
    /// An identical atom was already present. Nothing changed.
    Existing(Atom<Op>),
    /// The atom could not be placed.
    Rejected(RejectionReason),
}

impl<Op> WeaveInsert<Op> {
    /// The newly inserted atom, if any.
    pub fn inserted(self) -> Option<Atom<Op>> {
        match self {
            WeaveInsert::Inserted(atom) => Some(atom),
            _ => None,
        }
    }

    /// The atom now present in the weave, whether new or pre-existing.
    pub fn atom(self) -> Option<Atom<Op>> {
        match self {
            WeaveInsert::Inserted(atom) | WeaveInsert::Existing(atom) => Some(atom),
            WeaveInsert::Rejected(_) => None,
        }
    }
}

/// A summary of a weave's contents.
///
/// `sites` maps each site to the newest timestamp present for it, which is
/// enough to answer "what am I missing" without transferring atoms. `hash`
/// covers the full ordered atom sequence, so two weaves holding the same atoms
/// report the same hash no matter how they were assembled.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeaveVersion {
    /// Newest timestamp per site.
    pub sites: BTreeMap<u64, u64>,
    /// Hex-encoded SHA-256 over the ordered atoms.
    pub hash: String,
}

impl WeaveVersion {
    /// Whether this version includes the given atom id.
    pub fn includes(&self, id: &AtomId) -> bool {
        self.sites
            .get(&id.site)
            .is_some_and(|timestamp| id.timestamp <= *timestamp)
    }
}

/// A structural problem found by [`Weave::check_sequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeaveViolation {
    /// Position of the offending atom in the sequence.
    pub index: usize,
    /// What is wrong with it.
    pub reason: &'static str,
}

impl std::fmt::Display for WeaveViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "atom {}: {}", self.index, self.reason)
    }
}

/// The ordered set of atoms of one causal tree.
///
/// The weave owns every atom it contains. Atoms removed from it are returned
/// to the caller and owned by no one else.
#[derive(Debug, Clone)]
pub struct Weave<Op> {
    atoms: Vec<Atom<Op>>,
    sites: HashMap<u64, BTreeMap<u64, Atom<Op>>>,
    sizes: HashMap<AtomId, usize>,
}

impl<Op> Default for Weave<Op> {
    fn default() -> Self {
        Self {
            atoms: Vec::new(),
            sites: HashMap::new(),
            sizes: HashMap::new(),
        }
    }
}

impl<Op: Clone> Weave<Op> {
    /// Creates an empty weave.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a single atom at its causal position.
    ///
    /// Re-inserting an atom that is already present returns
    /// [`WeaveInsert::Existing`]. An atom whose id is taken by an atom with a
    /// different checksum is rejected as a fork, and so is a child whose
    /// timestamp is not newer than its cause's.
    pub fn insert(&mut self, atom: Atom<Op>) -> WeaveInsert<Op> {
        if let Some(existing) = self.site_slot(atom.id()) {
            if existing.id() == atom.id() && existing.checksum() == atom.checksum() {
                return WeaveInsert::Existing(existing.clone());
            }
            warn!(atom = %atom.id(), "Atom conflicts with an existing atom, rejecting");
            return WeaveInsert::Rejected(RejectionReason::ChecksumMismatch);
        }

        let Some(cause) = atom.cause().copied() else {
            if !self.atoms.is_empty() {
                return WeaveInsert::Rejected(RejectionReason::SecondRootNotAllowed);
            }
            self.splice_in(0, atom.clone());
            return WeaveInsert::Inserted(atom);
        };

        if atom.id().timestamp <= cause.timestamp {
            debug!(atom = %atom.id(), cause = %cause, "Atom is not newer than its cause");
            return WeaveInsert::Rejected(RejectionReason::TimestampNotAfterCause);
        }
        let Some(cause_index) = self.index_of(&cause) else {
            return WeaveInsert::Rejected(RejectionReason::CauseNotFound);
        };

        let index = self.sibling_position(cause_index, atom.id());
        trace!(atom = %atom.id(), index, "Inserting atom");
        self.splice_in(index, atom.clone());
        WeaveInsert::Inserted(atom)
    }

    /// Removes an atom and every atom causally dependent on it.
    ///
    /// Returns the removed atoms in weave order. Removing an unknown atom
    /// removes nothing.
    pub fn remove(&mut self, id: &AtomId) -> Vec<Atom<Op>> {
        let Some(index) = self.index_of(id) else {
            return Vec::new();
        };
        let cause = self.atoms[index].cause().copied();
        let end = index + self.size_of(id);
        self.splice_out(index, end, cause)
    }

    /// Removes the siblings that sort after `id` under the same cause,
    /// together with their subtrees.
    ///
    /// Those siblings are the ones that happened before `id`; this is how
    /// superseded last-writer-wins alternatives are discarded. `id`'s own
    /// children are kept.
    pub fn remove_before(&mut self, id: &AtomId) -> Vec<Atom<Op>> {
        let Some(index) = self.index_of(id) else {
            return Vec::new();
        };
        let Some(cause) = self.atoms[index].cause().copied() else {
            return Vec::new();
        };
        let Some(cause_index) = self.index_of(&cause) else {
            return Vec::new();
        };
        let start = index + self.size_of(id);
        let end = cause_index + self.size_of(&cause);
        self.splice_out(start, end, Some(cause))
    }

    /// Merges an already valid weave sequence from another replica.
    ///
    /// Walks the incoming atoms once, keeping a cursor into the local array.
    /// Because both sides are valid weaves, the incoming atoms appear in the
    /// same relative order they will have after the merge, so the cursor only
    /// moves forward. For each new atom the local atoms at the cursor are
    /// compared against it with the sibling ordering: atoms that precede it
    /// are skipped (whole subtrees at a time) and the atom is spliced in at the
    /// first local atom that follows it.
    ///
    /// Atoms whose cause cannot be found or whose timestamp is not newer than
    /// their cause's are dropped, and so is everything under them. An atom colliding with an existing id but carrying a
    /// different checksum stops the merge of that branch.
    ///
    /// Returns the atoms that were added, in weave order.
    pub fn import(&mut self, atoms: Vec<Atom<Op>>) -> Vec<Atom<Op>> {
        let mut added = Vec::new();
        let mut dropped: HashSet<AtomId> = HashSet::new();
        let mut cursor = 0;

        for atom in atoms {
            let id = *atom.id();
            if let Some(cause) = atom.cause()
                && dropped.contains(cause)
            {
                dropped.insert(id);
                continue;
            }

            if let Some(existing) = self.site_slot(&id) {
                if existing.id() != &id || existing.checksum() != atom.checksum() {
                    warn!(atom = %id, "Conflicting atom during import, skipping its branch");
                    dropped.insert(id);
                }
                continue;
            }

            match atom.cause() {
                None if self.atoms.is_empty() => {
                    self.splice_in(0, atom.clone());
                    added.push(atom);
                    cursor = 1;
                    continue;
                }
                None => {
                    debug!(atom = %id, "Dropping second root during import");
                    dropped.insert(id);
                    continue;
                }
                Some(cause) if id.timestamp <= cause.timestamp => {
                    debug!(atom = %id, cause = %cause, "Dropping atom not newer than its cause during import");
                    dropped.insert(id);
                    continue;
                }
                Some(cause) if !self.contains(cause) => {
                    debug!(atom = %id, cause = %cause, "Dropping atom with missing cause during import");
                    dropped.insert(id);
                    continue;
                }
                Some(_) => {}
            }

            let index = self.merge_position(cursor, &atom);
            self.splice_in(index, atom.clone());
            added.push(atom);
            cursor = index + 1;
        }

        added
    }

    /// Produces a copy holding only the atoms included in `version`.
    ///
    /// An atom outside the version is dropped together with its subtree. With
    /// `preserve_children`, leaf atoms whose cause was kept are retained even
    /// if they are newer than the cutoff.
    pub fn get_weft(&self, version: &WeaveVersion, preserve_children: bool) -> Weave<Op> {
        let mut kept = Vec::new();
        let mut index = 0;
        while index < self.atoms.len() {
            let atom = &self.atoms[index];
            let size = self.size_of(atom.id());
            let keep_leaf = preserve_children && atom.cause().is_some() && size == 1;
            if version.includes(atom.id()) || keep_leaf {
                kept.push(atom.clone());
                index += 1;
            } else {
                index += size.max(1);
            }
        }
        Weave::rebuild(kept)
    }

    /// Builds a weave from an ordered atom sequence.
    ///
    /// The sequence must pass [`Weave::check_sequence`].
    pub fn from_ordered(atoms: Vec<Atom<Op>>) -> Result<Self, WeaveViolation>
    where
        Op: serde::Serialize,
    {
        Self::check_sequence(&atoms)?;
        Ok(Self::rebuild(atoms))
    }

    fn rebuild(atoms: Vec<Atom<Op>>) -> Self {
        let mut sizes: HashMap<AtomId, usize> = HashMap::with_capacity(atoms.len());
        // Descendants follow their ancestors, so walking backwards sees every
        // subtree complete before its root.
        for atom in atoms.iter().rev() {
            let size = sizes.get(atom.id()).copied().unwrap_or(0) + 1;
            sizes.insert(*atom.id(), size);
            if let Some(cause) = atom.cause() {
                *sizes.entry(*cause).or_insert(0) += size;
            }
        }

        let mut sites: HashMap<u64, BTreeMap<u64, Atom<Op>>> = HashMap::new();
        for atom in &atoms {
            sites
                .entry(atom.id().site)
                .or_default()
                .insert(atom.id().timestamp, atom.clone());
        }

        Self {
            atoms,
            sites,
            sizes,
        }
    }

    fn splice_in(&mut self, index: usize, atom: Atom<Op>) {
        let id = *atom.id();
        let cause = atom.cause().copied();
        self.sites
            .entry(id.site)
            .or_default()
            .insert(id.timestamp, atom.clone());
        self.sizes.insert(id, 1);
        self.atoms.insert(index, atom);
        self.adjust_ancestors(cause, |size| size + 1);
    }

    fn splice_out(&mut self, start: usize, end: usize, parent: Option<AtomId>) -> Vec<Atom<Op>> {
        if start >= end {
            return Vec::new();
        }
        let removed: Vec<Atom<Op>> = self.atoms.drain(start..end).collect();
        for atom in &removed {
            let id = atom.id();
            self.sizes.remove(id);
            if let Some(site) = self.sites.get_mut(&id.site) {
                site.remove(&id.timestamp);
                if site.is_empty() {
                    self.sites.remove(&id.site);
                }
            }
        }
        let count = removed.len();
        self.adjust_ancestors(parent, |size| size.saturating_sub(count));
        debug!(count, "Removed atoms from weave");
        removed
    }

    fn adjust_ancestors(&mut self, mut current: Option<AtomId>, adjust: impl Fn(usize) -> usize) {
        while let Some(id) = current {
            if let Some(size) = self.sizes.get_mut(&id) {
                *size = adjust(*size);
            }
            current = self
                .sites
                .get(&id.site)
                .and_then(|site| site.get(&id.timestamp))
                .and_then(|atom| atom.cause().copied());
        }
    }

    /// Position for a new child of the atom at `cause_index`: after every
    /// sibling subtree that sorts before it.
    fn sibling_position(&self, cause_index: usize, id: &AtomId) -> usize {
        let cause_end = cause_index + self.size_of(self.atoms[cause_index].id());
        let mut index = cause_index + 1;
        while index < cause_end {
            let sibling = self.atoms[index].id();
            if sibling < id {
                index += self.size_of(sibling).max(1);
            } else {
                break;
            }
        }
        index
    }

    /// Position for a new atom during a merge, searching forward from `start`.
    fn merge_position(&self, start: usize, atom: &Atom<Op>) -> usize {
        // Maps every ancestor of the new atom to its child on the path down.
        let mut path: HashMap<AtomId, AtomId> = HashMap::new();
        let mut child = *atom.id();
        let mut current = atom.cause().copied();
        while let Some(id) = current {
            path.insert(id, child);
            child = id;
            current = self.get_atom(&id).and_then(|a| a.cause().copied());
        }

        let mut index = start;
        while index < self.atoms.len() {
            let local = self.atoms[index].id();
            if path.contains_key(local) {
                // An ancestor: the new atom belongs inside its span.
                index += 1;
            } else if self.precedes(local, &path) {
                index += self.size_of(local).max(1);
            } else {
                break;
            }
        }
        index
    }

    /// Whether local atom `id` (not an ancestor of the new atom) comes before
    /// the new atom described by `path`.
    fn precedes(&self, id: &AtomId, path: &HashMap<AtomId, AtomId>) -> bool {
        let mut branch = *id;
        let mut current = self.get_atom(id).and_then(|a| a.cause().copied());
        while let Some(ancestor) = current {
            if let Some(new_branch) = path.get(&ancestor) {
                return branch < *new_branch;
            }
            branch = ancestor;
            current = self.get_atom(&ancestor).and_then(|a| a.cause().copied());
        }
        false
    }
}

impl<Op> Weave<Op> {
    /// Verifies that an atom sequence is a valid weave.
    ///
    /// Checks, in one pass, that the first atom is the only root, that every
    /// cause resolves to an ancestor on the current depth-first path, that
    /// children are newer than their cause, that siblings are in order, that
    /// no id repeats, and that every checksum matches its atom's content.
    pub fn check_sequence(atoms: &[Atom<Op>]) -> Result<(), WeaveViolation>
    where
        Op: serde::Serialize,
    {
        struct Frame {
            id: AtomId,
            last_child: Option<AtomId>,
        }

        let violation = |index, reason| Err(WeaveViolation { index, reason });
        let mut seen: HashMap<AtomId, u32> = HashMap::with_capacity(atoms.len());
        let mut stack: Vec<Frame> = Vec::new();

        for (index, atom) in atoms.iter().enumerate() {
            let id = *atom.id();
            if let Some(checksum) = seen.get(&id) {
                return if *checksum != atom.checksum() {
                    violation(index, "conflicting checksum for duplicate id")
                } else {
                    violation(index, "duplicate atom")
                };
            }
            if !atom.matches_checksum() {
                return violation(index, "checksum does not match content");
            }

            match atom.cause() {
                None if index != 0 => return violation(index, "more than one root"),
                None => {}
                Some(_) if index == 0 => return violation(index, "weave does not start with a root"),
                Some(cause) => {
                    while stack.last().is_some_and(|frame| frame.id != *cause) {
                        stack.pop();
                    }
                    let Some(parent) = stack.last_mut() else {
                        return violation(index, "cause does not precede atom on the current path");
                    };
                    if id.timestamp <= cause.timestamp {
                        return violation(index, "timestamp is not newer than cause");
                    }
                    if let Some(previous) = parent.last_child
                        && previous >= id
                    {
                        return violation(index, "siblings out of order");
                    }
                    parent.last_child = Some(id);
                }
            }

            seen.insert(id, atom.checksum());
            stack.push(Frame {
                id,
                last_child: None,
            });
        }
        Ok(())
    }

    /// O(n) structural verification of this weave. See [`Weave::check_sequence`].
    pub fn is_valid(&self) -> bool
    where
        Op: serde::Serialize,
    {
        Self::check_sequence(&self.atoms).is_ok()
    }

    /// The version vector and content hash of this weave.
    pub fn get_version(&self) -> WeaveVersion {
        let sites = self
            .sites
            .iter()
            .filter_map(|(site, atoms)| atoms.keys().next_back().map(|ts| (*site, *ts)))
            .collect();
        WeaveVersion {
            sites,
            hash: self.get_hash(),
        }
    }

    /// Hex-encoded SHA-256 over the ordered atom sequence.
    pub fn get_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for atom in &self.atoms {
            let id = atom.id();
            hasher.update(id.site.to_be_bytes());
            hasher.update(id.timestamp.to_be_bytes());
            hasher.update(id.priority.to_be_bytes());
            hasher.update(atom.checksum().to_be_bytes());
        }
        let hash = hasher.finalize();
        format!("{hash:x}")
    }

    /// The atoms in weave order.
    pub fn atoms(&self) -> &[Atom<Op>] {
        &self.atoms
    }

    /// Number of atoms in the weave.
    pub fn len(&self) -> usize {
        self.atoms.len()
    }

    /// Whether the weave has no atoms.
    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    /// The root atom, if any.
    pub fn root(&self) -> Option<&Atom<Op>> {
        self.atoms.first()
    }

    /// Looks up an atom by id in O(1).
    pub fn get_atom(&self, id: &AtomId) -> Option<&Atom<Op>> {
        self.site_slot(id).filter(|atom| atom.id() == id)
    }

    /// Whether an atom with this id is present.
    pub fn contains(&self, id: &AtomId) -> bool {
        self.get_atom(id).is_some()
    }

    /// Position of an atom in the weave.
    pub fn index_of(&self, id: &AtomId) -> Option<usize> {
        if !self.contains(id) {
            return None;
        }
        self.atoms.iter().position(|atom| atom.id() == id)
    }

    /// Number of atoms in the subtree rooted at `id`, including itself.
    /// Zero if the atom is not present.
    pub fn size_of(&self, id: &AtomId) -> usize {
        self.sizes.get(id).copied().unwrap_or(0)
    }

    /// The contiguous span holding `id` and all of its descendants.
    pub fn subtree(&self, id: &AtomId) -> &[Atom<Op>] {
        match self.index_of(id) {
            Some(index) => &self.atoms[index..index + self.size_of(id)],
            None => &[],
        }
    }

    /// The direct children of `id`, in weave order.
    pub fn children(&self, id: &AtomId) -> Vec<&Atom<Op>> {
        let span = self.subtree(id);
        let mut children = Vec::new();
        let mut index = 1;
        while index < span.len() {
            let child = &span[index];
            children.push(child);
            index += self.size_of(child.id()).max(1);
        }
        children
    }

    /// The atoms created by a site, oldest first.
    pub fn site_atoms(&self, site: u64) -> impl Iterator<Item = &Atom<Op>> {
        self.sites.get(&site).into_iter().flat_map(|atoms| atoms.values())
    }

    /// The newest timestamp present for a site.
    pub fn get_site_timestamp(&self, site: u64) -> Option<u64> {
        self.sites
            .get(&site)
            .and_then(|atoms| atoms.keys().next_back().copied())
    }

    fn site_slot(&self, id: &AtomId) -> Option<&Atom<Op>> {
        self.sites
            .get(&id.site)
            .and_then(|atoms| atoms.get(&id.timestamp))
    }
}
