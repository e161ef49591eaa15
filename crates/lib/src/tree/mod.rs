//! Causal trees: a weave, a Lamport clock, a reducer, and site authentication.
//!
//! A [`CausalTree`] is the unit applications work with. Local writes go
//! through [`CausalTree::create`], remote atoms through [`CausalTree::add`] or
//! [`CausalTree::import_weave`]. Every admitted atom advances the tree's
//! clock and updates the reduced value.
//!
//! Three broadcast streams report what happened:
//! - `atom_added`: atoms newly inserted by `add`/`create` (one message per batch),
//! - `atoms_archived`: atoms removed by garbage collection,
//! - `atom_rejected`: atoms that were refused, with the reason.
//!
//! Rejections are expected during replication and are never returned as
//! errors. Errors are reserved for structural problems, such as a foreign
//! weave that fails validation.

pub mod errors;
pub mod factory;
pub mod gc;
pub mod options;
pub mod site;
pub mod stored;


use std::collections::HashMap;

use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

pub use errors::TreeError;
pub use factory::{CausalTreeFactory, ReducerRegistry};
pub use gc::{GarbageCollector, LastWriteWins};
pub use options::CausalTreeOptions;
pub use site::{SiteCrypto, SiteInfo};
pub use stored::{StoredCausalTree, StoredCausalTreeVersion3};

use crate::{
    Result,
    atom::{Atom, AtomFactory, AtomId, AtomOp, PrecalculatedOp},
    auth::PublicKey,
    reducer::AtomReducer,
    rejection::{RejectedAtom, RejectionReason},
    weave::{Weave, WeaveInsert},
};

/// Capacity of each event stream. Slow subscribers miss older messages.
const EVENT_CAPACITY: usize = 1024;

/// Notifications collected while a batch is open.
struct PendingBatch<Op> {
    added: Vec<Atom<Op>>,
    rejected: Vec<RejectedAtom<Op>>,
}

impl<Op> Default for PendingBatch<Op> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            rejected: Vec::new(),
        }
    }
}

/// A replicated causal tree reduced to a value by `R`.
pub struct CausalTree<Op: AtomOp, R: AtomReducer<Op>> {
    site: SiteInfo,
    known_sites: Vec<SiteInfo>,
    /// Keys of known sites. `None` marks a site whose advertised key is unusable.
    public_keys: HashMap<u64, Option<PublicKey>>,
    weave: Weave<Op>,
    factory: AtomFactory,
    reducer: R,
    reduced: Option<(R::Value, R::Metadata)>,
    options: CausalTreeOptions<Op>,
    batch: Option<PendingBatch<Op>>,
    atom_added: broadcast::Sender<Vec<Atom<Op>>>,
    atoms_archived: broadcast::Sender<Vec<Atom<Op>>>,
    atom_rejected: broadcast::Sender<Vec<RejectedAtom<Op>>>,
}

impl<Op: AtomOp, R: AtomReducer<Op>> std::fmt::Debug for CausalTree<Op, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CausalTree")
            .field("site", &self.site)
            .field("known_sites", &self.known_sites)
            .field("atoms", &self.weave.len())
            .field("time", &self.factory.time())
            .finish_non_exhaustive()
    }
}

impl<Op: AtomOp, R: AtomReducer<Op>> CausalTree<Op, R> {
    /// Creates a tree from its stored form.
    ///
    /// When the options carry a validator and a signing key and the stored
    /// site advertises no key, the site is given the signing key's public
    /// half so that locally created atoms validate.
    ///
    /// Fails if the stored format version is unknown or an ordered stored
    /// weave is invalid.
    pub fn new(
        stored: impl Into<StoredCausalTree<Op>>,
        reducer: R,
        options: CausalTreeOptions<Op>,
    ) -> Result<Self> {
        let stored = stored.into();
        let version = stored.format_version();
        let stored = stored
            .upgrade()
            .ok_or(TreeError::UnsupportedFormatVersion { version })?;

        let mut site = stored.site.clone();
        if site.crypto.is_none()
            && options.validator.is_some()
            && let Some(key) = &options.signing_key
        {
            site = SiteInfo::with_public_key(site.id, &key.public_key());
        }

        let (atom_added, _) = broadcast::channel(EVENT_CAPACITY);
        let (atoms_archived, _) = broadcast::channel(EVENT_CAPACITY);
        let (atom_rejected, _) = broadcast::channel(EVENT_CAPACITY);
        let mut tree = Self {
            factory: AtomFactory::new(site.id, 0),
            site: site.clone(),
            known_sites: Vec::new(),
            public_keys: HashMap::new(),
            weave: Weave::new(),
            reducer,
            reduced: None,
            options,
            batch: None,
            atom_added,
            atoms_archived,
            atom_rejected,
        };
        tree.register_site(site);
        tree.reduce(None);
        tree.import(stored.into())?;
        debug!(site = tree.site.id, atoms = tree.weave.len(), "Loaded causal tree");
        Ok(tree)
    }

    /// Creates an empty tree for `site`.
    pub fn empty(site: SiteInfo, reducer: R, options: CausalTreeOptions<Op>) -> Result<Self> {
        Self::new(StoredCausalTreeVersion3::empty(site), reducer, options)
    }

    /// This tree's own site.
    pub fn site(&self) -> &SiteInfo {
        &self.site
    }

    /// Every site this tree knows about, including its own.
    pub fn known_sites(&self) -> &[SiteInfo] {
        &self.known_sites
    }

    /// The weave.
    pub fn weave(&self) -> &Weave<Op> {
        &self.weave
    }

    /// The factory stamping local atoms.
    pub fn factory(&self) -> &AtomFactory {
        &self.factory
    }

    /// The current Lamport time.
    pub fn time(&self) -> u64 {
        self.factory.time()
    }

    /// The options the tree was created with.
    pub fn options(&self) -> &CausalTreeOptions<Op> {
        &self.options
    }

    /// The reduced value of the weave.
    ///
    /// Only `None` if the reducer panicked during an evaluation.
    pub fn value(&self) -> Option<&R::Value> {
        self.reduced.as_ref().map(|(value, _)| value)
    }

    /// The reducer's metadata for the current value.
    pub fn metadata(&self) -> Option<&R::Metadata> {
        self.reduced.as_ref().map(|(_, metadata)| metadata)
    }

    /// Subscribes to atoms newly added by `add`, `add_many` and `create`.
    pub fn subscribe_atom_added(&self) -> broadcast::Receiver<Vec<Atom<Op>>> {
        self.atom_added.subscribe()
    }

    /// Subscribes to atoms removed by garbage collection.
    pub fn subscribe_atoms_archived(&self) -> broadcast::Receiver<Vec<Atom<Op>>> {
        self.atoms_archived.subscribe()
    }

    /// Subscribes to rejected atoms.
    pub fn subscribe_atom_rejected(&self) -> broadcast::Receiver<Vec<RejectedAtom<Op>>> {
        self.atom_rejected.subscribe()
    }

    /// Adds a site to the known sites. Sites already known by id are ignored.
    ///
    /// Known sites are the directory of public keys used to verify atoms.
    pub fn register_site(&mut self, site: SiteInfo) {
        if self.known_sites.iter().any(|known| known.id == site.id) {
            return;
        }
        if let Some(key) = self.resolve_key(&site) {
            self.public_keys.insert(site.id, key);
        }
        debug!(site = site.id, signed = site.crypto.is_some(), "Registered site");
        self.known_sites.push(site);
    }

    /// Adds a single atom.
    ///
    /// Returns the atom now in the weave (newly inserted or already present),
    /// or `None` if it was rejected. Rejections are published on the
    /// `atom_rejected` stream.
    pub fn add(&mut self, atom: Atom<Op>) -> Option<Atom<Op>> {
        self.batch(|tree| tree.admit(atom))
    }

    /// Adds many atoms in one batch, oldest timestamp first.
    ///
    /// Returns the atoms that are in the weave afterwards.
    pub fn add_many(&mut self, mut atoms: Vec<Atom<Op>>) -> Vec<Atom<Op>> {
        atoms.sort_by_key(|atom| atom.id().timestamp);
        self.batch(|tree| atoms.into_iter().filter_map(|atom| tree.admit(atom)).collect())
    }

    /// Creates and adds a local atom.
    ///
    /// The atom is signed when the tree has a validator and a signing key.
    /// Returns `Ok(None)` if the atom was rejected, e.g. because `cause` is
    /// not in the weave.
    pub fn create(
        &mut self,
        op: Op,
        cause: Option<AtomId>,
        priority: Option<u32>,
    ) -> Result<Option<Atom<Op>>> {
        let atom = self.factory.create(op, cause, priority)?;
        let atom = match (&self.options.validator, &self.options.signing_key) {
            (Some(validator), Some(key)) => validator.sign(key, atom)?,
            _ => atom,
        };
        Ok(self.add(atom))
    }

    /// Creates and adds a local atom caused by `cause`.
    pub fn create_child_of(
        &mut self,
        op: Op,
        cause: &Atom<Op>,
        priority: Option<u32>,
    ) -> Result<Option<Atom<Op>>> {
        self.create(op, Some(*cause.id()), priority)
    }

    /// Creates and adds an atom from a precalculated operation.
    pub fn create_from_precalculated(
        &mut self,
        op: PrecalculatedOp<Op>,
    ) -> Result<Option<Atom<Op>>> {
        self.create(op.op, op.cause, Some(op.priority))
    }

    /// Creates and adds many precalculated operations in one batch.
    ///
    /// Results are in input order. Stops at the first error.
    pub fn create_many_from_precalculated(
        &mut self,
        ops: Vec<PrecalculatedOp<Op>>,
    ) -> Result<Vec<Option<Atom<Op>>>> {
        self.batch(|tree| {
            ops.into_iter()
                .map(|op| tree.create_from_precalculated(op))
                .collect()
        })
    }

    /// Merges an ordered weave from another replica.
    ///
    /// With `validate`, the sequence is checked with
    /// [`Weave::check_sequence`] first and a violation fails the whole
    /// import. Without it the caller guarantees the sequence is a valid weave.
    /// Atoms failing checksum or signature checks are rejected, and atoms
    /// under them are dropped by the merge.
    ///
    /// Imported atoms are not published on `atom_added` and do not trigger
    /// garbage collection. Returns the newly merged atoms in weave order.
    pub fn import_weave(&mut self, atoms: Vec<Atom<Op>>, validate: bool) -> Result<Vec<Atom<Op>>> {
        if validate {
            Weave::check_sequence(&atoms)?;
        }

        let verdicts = self.verdicts(&atoms);
        let mut accepted = Vec::with_capacity(atoms.len());
        let mut rejected = Vec::new();
        for (atom, verdict) in atoms.into_iter().zip(verdicts) {
            match verdict {
                Some(reason) => rejected.push(RejectedAtom::new(atom, reason)),
                None => accepted.push(atom),
            }
        }

        let added = self.weave.import(accepted);
        for atom in &added {
            self.factory.update_time_from(atom);
        }
        if !added.is_empty() {
            self.reduce(Some(added.as_slice()));
        }
        debug!(
            added = added.len(),
            rejected = rejected.len(),
            "Imported weave"
        );
        self.batch(|tree| tree.pending().rejected.extend(rejected));
        Ok(added)
    }

    /// Exports the tree in the current stored format.
    pub fn export(&self) -> StoredCausalTreeVersion3<Op> {
        StoredCausalTreeVersion3 {
            site: self.site.clone(),
            known_sites: self.known_sites.clone(),
            weave: self.weave.atoms().to_vec(),
            ordered: true,
        }
    }

    /// Imports a stored tree.
    ///
    /// Known sites are registered before any atom is merged. Ordered weaves
    /// take the [`import_weave`](Self::import_weave) path, unordered ones
    /// [`add_many`](Self::add_many). An unknown format version imports
    /// nothing.
    pub fn import(&mut self, stored: StoredCausalTree<Op>) -> Result<Vec<Atom<Op>>> {
        let version = stored.format_version();
        let Some(stored) = stored.upgrade() else {
            warn!(version, "Unknown stored tree format version, nothing imported");
            return Ok(Vec::new());
        };
        for site in stored.known_sites {
            self.register_site(site);
        }
        self.register_site(stored.site);
        if stored.ordered {
            self.import_weave(stored.weave, true)
        } else {
            Ok(self.add_many(stored.weave))
        }
    }

    /// Runs `f` as one batch.
    ///
    /// Subscribers see a single combined notification per stream after `f`
    /// returns. Nested batches join the outermost one.
    pub fn batch<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        if self.batch.is_some() {
            return f(self);
        }
        self.batch = Some(PendingBatch::default());
        let result = f(self);
        if let Some(pending) = self.batch.take() {
            self.finish_batch(pending);
        }
        result
    }

    /// Runs the garbage collection policy for `added`, if enabled.
    ///
    /// Returns the removed atoms. Nothing is published.
    pub fn collect_garbage(&mut self, added: &[Atom<Op>]) -> Vec<Atom<Op>> {
        match self.options.collector() {
            Some(collector) => collector.collect(&mut self.weave, added),
            None => Vec::new(),
        }
    }

    fn admit(&mut self, atom: Atom<Op>) -> Option<Atom<Op>> {
        if let Some(reason) = self.verdict(&atom) {
            self.reject(atom, reason);
            return None;
        }
        self.factory.update_time_from(&atom);
        match self.weave.insert(atom.clone()) {
            WeaveInsert::Inserted(inserted) => {
                trace!(atom = %inserted.id(), "Added atom");
                self.pending().added.push(inserted.clone());
                Some(inserted)
            }
            WeaveInsert::Existing(existing) => Some(existing),
            WeaveInsert::Rejected(reason) => {
                self.reject(atom, reason);
                None
            }
        }
    }

    fn reject(&mut self, atom: Atom<Op>, reason: RejectionReason) {
        debug!(atom = %atom.id(), %reason, "Rejected atom");
        self.pending().rejected.push(RejectedAtom::new(atom, reason));
    }

    fn pending(&mut self) -> &mut PendingBatch<Op> {
        self.batch.get_or_insert_with(PendingBatch::default)
    }

    fn finish_batch(&mut self, pending: PendingBatch<Op>) {
        let PendingBatch { added, rejected } = pending;
        if !added.is_empty() {
            let archived = self.collect_garbage(&added);
            if archived.is_empty() {
                self.reduce(Some(added.as_slice()));
            } else {
                // Collected atoms may have been part of earlier results.
                self.reduce(None);
            }
            let _ = self.atom_added.send(added);
            if !archived.is_empty() {
                debug!(count = archived.len(), "Archived atoms");
                let _ = self.atoms_archived.send(archived);
            }
        }
        if !rejected.is_empty() {
            let _ = self.atom_rejected.send(rejected);
        }
    }

    fn reduce(&mut self, refs: Option<&[Atom<Op>]>) {
        let (value, metadata) = match (refs, self.reduced.take()) {
            (Some(_), Some((value, metadata))) => (Some(value), Some(metadata)),
            _ => (None, None),
        };
        self.reduced = Some(self.reducer.eval(&self.weave, refs, value, metadata));
    }

    fn resolve_key(&self, site: &SiteInfo) -> Option<Option<PublicKey>> {
        let validator = self.options.validator.as_ref()?;
        let crypto = site.crypto.as_ref()?;
        if crypto.signature_algorithm != validator.crypto().algorithm() {
            warn!(
                site = site.id,
                algorithm = %crypto.signature_algorithm,
                "Site signs with an unsupported algorithm"
            );
            return Some(None);
        }
        match validator.crypto().import_public_key(&crypto.public_key) {
            Ok(key) => Some(Some(key)),
            Err(e) => {
                warn!(site = site.id, error = %e, "Site advertises an unusable public key");
                Some(None)
            }
        }
    }

    fn verdict(&self, atom: &Atom<Op>) -> Option<RejectionReason> {
        self.verdicts(std::slice::from_ref(atom)).pop().flatten()
    }

    /// Checksum and signature checks for each atom, in input order.
    ///
    /// Signatures of atoms from the same site are verified as one batch.
    fn verdicts(&self, atoms: &[Atom<Op>]) -> Vec<Option<RejectionReason>> {
        let mut verdicts: Vec<Option<RejectionReason>> = atoms
            .iter()
            .map(|atom| (!atom.matches_checksum()).then_some(RejectionReason::ChecksumMismatch))
            .collect();
        let Some(validator) = &self.options.validator else {
            return verdicts;
        };

        let mut by_site: HashMap<u64, Vec<usize>> = HashMap::new();
        for (index, atom) in atoms.iter().enumerate() {
            if verdicts[index].is_some() {
                continue;
            }
            match self.public_keys.get(&atom.id().site) {
                Some(Some(_)) => by_site.entry(atom.id().site).or_default().push(index),
                Some(None) => verdicts[index] = Some(RejectionReason::SignatureFailed),
                None if atom.signature().is_some() => {
                    verdicts[index] = Some(RejectionReason::NoPublicKey)
                }
                None => {}
            }
        }

        for (site, indexes) in by_site {
            let Some(Some(key)) = self.public_keys.get(&site) else {
                continue;
            };
            let results = validator.verify_batch(key, indexes.iter().map(|&i| &atoms[i]));
            for (index, valid) in indexes.into_iter().zip(results) {
                if !valid {
                    verdicts[index] = Some(RejectionReason::SignatureFailed);
                }
            }
        }
        verdicts
    }
}
