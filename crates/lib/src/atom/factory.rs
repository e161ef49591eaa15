//! Per-site Lamport clock that stamps new atoms.

use tracing::trace;

use super::{Atom, AtomId, AtomOp};
use crate::Result;

/// Creates atoms for a single site.
///
/// The factory owns the site's Lamport clock. Every atom admitted into a
/// tree, local or remote, must be reported through [`AtomFactory::update_time`]
/// so the clock always exceeds every timestamp the site has observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomFactory {
    site: u64,
    time: u64,
}

impl AtomFactory {
    /// Creates a factory for `site` starting at the given Lamport time.
    pub fn new(site: u64, time: u64) -> Self {
        Self { site, time }
    }

    /// The site this factory stamps atoms for.
    pub fn site(&self) -> u64 {
        self.site
    }

    /// The current Lamport time.
    pub fn time(&self) -> u64 {
        self.time
    }

    /// Creates a new atom caused by `cause`.
    ///
    /// Increments the clock by one and stamps the atom with the new time. The
    /// atom is not inserted anywhere.
    pub fn create<Op: AtomOp>(
        &mut self,
        op: Op,
        cause: Option<AtomId>,
        priority: Option<u32>,
    ) -> Result<Atom<Op>> {
        if let Some(cause) = &cause {
            // A child must be newer than its cause.
            self.time = self.time.max(cause.timestamp);
        }
        self.time += 1;
        let id = AtomId::new(self.site, self.time).with_priority(priority.unwrap_or(0));
        trace!(site = self.site, timestamp = self.time, "Created atom");
        Atom::new(id, cause, op)
    }

    /// Creates a new atom caused by an existing atom.
    pub fn create_child<Op: AtomOp>(
        &mut self,
        op: Op,
        cause: &Atom<Op>,
        priority: Option<u32>,
    ) -> Result<Atom<Op>> {
        self.create(op, Some(*cause.id()), priority)
    }

    /// Advances the clock past a timestamp that was observed.
    ///
    /// Sets `time = max(time, timestamp) + 1`.
    pub fn update_time(&mut self, timestamp: u64) {
        self.time = self.time.max(timestamp) + 1;
    }

    /// Advances the clock past the timestamp of an admitted atom.
    pub fn update_time_from<Op>(&mut self, atom: &Atom<Op>) {
        self.update_time(atom.id().timestamp);
    }
}
