//! The peer side of the realtime protocol.
//!
//! A [`ChannelHandler`] answers channel requests against a tree it owns. It
//! is transport-agnostic: a server hands it the event name and JSON payload
//! of each request and sends back whatever it returns.

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, trace};

use super::{
    RealtimeError,
    protocol::{RealtimeChannelInfo, SiteVersionInfo, WeaveExchange},
};
use crate::{
    Result,
    atom::{Atom, AtomOp},
    reducer::AtomReducer,
    tree::{CausalTree, SiteInfo},
};

/// The outcome of a handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct Handled<Op> {
    /// Payload to send back to the caller.
    pub response: Value,
    /// Atoms newly merged into the tree, in weave order. The other members
    /// of the channel have not seen them yet.
    pub merged: Vec<Atom<Op>>,
}

/// Answers the requests of one channel.
#[derive(Debug)]
pub struct ChannelHandler<Op: AtomOp, R: AtomReducer<Op>> {
    info: RealtimeChannelInfo,
    tree: CausalTree<Op, R>,
}

impl<Op: AtomOp, R: AtomReducer<Op>> ChannelHandler<Op, R> {
    /// Serves `tree` on the channel described by `info`.
    pub fn new(info: RealtimeChannelInfo, tree: CausalTree<Op, R>) -> Self {
        Self { info, tree }
    }

    /// The channel served.
    pub fn info(&self) -> &RealtimeChannelInfo {
        &self.info
    }

    /// The served tree.
    pub fn tree(&self) -> &CausalTree<Op, R> {
        &self.tree
    }

    /// The served tree, for local writes. Those are not broadcast.
    pub fn tree_mut(&mut self) -> &mut CausalTree<Op, R> {
        &mut self.tree
    }

    /// Dispatches a request by event name.
    pub fn handle_request(&mut self, name: &str, payload: Value) -> Result<Handled<Op>> {
        let mut merged = Vec::new();
        let response = if name == self.info.info_name() {
            let remote = decode(name, payload)?;
            encode(name, &self.exchange_info(remote))?
        } else if name == self.info.site_id_name() {
            let site = decode(name, payload)?;
            encode(name, &self.grant_site_id(site))?
        } else if name == self.info.weave_name() {
            let exchange = decode(name, payload)?;
            merged = self.merge_weave(exchange)?;
            encode(name, self.tree.weave().atoms())?
        } else {
            return Err(RealtimeError::UnknownEvent {
                name: name.to_string(),
            }
            .into());
        };
        Ok(Handled { response, merged })
    }

    /// Handles a broadcast event. Returns the atom if it is now in the tree
    /// and should be relayed to the other members.
    pub fn handle_event(&mut self, name: &str, payload: Value) -> Result<Option<Atom<Op>>> {
        if name != self.info.event_name() {
            return Err(RealtimeError::UnknownEvent {
                name: name.to_string(),
            }
            .into());
        }
        let atom = decode(name, payload)?;
        Ok(self.add_atom(atom))
    }

    /// Registers the caller's sites and returns our version info.
    pub fn exchange_info(&mut self, remote: SiteVersionInfo) -> SiteVersionInfo {
        for site in remote.known_sites.into_iter().chain(remote.site) {
            self.tree.register_site(site);
        }
        SiteVersionInfo {
            site: Some(self.tree.site().clone()),
            known_sites: self.tree.known_sites().to_vec(),
            version: self.tree.weave().get_version(),
        }
    }

    /// Grants `site` if no known site has its id.
    pub fn grant_site_id(&mut self, site: SiteInfo) -> bool {
        if self.tree.known_sites().iter().any(|known| known.id == site.id) {
            debug!(channel = %self.info.id, site = site.id, "Site id taken");
            return false;
        }
        info!(channel = %self.info.id, site = site.id, "Granted site id");
        self.tree.register_site(site);
        true
    }

    /// Merges the caller's weave. Returns the atoms that were new to us.
    pub fn merge_weave(&mut self, exchange: WeaveExchange<Op>) -> Result<Vec<Atom<Op>>> {
        if exchange.weave.is_empty() {
            return Ok(Vec::new());
        }
        let added = self.tree.import_weave(exchange.weave, true)?;
        debug!(channel = %self.info.id, added = added.len(), "Merged remote weave");
        Ok(added)
    }

    /// Adds a broadcast atom.
    pub fn add_atom(&mut self, atom: Atom<Op>) -> Option<Atom<Op>> {
        trace!(channel = %self.info.id, atom = %atom.id(), "Received atom");
        let existed = self.tree.weave().contains(atom.id());
        let added = self.tree.add(atom)?;
        (!existed).then_some(added)
    }
}

fn decode<T: DeserializeOwned>(name: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload).map_err(|e| RealtimeError::invalid_payload(name, e).into())
}

fn encode<T: Serialize + ?Sized>(name: &str, value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| RealtimeError::invalid_payload(name, e).into())
}
