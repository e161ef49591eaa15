//! Messages exchanged over a realtime channel.
//!
//! Every channel uses four events named after its id:
//!
//! | Event | Kind | Payload | Response |
//! |---|---|---|---|
//! | `event_<id>` | broadcast | [`Atom`] | |
//! | `info_<id>` | request | [`SiteVersionInfo`] | [`SiteVersionInfo`] |
//! | `siteId_<id>` | request | [`SiteInfo`] | `bool` |
//! | `weave_<id>` | request | [`WeaveExchange`] | `Vec<Atom>` |
//!
//! plus [`JOIN_CHANNEL`], sent with the [`RealtimeChannelInfo`] whenever the
//! connection comes up.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{atom::Atom, tree::SiteInfo, weave::WeaveVersion};

/// Sent whenever a connection transitions to connected.
pub const JOIN_CHANNEL: &str = "join_channel";

/// Identifies a channel and the type of tree it carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RealtimeChannelInfo {
    /// Channel id, also the id the tree is stored under.
    pub id: String,
    /// Tree type name, resolved by a [`CausalTreeFactory`](crate::tree::CausalTreeFactory).
    #[serde(rename = "type")]
    pub tree_type: String,
}

impl RealtimeChannelInfo {
    /// Creates channel info for a tree of `tree_type`.
    pub fn new(id: impl Into<String>, tree_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tree_type: tree_type.into(),
        }
    }

    /// Name of the atom broadcast event.
    pub fn event_name(&self) -> String {
        format!("event_{}", self.id)
    }

    /// Name of the version info request.
    pub fn info_name(&self) -> String {
        format!("info_{}", self.id)
    }

    /// Name of the site id request.
    pub fn site_id_name(&self) -> String {
        format!("siteId_{}", self.id)
    }

    /// Name of the weave exchange request.
    pub fn weave_name(&self) -> String {
        format!("weave_{}", self.id)
    }
}

/// A site's view of a tree, exchanged to decide whether a resync is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteVersionInfo {
    /// The sender's site, if it has one yet.
    pub site: Option<SiteInfo>,
    /// Every site the sender knows, with their public keys.
    #[serde(default)]
    pub known_sites: Vec<SiteInfo>,
    /// The sender's weave version. Empty without a tree.
    pub version: WeaveVersion,
}

/// Request payload of a weave exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeaveExchange<Op> {
    /// The sender's atoms in weave order.
    pub weave: Vec<Atom<Op>>,
    /// The sender's version, or `None` if it has no tree yet.
    pub current_version: Option<WeaveVersion>,
}

/// A raw event delivered by a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeEvent {
    /// Event name, e.g. `event_<id>`.
    pub name: String,
    /// JSON payload as sent.
    pub payload: Value,
}
