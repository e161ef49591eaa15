//! Realtime synchronization of causal trees.
//!
//! A [`RealtimeConnection`] carries JSON events and requests to a peer. A
//! [`RealtimeChannel`] gives typed access to one tree's channel on it, and a
//! [`RealtimeCausalTree`] keeps a local tree in sync through the channel. On
//! the other side a [`ChannelHandler`] answers the channel's requests.
//!
//! [`MemoryHub`] and [`MemoryConnection`] implement the transport in process.

mod channel;
mod connection;
mod error;
mod handler;
mod memory;
mod protocol;
mod tree;

pub use channel::{AtomEmitter, ChannelAtoms, RealtimeChannel};
pub use connection::RealtimeConnection;
pub use error::RealtimeError;
pub use handler::{ChannelHandler, Handled};
pub use memory::{HUB_SITE_ID, MemoryConnection, MemoryHub};
pub use protocol::{
    JOIN_CHANNEL, RealtimeChannelInfo, RealtimeEvent, SiteVersionInfo, WeaveExchange,
};
pub use tree::{RealtimeCausalTree, RealtimeCausalTreeOptions, RealtimeState};
