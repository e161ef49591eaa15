//! The transport a realtime channel runs over.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use super::protocol::RealtimeEvent;
use crate::Result;

/// A bidirectional event/request connection to a peer.
///
/// Payloads are JSON values, so one connection can carry channels of any
/// operation type.
#[async_trait]
pub trait RealtimeConnection: Send + Sync {
    /// Whether the connection is up. Every transition is published.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Brings the connection up.
    async fn connect(&self) -> Result<()>;

    /// Takes the connection down.
    async fn disconnect(&self) -> Result<()>;

    /// Sends a fire-and-forget event.
    async fn emit(&self, name: &str, payload: Value) -> Result<()>;

    /// Sends a request and waits for the peer's response.
    async fn request(&self, name: &str, payload: Value) -> Result<Value>;

    /// Subscribes to events sent by the peer.
    fn events(&self) -> broadcast::Receiver<RealtimeEvent>;
}
