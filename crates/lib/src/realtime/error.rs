//! Error types for realtime synchronization.

use thiserror::Error;

/// Errors that can occur while synchronizing a tree over a realtime channel.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RealtimeError {
    /// The connection is down.
    #[error("Not connected")]
    NotConnected,

    /// A request was made on a channel the connection has not joined.
    #[error("Channel '{channel}' has not been joined")]
    ChannelNotJoined { channel: String },

    /// The peer does not understand an event.
    #[error("Unknown event '{name}'")]
    UnknownEvent { name: String },

    /// A message could not be decoded.
    #[error("Invalid payload for '{event}': {reason}")]
    InvalidPayload { event: String, reason: String },

    /// No site id was granted within the configured number of attempts.
    #[error("No site id granted after {attempts} attempts")]
    SiteIdUnavailable { attempts: u32 },

    /// Tree events were dropped before they could be relayed.
    #[error("Relay missed {skipped} batches of atoms")]
    RelayLagged { skipped: u64 },

    /// The realtime tree has been closed.
    #[error("Realtime tree closed")]
    Closed,
}

impl RealtimeError {
    /// Check if this is a network/connection error.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            RealtimeError::NotConnected | RealtimeError::ChannelNotJoined { .. }
        )
    }

    /// Check if this is a protocol error.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            RealtimeError::UnknownEvent { .. } | RealtimeError::InvalidPayload { .. }
        )
    }

    pub(crate) fn invalid_payload(event: &str, err: serde_json::Error) -> Self {
        RealtimeError::InvalidPayload {
            event: event.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<RealtimeError> for crate::Error {
    fn from(err: RealtimeError) -> Self {
        crate::Error::Realtime(err)
    }
}
