//! Typed access to one channel of a realtime connection.

use std::{marker::PhantomData, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{
    RealtimeError,
    connection::RealtimeConnection,
    protocol::{JOIN_CHANNEL, RealtimeChannelInfo, RealtimeEvent, SiteVersionInfo, WeaveExchange},
};
use crate::{
    Result,
    atom::{Atom, AtomOp},
    tree::SiteInfo,
};

/// One channel over a [`RealtimeConnection`].
///
/// The channel announces itself with [`JOIN_CHANNEL`] every time the
/// connection comes up, and only reports itself connected once the
/// announcement has been sent.
pub struct RealtimeChannel<Op> {
    info: RealtimeChannelInfo,
    connection: Arc<dyn RealtimeConnection>,
    state: watch::Receiver<bool>,
    join_task: JoinHandle<()>,
    _op: PhantomData<fn() -> Op>,
}

impl<Op> std::fmt::Debug for RealtimeChannel<Op> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("info", &self.info)
            .field("connected", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<Op> Drop for RealtimeChannel<Op> {
    fn drop(&mut self) {
        self.join_task.abort();
    }
}

impl<Op: AtomOp> RealtimeChannel<Op> {
    /// Opens `info` over `connection`. Must be called within a tokio runtime.
    pub fn new(info: RealtimeChannelInfo, connection: Arc<dyn RealtimeConnection>) -> Self {
        let (state_tx, state) = watch::channel(false);
        let join_task = tokio::spawn(join_on_connect(
            info.clone(),
            Arc::clone(&connection),
            state_tx,
        ));
        Self {
            info,
            connection,
            state,
            join_task,
            _op: PhantomData,
        }
    }

    /// The channel this handle joins.
    pub fn info(&self) -> &RealtimeChannelInfo {
        &self.info
    }

    /// Whether the channel is joined. Every transition is published.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.state.clone()
    }

    /// Whether the channel is joined right now.
    pub fn is_connected(&self) -> bool {
        *self.state.borrow()
    }

    /// Connects the underlying connection.
    pub async fn connect(&self) -> Result<()> {
        self.connection.connect().await
    }

    /// Disconnects the underlying connection.
    pub async fn disconnect(&self) -> Result<()> {
        self.connection.disconnect().await
    }

    /// Broadcasts an atom to the other members of the channel.
    pub async fn emit_atom(&self, atom: &Atom<Op>) -> Result<()> {
        self.emitter().emit(atom).await
    }

    /// A handle that broadcasts atoms on this channel.
    pub fn emitter(&self) -> AtomEmitter<Op> {
        AtomEmitter {
            connection: Arc::clone(&self.connection),
            name: self.info.event_name(),
            _op: PhantomData,
        }
    }

    /// Sends our version info and returns the peer's.
    pub async fn exchange_info(&self, info: &SiteVersionInfo) -> Result<SiteVersionInfo> {
        self.call(self.info.info_name(), info).await
    }

    /// Asks the peer to grant `site`'s id.
    pub async fn request_site_id(&self, site: &SiteInfo) -> Result<bool> {
        self.call(self.info.site_id_name(), site).await
    }

    /// Sends our weave and returns the peer's atoms.
    pub async fn exchange_weaves(&self, exchange: &WeaveExchange<Op>) -> Result<Vec<Atom<Op>>> {
        self.call(self.info.weave_name(), exchange).await
    }

    /// Subscribes to atoms broadcast by other members.
    pub fn atoms(&self) -> ChannelAtoms<Op> {
        ChannelAtoms {
            events: self.connection.events(),
            name: self.info.event_name(),
            _op: PhantomData,
        }
    }

    async fn call<Req: Serialize, Res: DeserializeOwned>(
        &self,
        name: String,
        payload: &Req,
    ) -> Result<Res> {
        let payload =
            serde_json::to_value(payload).map_err(|e| RealtimeError::invalid_payload(&name, e))?;
        let response = self.connection.request(&name, payload).await?;
        serde_json::from_value(response).map_err(|e| RealtimeError::invalid_payload(&name, e).into())
    }
}

async fn join_on_connect(
    info: RealtimeChannelInfo,
    connection: Arc<dyn RealtimeConnection>,
    state: watch::Sender<bool>,
) {
    let mut upstream = connection.connection_state();
    loop {
        let connected = *upstream.borrow_and_update();
        if connected {
            match serde_json::to_value(&info) {
                Ok(payload) => {
                    if let Err(e) = connection.emit(JOIN_CHANNEL, payload).await {
                        warn!(channel = %info.id, error = %e, "Failed to join channel");
                    } else {
                        debug!(channel = %info.id, "Joined channel");
                    }
                }
                Err(e) => warn!(channel = %info.id, error = %e, "Failed to encode channel info"),
            }
        }
        // Always notifies, so a reconnect seen as true -> true still resyncs.
        state.send_replace(connected);
        if upstream.changed().await.is_err() {
            break;
        }
    }
}

/// Broadcasts atoms on a channel. Outlives the channel it came from.
pub struct AtomEmitter<Op> {
    connection: Arc<dyn RealtimeConnection>,
    name: String,
    _op: PhantomData<fn() -> Op>,
}

impl<Op> Clone for AtomEmitter<Op> {
    fn clone(&self) -> Self {
        Self {
            connection: Arc::clone(&self.connection),
            name: self.name.clone(),
            _op: PhantomData,
        }
    }
}

impl<Op: AtomOp> AtomEmitter<Op> {
    /// Broadcasts `atom` on the channel's event name.
    pub async fn emit(&self, atom: &Atom<Op>) -> Result<()> {
        let payload = serde_json::to_value(atom)
            .map_err(|e| RealtimeError::invalid_payload(&self.name, e))?;
        trace!(event = %self.name, atom = %atom.id(), "Emitting atom");
        self.connection.emit(&self.name, payload).await
    }
}

/// Atoms arriving on a channel's broadcast event.
pub struct ChannelAtoms<Op> {
    events: broadcast::Receiver<RealtimeEvent>,
    name: String,
    _op: PhantomData<fn() -> Op>,
}

impl<Op: AtomOp> ChannelAtoms<Op> {
    /// The next atom, or `None` once the connection is gone.
    ///
    /// Undecodable payloads are skipped.
    pub async fn recv(&mut self) -> Option<Atom<Op>> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.name == self.name => {
                    match serde_json::from_value(event.payload) {
                        Ok(atom) => return Some(atom),
                        Err(e) => warn!(event = %self.name, error = %e, "Dropping undecodable atom"),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(event = %self.name, skipped, "Missed channel events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
