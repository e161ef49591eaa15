//! In-process realtime transport.
//!
//! A [`MemoryHub`] plays the server: it hosts one [`ChannelHandler`] per
//! channel id, answers requests with it, and relays broadcast atoms to the
//! other members of the channel. [`MemoryConnection`]s are its clients and can
//! be taken down and brought back up to exercise resynchronization.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, broadcast, watch};
use tracing::{debug, info, trace};

use super::{
    RealtimeError,
    connection::RealtimeConnection,
    handler::ChannelHandler,
    protocol::{JOIN_CHANNEL, RealtimeChannelInfo, RealtimeEvent},
};
use crate::{
    Result,
    atom::AtomOp,
    reducer::AtomReducer,
    tree::{CausalTreeFactory, CausalTreeOptions, SiteInfo, StoredCausalTreeVersion3},
};

/// Site id of the hub's own replica of each channel.
pub const HUB_SITE_ID: u64 = 0;

const EVENT_CAPACITY: usize = 1024;

struct HostedChannel<Op: AtomOp, R: AtomReducer<Op>> {
    handler: ChannelHandler<Op, R>,
    members: HashSet<u64>,
}

struct HubState<Op: AtomOp, R: AtomReducer<Op>> {
    channels: HashMap<String, HostedChannel<Op, R>>,
    connections: HashMap<u64, broadcast::Sender<RealtimeEvent>>,
}

struct HubInner<Op: AtomOp, F: CausalTreeFactory<Op>> {
    factory: F,
    options: CausalTreeOptions<Op>,
    state: Mutex<HubState<Op, F::Reducer>>,
    next_connection: AtomicU64,
}

/// An in-process server for realtime channels.
pub struct MemoryHub<Op: AtomOp, F: CausalTreeFactory<Op>> {
    inner: Arc<HubInner<Op, F>>,
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> Clone for MemoryHub<Op, F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> std::fmt::Debug for MemoryHub<Op, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub").finish_non_exhaustive()
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> MemoryHub<Op, F> {
    /// Creates a hub building channel trees with `factory`.
    pub fn new(factory: F) -> Self {
        Self::with_options(factory, CausalTreeOptions::default())
    }

    /// Creates a hub whose channel trees use `options`.
    pub fn with_options(factory: F, options: CausalTreeOptions<Op>) -> Self {
        Self {
            inner: Arc::new(HubInner {
                factory,
                options,
                state: Mutex::new(HubState {
                    channels: HashMap::new(),
                    connections: HashMap::new(),
                }),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Creates a new client connection. It starts disconnected.
    pub fn connection(&self) -> MemoryConnection<Op, F> {
        let (state, _) = watch::channel(false);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        MemoryConnection {
            id: self.inner.next_connection.fetch_add(1, Ordering::Relaxed),
            hub: self.clone(),
            state,
            events,
        }
    }

    /// Runs `f` against the handler of channel `id`, if it is hosted.
    pub async fn with_channel<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ChannelHandler<Op, F::Reducer>) -> T,
    ) -> Option<T> {
        let mut state = self.inner.state.lock().await;
        state.channels.get_mut(id).map(|hosted| f(&mut hosted.handler))
    }

    async fn attach(&self, connection: u64, events: broadcast::Sender<RealtimeEvent>) {
        self.inner
            .state
            .lock()
            .await
            .connections
            .insert(connection, events);
    }

    async fn detach(&self, connection: u64) {
        let mut state = self.inner.state.lock().await;
        state.connections.remove(&connection);
        for hosted in state.channels.values_mut() {
            hosted.members.remove(&connection);
        }
    }

    async fn join(&self, connection: u64, info: RealtimeChannelInfo) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.channels.contains_key(&info.id) {
            let stored = StoredCausalTreeVersion3::empty(SiteInfo::new(HUB_SITE_ID));
            let tree = self.inner.factory.create(
                &info.tree_type,
                stored.into(),
                self.inner.options.clone(),
            )?;
            info!(channel = %info.id, tree_type = %info.tree_type, "Hosting channel");
            state.channels.insert(
                info.id.clone(),
                HostedChannel {
                    handler: ChannelHandler::new(info.clone(), tree),
                    members: HashSet::new(),
                },
            );
        }
        if let Some(hosted) = state.channels.get_mut(&info.id) {
            hosted.members.insert(connection);
        }
        debug!(channel = %info.id, connection, "Connection joined channel");
        Ok(())
    }

    async fn broadcast(&self, connection: u64, name: &str, payload: Value) -> Result<()> {
        let channel = name.strip_prefix("event_").ok_or_else(|| RealtimeError::UnknownEvent {
            name: name.to_string(),
        })?;
        let mut state = self.inner.state.lock().await;
        let HubState {
            channels,
            connections,
        } = &mut *state;
        let hosted = joined(channels, channel, connection)?;
        let Some(atom) = hosted.handler.handle_event(name, payload.clone())? else {
            return Ok(());
        };
        trace!(channel, atom = %atom.id(), "Relaying atom");
        relay(connections, &hosted.members, connection, name, payload);
        Ok(())
    }

    async fn request(&self, connection: u64, name: &str, payload: Value) -> Result<Value> {
        let Some((_, channel)) = name.split_once('_') else {
            return Err(RealtimeError::UnknownEvent {
                name: name.to_string(),
            }
            .into());
        };
        let mut state = self.inner.state.lock().await;
        let HubState {
            channels,
            connections,
        } = &mut *state;
        let hosted = joined(channels, channel, connection)?;
        let handled = hosted.handler.handle_request(name, payload)?;
        if !handled.merged.is_empty() {
            let event = hosted.handler.info().event_name();
            debug!(channel, count = handled.merged.len(), "Relaying merged atoms");
            for atom in &handled.merged {
                let payload = serde_json::to_value(atom)
                    .map_err(|e| RealtimeError::invalid_payload(&event, e))?;
                relay(connections, &hosted.members, connection, &event, payload);
            }
        }
        Ok(handled.response)
    }
}

/// Sends an event to every member except `from`.
fn relay(
    connections: &HashMap<u64, broadcast::Sender<RealtimeEvent>>,
    members: &HashSet<u64>,
    from: u64,
    name: &str,
    payload: Value,
) {
    for member in members.iter().filter(|&&member| member != from) {
        if let Some(events) = connections.get(member) {
            let _ = events.send(RealtimeEvent {
                name: name.to_string(),
                payload: payload.clone(),
            });
        }
    }
}

fn joined<'a, Op: AtomOp, R: AtomReducer<Op>>(
    channels: &'a mut HashMap<String, HostedChannel<Op, R>>,
    channel: &str,
    connection: u64,
) -> Result<&'a mut HostedChannel<Op, R>> {
    channels
        .get_mut(channel)
        .filter(|hosted| hosted.members.contains(&connection))
        .ok_or_else(|| {
            RealtimeError::ChannelNotJoined {
                channel: channel.to_string(),
            }
            .into()
        })
}

/// A client connection to a [`MemoryHub`].
pub struct MemoryConnection<Op: AtomOp, F: CausalTreeFactory<Op>> {
    id: u64,
    hub: MemoryHub<Op, F>,
    state: watch::Sender<bool>,
    events: broadcast::Sender<RealtimeEvent>,
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> std::fmt::Debug for MemoryConnection<Op, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("connected", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> MemoryConnection<Op, F> {
    fn ensure_connected(&self) -> Result<()> {
        if *self.state.borrow() {
            Ok(())
        } else {
            Err(RealtimeError::NotConnected.into())
        }
    }
}

#[async_trait]
impl<Op: AtomOp, F: CausalTreeFactory<Op> + 'static> RealtimeConnection
    for MemoryConnection<Op, F>
{
    fn connection_state(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    async fn connect(&self) -> Result<()> {
        self.hub.attach(self.id, self.events.clone()).await;
        self.state.send_replace(true);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.hub.detach(self.id).await;
        self.state.send_replace(false);
        Ok(())
    }

    async fn emit(&self, name: &str, payload: Value) -> Result<()> {
        self.ensure_connected()?;
        if name == JOIN_CHANNEL {
            let info: RealtimeChannelInfo = serde_json::from_value(payload)
                .map_err(|e| RealtimeError::invalid_payload(name, e))?;
            self.hub.join(self.id, info).await
        } else {
            self.hub.broadcast(self.id, name, payload).await
        }
    }

    async fn request(&self, name: &str, payload: Value) -> Result<Value> {
        self.ensure_connected()?;
        self.hub.request(self.id, name, payload).await
    }

    fn events(&self) -> broadcast::Receiver<RealtimeEvent> {
        self.events.subscribe()
    }
}
