//! A causal tree kept in sync over a realtime channel.

use std::sync::{Arc, Mutex as StdMutex};

use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, trace};

use super::{
    RealtimeError,
    channel::{AtomEmitter, RealtimeChannel},
    protocol::{RealtimeChannelInfo, SiteVersionInfo, WeaveExchange},
};
use crate::{
    Error, Result,
    atom::{Atom, AtomOp},
    store::CausalTreeStore,
    tree::{
        CausalTree, CausalTreeFactory, CausalTreeOptions, SiteInfo, StoredCausalTreeVersion3,
        site::next_site_id,
    },
    weave::WeaveVersion,
};

const ERROR_CAPACITY: usize = 64;

/// Where a [`RealtimeCausalTree`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealtimeState {
    /// `init` has not run.
    Uninitialized,
    /// Waiting for the channel to connect.
    Disconnected,
    /// Connected without a tree, negotiating a site id.
    AwaitingSiteId,
    /// Exchanging versions and weaves with the peer.
    Syncing,
    /// In sync and relaying atoms.
    Connected,
    /// `close` was called.
    Closed,
}

/// Options for [`RealtimeCausalTree`].
///
/// ```
/// use causal_trees::realtime::RealtimeCausalTreeOptions;
///
/// let options: RealtimeCausalTreeOptions =
///     serde_json::from_str(r#"{"max_site_id_attempts": 8}"#).unwrap();
/// assert_eq!(options.max_site_id_attempts, 8);
/// assert!(options.validate_remote_weaves);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeCausalTreeOptions {
    /// Site ids to try before giving up on site negotiation.
    pub max_site_id_attempts: u32,
    /// Check weaves received from the peer before importing them.
    pub validate_remote_weaves: bool,
    /// Write the tree to the store after every sync.
    pub persist_on_sync: bool,
}

impl Default for RealtimeCausalTreeOptions {
    fn default() -> Self {
        Self {
            max_site_id_attempts: 256,
            validate_remote_weaves: true,
            persist_on_sync: true,
        }
    }
}

impl RealtimeCausalTreeOptions {
    /// Sets how many site ids to try.
    pub fn with_max_site_id_attempts(mut self, attempts: u32) -> Self {
        self.max_site_id_attempts = attempts;
        self
    }

    /// Sets whether remote weaves are checked before import.
    pub fn with_validate_remote_weaves(mut self, validate: bool) -> Self {
        self.validate_remote_weaves = validate;
        self
    }

    /// Sets whether the tree is stored after every sync.
    pub fn with_persist_on_sync(mut self, persist: bool) -> Self {
        self.persist_on_sync = persist;
        self
    }
}

type Tree<Op, F> = CausalTree<Op, <F as CausalTreeFactory<Op>>::Reducer>;

struct Shared<Op: AtomOp, F: CausalTreeFactory<Op>> {
    channel: RealtimeChannel<Op>,
    factory: Arc<F>,
    store: Arc<dyn CausalTreeStore<Op>>,
    tree_options: CausalTreeOptions<Op>,
    options: RealtimeCausalTreeOptions,
    tree: Mutex<Option<Tree<Op, F>>>,
    state: watch::Sender<RealtimeState>,
    updated: watch::Sender<Option<Vec<Atom<Op>>>>,
    errors: broadcast::Sender<Arc<Error>>,
    relay: StdMutex<Option<JoinHandle<()>>>,
}

/// A causal tree synchronized with peers over a [`RealtimeChannel`].
///
/// After [`init`](Self::init) the tree follows the channel's connection:
///
/// - Without a tree, the first connection negotiates a site id, creates an
///   empty tree for it, and imports the peer's weave.
/// - With a tree, every connection compares versions with the peer and
///   exchanges weaves only if they differ.
/// - Atoms broadcast by peers are added to the tree. Atoms created locally
///   are broadcast, but only those of our own site, so nothing is echoed.
///
/// Failures in this pipeline are logged and published on
/// [`errors`](Self::errors); they never reach the connection.
pub struct RealtimeCausalTree<Op: AtomOp, F: CausalTreeFactory<Op>> {
    shared: Arc<Shared<Op, F>>,
    task: StdMutex<Option<JoinHandle<()>>>,
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> std::fmt::Debug for RealtimeCausalTree<Op, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeCausalTree")
            .field("channel", self.shared.channel.info())
            .field("state", &*self.shared.state.borrow())
            .finish_non_exhaustive()
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> Drop for RealtimeCausalTree<Op, F> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op>> RealtimeCausalTree<Op, F> {
    fn stop(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        if let Some(relay) = lock(&self.shared.relay).take() {
            relay.abort();
        }
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op> + 'static> RealtimeCausalTree<Op, F> {
    /// Creates an uninitialized tree for `channel`. Trees are built by
    /// `factory` with `tree_options` and persisted in `store`.
    pub fn new(
        channel: RealtimeChannel<Op>,
        factory: Arc<F>,
        store: Arc<dyn CausalTreeStore<Op>>,
        tree_options: CausalTreeOptions<Op>,
        options: RealtimeCausalTreeOptions,
    ) -> Self {
        let (errors, _) = broadcast::channel(ERROR_CAPACITY);
        let (state, _) = watch::channel(RealtimeState::Uninitialized);
        let (updated, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                channel,
                factory,
                store,
                tree_options,
                options,
                tree: Mutex::new(None),
                state,
                updated,
                errors,
                relay: StdMutex::new(None),
            }),
            task: StdMutex::new(None),
        }
    }

    /// Loads the tree from the store, if present, and starts following the
    /// channel.
    pub async fn init(&self) -> Result<()> {
        let shared = &self.shared;
        if *shared.state.borrow() != RealtimeState::Uninitialized {
            return Ok(());
        }
        shared.store.init().await?;
        let id = &shared.channel.info().id;
        if let Some(stored) = shared.store.get(id).await? {
            let tree = shared.factory.create(
                &shared.channel.info().tree_type,
                stored,
                shared.tree_options.clone(),
            )?;
            info!(channel = %id, site = tree.site().id, atoms = tree.weave().len(), "Loaded tree from store");
            let weave = tree.weave().atoms().to_vec();
            shared.replace_tree(&mut *shared.tree.lock().await, tree);
            shared.updated.send_replace(Some(weave));
        }
        shared.state.send_replace(RealtimeState::Disconnected);

        let task = tokio::spawn(Arc::clone(shared).run());
        if let Some(old) = lock(&self.task).replace(task) {
            old.abort();
        }
        Ok(())
    }

    /// The channel the tree follows.
    pub fn channel_info(&self) -> &RealtimeChannelInfo {
        self.shared.channel.info()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> RealtimeState {
        *self.shared.state.borrow()
    }

    /// Subscribes to lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<RealtimeState> {
        self.shared.state.subscribe()
    }

    /// Our site, once a tree exists.
    pub async fn site(&self) -> Option<SiteInfo> {
        self.shared
            .tree
            .lock()
            .await
            .as_ref()
            .map(|tree| tree.site().clone())
    }

    /// Runs `f` against the tree, if one exists.
    ///
    /// Atoms `f` creates are broadcast once the channel is connected.
    pub async fn with_tree<T>(&self, f: impl FnOnce(&mut Tree<Op, F>) -> T) -> Option<T> {
        self.shared.tree.lock().await.as_mut().map(f)
    }

    /// The latest atoms that changed the tree.
    ///
    /// Holds the whole weave after loading or syncing and the added atoms
    /// after every other change. Starts as `None` until a tree exists.
    pub fn updated(&self) -> watch::Receiver<Option<Vec<Atom<Op>>>> {
        self.shared.updated.subscribe()
    }

    /// Subscribes to errors raised while syncing.
    pub fn errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.shared.errors.subscribe()
    }

    /// Writes the tree to the store.
    pub async fn persist(&self) -> Result<()> {
        let stored = self.shared.tree.lock().await.as_ref().map(|tree| tree.export());
        match stored {
            Some(stored) => self.shared.save(stored).await,
            None => Ok(()),
        }
    }

    /// Stops following the channel. The tree stays readable.
    pub fn close(&self) {
        self.stop();
        self.shared.state.send_replace(RealtimeState::Closed);
        debug!(channel = %self.shared.channel.info().id, "Closed realtime tree");
    }
}

impl<Op: AtomOp, F: CausalTreeFactory<Op> + 'static> Shared<Op, F> {
    async fn run(self: Arc<Self>) {
        let mut connection = self.channel.connection_state();
        let mut atoms = self.channel.atoms();
        if *connection.borrow_and_update() {
            self.on_connection(true).await;
        }
        loop {
            tokio::select! {
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let connected = *connection.borrow_and_update();
                    self.on_connection(connected).await;
                }
                atom = atoms.recv() => match atom {
                    Some(atom) => {
                        if let Err(e) = self.receive(atom).await {
                            self.report(e);
                        }
                    }
                    None => break,
                },
            }
        }
        debug!(channel = %self.channel.info().id, "Realtime tree stopped");
    }

    async fn on_connection(&self, connected: bool) {
        if !connected {
            self.state.send_replace(RealtimeState::Disconnected);
            debug!(channel = %self.channel.info().id, "Disconnected");
            return;
        }
        let has_tree = self.tree.lock().await.is_some();
        let result = if has_tree {
            self.resync().await
        } else {
            self.bootstrap().await
        };
        match result {
            Ok(()) => {
                self.state.send_replace(RealtimeState::Connected);
            }
            Err(e) => {
                self.report(e);
                if !self.channel.is_connected() {
                    self.state.send_replace(RealtimeState::Disconnected);
                }
            }
        }
    }

    /// Joins the channel without a tree.
    async fn bootstrap(&self) -> Result<()> {
        self.state.send_replace(RealtimeState::AwaitingSiteId);
        let remote = self
            .channel
            .exchange_info(&SiteVersionInfo {
                site: None,
                known_sites: Vec::new(),
                version: WeaveVersion::default(),
            })
            .await?;
        let site = self.negotiate_site(&remote).await?;

        self.state.send_replace(RealtimeState::Syncing);
        let stored = StoredCausalTreeVersion3::empty(site);
        let mut tree = self.factory.create(
            &self.channel.info().tree_type,
            stored.into(),
            self.tree_options.clone(),
        )?;
        for site in remote.known_sites.into_iter().chain(remote.site) {
            tree.register_site(site);
        }
        let atoms = self
            .channel
            .exchange_weaves(&WeaveExchange {
                weave: Vec::new(),
                current_version: None,
            })
            .await?;
        let imported = tree.import_weave(atoms, self.options.validate_remote_weaves)?;
        info!(
            channel = %self.channel.info().id,
            site = tree.site().id,
            imported = imported.len(),
            "Joined with new site"
        );

        let weave = tree.weave().atoms().to_vec();
        let stored = self.options.persist_on_sync.then(|| tree.export());
        self.replace_tree(&mut *self.tree.lock().await, tree);
        self.updated.send_replace(Some(weave));
        if let Some(stored) = stored {
            self.save(stored).await?;
        }
        Ok(())
    }

    /// Finds a site id the peer grants, starting above every known one.
    async fn negotiate_site(&self, remote: &SiteVersionInfo) -> Result<SiteInfo> {
        let first = next_site_id(remote.known_sites.iter().chain(remote.site.as_ref()));
        let signing_key = self
            .tree_options
            .validator
            .as_ref()
            .and(self.tree_options.signing_key.as_ref());
        for id in (first..).take(self.options.max_site_id_attempts as usize) {
            let site = match signing_key {
                Some(key) => SiteInfo::with_public_key(id, &key.public_key()),
                None => SiteInfo::new(id),
            };
            if self.channel.request_site_id(&site).await? {
                info!(channel = %self.channel.info().id, site = id, "Site id granted");
                return Ok(site);
            }
            trace!(site = id, "Site id refused");
        }
        Err(RealtimeError::SiteIdUnavailable {
            attempts: self.options.max_site_id_attempts,
        }
        .into())
    }

    /// Brings an existing tree up to date with the peer.
    async fn resync(&self) -> Result<()> {
        self.state.send_replace(RealtimeState::Syncing);
        let local = self.local_info().await?;
        let remote = self.channel.exchange_info(&local).await?;
        self.register_sites(&remote).await;

        if remote.version.hash == local.version.hash {
            info!(channel = %self.channel.info().id, "Versions match");
            return Ok(());
        }

        let weave = match self.tree.lock().await.as_ref() {
            Some(tree) => tree.weave().atoms().to_vec(),
            None => return Err(RealtimeError::Closed.into()),
        };
        let atoms = self
            .channel
            .exchange_weaves(&WeaveExchange {
                weave,
                current_version: Some(local.version),
            })
            .await?;

        let stored = {
            let mut slot = self.tree.lock().await;
            let Some(tree) = slot.as_mut() else {
                return Err(RealtimeError::Closed.into());
            };
            let imported = tree.import_weave(atoms, self.options.validate_remote_weaves)?;
            info!(
                channel = %self.channel.info().id,
                imported = imported.len(),
                "Resynchronized weave"
            );
            if !imported.is_empty() {
                self.updated.send_replace(Some(tree.weave().atoms().to_vec()));
            }
            self.options.persist_on_sync.then(|| tree.export())
        };
        if let Some(stored) = stored {
            self.save(stored).await?;
        }
        Ok(())
    }

    async fn local_info(&self) -> Result<SiteVersionInfo> {
        let tree = self.tree.lock().await;
        let tree = tree.as_ref().ok_or(RealtimeError::Closed)?;
        Ok(SiteVersionInfo {
            site: Some(tree.site().clone()),
            known_sites: tree.known_sites().to_vec(),
            version: tree.weave().get_version(),
        })
    }

    async fn register_sites(&self, remote: &SiteVersionInfo) {
        if let Some(tree) = self.tree.lock().await.as_mut() {
            for site in remote.known_sites.iter().chain(remote.site.as_ref()) {
                tree.register_site(site.clone());
            }
        }
    }

    /// Adds an atom broadcast by a peer.
    async fn receive(&self, atom: Atom<Op>) -> Result<()> {
        let needs_sites = match self.tree.lock().await.as_ref() {
            None => {
                trace!(atom = %atom.id(), "No tree yet, dropping atom");
                return Ok(());
            }
            Some(tree) => {
                tree.options().validator.is_some()
                    && !tree
                        .known_sites()
                        .iter()
                        .any(|site| site.id == atom.id().site)
            }
        };
        if needs_sites {
            // The key of a site that joined after us is only known to the peer.
            let local = self.local_info().await?;
            let remote = self.channel.exchange_info(&local).await?;
            self.register_sites(&remote).await;
        }
        if let Some(tree) = self.tree.lock().await.as_mut() {
            tree.add(atom);
        }
        Ok(())
    }

    /// Swaps in a new tree and starts relaying its events.
    fn replace_tree(&self, slot: &mut Option<Tree<Op, F>>, tree: Tree<Op, F>) {
        let relay = Relay {
            site: tree.site().id,
            added: tree.subscribe_atom_added(),
            archived: tree.subscribe_atoms_archived(),
        };
        *slot = Some(tree);
        let task = tokio::spawn(relay.run(self.relay_targets()));
        if let Some(old) = lock(&self.relay).replace(task) {
            old.abort();
        }
    }

    fn relay_targets(&self) -> RelayTargets<Op> {
        RelayTargets {
            id: self.channel.info().id.clone(),
            emitter: self.channel.emitter(),
            store: Arc::clone(&self.store),
            state: self.state.subscribe(),
            updated: self.updated.clone(),
            errors: self.errors.clone(),
        }
    }

    async fn save(&self, stored: StoredCausalTreeVersion3<Op>) -> Result<()> {
        let id = &self.channel.info().id;
        self.store.update(id, stored.into()).await?;
        trace!(channel = %id, "Persisted tree");
        Ok(())
    }

    fn report(&self, e: Error) {
        report(&self.errors, &self.channel.info().id, e);
    }
}

fn report(errors: &broadcast::Sender<Arc<Error>>, channel: &str, e: Error) {
    error!(channel, error = %e, "Realtime sync failed");
    let _ = errors.send(Arc::new(e));
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The event streams of one tree instance.
struct Relay<Op> {
    site: u64,
    added: broadcast::Receiver<Vec<Atom<Op>>>,
    archived: broadcast::Receiver<Vec<Atom<Op>>>,
}

/// Where a relay sends what it sees.
struct RelayTargets<Op> {
    id: String,
    emitter: AtomEmitter<Op>,
    store: Arc<dyn CausalTreeStore<Op>>,
    state: watch::Receiver<RealtimeState>,
    updated: watch::Sender<Option<Vec<Atom<Op>>>>,
    errors: broadcast::Sender<Arc<Error>>,
}

impl<Op: AtomOp> Relay<Op> {
    async fn run(mut self, targets: RelayTargets<Op>) {
        loop {
            tokio::select! {
                added = self.added.recv() => match added {
                    Ok(atoms) => self.forward(&targets, atoms).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        report(&targets.errors, &targets.id, RealtimeError::RelayLagged { skipped }.into());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                archived = self.archived.recv() => match archived {
                    Ok(atoms) => {
                        if let Err(e) = targets.store.add_archived_atoms(&targets.id, atoms).await {
                            report(&targets.errors, &targets.id, e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn forward(&self, targets: &RelayTargets<Op>, atoms: Vec<Atom<Op>>) {
        let online = matches!(
            *targets.state.borrow(),
            RealtimeState::Syncing | RealtimeState::Connected
        );
        if online {
            for atom in atoms.iter().filter(|atom| atom.id().site == self.site) {
                if let Err(e) = targets.emitter.emit(atom).await {
                    report(&targets.errors, &targets.id, e);
                }
            }
        }
        targets.updated.send_replace(Some(atoms));
    }
}
