use std::{future::Future, sync::Arc, time::Duration};

use causal_trees::{
    Atom, CausalTree, CausalTreeOptions, Weave,
    atom::{AtomFactory, AtomId},
    realtime::{
        MemoryConnection, MemoryHub, RealtimeCausalTree, RealtimeCausalTreeOptions,
        RealtimeChannel, RealtimeChannelInfo, RealtimeConnection, RealtimeState,
    },
    reducer::AtomReducer,
    store::InMemoryStore,
    tree::{ReducerRegistry, SiteInfo},
};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Concatenates atom values in weave order.
#[derive(Debug)]
pub struct Text;

impl AtomReducer<String> for Text {
    type Value = String;
    type Metadata = ();

    fn eval(
        &self,
        weave: &Weave<String>,
        _refs: Option<&[Atom<String>]>,
        _value: Option<String>,
        _metadata: Option<()>,
    ) -> (String, ()) {
        let text = weave.atoms().iter().map(|a| a.value().as_str()).collect();
        (text, ())
    }
}

pub type TextTree = CausalTree<String, Text>;
pub type TextRegistry = ReducerRegistry<Text>;
pub type TextHub = MemoryHub<String, TextRegistry>;
pub type TextClient = RealtimeCausalTree<String, TextRegistry>;

pub const CHANNEL: &str = "doc";
pub const TREE_TYPE: &str = "text";

pub fn text_tree(site: u64) -> TextTree {
    CausalTree::empty(SiteInfo::new(site), Text, CausalTreeOptions::default()).unwrap()
}

pub fn registry() -> TextRegistry {
    ReducerRegistry::new().register(TREE_TYPE, || Text)
}

/// Generates `count` atoms from `sites` sites, each caused by a random
/// earlier atom, in creation order.
pub fn random_atoms(seed: u64, sites: u64, count: usize) -> Vec<Atom<String>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut factories: Vec<AtomFactory> = (1..=sites).map(|site| AtomFactory::new(site, 0)).collect();
    let mut atoms: Vec<Atom<String>> = Vec::with_capacity(count);

    let root = factories[0].create("root".to_string(), None, None).unwrap();
    atoms.push(root);
    while atoms.len() < count {
        let cause = *atoms[rng.gen_range(0..atoms.len())].id();
        let factory = &mut factories[rng.gen_range(0..sites as usize)];
        let priority = (rng.gen_range(0..10) == 0).then_some(1);
        let value = format!("{}", atoms.len());
        atoms.push(factory.create(value, Some(cause), priority).unwrap());
    }
    atoms
}

pub fn atom(site: u64, timestamp: u64, cause: Option<&Atom<String>>, value: &str) -> Atom<String> {
    Atom::new(
        AtomId::new(site, timestamp),
        cause.map(|c| *c.id()),
        value.to_string(),
    )
    .unwrap()
}

/// A realtime client of the test hub.
pub struct Client {
    pub connection: Arc<MemoryConnection<String, TextRegistry>>,
    pub store: Arc<InMemoryStore<String>>,
    pub tree: TextClient,
}

impl Client {
    pub async fn connect(&self) {
        self.connection.connect().await.unwrap();
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await.unwrap();
    }

    pub async fn value(&self) -> Option<String> {
        self.tree
            .with_tree(|tree| tree.value().cloned())
            .await
            .flatten()
    }

    pub async fn hash(&self) -> Option<String> {
        self.tree.with_tree(|tree| tree.weave().get_hash()).await
    }

    /// Creates an atom under the root, or the root itself in an empty tree.
    pub async fn write(&self, value: &str) -> Atom<String> {
        self.tree
            .with_tree(|tree| {
                let cause = tree.weave().root().map(|root| *root.id());
                tree.create(value.to_string(), cause, None).unwrap().unwrap()
            })
            .await
            .unwrap()
    }

    pub async fn wait_for_state(&self, state: RealtimeState) {
        let mut states = self.tree.subscribe_state();
        tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {state:?}"))
            .unwrap();
    }
}

pub async fn client(hub: &TextHub, store: Arc<InMemoryStore<String>>) -> Client {
    client_with(
        hub,
        store,
        CausalTreeOptions::default(),
        RealtimeCausalTreeOptions::default(),
    )
    .await
}

pub async fn client_with(
    hub: &TextHub,
    store: Arc<InMemoryStore<String>>,
    tree_options: CausalTreeOptions<String>,
    options: RealtimeCausalTreeOptions,
) -> Client {
    let connection = Arc::new(hub.connection());
    let channel = RealtimeChannel::new(
        RealtimeChannelInfo::new(CHANNEL, TREE_TYPE),
        connection.clone(),
    );
    let tree = RealtimeCausalTree::new(
        channel,
        Arc::new(registry()),
        store.clone(),
        tree_options,
        options,
    );
    tree.init().await.unwrap();
    Client {
        connection,
        store,
        tree,
    }
}

/// Polls `check` until it returns true, panicking after five seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn hub_value(hub: &TextHub) -> Option<String> {
    hub.with_channel(CHANNEL, |handler| handler.tree().value().cloned())
        .await
        .flatten()
}

pub async fn hub_hash(hub: &TextHub) -> Option<String> {
    hub.with_channel(CHANNEL, |handler| handler.tree().weave().get_hash())
        .await
}

/// Waits until every client holds the hub's weave.
pub async fn converged(hub: &TextHub, clients: &[&Client]) {
    eventually("replicas to converge", move || async move {
        let Some(expected) = hub_hash(hub).await else {
            return false;
        };
        for client in clients {
            if client.hash().await.as_ref() != Some(&expected) {
                return false;
            }
        }
        true
    })
    .await
}
