use std::{sync::Arc, time::Duration};

use causal_trees::{
    CausalTreeOptions, Error,
    auth::{AtomValidator, PrivateKey},
    realtime::{RealtimeCausalTreeOptions, RealtimeError, RealtimeState},
    store::{CausalTreeStore, InMemoryStore},
};

use crate::helpers::{
    CHANNEL, Client, TextHub, client, client_with, converged, eventually, hub_value, registry,
};

async fn connected(client: &Client) {
    client.connect().await;
    client.wait_for_state(RealtimeState::Connected).await;
}

#[tokio::test]
async fn test_clients_converge_through_hub() {
    let hub = TextHub::new(registry());
    let a = client(&hub, Arc::new(InMemoryStore::new())).await;
    connected(&a).await;
    assert_eq!(a.tree.site().await.unwrap().id, 1);

    a.write("r").await;
    a.write("a").await;
    let hub_ref = &hub;
    eventually("hub to receive writes", move || async move {
        hub_value(hub_ref).await.as_deref() == Some("ra")
    })
    .await;

    let b = client(&hub, Arc::new(InMemoryStore::new())).await;
    connected(&b).await;
    assert_eq!(b.tree.site().await.unwrap().id, 2);
    assert_eq!(b.value().await.as_deref(), Some("ra"));

    b.write("b").await;
    converged(&hub, &[&a, &b]).await;
    assert_eq!(a.value().await, b.value().await);
    assert_eq!(a.value().await.map(|v| v.len()), Some(3));
}

#[tokio::test]
async fn test_offline_writes_merge_on_reconnect() {
    let hub = TextHub::new(registry());
    let a = client(&hub, Arc::new(InMemoryStore::new())).await;
    let b = client(&hub, Arc::new(InMemoryStore::new())).await;
    connected(&a).await;
    connected(&b).await;
    a.write("r").await;
    converged(&hub, &[&a, &b]).await;

    a.disconnect().await;
    a.wait_for_state(RealtimeState::Disconnected).await;
    a.write("x").await;
    b.write("y").await;
    converged(&hub, &[&b]).await;
    assert!(!hub_value(&hub).await.unwrap().contains('x'));

    connected(&a).await;
    converged(&hub, &[&a, &b]).await;
    let value = b.value().await.unwrap();
    assert!(value.contains('x') && value.contains('y'));
}

#[tokio::test]
async fn test_stored_tree_loads_before_connecting() {
    let hub = TextHub::new(registry());
    let store = Arc::new(InMemoryStore::new());
    let a = client(&hub, store.clone()).await;
    connected(&a).await;
    a.write("r").await;
    a.write("a").await;
    converged(&hub, &[&a]).await;
    a.tree.persist().await.unwrap();
    let hash = a.hash().await;
    a.disconnect().await;
    a.tree.close();
    assert_eq!(a.tree.state(), RealtimeState::Closed);

    let again = client(&hub, store.clone()).await;
    assert_eq!(again.tree.state(), RealtimeState::Disconnected);
    assert_eq!(again.tree.site().await.unwrap().id, 1);
    assert_eq!(again.hash().await, hash);
    assert_eq!(again.tree.updated().borrow().as_ref().map(Vec::len), Some(2));

    // Versions already match, so resync keeps the same weave.
    connected(&again).await;
    converged(&hub, &[&again]).await;
    assert_eq!(again.hash().await, hash);
}

#[tokio::test]
async fn test_updates_report_written_atoms() {
    let hub = TextHub::new(registry());
    let a = client(&hub, Arc::new(InMemoryStore::new())).await;
    let mut updated = a.tree.updated();
    connected(&a).await;

    let root = a.write("r").await;
    tokio::time::timeout(
        Duration::from_secs(5),
        updated.wait_for(|atoms| atoms.as_deref() == Some(std::slice::from_ref(&root))),
    )
    .await
    .unwrap()
    .unwrap();
}

#[tokio::test]
async fn test_signed_clients_learn_new_keys() {
    let validator = AtomValidator::ed25519();
    let hub = TextHub::with_options(
        registry(),
        CausalTreeOptions::default().with_validator(validator.clone()),
    );
    let signed = || {
        CausalTreeOptions::default()
            .with_validator(validator.clone())
            .with_signing_key(PrivateKey::generate())
    };
    let store = || Arc::new(InMemoryStore::new());

    let a = client_with(&hub, store(), signed(), Default::default()).await;
    connected(&a).await;
    assert!(a.tree.site().await.unwrap().crypto.is_some());
    a.write("r").await;
    converged(&hub, &[&a]).await;

    // a has never heard of b's key when b's first atom arrives.
    let b = client_with(&hub, store(), signed(), Default::default()).await;
    connected(&b).await;
    b.write("b").await;
    converged(&hub, &[&a, &b]).await;
    assert_eq!(a.value().await.as_deref(), Some("rb"));
}

#[tokio::test]
async fn test_site_id_exhaustion_is_reported() {
    let hub = TextHub::new(registry());
    let c = client_with(
        &hub,
        Arc::new(InMemoryStore::new()),
        CausalTreeOptions::default(),
        RealtimeCausalTreeOptions::default().with_max_site_id_attempts(0),
    )
    .await;
    let mut errors = c.tree.errors();
    c.connect().await;

    let err = tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        *err,
        Error::Realtime(RealtimeError::SiteIdUnavailable { attempts: 0 })
    ));
    assert!(c.tree.site().await.is_none());
}

#[tokio::test]
async fn test_collected_atoms_reach_store() {
    let hub = TextHub::new(registry());
    let store = Arc::new(InMemoryStore::new());
    let a = client_with(
        &hub,
        store.clone(),
        CausalTreeOptions::default().with_garbage_collection(true),
        Default::default(),
    )
    .await;
    connected(&a).await;

    a.write("r").await;
    let old = a.write("a").await;
    a.write("b").await;
    assert_eq!(a.value().await.as_deref(), Some("rb"));

    let (store_ref, expected) = (&store, &vec![old]);
    eventually("archived atoms in store", move || async move {
        &store_ref.archived_atoms(CHANNEL).await == expected
    })
    .await;
    assert!(store.get(CHANNEL).await.unwrap().is_some());
}

#[tokio::test]
async fn test_without_persist_on_sync_store_waits_for_persist() {
    let hub = TextHub::new(registry());
    let store = Arc::new(InMemoryStore::new());
    let a = client_with(
        &hub,
        store.clone(),
        CausalTreeOptions::default(),
        RealtimeCausalTreeOptions::default().with_persist_on_sync(false),
    )
    .await;
    connected(&a).await;
    a.write("r").await;
    converged(&hub, &[&a]).await;
    assert!(store.get(CHANNEL).await.unwrap().is_none());

    a.tree.persist().await.unwrap();
    let stored = store.get(CHANNEL).await.unwrap().unwrap().upgrade().unwrap();
    assert_eq!(stored.weave.len(), 1);
}

#[tokio::test]
async fn test_unvalidated_client_syncs_and_resyncs() {
    let hub = TextHub::new(registry());
    let a = client(&hub, Arc::new(InMemoryStore::new())).await;
    connected(&a).await;
    a.write("r").await;
    a.write("a").await;
    converged(&hub, &[&a]).await;

    let b = client_with(
        &hub,
        Arc::new(InMemoryStore::new()),
        CausalTreeOptions::default(),
        RealtimeCausalTreeOptions::default().with_validate_remote_weaves(false),
    )
    .await;
    connected(&b).await;
    assert_eq!(b.value().await.as_deref(), Some("ra"));

    b.disconnect().await;
    b.wait_for_state(RealtimeState::Disconnected).await;
    a.write("x").await;
    converged(&hub, &[&a]).await;

    connected(&b).await;
    converged(&hub, &[&a, &b]).await;
    assert!(b.value().await.unwrap().contains('x'));
}
