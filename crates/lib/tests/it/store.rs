use causal_trees::{
    CausalTreeOptions,
    store::{CausalTreeStore, InMemoryStore},
    tree::CausalTreeFactory,
};

use crate::helpers::{registry, text_tree};

#[tokio::test]
async fn test_tree_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trees.json");

    let mut tree = text_tree(4);
    let root = tree.create("r".to_string(), None, None).unwrap().unwrap();
    tree.create("a".to_string(), Some(*root.id()), None).unwrap();

    let store = InMemoryStore::new();
    store.init().await.unwrap();
    store.update("doc", tree.export().into()).await.unwrap();
    store
        .add_archived_atoms("doc", vec![root.clone()])
        .await
        .unwrap();
    store.save_to_file(&path).await.unwrap();

    let loaded = InMemoryStore::<String>::load_from_file(&path).await.unwrap();
    loaded.init().await.unwrap();
    let stored = loaded.get("doc").await.unwrap().unwrap();
    let reloaded = registry()
        .create("text", stored, CausalTreeOptions::default())
        .unwrap();

    assert_eq!(reloaded.site().id, 4);
    assert_eq!(reloaded.weave().get_hash(), tree.weave().get_hash());
    assert_eq!(reloaded.value(), tree.value());
    // The clock resumes past every loaded atom.
    assert!(reloaded.time() > tree.weave().atoms().last().unwrap().id().timestamp);
    assert_eq!(loaded.archived_atoms("doc").await, vec![root]);
}

#[tokio::test]
async fn test_store_holds_trees_independently() {
    let store = InMemoryStore::new();
    store.init().await.unwrap();

    let mut one = text_tree(1);
    one.create("1".to_string(), None, None).unwrap();
    let mut two = text_tree(2);
    two.create("2".to_string(), None, None).unwrap();
    store.update("one", one.export().into()).await.unwrap();
    store.update("two", two.export().into()).await.unwrap();
    store.update("one", two.export().into()).await.unwrap();

    assert_eq!(store.tree_ids().await, vec!["one".to_string(), "two".to_string()]);
    assert_eq!(
        store.get("one").await.unwrap(),
        store.get("two").await.unwrap()
    );
    assert!(store.get("three").await.unwrap().is_none());
}
