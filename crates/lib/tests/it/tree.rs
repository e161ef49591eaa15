use causal_trees::{
    CausalTree, CausalTreeOptions, PrecalculatedOp, RejectionReason,
    tree::{CausalTreeFactory, SiteInfo, StoredCausalTree},
};
use serde_json::json;

use crate::helpers::{Text, atom, random_atoms, registry, text_tree};

#[test]
fn test_replicas_converge_through_exports() {
    let mut a = text_tree(1);
    let root = a.create("r".to_string(), None, None).unwrap().unwrap();
    let mut b = text_tree(2);
    b.import(a.export().into()).unwrap();

    a.create("a".to_string(), Some(*root.id()), None).unwrap();
    b.create("b".to_string(), Some(*root.id()), None).unwrap();
    b.create("c".to_string(), Some(*root.id()), Some(1)).unwrap();

    let from_a = a.export();
    let from_b = b.export();
    a.import(from_b.into()).unwrap();
    b.import(from_a.into()).unwrap();

    assert_eq!(a.weave().get_hash(), b.weave().get_hash());
    assert_eq!(a.value(), b.value());
    // Priority sorts first, then newer timestamps, then lower sites.
    assert_eq!(a.value().unwrap(), "rcab");
    let sites: Vec<u64> = a.known_sites().iter().map(|s| s.id).collect();
    assert!(sites.contains(&1) && sites.contains(&2));
}

#[test]
fn test_clock_tracks_remote_atoms() {
    let mut tree = text_tree(1);
    let root = atom(2, 1, None, "r");
    let remote = atom(2, 40, Some(&root), "x");
    tree.add_many(vec![remote, root]);

    let local = tree.create("y".to_string(), None, None).unwrap();
    // A second root is never accepted.
    assert!(local.is_none());
    assert!(tree.time() > 40);
}

#[test]
fn test_registry_builds_trees_by_type() {
    let registry = registry();
    let stored = causal_trees::tree::StoredCausalTreeVersion3::empty(SiteInfo::new(3));
    let mut tree = registry
        .create("text", stored.clone().into(), CausalTreeOptions::default())
        .unwrap();
    tree.create("hi".to_string(), None, None).unwrap();
    assert_eq!(tree.value().unwrap(), "hi");

    let err = registry
        .create("nope", stored.into(), CausalTreeOptions::default())
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_legacy_formats_load() {
    let root = atom(1, 1, None, "r");
    let child = atom(1, 2, Some(&root), "a");

    let v1 = json!({
        "site": {"id": 1},
        "knownSites": [{"id": 1}],
        "weave": [{"atom": root.clone()}, {"atom": child.clone()}],
    });
    let v2 = json!({
        "formatVersion": 2,
        "site": {"id": 1},
        "knownSites": [{"id": 1}],
        "weave": [root, child],
    });

    for stored in [v1, v2] {
        let stored: StoredCausalTree<String> = serde_json::from_value(stored).unwrap();
        let tree = registry()
            .create("text", stored, CausalTreeOptions::default())
            .unwrap();
        assert_eq!(tree.value().unwrap(), "ra");
        assert_eq!(tree.site().id, 1);
    }
}

#[test]
fn test_export_is_current_format() {
    let mut tree = text_tree(1);
    tree.create("r".to_string(), None, None).unwrap();
    let json = serde_json::to_value(StoredCausalTree::from(tree.export())).unwrap();
    assert_eq!(json["formatVersion"], 3);
    assert_eq!(json["ordered"], true);
}

#[test]
fn test_precalculated_ops_in_one_batch() {
    let mut tree = text_tree(1);
    let root = tree.create("r".to_string(), None, None).unwrap().unwrap();
    let mut added = tree.subscribe_atom_added();

    let ops = vec![
        PrecalculatedOp::new("a".to_string(), Some(*root.id())),
        PrecalculatedOp::new("b".to_string(), Some(*root.id())).with_priority(5),
    ];
    let created = tree.create_many_from_precalculated(ops).unwrap();
    assert!(created.iter().all(Option::is_some));
    assert_eq!(added.try_recv().unwrap().len(), 2);
    assert_eq!(tree.value().unwrap(), "rba");
}

#[test]
fn test_unordered_import_matches_ordered() {
    let atoms = random_atoms(3, 3, 200);
    let mut ordered = text_tree(9);
    ordered.add_many(atoms.clone());

    let mut unordered = causal_trees::tree::StoredCausalTreeVersion3::empty(SiteInfo::new(9));
    unordered.weave = atoms.into_iter().rev().collect();
    unordered.ordered = false;
    let mut tree = text_tree(9);
    tree.import(unordered.into()).unwrap();

    assert_eq!(tree.weave().get_hash(), ordered.weave().get_hash());
}

#[test]
fn test_stale_child_cannot_break_reload() {
    let mut tree = text_tree(1);
    let mut rejected = tree.subscribe_atom_rejected();
    let root = atom(1, 5, None, "r");
    tree.add(root.clone()).unwrap();

    let stale = atom(2, 3, Some(&root), "x");
    assert!(tree.add(stale.clone()).is_none());
    let rejected = rejected.try_recv().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].atom, stale);
    assert_eq!(rejected[0].reason, RejectionReason::TimestampNotAfterCause);
    assert!(tree.weave().is_valid());

    let reloaded = CausalTree::new(tree.export(), Text, CausalTreeOptions::default()).unwrap();
    assert_eq!(reloaded.value().unwrap(), "r");
}
