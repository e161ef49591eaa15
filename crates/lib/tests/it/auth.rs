use std::sync::Arc;

use causal_trees::{
    CausalTree, CausalTreeOptions, RejectionReason,
    auth::{AtomValidator, PrivateKey},
    tree::SiteInfo,
};

use crate::helpers::{Text, TextTree, atom};

fn signed_tree(site: u64) -> (TextTree, AtomValidator, Arc<PrivateKey>) {
    let key = Arc::new(PrivateKey::generate());
    let validator = AtomValidator::ed25519();
    let options = CausalTreeOptions::default()
        .with_validator(validator.clone())
        .with_signing_key(Arc::clone(&key));
    let tree = CausalTree::empty(SiteInfo::new(site), Text, options).unwrap();
    (tree, validator, key)
}

#[test]
fn test_signed_replicas_exchange_history() {
    let (mut a, _, _) = signed_tree(1);
    let (mut b, _, _) = signed_tree(2);
    assert!(a.site().crypto.is_some());

    let root = a.create("r".to_string(), None, None).unwrap().unwrap();
    a.create("x".to_string(), Some(*root.id()), None).unwrap();
    assert!(root.signature().is_some());

    b.import(a.export().into()).unwrap();
    assert_eq!(b.value().unwrap(), "rx");

    b.create("y".to_string(), Some(*root.id()), None).unwrap();
    a.import(b.export().into()).unwrap();
    assert_eq!(a.weave().get_hash(), b.weave().get_hash());
}

#[test]
fn test_forged_and_unknown_signers() {
    let (mut a, validator, _) = signed_tree(1);
    let (mut b, _, b_key) = signed_tree(2);
    let root = a.create("r".to_string(), None, None).unwrap().unwrap();
    b.import(a.export().into()).unwrap();
    let mut rejected = b.subscribe_atom_rejected();

    // Site 2 pretending to be site 1.
    let forged = validator
        .sign(&b_key, atom(1, 50, Some(&root), "evil"))
        .unwrap();
    assert!(b.add(forged).is_none());

    // Unsigned atoms from a site with a key do not verify either.
    assert!(b.add(atom(1, 51, Some(&root), "plain")).is_none());

    // A signing site nobody registered.
    let stranger = validator
        .sign(&PrivateKey::generate(), atom(7, 52, Some(&root), "who"))
        .unwrap();
    assert!(b.add(stranger).is_none());

    // Keyless sites may still write unsigned atoms.
    assert!(b.add(atom(8, 53, Some(&root), "ok")).is_some());

    let reasons: Vec<RejectionReason> = std::iter::from_fn(|| rejected.try_recv().ok())
        .flatten()
        .map(|r| r.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            RejectionReason::SignatureFailed,
            RejectionReason::SignatureFailed,
            RejectionReason::NoPublicKey,
        ]
    );
    assert_eq!(b.value().unwrap(), "rok");
}

#[test]
fn test_tampered_weave_drops_branch() {
    let (mut a, _, _) = signed_tree(1);
    let root = a.create("r".to_string(), None, None).unwrap().unwrap();
    let x = a.create("x".to_string(), Some(*root.id()), None).unwrap().unwrap();
    a.create("z".to_string(), Some(*x.id()), None).unwrap();

    // Swap in the root's signature for x; checksums stay intact.
    let mut exported = serde_json::to_value(causal_trees::tree::StoredCausalTree::from(a.export()))
        .unwrap();
    let signature = exported["weave"][0]["signature"].clone();
    exported["weave"][1]["signature"] = signature;
    let tampered = serde_json::from_value(exported).unwrap();

    let (mut c, _, _) = signed_tree(3);
    let mut rejected = c.subscribe_atom_rejected();
    c.import(tampered).unwrap();

    assert_eq!(c.value().unwrap(), "r");
    let rejected = rejected.try_recv().unwrap();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].atom.id(), x.id());
    assert_eq!(rejected[0].reason, RejectionReason::SignatureFailed);
}
