use std::collections::HashSet;

use causal_trees::{AtomId, Weave, weave::WeaveInsert};
use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::helpers::{atom, random_atoms, text_tree};

/// Inserts atoms in an order where every cause precedes its children.
fn causal_weave(atoms: &[causal_trees::Atom<String>]) -> Weave<String> {
    let mut weave = Weave::new();
    for atom in atoms {
        assert!(matches!(
            weave.insert(atom.clone()),
            WeaveInsert::Inserted(_)
        ));
    }
    weave
}

#[test]
fn test_thousand_atoms_converge_in_any_order() {
    let atoms = random_atoms(42, 4, 1000);
    let expected = causal_weave(&atoms);
    assert!(expected.is_valid());
    assert_eq!(expected.len(), 1000);

    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..3 {
        let mut shuffled = atoms.clone();
        shuffled.shuffle(&mut rng);
        let mut tree = text_tree(99);
        let added = tree.add_many(shuffled);
        assert_eq!(added.len(), 1000);
        assert_eq!(tree.weave().get_hash(), expected.get_hash());
        assert_eq!(tree.weave().atoms(), expected.atoms());
    }
}

#[test]
fn test_weave_stays_valid_after_every_admitted_atom() {
    let atoms = random_atoms(42, 4, 1000);
    let expected = causal_weave(&atoms);

    let mut shuffled = atoms;
    shuffled.shuffle(&mut StdRng::seed_from_u64(2));
    // Timestamps grow along every causal chain, so this order admits all.
    shuffled.sort_by_key(|atom| atom.id().timestamp);

    let mut tree = text_tree(99);
    for atom in shuffled {
        assert!(tree.add(atom).is_some());
        assert!(tree.weave().is_valid());
    }
    assert_eq!(tree.weave().atoms(), expected.atoms());
}

#[test]
fn test_importing_random_subsets_keeps_weave_valid() {
    for seed in 0..200 {
        let atoms = random_atoms(seed, 3, 60);
        let full = causal_weave(&atoms);
        let mut rng = StdRng::seed_from_u64(seed);

        // Drops most atoms, so many survivors lose their cause.
        let subset: Vec<_> = full
            .atoms()
            .iter()
            .filter(|_| rng.gen_range(0..10) >= 7)
            .cloned()
            .collect();

        let mut empty = Weave::new();
        empty.import(subset.clone());
        assert!(empty.is_valid(), "seed {seed}: import into empty weave");

        let prefix = rng.gen_range(1..=atoms.len());
        let mut partial = causal_weave(&atoms[..prefix]);
        partial.import(subset);
        assert!(partial.is_valid(), "seed {seed}: import into prefix of {prefix}");
    }
}

#[test]
fn test_partial_merges_converge() {
    let atoms = random_atoms(7, 3, 300);

    // Two replicas see different, overlapping parts of history. The right one
    // misses the middle, so some of the later atoms have no cause there.
    let left = causal_weave(&atoms[..200]);
    let mut right = causal_weave(&atoms[..120]);
    for atom in &atoms[200..] {
        right.insert(atom.clone());
    }

    let mut merged_left = left.clone();
    merged_left.import(right.atoms().to_vec());
    let mut merged_right = right.clone();
    merged_right.import(left.atoms().to_vec());

    let union: HashSet<AtomId> = left
        .atoms()
        .iter()
        .chain(right.atoms())
        .map(|atom| *atom.id())
        .collect();
    assert_eq!(merged_left.len(), union.len());
    assert_eq!(merged_left.get_hash(), merged_right.get_hash());
    assert!(merged_left.is_valid());
}

#[test]
fn test_import_is_idempotent_and_commutative() {
    let root = atom(1, 1, None, "r");
    let a = atom(1, 2, Some(&root), "a");
    let b = atom(2, 3, Some(&root), "b");
    let c = atom(3, 4, Some(&a), "c");

    let one = causal_weave(&[root.clone(), a.clone(), c.clone()]);
    let two = causal_weave(&[root.clone(), b.clone()]);

    let mut ab = one.clone();
    ab.import(two.atoms().to_vec());
    let mut ba = two.clone();
    ba.import(one.atoms().to_vec());
    assert_eq!(ab.atoms(), ba.atoms());

    let again = ab.import(ba.atoms().to_vec());
    assert!(again.is_empty());
    assert_eq!(ab.get_version(), ba.get_version());
}

#[test]
fn test_weft_matches_older_replica() {
    let atoms = random_atoms(11, 2, 200);
    let old = causal_weave(&atoms[..80]);
    let new = causal_weave(&atoms);

    let weft = new.get_weft(&old.get_version(), false);
    assert!(weft.is_valid());
    for atom in weft.atoms() {
        assert!(old.get_version().includes(atom.id()));
    }
    assert_eq!(weft.get_hash(), old.get_hash());
}
