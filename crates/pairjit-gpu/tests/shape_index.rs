//! Constituent hierarchy behaviour seen through the public API.

use nalgebra::Vector3;
use pairjit_core::{PairJitError, Quat, Vec3};
use pairjit_gpu::{CompositeShapeIndex, Constituents, ResidencyHint};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn cloud(n: usize, seed: u64) -> Vec<Vec3> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            Vector3::new(
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
                rng.gen_range(-2.0..2.0),
            )
        })
        .collect()
}

#[test]
fn test_root_encloses_every_constituent() {
    let mut idx = CompositeShapeIndex::new(1, 0.8, 2).unwrap();
    let pts = vec![
        Vector3::new(0.0, 0.0, 0.0),
        Vector3::new(1.5, -0.5, 0.2),
        Vector3::new(-0.7, 2.0, -1.0),
    ];
    idx.set_positions(0, pts.clone()).unwrap();
    let root = idx.root_bounds(0).unwrap();
    for p in &pts {
        assert!(root.contains_point(p));
    }
    // Leaves are padded by half the constituent range on every side.
    assert!((root.lower.x - (-0.7 - 0.4)).abs() < 1e-6);
    assert!((root.upper.y - (2.0 + 0.4)).abs() < 1e-6);
}

#[test]
fn test_removing_constituent_never_grows_root() {
    let mut idx = CompositeShapeIndex::new(1, 1.0, 3).unwrap();
    let mut pts = cloud(40, 7);
    idx.set_positions(0, pts.clone()).unwrap();
    let mut prev = idx.root_bounds(0).unwrap();
    while pts.len() > 1 {
        pts.pop();
        idx.set_positions(0, pts.clone()).unwrap();
        let root = idx.root_bounds(0).unwrap();
        assert!(prev.contains_box(&root));
        prev = root;
    }
}

#[test]
fn test_every_leaf_respects_capacity() {
    let mut idx = CompositeShapeIndex::new(1, 0.5, 4).unwrap();
    idx.set_positions(0, cloud(100, 3)).unwrap();
    let view = idx.index(0).unwrap();
    let mut members = 0;
    for node in view.tree.nodes().iter().filter(|n| n.is_leaf()) {
        assert!(node.leaf_count as usize <= 4);
        members += view.tree.leaf_members(node).len();
    }
    assert_eq!(members, 100);
    assert_eq!(view.tree.order().len(), 100);
}

#[test]
fn test_publish_is_idempotent() {
    let mut idx = CompositeShapeIndex::new(2, 1.0, 4).unwrap();
    idx.set_positions(1, cloud(5, 1)).unwrap();
    assert!(!idx.is_published(1));
    assert!(idx.publish(1).unwrap());
    let advised = idx.advise_calls();
    assert!(advised > 0);
    assert!(!idx.publish(1).unwrap());
    assert_eq!(idx.advise_calls(), advised);
    assert!(idx.is_published(1));
}

#[test]
fn test_residency_hint_controls_advice() {
    let mut idx = CompositeShapeIndex::new(1, 1.0, 4).unwrap();
    assert_eq!(idx.residency_hint(), ResidencyHint::ReadMostly);
    idx.set_residency_hint(ResidencyHint::None);
    idx.set_positions(0, cloud(5, 2)).unwrap();
    idx.publish_all();
    assert_eq!(idx.advise_calls(), 0);
}

#[test]
fn test_out_of_range_type_is_config_error() {
    let mut idx = CompositeShapeIndex::new(2, 1.0, 4).unwrap();
    let err = idx.set_positions(5, cloud(2, 0)).unwrap_err();
    assert!(matches!(err, PairJitError::Configuration(_)));
    assert!(idx.index(2).is_err());
    assert!(idx.publish(9).is_err());
}

#[test]
fn test_invalid_geometry_rejected() {
    let mut idx = CompositeShapeIndex::new(1, 1.0, 4).unwrap();
    let err = idx
        .set_positions(0, vec![Vector3::new(f32::NAN, 0.0, 0.0)])
        .unwrap_err();
    assert!(matches!(err, PairJitError::Configuration(_)));

    let bad = Constituents {
        positions: cloud(3, 4),
        orientations: vec![Quat::identity(); 2],
        diameters: vec![1.0; 3],
        charges: vec![0.0; 3],
        typeids: vec![0; 3],
    };
    assert!(idx.set_constituents(0, bad).is_err());
    assert!(CompositeShapeIndex::new(1, -1.0, 4).is_err());
    assert!(CompositeShapeIndex::new(1, 1.0, 0).is_err());
}

#[test]
fn test_rotated_bodies_find_same_pairs_as_brute_force() {
    let mut idx = CompositeShapeIndex::new(2, 0.9, 2).unwrap();
    idx.set_positions(0, cloud(12, 11)).unwrap();
    idx.set_positions(1, cloud(9, 12)).unwrap();
    let a = idx.index(0).unwrap();
    let b = idx.index(1).unwrap();
    let q_i = Quat::from_euler_angles(0.3, -1.2, 2.0);
    let q_j = Quat::from_euler_angles(-0.8, 0.4, 0.1);
    let dx = Vector3::new(2.5, -1.0, 0.5);

    let mut found = Vec::new();
    let counts = a.for_each_near_pair(&b, &q_i, &q_j, &dx, |ca, cb, d| {
        found.push((ca, cb));
        let expected = (q_j * b.constituents.positions[cb] + dx) - q_i * a.constituents.positions[ca];
        assert!((d - expected).norm() < 1e-5);
    });

    let mut expected = Vec::new();
    for (ca, pa) in a.constituents.positions.iter().enumerate() {
        for (cb, pb) in b.constituents.positions.iter().enumerate() {
            if ((q_j * pb + dx) - q_i * pa).norm_squared() <= 0.81 {
                expected.push((ca, cb));
            }
        }
    }
    found.sort();
    assert_eq!(found, expected);
    assert_eq!(counts.evaluated as usize, expected.len());
    assert_eq!(counts.evaluated + counts.pruned, 12 * 9);
}

#[test]
fn test_explicit_rebuild_counts() {
    let mut idx = CompositeShapeIndex::new(1, 1.0, 4).unwrap();
    idx.set_positions(0, cloud(4, 9)).unwrap();
    let before = idx.rebuilds();
    idx.build_index(0).unwrap();
    assert_eq!(idx.rebuilds(), before + 1);
    assert_eq!(idx.constituent_count(0), 4);
    assert!(idx.has_constituents());
}
