//! End-to-end conflict resolution scenarios.

use std::collections::BTreeSet;

use proptest::prelude::*;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use weave_graph::{
    Constraint, ElementHandle, ElementId, ManifestId, ProtectionGraph,
};

fn ids(raw: &[u64]) -> BTreeSet<ElementId> {
    raw.iter().map(|&i| ElementId(i)).collect()
}

#[test]
fn present_conflict_removes_exactly_one_manifest() {
    let mut pg = ProtectionGraph::new();
    let m1 = pg.add_manifest("vm", ids(&[1, 2]));
    let m2 = pg.add_manifest("cfi", BTreeSet::new());
    let target = ElementHandle::instruction(1);

    pg.add_constraint(
        m1,
        Constraint::Present {
            target,
            inverse: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m2,
        Constraint::Present {
            target,
            inverse: true,
        },
    )
    .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    pg.resolve_conflicts(&mut rng);

    assert_eq!(pg.removed_manifests().len(), 1);
    let removed = pg.removed_manifests()[0];
    assert!(removed == m1 || removed == m2);
    assert!(pg.is_conflict_free());
    // The survivor is still registered.
    let survivor = if removed == m1 { m2 } else { m1 };
    assert!(pg.registry().contains(survivor));
    assert!(!pg.registry().contains(removed));
}

#[test]
fn dependency_cycle_is_broken_by_one_removal() {
    let mut pg = ProtectionGraph::new();
    let m1 = pg.add_manifest("vm", BTreeSet::new());
    let m2 = pg.add_manifest("cfi", BTreeSet::new());
    let a = ElementHandle::instruction(1);
    let b = ElementHandle::instruction(2);

    pg.add_constraint(
        m1,
        Constraint::Dependency {
            from: a,
            to: b,
            weak: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m2,
        Constraint::Dependency {
            from: b,
            to: a,
            weak: false,
        },
    )
    .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(3);
    pg.resolve_conflicts(&mut rng);

    assert_eq!(pg.removed_manifests().len(), 1);
    assert!(pg.is_conflict_free());
    // The surviving manifest can now be ordered.
    let survivors: Vec<ManifestId> = pg.registry().manifests().map(|m| m.id).collect();
    assert_eq!(survivors.len(), 1);
    assert!(pg.topological_sort_manifests(&survivors).is_ok());
}

#[test]
fn weak_dependency_cycles_are_tolerated() {
    let mut pg = ProtectionGraph::new();
    let m1 = pg.add_manifest("vm", BTreeSet::new());
    let m2 = pg.add_manifest("cfi", BTreeSet::new());
    let a = ElementHandle::instruction(1);
    let b = ElementHandle::instruction(2);

    pg.add_constraint(
        m1,
        Constraint::Dependency {
            from: a,
            to: b,
            weak: false,
        },
    )
    .unwrap();
    // The back edge is advisory; it must not cost anyone their manifest.
    pg.add_constraint(
        m2,
        Constraint::Dependency {
            from: b,
            to: a,
            weak: true,
        },
    )
    .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(11);
    pg.resolve_conflicts(&mut rng);

    assert!(pg.removed_manifests().is_empty());
    assert!(pg.is_conflict_free());
}

#[test]
fn conflict_inside_cycle_is_resolved_via_constraints() {
    // Two manifests form a dependency cycle *and* disagree about the
    // presence of a vertex inside it. The cycle handler resolves the
    // constraint conflict directly, which also dissolves the cycle.
    let mut pg = ProtectionGraph::new();
    let m1 = pg.add_manifest("vm", BTreeSet::new());
    let m2 = pg.add_manifest("cfi", BTreeSet::new());
    let a = ElementHandle::instruction(1);
    let b = ElementHandle::instruction(2);

    pg.add_constraint(
        m1,
        Constraint::Dependency {
            from: a,
            to: b,
            weak: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m2,
        Constraint::Dependency {
            from: b,
            to: a,
            weak: false,
        },
    )
    .unwrap();
    // Attach the conflicting Present pair to a vertex inside the cycle.
    pg.add_constraint(
        m1,
        Constraint::Present {
            target: a,
            inverse: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m2,
        Constraint::Present {
            target: a,
            inverse: true,
        },
    )
    .unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(5);
    pg.resolve_conflicts(&mut rng);

    assert_eq!(pg.removed_manifests().len(), 1);
    assert!(pg.is_conflict_free());
}

#[test]
fn empty_graph_resolution_is_a_noop() {
    let mut pg = ProtectionGraph::new();
    let mut rng = ChaCha8Rng::seed_from_u64(0);
    pg.resolve_conflicts(&mut rng);
    assert!(pg.removed_manifests().is_empty());
    assert!(pg.is_conflict_free());
}

/// Builds a graph with a three-manifest cycle and an unrelated Present
/// conflict, so resolution has several random choices to make.
fn contested_graph() -> (ProtectionGraph, Vec<ManifestId>) {
    let mut pg = ProtectionGraph::new();
    let m: Vec<ManifestId> = (0..5)
        .map(|i| pg.add_manifest(format!("protection-{i}"), ids(&[i + 1])))
        .collect();

    let e = |raw: u64| ElementHandle::instruction(raw);
    // Cycle: 1 -> 2 -> 3 -> 1, one edge per manifest.
    pg.add_constraint(
        m[0],
        Constraint::Dependency {
            from: e(1),
            to: e(2),
            weak: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m[1],
        Constraint::Dependency {
            from: e(2),
            to: e(3),
            weak: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m[2],
        Constraint::Dependency {
            from: e(3),
            to: e(1),
            weak: false,
        },
    )
    .unwrap();
    // Present conflict on instruction 9 between the remaining two.
    pg.add_constraint(
        m[3],
        Constraint::Present {
            target: e(9),
            inverse: false,
        },
    )
    .unwrap();
    pg.add_constraint(
        m[4],
        Constraint::Present {
            target: e(9),
            inverse: true,
        },
    )
    .unwrap();
    (pg, m)
}

#[test]
fn resolution_is_deterministic_under_a_fixed_seed() {
    let (mut first, _) = contested_graph();
    let (mut second, _) = contested_graph();

    let mut rng1 = ChaCha8Rng::seed_from_u64(42);
    let mut rng2 = ChaCha8Rng::seed_from_u64(42);
    first.resolve_conflicts(&mut rng1);
    second.resolve_conflicts(&mut rng2);

    assert_eq!(first.removed_manifests(), second.removed_manifests());
    assert!(first.is_conflict_free());
    assert!(second.is_conflict_free());
}

#[test]
fn removal_observer_sees_every_resolution_eviction() {
    use std::cell::RefCell;
    use std::rc::Rc;

    let (mut pg, _) = contested_graph();
    let log: Rc<RefCell<Vec<ManifestId>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&log);
    pg.on_manifest_removed(move |m| sink.borrow_mut().push(m.id));

    let mut rng = ChaCha8Rng::seed_from_u64(1);
    pg.resolve_conflicts(&mut rng);

    assert_eq!(log.borrow().as_slice(), pg.removed_manifests());
    assert!(!log.borrow().is_empty());
}

/// A random constraint for the property test below.
#[derive(Debug, Clone)]
enum AnyConstraint {
    Dependency { from: u64, to: u64, weak: bool },
    Present { target: u64, inverse: bool },
    Preserved { target: u64, inverse: bool },
}

fn constraint_strategy() -> impl Strategy<Value = AnyConstraint> {
    prop_oneof![
        (1u64..8, 1u64..8, any::<bool>())
            .prop_map(|(from, to, weak)| AnyConstraint::Dependency { from, to, weak }),
        (1u64..8, any::<bool>())
            .prop_map(|(target, inverse)| AnyConstraint::Present { target, inverse }),
        (1u64..8, any::<bool>())
            .prop_map(|(target, inverse)| AnyConstraint::Preserved { target, inverse }),
    ]
}

proptest! {
    /// Whatever the input graph, resolution terminates with no multi-vertex
    /// dependency component and no Present/Preserved conflict.
    #[test]
    fn resolution_reaches_a_conflict_free_fixed_point(
        per_manifest in proptest::collection::vec(
            proptest::collection::vec(constraint_strategy(), 0..4),
            1..5,
        ),
        seed in any::<u64>(),
    ) {
        let mut pg = ProtectionGraph::new();
        for (i, constraints) in per_manifest.iter().enumerate() {
            let m = pg.add_manifest(format!("protection-{i}"), BTreeSet::new());
            for c in constraints {
                let constraint = match *c {
                    AnyConstraint::Dependency { from, to, weak } => Constraint::Dependency {
                        from: ElementHandle::instruction(from),
                        to: ElementHandle::instruction(to),
                        weak,
                    },
                    AnyConstraint::Present { target, inverse } => Constraint::Present {
                        target: ElementHandle::instruction(target),
                        inverse,
                    },
                    AnyConstraint::Preserved { target, inverse } => Constraint::Preserved {
                        target: ElementHandle::instruction(target),
                        inverse,
                    },
                };
                pg.add_constraint(m, constraint).unwrap();
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        pg.resolve_conflicts(&mut rng);
        prop_assert!(pg.is_conflict_free());
    }
}
