//! Property tests for ECS operations.
//!
//! These tests use `proptest` to generate random sequences of ECS operations
//! and verify that world invariants hold after each sequence: entity ids are
//! unique among live entities, and every query's membership and deltas agree
//! with a brute-force scan.

use std::collections::BTreeSet;

use ember_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Pos {
    x: f32,
    y: f32,
}

impl Component for Pos {
    type Patch = Pos;
    const NAME: &'static str = "pos";
    const STORAGE: StorageKind = StorageKind::Packed;

    fn init(_entity: EntityId) -> Self {
        Pos { x: 0.0, y: 0.0 }
    }

    fn on_set(&mut self, patch: Pos) -> Result<(), EcsError> {
        *self = patch;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Vel {
    dx: f32,
    dy: f32,
}

impl Component for Vel {
    type Patch = Vel;
    const NAME: &'static str = "vel";

    fn init(_entity: EntityId) -> Self {
        Vel { dx: 0.0, dy: 0.0 }
    }

    fn on_set(&mut self, patch: Vel) -> Result<(), EcsError> {
        *self = patch;
        Ok(())
    }
}

/// Operations we can perform on the world.
#[derive(Debug, Clone)]
enum EcsOp {
    Spawn,
    Despawn(usize),
    SetPos(usize, f32),
    SetVel(usize, f32),
    RemovePos(usize),
    RemoveVel(usize),
    Evaluate,
    Batch(Vec<(usize, bool)>),
}

/// Strategy that generates finite (non-NaN, non-Inf) f32 values.
fn finite_f32() -> impl Strategy<Value = f32> {
    (-1_000_000i32..1_000_000i32).prop_map(|v| v as f32 * 0.01)
}

fn ecs_op_strategy() -> impl Strategy<Value = EcsOp> {
    prop_oneof![
        3 => Just(EcsOp::Spawn),
        1 => (0..100usize).prop_map(EcsOp::Despawn),
        2 => (0..100usize, finite_f32()).prop_map(|(i, x)| EcsOp::SetPos(i, x)),
        2 => (0..100usize, finite_f32()).prop_map(|(i, dx)| EcsOp::SetVel(i, dx)),
        1 => (0..100usize).prop_map(EcsOp::RemovePos),
        1 => (0..100usize).prop_map(EcsOp::RemoveVel),
        1 => Just(EcsOp::Evaluate),
        1 => prop::collection::vec((0..100usize, proptest::bool::ANY), 1..6).prop_map(EcsOp::Batch),
    ]
}

struct Tracked {
    handle: QueryHandle,
    predicate: fn(&World, EntityId) -> bool,
    previous: BTreeSet<EntityId>,
}

fn moving(world: &World, e: EntityId) -> bool {
    world.has::<Pos>(e) && world.has::<Vel>(e)
}

fn resting(world: &World, e: EntityId) -> bool {
    world.has::<Pos>(e) && !world.has::<Vel>(e)
}

fn no_velocity(world: &World, e: EntityId) -> bool {
    !world.has::<Vel>(e)
}

fn toggle(world: &mut World, e: EntityId, attach_vel: bool) {
    if attach_vel {
        if world.has::<Vel>(e) {
            world.remove::<Vel>(e).unwrap();
        } else {
            world.insert(e, Vel { dx: 1.0, dy: 0.0 }).unwrap();
        }
    } else if world.has::<Pos>(e) {
        world.remove::<Pos>(e).unwrap();
    } else {
        world.insert(e, Pos { x: 0.0, y: 0.0 }).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(2_000))]

    #[test]
    fn random_ops_preserve_invariants(ops in prop::collection::vec(ecs_op_strategy(), 1..60)) {
        let mut world = World::new();
        world.register::<Pos>().unwrap();
        world.register::<Vel>().unwrap();

        let mut queries = vec![
            Tracked {
                handle: world.define_query(QuerySpec::new().with::<Pos>().with::<Vel>()).unwrap(),
                predicate: moving,
                previous: BTreeSet::new(),
            },
            Tracked {
                handle: world.define_query(QuerySpec::new().with::<Pos>().without::<Vel>()).unwrap(),
                predicate: resting,
                previous: BTreeSet::new(),
            },
            Tracked {
                handle: world.define_query(QuerySpec::new().without::<Vel>()).unwrap(),
                predicate: no_velocity,
                previous: BTreeSet::new(),
            },
        ];

        let mut alive: Vec<EntityId> = Vec::new();
        let pick = |alive: &Vec<EntityId>, idx: usize| alive.get(idx % alive.len().max(1)).copied();

        for op in ops {
            match op {
                EcsOp::Spawn => {
                    let e = world.spawn();
                    prop_assert!(!alive.contains(&e), "spawn returned live id {:?}", e);
                    alive.push(e);
                }
                EcsOp::Despawn(idx) => {
                    if let Some(e) = pick(&alive, idx) {
                        alive.retain(|&a| a != e);
                        world.despawn(e).unwrap();
                        prop_assert!(!world.is_alive(e));
                    }
                }
                EcsOp::SetPos(idx, x) => {
                    if let Some(e) = pick(&alive, idx) {
                        world.insert(e, Pos { x, y: 0.0 }).unwrap();
                    }
                }
                EcsOp::SetVel(idx, dx) => {
                    if let Some(e) = pick(&alive, idx) {
                        world.insert(e, Vel { dx, dy: 0.0 }).unwrap();
                    }
                }
                EcsOp::RemovePos(idx) => {
                    if let Some(e) = pick(&alive, idx) {
                        world.remove::<Pos>(e).unwrap();
                    }
                }
                EcsOp::RemoveVel(idx) => {
                    if let Some(e) = pick(&alive, idx) {
                        world.remove::<Vel>(e).unwrap();
                    }
                }
                EcsOp::Batch(toggles) => {
                    let targets: Vec<(EntityId, bool)> = toggles
                        .into_iter()
                        .filter_map(|(idx, vel)| pick(&alive, idx).map(|e| (e, vel)))
                        .collect();
                    world.batch(|w| {
                        for (e, vel) in targets {
                            toggle(w, e, vel);
                        }
                    });
                }
                EcsOp::Evaluate => {
                    for q in &mut queries {
                        let members = world.evaluate(q.handle).unwrap();
                        let current: BTreeSet<EntityId> = members.iter().copied().collect();
                        prop_assert_eq!(current.len(), members.len(), "duplicate members");

                        let entered: BTreeSet<EntityId> =
                            world.entered(q.handle).unwrap().iter().copied().collect();
                        let exited: BTreeSet<EntityId> =
                            world.exited(q.handle).unwrap().iter().copied().collect();
                        let expect_entered: BTreeSet<EntityId> =
                            current.difference(&q.previous).copied().collect();
                        let expect_exited: BTreeSet<EntityId> =
                            q.previous.difference(&current).copied().collect();
                        prop_assert_eq!(entered, expect_entered);
                        prop_assert_eq!(exited, expect_exited);
                        q.previous = current;
                    }
                }
            }

            // Invariant: entity_count matches our tracking.
            prop_assert_eq!(world.entity_count(), alive.len());

            // Invariant: membership equals a brute-force scan.
            for q in &queries {
                let expected = alive.iter().filter(|&&e| (q.predicate)(&world, e)).count();
                prop_assert_eq!(world.query_len(q.handle).unwrap(), expected);
                for &e in &alive {
                    prop_assert_eq!(
                        world.query_contains(q.handle, e).unwrap(),
                        (q.predicate)(&world, e)
                    );
                }
            }
        }
    }

    /// Generational ids catch stale references even after their index is
    /// recycled, and recycling always picks the lowest free index.
    #[test]
    fn stale_ids_detected_after_despawn_and_recycle(
        spawn_count in 1..20usize,
        despawn_indices in prop::collection::vec(0..20usize, 1..10),
    ) {
        let mut world = World::new();
        world.register::<Pos>().unwrap();

        let mut entities: Vec<EntityId> = Vec::new();
        for i in 0..spawn_count {
            let e = world.spawn();
            world.insert(e, Pos { x: i as f32, y: 0.0 }).unwrap();
            entities.push(e);
        }

        let mut stale_ids: Vec<EntityId> = Vec::new();
        for &idx in &despawn_indices {
            if !entities.is_empty() {
                let idx = idx % entities.len();
                let e = entities.remove(idx);
                world.despawn(e).unwrap();
                stale_ids.push(e);
            }
        }

        let mut free: BTreeSet<u32> = stale_ids.iter().map(|e| e.index()).collect();
        for _ in 0..stale_ids.len() {
            let new_e = world.spawn();
            let lowest = free.pop_first().unwrap();
            prop_assert_eq!(new_e.index(), lowest);
            world.insert(new_e, Pos { x: 999.0, y: 999.0 }).unwrap();
            entities.push(new_e);
        }

        for &stale in &stale_ids {
            prop_assert!(!world.is_alive(stale));
            prop_assert!(world.get_optional::<Pos>(stale).is_none());
            let is_invalid = matches!(
                world.get::<Pos>(stale),
                Err(EcsError::InvalidEntity { .. })
            );
            prop_assert!(is_invalid);
        }

        for &e in &entities {
            prop_assert!(world.is_alive(e));
            prop_assert!(world.get_optional::<Pos>(e).is_some());
        }
    }

    /// Swap-remove compaction never mixes up values between entities.
    #[test]
    fn values_stay_with_their_entities(
        count in 2..50usize,
        removals in prop::collection::vec(0..50usize, 1..20),
    ) {
        let mut world = World::new();
        world.register::<Pos>().unwrap();
        world.register::<Vel>().unwrap();

        let mut entities = Vec::new();
        for i in 0..count {
            let e = world.spawn();
            world.insert(e, Pos { x: i as f32, y: (i * 2) as f32 }).unwrap();
            world.insert(e, Vel { dx: i as f32, dy: 0.0 }).unwrap();
            entities.push((e, i));
        }

        for idx in removals {
            if entities.len() > 1 {
                let (e, _) = entities.remove(idx % entities.len());
                if idx % 2 == 0 {
                    world.despawn(e).unwrap();
                } else {
                    world.remove::<Pos>(e).unwrap();
                    world.remove::<Vel>(e).unwrap();
                }
            }
        }

        for &(e, i) in &entities {
            let pos = world.get::<Pos>(e).unwrap();
            prop_assert_eq!(pos.x, i as f32);
            prop_assert_eq!(pos.y, (i * 2) as f32);
            prop_assert_eq!(world.get::<Vel>(e).unwrap().dx, i as f32);
        }
        prop_assert_eq!(world.count::<Pos>(), entities.len());
    }
}
