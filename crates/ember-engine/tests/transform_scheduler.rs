//! End-to-end scheduler tests driven through the tick loop.
//!
//! Covers hierarchy tracking, depth ordering, cycle reporting, computed
//! transforms, change-driven culling, scene round trips, and determinism of
//! the packed world-matrix buffer (hashed with blake3).

use ember_engine::prelude::*;
use glam::{Mat4, Vec3};

// -- helpers ----------------------------------------------------------------

fn new_loop() -> TickLoop {
    TickLoop::new(World::new(), EngineConfig::default()).unwrap()
}

fn spawn_at(world: &mut World, position: Vec3) -> EntityId {
    let e = world.spawn();
    world
        .set::<Transform>(e, Transform::from_translation(position).into())
        .unwrap();
    e
}

fn position(tick_loop: &TickLoop, e: EntityId) -> Vec3 {
    tick_loop
        .transforms()
        .world_matrix(e)
        .unwrap()
        .w_axis
        .truncate()
}

// -- hierarchy --------------------------------------------------------------

#[test]
fn child_follows_root_without_own_write() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let root = spawn_at(world, Vec3::ZERO);
    let e = spawn_at(world, Vec3::ZERO);
    world.insert(e, Hierarchy::child_of(root)).unwrap();

    tick_loop.tick().unwrap();
    let graph = tick_loop.transforms();
    assert_eq!(graph.world_matrix(e), graph.world_matrix(root));

    let e_version = tick_loop.world().version::<Transform>(e);
    tick_loop
        .world_mut()
        .update::<Transform>(root, "position.0", serde_json::json!(1.0))
        .unwrap();
    tick_loop.tick().unwrap();

    assert_eq!(position(&tick_loop, e), Vec3::new(1.0, 0.0, 0.0));
    assert_eq!(tick_loop.world().version::<Transform>(e), e_version);
}

#[test]
fn grandchild_sees_post_tick_parent_matrix() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    // Spawned leaf-first so the sort has real work to do.
    let grandchild = spawn_at(world, Vec3::new(0.0, 0.0, 1.0));
    let child = spawn_at(world, Vec3::new(0.0, 1.0, 0.0));
    let parent = spawn_at(world, Vec3::new(1.0, 0.0, 0.0));
    world.insert(grandchild, Hierarchy::child_of(child)).unwrap();
    world.insert(child, Hierarchy::child_of(parent)).unwrap();

    tick_loop.tick().unwrap();
    let graph = tick_loop.transforms();
    assert_eq!(graph.order(), &[parent, child, grandchild]);
    assert_eq!(graph.depth(parent), Some(0));
    assert_eq!(graph.depth(child), Some(1));
    assert_eq!(graph.depth(grandchild), Some(2));
    assert_eq!(position(&tick_loop, grandchild), Vec3::new(1.0, 1.0, 1.0));

    tick_loop
        .world_mut()
        .update::<Transform>(parent, "position.0", serde_json::json!(5.0))
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, grandchild), Vec3::new(5.0, 1.0, 1.0));
    assert_eq!(tick_loop.last_diagnostics().nodes_recomposed, 3);
}

#[test]
fn reparenting_moves_node_between_subtrees() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let left = spawn_at(world, Vec3::new(-10.0, 0.0, 0.0));
    let right = spawn_at(world, Vec3::new(10.0, 0.0, 0.0));
    let node = spawn_at(world, Vec3::new(0.0, 1.0, 0.0));
    world.insert(node, Hierarchy::child_of(left)).unwrap();

    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(-10.0, 1.0, 0.0));

    tick_loop
        .world_mut()
        .insert(node, Hierarchy::child_of(right))
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(10.0, 1.0, 0.0));
    assert!(tick_loop.last_diagnostics().resorted);
}

#[test]
fn reparent_by_removing_and_reinserting_hierarchy() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let a = spawn_at(world, Vec3::new(10.0, 0.0, 0.0));
    let b = spawn_at(world, Vec3::new(-5.0, 0.0, 0.0));
    let c = spawn_at(world, Vec3::Y);
    world.insert(c, Hierarchy::child_of(a)).unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, c), Vec3::new(10.0, 1.0, 0.0));

    let world = tick_loop.world_mut();
    world.remove::<Hierarchy>(c).unwrap();
    world.insert(c, Hierarchy::child_of(b)).unwrap();
    tick_loop.tick().unwrap();

    assert_eq!(tick_loop.transforms().parent(c), Some(b));
    assert_eq!(position(&tick_loop, c), Vec3::new(-5.0, 1.0, 0.0));
    assert!(tick_loop.last_diagnostics().resorted);
}

#[test]
fn transform_removed_and_set_again_is_recomposed() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let e = spawn_at(world, Vec3::ZERO);
    let child = spawn_at(world, Vec3::Y);
    world.insert(child, Hierarchy::child_of(e)).unwrap();
    tick_loop.tick().unwrap();

    let world = tick_loop.world_mut();
    world.remove::<Transform>(e).unwrap();
    world
        .set::<Transform>(e, Transform::from_translation(Vec3::new(5.0, 0.0, 0.0)).into())
        .unwrap();
    tick_loop.tick().unwrap();

    assert!(tick_loop.transforms().contains(e));
    assert_eq!(position(&tick_loop, e), Vec3::new(5.0, 0.0, 0.0));
    assert_eq!(position(&tick_loop, child), Vec3::new(5.0, 1.0, 0.0));
}

#[test]
fn computed_behaviour_replaced_by_remove_and_insert() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let a = spawn_at(world, Vec3::new(1.0, 0.0, 0.0));
    let b = spawn_at(world, Vec3::new(0.0, 0.0, 7.0));
    let node = spawn_at(world, Vec3::ZERO);
    world
        .insert(
            node,
            ComputedTransform::new(ComputeBehavior::CopyPosition {
                target: a,
                offset: Vec3::ZERO,
            }),
        )
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(1.0, 0.0, 0.0));

    let world = tick_loop.world_mut();
    world.remove::<ComputedTransform>(node).unwrap();
    world
        .insert(
            node,
            ComputedTransform::new(ComputeBehavior::CopyPosition {
                target: b,
                offset: Vec3::ZERO,
            }),
        )
        .unwrap();
    tick_loop.tick().unwrap();

    assert_eq!(position(&tick_loop, node), Vec3::new(0.0, 0.0, 7.0));
    assert!(tick_loop.last_diagnostics().resorted);
}

#[test]
fn removing_transform_drops_node() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let root = spawn_at(world, Vec3::X);
    let child = spawn_at(world, Vec3::Y);
    world.insert(child, Hierarchy::child_of(root)).unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(tick_loop.transforms().len(), 2);

    tick_loop.world_mut().remove::<Transform>(root).unwrap();
    tick_loop.tick().unwrap();
    assert!(!tick_loop.transforms().contains(root));
    assert_eq!(tick_loop.transforms().parent(child), None);
    assert_eq!(position(&tick_loop, child), Vec3::Y);
}

// -- cycles -----------------------------------------------------------------

#[test]
fn three_node_cycle_reports_chain_and_recovers() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let a = spawn_at(world, Vec3::ZERO);
    let b = spawn_at(world, Vec3::ZERO);
    let c = spawn_at(world, Vec3::ZERO);
    world.insert(a, Hierarchy::child_of(b)).unwrap();
    world.insert(b, Hierarchy::child_of(c)).unwrap();
    world.insert(c, Hierarchy::child_of(a)).unwrap();

    match tick_loop.tick() {
        Err(EngineError::CyclicDependency { chain, .. }) => {
            assert_eq!(chain.len(), 4);
            assert_eq!(chain.first(), chain.last());
            for e in [a, b, c] {
                assert!(chain.contains(&e));
            }
        }
        other => panic!("expected a cycle, got {other:?}"),
    }

    // Breaking the loop lets the next tick succeed.
    tick_loop.world_mut().remove::<Hierarchy>(a).unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(tick_loop.transforms().order(), &[a, c, b]);
}

#[test]
fn computed_reference_can_close_a_cycle() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let parent = spawn_at(world, Vec3::ZERO);
    let child = spawn_at(world, Vec3::ZERO);
    world.insert(child, Hierarchy::child_of(parent)).unwrap();
    world
        .insert(
            parent,
            ComputedTransform::new(ComputeBehavior::CopyPosition {
                target: child,
                offset: Vec3::ZERO,
            }),
        )
        .unwrap();

    assert!(matches!(
        tick_loop.tick(),
        Err(EngineError::CyclicDependency { .. })
    ));
}

// -- computed transforms ----------------------------------------------------

#[test]
fn computed_nodes_sort_after_their_references() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let follower = spawn_at(world, Vec3::ZERO);
    let a = spawn_at(world, Vec3::new(0.0, 0.0, 0.0));
    let b = spawn_at(world, Vec3::new(4.0, 0.0, 0.0));
    let arm = spawn_at(world, Vec3::new(0.0, 2.0, 0.0));
    world.insert(arm, Hierarchy::child_of(b)).unwrap();
    world
        .insert(follower, ComputedTransform::new(ComputeBehavior::Midpoint { a, b: arm }))
        .unwrap();

    tick_loop.tick().unwrap();
    let graph = tick_loop.transforms();
    assert_eq!(graph.depth(follower), Some(2));
    let order = graph.order();
    let idx = |e| order.iter().position(|&x| x == e).unwrap();
    assert!(idx(follower) > idx(arm));
    assert!(idx(arm) > idx(b));
    assert_eq!(position(&tick_loop, follower), Vec3::new(2.0, 1.0, 0.0));

    // Moving the arm's parent moves the midpoint the same tick.
    tick_loop
        .world_mut()
        .update::<Transform>(b, "position.0", serde_json::json!(8.0))
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, follower), Vec3::new(4.0, 1.0, 0.0));
}

#[test]
fn computed_output_does_not_write_back() {
    let mut tick_loop = new_loop();
    let world = tick_loop.world_mut();
    let target = spawn_at(world, Vec3::new(3.0, 0.0, 0.0));
    let node = spawn_at(world, Vec3::new(-1.0, 0.0, 0.0));
    world
        .insert(
            node,
            ComputedTransform::new(ComputeBehavior::CopyPosition {
                target,
                offset: Vec3::Y,
            }),
        )
        .unwrap();

    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(3.0, 1.0, 0.0));
    assert_eq!(
        tick_loop.world().get::<Transform>(node).unwrap().position,
        Vec3::new(-1.0, 0.0, 0.0)
    );

    tick_loop.world_mut().remove::<ComputedTransform>(node).unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(-1.0, 0.0, 0.0));
}

#[test]
fn custom_behaviour_registered_on_graph() {
    let mut tick_loop = new_loop();
    tick_loop
        .transforms_mut()
        .register_behavior("double_x", |input: &ComputeInput<'_>| {
            let src = input.refs.first().copied().flatten()?;
            let p = src.w_axis.truncate();
            Some(Mat4::from_translation(Vec3::new(p.x * 2.0, p.y, p.z)))
        });
    let world = tick_loop.world_mut();
    let src = spawn_at(world, Vec3::new(1.5, 2.0, 0.0));
    let node = spawn_at(world, Vec3::ZERO);
    world
        .insert(
            node,
            ComputedTransform::new(ComputeBehavior::Custom {
                name: "double_x".into(),
                refs: vec![src],
            }),
        )
        .unwrap();

    tick_loop.tick().unwrap();
    assert_eq!(position(&tick_loop, node), Vec3::new(3.0, 2.0, 0.0));
}

// -- culling ----------------------------------------------------------------

fn culling_scene(tick_loop: &mut TickLoop) -> (EntityId, EntityId, EntityId) {
    let world = tick_loop.world_mut();
    // Camera at the origin looking down -Z.
    let camera = spawn_at(world, Vec3::ZERO);
    world.insert(camera, Camera::default()).unwrap();
    let ahead = spawn_at(world, Vec3::new(0.0, 0.0, -10.0));
    world.insert(ahead, CullBounds::sphere(1.0)).unwrap();
    let behind = spawn_at(world, Vec3::new(0.0, 0.0, 10.0));
    world.insert(behind, CullBounds::sphere(1.0)).unwrap();
    tick_loop.transforms_mut().set_camera(Some(camera));
    (camera, ahead, behind)
}

#[test]
fn culling_runs_only_when_something_changed() {
    let mut tick_loop = new_loop();
    let (camera, ahead, behind) = culling_scene(&mut tick_loop);

    tick_loop.tick().unwrap();
    let graph = tick_loop.transforms();
    assert!(!graph.is_culled(ahead));
    assert!(graph.cull_flags(behind).unwrap().frustum);
    assert!(!graph.is_culled(camera));
    assert_eq!(tick_loop.last_diagnostics().cull_updates, 3);

    tick_loop.tick().unwrap();
    assert_eq!(tick_loop.last_diagnostics().cull_updates, 0);

    // Moving one node re-culls only that node.
    tick_loop
        .world_mut()
        .update::<Transform>(behind, "position.2", serde_json::json!(-20.0))
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(tick_loop.last_diagnostics().cull_updates, 1);
    assert!(!tick_loop.transforms().is_culled(behind));

    // Turning the camera around re-culls everything.
    tick_loop
        .world_mut()
        .update::<Transform>(
            camera,
            "rotation",
            serde_json::to_value(glam::Quat::from_rotation_y(std::f32::consts::PI)).unwrap(),
        )
        .unwrap();
    tick_loop.tick().unwrap();
    assert_eq!(tick_loop.last_diagnostics().cull_updates, 3);
    assert!(tick_loop.transforms().is_culled(ahead));
    assert!(tick_loop.transforms().is_culled(behind));
}

#[test]
fn distance_culling_uses_configured_default() {
    let config = EngineConfig::from_json(
        r#"{ "transform": { "default_cull_distance": 50.0, "frustum_culling": false } }"#,
    )
    .unwrap();
    let mut tick_loop = TickLoop::new(World::new(), config).unwrap();
    let world = tick_loop.world_mut();
    let camera = spawn_at(world, Vec3::ZERO);
    world.insert(camera, Camera::default()).unwrap();
    let near = spawn_at(world, Vec3::new(0.0, 0.0, 40.0));
    let far = spawn_at(world, Vec3::new(0.0, 0.0, -60.0));
    let far_but_allowed = spawn_at(world, Vec3::new(0.0, 0.0, -60.0));
    world
        .insert(
            far_but_allowed,
            CullBounds {
                radius: 0.0,
                max_distance: 100.0,
            },
        )
        .unwrap();
    tick_loop.transforms_mut().set_camera(Some(camera));

    tick_loop.tick().unwrap();
    let graph = tick_loop.transforms();
    // Behind the camera but frustum culling is off.
    assert!(!graph.is_culled(near));
    assert_eq!(
        graph.cull_flags(far),
        Some(CullFlags {
            distance: true,
            frustum: false
        })
    );
    assert!(!graph.is_culled(far_but_allowed));
}

// -- scenes -----------------------------------------------------------------

#[test]
fn scene_round_trip_rebuilds_hierarchy() {
    let mut source = new_loop();
    let world = source.world_mut();
    let root = spawn_at(world, Vec3::new(2.0, 0.0, 0.0));
    let child = spawn_at(world, Vec3::new(0.0, 3.0, 0.0));
    world.insert(child, Hierarchy::child_of(root)).unwrap();
    let follower = spawn_at(world, Vec3::ZERO);
    world
        .insert(
            follower,
            ComputedTransform::new(ComputeBehavior::CopyPosition {
                target: child,
                offset: Vec3::ZERO,
            }),
        )
        .unwrap();
    source.tick().unwrap();

    let text = serde_json::to_string(&source.world().save_scene()).unwrap();
    let doc: SceneDocument = serde_json::from_str(&text).unwrap();

    let mut target = new_loop();
    // Occupy a few indices so ids cannot line up by accident.
    for _ in 0..5 {
        target.world_mut().spawn();
    }
    let map = target.world_mut().load_scene(&doc).unwrap();
    target.tick().unwrap();

    let new_root = map.get(root).unwrap();
    let new_child = map.get(child).unwrap();
    let new_follower = map.get(follower).unwrap();
    assert_ne!(new_child, child);
    assert_eq!(target.transforms().parent(new_child), Some(new_root));
    assert_eq!(position(&target, new_child), Vec3::new(2.0, 3.0, 0.0));
    assert_eq!(position(&target, new_follower), Vec3::new(2.0, 3.0, 0.0));
}

#[test]
fn scene_parent_outside_document_loads_as_root() {
    let mut source = new_loop();
    let world = source.world_mut();
    let root = spawn_at(world, Vec3::X);
    let child = spawn_at(world, Vec3::new(0.0, 4.0, 0.0));
    world.insert(child, Hierarchy::child_of(root)).unwrap();
    world.despawn(root).unwrap();
    let doc = source.world().save_scene();

    let mut target = new_loop();
    let map = target.world_mut().load_scene(&doc).unwrap();
    let new_child = map.get(child).unwrap();
    assert_eq!(
        target.world().get::<Hierarchy>(new_child).unwrap().parent,
        Some(EntityId::PLACEHOLDER)
    );

    target.tick().unwrap();
    assert_eq!(target.transforms().parent(new_child), None);
    assert_eq!(position(&target, new_child), Vec3::new(0.0, 4.0, 0.0));
}

// -- determinism ------------------------------------------------------------

fn spin(cx: &SystemContext<'_>, cmds: &mut CommandBuffer) {
    let angle = cx.tick as f32 * 0.01;
    for (entity, h) in cx.world.iter::<Hierarchy>() {
        if h.parent.is_none() {
            continue;
        }
        if let Some(t) = cx.world.get_optional::<Transform>(entity) {
            let rotation = t.rotation * glam::Quat::from_rotation_z(angle);
            cmds.set_component(entity, "transform", serde_json::json!({ "rotation": rotation }));
        }
    }
}

fn hash_run() -> String {
    let mut tick_loop = new_loop();
    tick_loop.add_system("spin", Stage::PreTransform, spin).unwrap();
    let world = tick_loop.world_mut();
    let mut parents = Vec::new();
    for i in 0..20 {
        let e = spawn_at(world, Vec3::new(i as f32, 0.0, 0.0));
        if let Some(&p) = parents.get(i / 2) {
            world.insert(e, Hierarchy::child_of(p)).unwrap();
        }
        parents.push(e);
    }
    tick_loop.run_ticks(120).unwrap();

    let mut hasher = blake3::Hasher::new();
    hasher.update(tick_loop.transforms().world_matrix_bytes());
    hasher.finalize().to_hex().to_string()
}

#[test]
fn world_matrix_buffer_is_deterministic() {
    let first = hash_run();
    let second = hash_run();
    assert_eq!(first, second, "two identical runs produced different matrices");
    assert_eq!(first.len(), 64);
}
