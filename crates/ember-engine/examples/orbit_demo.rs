//! Headless orbit demo -- a planet circles a sun, a moon rides along as its
//! child, and a camera tracks the planet with a look-at behaviour.
//!
//! Run with:
//!   RUST_LOG=ember_engine=debug cargo run --example orbit_demo -p ember-engine

use ember_engine::prelude::*;
use glam::{Quat, Vec3};

// ---------------------------------------------------------------------------
// Demo components
// ---------------------------------------------------------------------------

/// Angular speed in radians per second around the parent's Y axis.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
struct Orbit {
    radius: f32,
    speed: f32,
}

impl Component for Orbit {
    type Patch = Orbit;
    const NAME: &'static str = "orbit";

    fn init(_entity: EntityId) -> Self {
        Orbit {
            radius: 1.0,
            speed: 1.0,
        }
    }

    fn on_set(&mut self, patch: Orbit) -> Result<(), EcsError> {
        *self = patch;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

fn orbit_system(cx: &SystemContext<'_>, cmds: &mut CommandBuffer) {
    let t = (cx.tick + 1) as f32 * cx.dt as f32;
    for (entity, orbit) in cx.world.iter::<Orbit>() {
        let angle = t * orbit.speed;
        let position = Quat::from_rotation_y(angle) * Vec3::new(orbit.radius, 0.0, 0.0);
        cmds.set_component(entity, "transform", serde_json::json!({ "position": position }));
    }
}

fn report_system(cx: &SystemContext<'_>, _cmds: &mut CommandBuffer) {
    // Once per simulated second.
    if cx.tick % 60 != 0 {
        return;
    }
    let graph = cx.transforms;
    let culled = graph.order().iter().filter(|&&e| graph.is_culled(e)).count();
    tracing::info!(
        tick = cx.tick,
        nodes = graph.len(),
        culled,
        recomposed = graph.last_stats().recomposed,
        "frame"
    );
}

fn spawn_body(world: &mut World, orbit: Option<Orbit>, parent: Option<EntityId>) -> anyhow::Result<EntityId> {
    let e = world.spawn();
    world.set::<Transform>(e, TransformPatch::default())?;
    world.insert(e, CullBounds::sphere(0.5))?;
    if let Some(orbit) = orbit {
        world.insert(e, orbit)?;
    }
    if let Some(parent) = parent {
        world.insert(e, Hierarchy::child_of(parent))?;
    }
    Ok(e)
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut world = World::new();
    world.register::<Orbit>()?;
    let mut tick_loop = TickLoop::new(world, EngineConfig::default())?;

    let world = tick_loop.world_mut();
    let sun = spawn_body(world, None, None)?;
    let planet = spawn_body(
        world,
        Some(Orbit {
            radius: 20.0,
            speed: 0.5,
        }),
        Some(sun),
    )?;
    let moon = spawn_body(
        world,
        Some(Orbit {
            radius: 3.0,
            speed: 2.0,
        }),
        Some(planet),
    )?;

    let camera = world.spawn();
    world.set::<Transform>(camera, Transform::from_translation(Vec3::new(0.0, 15.0, 40.0)).into())?;
    world.insert(camera, Camera::default())?;
    world.insert(
        camera,
        ComputedTransform::new(ComputeBehavior::LookAt {
            target: planet,
            up: Vec3::Y,
        }),
    )?;
    tick_loop.transforms_mut().set_camera(Some(camera));

    tick_loop.add_system("orbit", Stage::PreTransform, orbit_system)?;
    tick_loop.add_system("report", Stage::PostTransform, report_system)?;

    let commands = tick_loop.run_ticks(600)?;

    let moon_pos = tick_loop
        .transforms()
        .world_matrix(moon)
        .map(|m| m.w_axis.truncate())
        .unwrap_or_default();
    println!(
        "{} ticks ({:.1}s simulated), {} commands, moon at {:?}",
        tick_loop.tick_count(),
        tick_loop.sim_time(),
        commands,
        moon_pos
    );
    let diag = tick_loop.last_diagnostics();
    println!(
        "last tick: {:?} total, {:?} in transforms, {} nodes recomposed",
        diag.total_time, diag.transform_time, diag.nodes_recomposed
    );
    Ok(())
}
