//! Ember Engine -- spatial runtime on top of the reactive ECS.
//!
//! This crate builds on [`ember_ecs`] to provide the simulation driver: a
//! fixed-timestep tick loop that runs systems in a deterministic order,
//! applies commands via the [`CommandBuffer`](ember_ecs::command::CommandBuffer),
//! and keeps world matrices and culling flags current through a
//! dependency-ordered [`TransformGraph`](graph::TransformGraph).
//!
//! # Quick Start
//!
//! ```
//! use ember_engine::prelude::*;
//! use glam::Vec3;
//!
//! let mut tick_loop = TickLoop::new(World::new(), EngineConfig::default()).unwrap();
//!
//! let world = tick_loop.world_mut();
//! let root = world.spawn();
//! world.set::<Transform>(root, Transform::from_translation(Vec3::new(1.0, 0.0, 0.0)).into()).unwrap();
//! let child = world.spawn();
//! world.set::<Transform>(child, Transform::from_translation(Vec3::new(0.0, 2.0, 0.0)).into()).unwrap();
//! world.insert(child, Hierarchy::child_of(root)).unwrap();
//!
//! tick_loop.tick().unwrap();
//!
//! let world_pos = tick_loop.transforms().world_matrix(child).unwrap().w_axis.truncate();
//! assert_eq!(world_pos, Vec3::new(1.0, 2.0, 0.0));
//! assert_eq!(tick_loop.transforms().order(), &[root, child]);
//! ```

#![deny(unsafe_code)]

pub mod components;
pub mod config;
pub mod culling;
pub mod graph;
pub mod tick;

use ember_ecs::entity::EntityId;
use ember_ecs::EcsError;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use ember_ecs;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by the engine layer.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// Parent links and computed references loop back on themselves.
    /// `chain` starts and ends with the same entity.
    #[error("cyclic transform dependency at {entity:?}: {chain:?}")]
    CyclicDependency {
        entity: EntityId,
        chain: Vec<EntityId>,
    },

    #[error("invalid configuration: {details}")]
    InvalidConfig { details: String },

    /// A system could not be registered.
    #[error("system '{name}': {details}")]
    InvalidSystem { name: String, details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use ember_ecs::prelude::*;

    pub use crate::components::{
        Camera, ComputeBehavior, ComputedTransform, CullBounds, Hierarchy, Transform,
        TransformPatch,
    };
    pub use crate::config::{EngineConfig, TickConfig, TransformConfig};
    pub use crate::culling::Frustum;
    pub use crate::graph::{ComputeInput, CullFlags, TransformGraph, UpdateStats};
    pub use crate::tick::{Stage, SystemContext, SystemFn, TickDiagnostics, TickLoop};
    pub use crate::EngineError;
}
