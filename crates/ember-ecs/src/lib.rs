//! Ember ECS -- reactive entity-component store.
//!
//! Entities are generational ids. Each component type lives in its own sparse
//! set column (packed for plain data, boxed for larger objects), and every
//! stored value carries a reactive cell: observers and bindings hear about
//! committed changes once per logical update. Queries are maintained
//! incrementally from attach and detach, and report entered/exited deltas.
//!
//! # Quick Start
//!
//! ```
//! use ember_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//!
//! impl Component for Position {
//!     type Patch = Position;
//!     const NAME: &'static str = "position";
//!     fn init(_entity: EntityId) -> Self { Position { x: 0.0, y: 0.0 } }
//!     fn on_set(&mut self, patch: Position) -> Result<(), EcsError> { *self = patch; Ok(()) }
//! }
//!
//! let mut world = World::new();
//! world.register::<Position>().unwrap();
//! let moving = world.define_query(QuerySpec::new().with::<Position>()).unwrap();
//!
//! let entity = world.spawn();
//! world.insert(entity, Position { x: 1.0, y: 2.0 }).unwrap();
//!
//! assert_eq!(world.get::<Position>(entity).unwrap(), &Position { x: 1.0, y: 2.0 });
//! assert_eq!(world.evaluate(moving).unwrap(), vec![entity]);
//! assert_eq!(world.entered(moving).unwrap(), &[entity]);
//! ```

#![deny(unsafe_code)]

pub mod binding;
pub mod cell;
pub mod command;
pub mod component;
pub mod entity;
pub mod query;
pub mod scene;
mod storage;
pub mod world;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity is not alive (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    InvalidEntity { entity: entity::EntityId },

    /// The entity is alive but does not carry the component.
    #[error("entity {entity:?} has no '{component}' component")]
    MissingComponent {
        entity: entity::EntityId,
        component: &'static str,
    },

    /// A value or patch does not fit the component's schema.
    #[error("value rejected by component '{component}': {details}")]
    TypeMismatch { component: String, details: String },

    /// A lifecycle rule was violated.
    #[error("invalid state: {details}")]
    StateError { details: String },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// The query handle was released or belongs to another world.
    #[error("query {handle:?} is not defined")]
    UnknownQuery { handle: query::QueryHandle },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::binding::{Binding, BindingContext, Cleanup, Dep, EffectContext};
    pub use crate::cell::Subscription;
    pub use crate::command::{ApplyReport, Command, CommandBuffer, CommandKind};
    pub use crate::component::{
        Component, ComponentInfo, ComponentRegistry, ComponentTypeId, StorageKind,
    };
    pub use crate::entity::EntityId;
    pub use crate::query::{QueryHandle, QuerySpec};
    pub use crate::scene::{EntityMap, SceneDocument, SceneEntity};
    pub use crate::world::World;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
