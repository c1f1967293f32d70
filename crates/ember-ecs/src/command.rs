//! Command buffer for deferred world mutations.
//!
//! Component hooks, bindings, effects, and observers never receive
//! `&mut World`. Anything they want to change elsewhere in the world is queued
//! here and applied after the operation that triggered them has fully
//! completed, in strict insertion (FIFO) order.
//!
//! Component values in commands are stored as [`serde_json::Value`] and
//! addressed by registered component name, so a command can be recorded
//! without knowing the concrete Rust type. [`CommandBuffer::apply`] resolves
//! the name through the world's registry and deserializes into the type's
//! [`Patch`](crate::component::Component::Patch).
//!
//! # Example
//!
//! ```
//! use ember_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health(u32);
//!
//! impl Component for Health {
//!     type Patch = Health;
//!     const NAME: &'static str = "health";
//!     fn init(_entity: EntityId) -> Self { Health(100) }
//!     fn on_set(&mut self, patch: Health) -> Result<(), EcsError> { *self = patch; Ok(()) }
//! }
//!
//! let mut world = World::new();
//! world.register::<Health>().unwrap();
//! let entity = world.spawn();
//! world.insert(entity, Health(100)).unwrap();
//!
//! let mut cmds = CommandBuffer::new();
//! cmds.set_component(entity, "health", serde_json::json!(50));
//!
//! let applied = cmds.apply(&mut world);
//! assert!(applied[0].applied_successfully);
//! assert_eq!(world.get::<Health>(entity).unwrap(), &Health(50));
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::entity::EntityId;
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// CommandKind
// ---------------------------------------------------------------------------

/// The data payload for a command -- what mutation to perform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandKind {
    /// Apply a patch to a component (attaching it first if absent).
    SetComponent {
        /// Registered name of the component type.
        component_name: String,
        /// Serialized patch.
        value: Value,
    },
    /// Replace one field of an existing component by dotted path.
    UpdateComponent {
        /// Registered name of the component type.
        component_name: String,
        /// Dotted path, e.g. `"position.0"`.
        path: String,
        /// New value for the field.
        value: Value,
    },
    /// Remove a component from an entity.
    RemoveComponent {
        /// Registered name of the component type.
        component_name: String,
    },
    /// Destroy an entity.
    Despawn,
    /// Create an entity and attach the given components in order.
    Spawn {
        /// `(name, patch)` pairs attached after creation.
        components: Vec<(String, Value)>,
    },
}

impl CommandKind {
    fn component_name(&self) -> Option<&str> {
        match self {
            CommandKind::SetComponent { component_name, .. }
            | CommandKind::UpdateComponent { component_name, .. }
            | CommandKind::RemoveComponent { component_name } => Some(component_name),
            CommandKind::Despawn | CommandKind::Spawn { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A single deferred mutation.
///
/// For spawn commands the `target` field is `None` because the entity does
/// not exist yet. After application, `spawned_entity` holds the new id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Which entity this command targets. `None` for spawn commands.
    pub target: Option<EntityId>,
    /// What mutation to perform.
    pub kind: CommandKind,
    /// Sequential index within the buffer (set on insertion).
    pub command_index: u32,
    /// For spawn commands: the entity created on application.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub spawned_entity: Option<EntityId>,
    /// Set once the command has mutated the world.
    #[serde(default)]
    pub applied_successfully: bool,
}

// ---------------------------------------------------------------------------
// ApplyReport
// ---------------------------------------------------------------------------

/// Summary of one or more [`CommandBuffer::apply`] calls.
///
/// `conflict_count` counts (entity, component) pairs targeted by more than
/// one command in the same batch. Last write wins; conflicts are reported,
/// not rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Number of (entity, component) pairs targeted by multiple commands.
    pub conflict_count: usize,
    /// Number of commands that failed to apply.
    pub failed_count: usize,
    /// Number of commands that applied successfully.
    pub success_count: usize,
}

impl ApplyReport {
    /// Fold `other` into `self`.
    pub fn merge(&mut self, other: ApplyReport) {
        self.conflict_count += other.conflict_count;
        self.failed_count += other.failed_count;
        self.success_count += other.success_count;
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// Collects commands and applies them deterministically in FIFO order.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    next_index: u32,
    last_apply_report: ApplyReport,
}

impl CommandBuffer {
    /// Create a new, empty command buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `SetComponent` command.
    pub fn set_component(&mut self, target: EntityId, component_name: &str, value: Value) {
        self.push(
            Some(target),
            CommandKind::SetComponent {
                component_name: component_name.to_owned(),
                value,
            },
        );
    }

    /// Queue an `UpdateComponent` command.
    pub fn update_component(
        &mut self,
        target: EntityId,
        component_name: &str,
        path: &str,
        value: Value,
    ) {
        self.push(
            Some(target),
            CommandKind::UpdateComponent {
                component_name: component_name.to_owned(),
                path: path.to_owned(),
                value,
            },
        );
    }

    /// Queue a `RemoveComponent` command.
    pub fn remove_component(&mut self, target: EntityId, component_name: &str) {
        self.push(
            Some(target),
            CommandKind::RemoveComponent {
                component_name: component_name.to_owned(),
            },
        );
    }

    /// Queue a `Despawn` command.
    pub fn despawn(&mut self, target: EntityId) {
        self.push(Some(target), CommandKind::Despawn);
    }

    /// Queue a `Spawn` command with `(name, patch)` component pairs.
    pub fn spawn(&mut self, components: Vec<(String, Value)>) {
        self.push(None, CommandKind::Spawn { components });
    }

    /// Get all queued commands in insertion order.
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Report from the last [`apply`](Self::apply) call.
    pub fn last_apply_report(&self) -> ApplyReport {
        self.last_apply_report
    }

    /// Apply all commands to the world in insertion order.
    ///
    /// Returns every command (successful and failed); check
    /// [`applied_successfully`](Command::applied_successfully). Failures, such
    /// as commands addressing an entity despawned earlier in the batch, are
    /// logged and skipped. Mutations queued by hooks while this batch is
    /// applied land in the world's own buffer and are flushed by the world
    /// afterwards.
    pub fn apply(&mut self, world: &mut World) -> Vec<Command> {
        let mut commands = std::mem::take(&mut self.commands);
        self.next_index = 0;

        let conflict_count = Self::count_conflicts(&commands);
        let mut success_count = 0;
        let mut failed_count = 0;

        for cmd in &mut commands {
            match Self::apply_one(world, cmd) {
                Ok(()) => {
                    cmd.applied_successfully = true;
                    success_count += 1;
                }
                Err(e) => {
                    failed_count += 1;
                    warn!(
                        command_index = cmd.command_index,
                        target = ?cmd.target,
                        error = %e,
                        "command application failed"
                    );
                }
            }
        }

        self.last_apply_report = ApplyReport {
            conflict_count,
            failed_count,
            success_count,
        };
        commands
    }

    fn apply_one(world: &mut World, cmd: &mut Command) -> Result<(), EcsError> {
        let missing_target = || EcsError::StateError {
            details: format!("command {} has no target entity", cmd.command_index),
        };
        match &cmd.kind {
            CommandKind::SetComponent {
                component_name,
                value,
            } => {
                let target = cmd.target.ok_or_else(missing_target)?;
                world.set_by_name(target, component_name, value)
            }
            CommandKind::UpdateComponent {
                component_name,
                path,
                value,
            } => {
                let target = cmd.target.ok_or_else(missing_target)?;
                world.update_by_name(target, component_name, path, value.clone())
            }
            CommandKind::RemoveComponent { component_name } => {
                let target = cmd.target.ok_or_else(missing_target)?;
                world.remove_by_name(target, component_name).map(|_| ())
            }
            CommandKind::Despawn => {
                let target = cmd.target.ok_or_else(missing_target)?;
                world.despawn(target)
            }
            CommandKind::Spawn { components } => {
                let entity = world.spawn();
                cmd.spawned_entity = Some(entity);
                // The entity exists now; a bad component does not un-create it.
                for (name, value) in components {
                    if let Err(e) = world.set_by_name(entity, name, value) {
                        warn!(
                            command_index = cmd.command_index,
                            entity = ?entity,
                            component = %name,
                            error = %e,
                            "spawn component set failed (entity was still created)"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    fn count_conflicts(commands: &[Command]) -> usize {
        let mut seen: HashMap<(EntityId, &str), Vec<u32>> = HashMap::new();
        for cmd in commands {
            if let (Some(target), Some(name)) = (cmd.target, cmd.kind.component_name()) {
                seen.entry((target, name))
                    .or_default()
                    .push(cmd.command_index);
            }
        }
        let mut conflicts = 0;
        for ((entity, component), indices) in &seen {
            if indices.len() > 1 {
                conflicts += 1;
                tracing::debug!(
                    entity = ?entity,
                    component = %component,
                    command_indices = ?indices,
                    "{} commands target the same entity+component (last write wins)",
                    indices.len()
                );
            }
        }
        conflicts
    }

    fn push(&mut self, target: Option<EntityId>, kind: CommandKind) {
        let command_index = self.next_index;
        self.next_index += 1;
        self.commands.push(Command {
            target,
            kind,
            command_index,
            spawned_entity: None,
            applied_successfully: false,
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
