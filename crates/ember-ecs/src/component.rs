//! Component type descriptors, registration, and metadata.
//!
//! A component type is described by implementing [`Component`]. Every type
//! used in a [`World`](crate::world::World) must be registered once; the
//! registration produces a [`ComponentTypeId`] that keys the per-type column,
//! query terms, and entity signatures.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::binding::Binding;
use crate::command::CommandBuffer;
use crate::entity::EntityId;
use crate::scene::EntityMap;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// How a component type's values are laid out in its column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    /// Values stored contiguously in a dense array. Suited to small numeric
    /// "data" components that bulk consumers read as a slice.
    Packed,
    /// Values individually boxed. Suited to larger "object" components whose
    /// moves should stay cheap when the dense array is compacted.
    Boxed,
}

/// A statically registered component type.
///
/// The associated [`Patch`](Component::Patch) type is the set of fields a
/// caller may write in one [`World::set`](crate::world::World::set) call.
/// Types without partial-merge semantics use `type Patch = Self` and replace
/// the whole value in [`on_set`](Component::on_set).
///
/// Implementations must be pure data plus behaviour hooks: the store owns the
/// value, and hooks never receive `&mut World`. Mutations a hook wants to make
/// elsewhere go through the [`CommandBuffer`] and are applied once the
/// current operation completes.
pub trait Component: Clone + Serialize + DeserializeOwned + 'static {
    /// Partial update accepted by [`on_set`](Component::on_set).
    type Patch: DeserializeOwned + 'static;

    /// Unique registration name.
    const NAME: &'static str;

    /// External identifier for scene documents. Types without one are never
    /// written to or read from a [`SceneDocument`](crate::scene::SceneDocument).
    const JSON_ID: Option<&'static str> = None;

    /// Column layout for this type.
    const STORAGE: StorageKind = StorageKind::Boxed;

    /// Base value used when the component is first attached to `entity`.
    fn init(entity: EntityId) -> Self;

    /// Merge `patch` into `self`.
    ///
    /// Returning [`EcsError::TypeMismatch`] rejects the write; the store then
    /// leaves the previous value (or the absence of one) untouched.
    fn on_set(&mut self, patch: Self::Patch) -> Result<(), EcsError>;

    /// Schema check for values rebuilt by a path update, which bypasses
    /// [`on_set`](Component::on_set).
    fn validate(&self) -> Result<(), EcsError> {
        Ok(())
    }

    /// Teardown hook, run while the value is still readable and before the
    /// reactive cell is released.
    fn on_remove(&self, _entity: EntityId, _commands: &mut CommandBuffer) {}

    /// Binding started on first attach and stopped on detach.
    fn binding() -> Option<Box<dyn Binding<Self>>> {
        None
    }

    /// Structured form written to scene documents. `None` omits the
    /// component from the output.
    fn to_json(&self, _entity: EntityId) -> Option<serde_json::Value> {
        serde_json::to_value(self).ok()
    }

    /// Rewrite any entity references held by this value after a scene load.
    fn map_entities(&mut self, _map: &EntityMap) {}
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Opaque, lightweight identifier for a registered component type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// [`Component::NAME`].
    pub name: &'static str,
    /// [`Component::JSON_ID`].
    pub json_id: Option<&'static str>,
    /// [`Component::STORAGE`].
    pub storage: StorageKind,
    /// Rust `TypeId` for runtime type checking.
    pub type_id: TypeId,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types to [`ComponentTypeId`]s and their metadata.
///
/// Registering the same Rust type twice returns the existing id. A second
/// type claiming an existing name or JSON id is rejected: component identity
/// is stable for the lifetime of the world.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<&'static str, ComponentTypeId>,
    by_json_id: HashMap<&'static str, ComponentTypeId>,
    /// Indexed by `ComponentTypeId.0`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T`, returning its id and whether it was newly added.
    pub(crate) fn register<T: Component>(&mut self) -> Result<(ComponentTypeId, bool), EcsError> {
        let rust_type_id = TypeId::of::<T>();
        if let Some(&existing) = self.by_type.get(&rust_type_id) {
            return Ok((existing, false));
        }
        if self.by_name.contains_key(T::NAME) {
            return Err(EcsError::StateError {
                details: format!(
                    "component name '{}' is already registered for a different type",
                    T::NAME
                ),
            });
        }
        if let Some(json_id) = T::JSON_ID {
            if self.by_json_id.contains_key(json_id) {
                return Err(EcsError::StateError {
                    details: format!(
                        "json id '{json_id}' is already registered for a different type"
                    ),
                });
            }
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: T::NAME,
            json_id: T::JSON_ID,
            storage: T::STORAGE,
            type_id: rust_type_id,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(T::NAME, id);
        if let Some(json_id) = T::JSON_ID {
            self.by_json_id.insert(json_id, id);
        }
        Ok((id, true))
    }

    /// Look up a component type by its Rust `TypeId`.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Look up a component type by a raw Rust `TypeId`.
    pub(crate) fn lookup_type_id(&self, type_id: TypeId) -> Option<ComponentTypeId> {
        self.by_type.get(&type_id).copied()
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Look up a component type by its scene-document identifier.
    pub fn lookup_by_json_id(&self, json_id: &str) -> Option<ComponentTypeId> {
        self.by_json_id.get(json_id).copied()
    }

    /// Get the [`ComponentInfo`] for a registered component type ID.
    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Build an [`EcsError::UnknownComponent`] listing what is registered.
    pub(crate) fn unknown(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.registered_names().join(", "),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
