//! Per-type component columns.
//!
//! Each registered component type gets one [`Column`]: a sparse set mapping
//! entity index to a dense slot. The dense side holds the owning entity, the
//! value, and the value's reactive [`CellState`]. Lookup by entity is O(1);
//! iteration walks the dense arrays. Removal swaps the last slot into the
//! hole, so dense order is not insertion order.
//!
//! The world talks to columns through [`ErasedColumn`] when it only has a
//! [`ComponentTypeId`] (entity teardown, command buffer, scene documents) and
//! downcasts to `Column<T>` for typed access.

use std::any::Any;

use serde_json::Value;

use crate::binding::BindingArena;
use crate::cell::{CellState, ObserverFn};
use crate::command::CommandBuffer;
use crate::component::{Component, ComponentTypeId, StorageKind};
use crate::entity::EntityId;
use crate::scene::EntityMap;
use crate::EcsError;

const EMPTY: u32 = u32::MAX;

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Write {
    /// The component was not present and is now attached.
    Attached,
    /// An existing value was replaced.
    Modified,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

enum Values<T> {
    Packed(Vec<T>),
    Boxed(Vec<Box<T>>),
}

impl<T> Values<T> {
    fn new(kind: StorageKind) -> Self {
        match kind {
            StorageKind::Packed => Values::Packed(Vec::new()),
            StorageKind::Boxed => Values::Boxed(Vec::new()),
        }
    }

    fn get(&self, slot: usize) -> &T {
        match self {
            Values::Packed(v) => &v[slot],
            Values::Boxed(v) => &v[slot],
        }
    }

    fn get_mut(&mut self, slot: usize) -> &mut T {
        match self {
            Values::Packed(v) => &mut v[slot],
            Values::Boxed(v) => &mut v[slot],
        }
    }

    fn push(&mut self, value: T) {
        match self {
            Values::Packed(v) => v.push(value),
            Values::Boxed(v) => v.push(Box::new(value)),
        }
    }

    fn swap_remove(&mut self, slot: usize) {
        match self {
            Values::Packed(v) => {
                v.swap_remove(slot);
            }
            Values::Boxed(v) => {
                v.swap_remove(slot);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

pub(crate) struct Column<T: Component> {
    id: ComponentTypeId,
    /// Entity index -> dense slot, `EMPTY` when absent.
    sparse: Vec<u32>,
    entities: Vec<EntityId>,
    values: Values<T>,
    cells: Vec<CellState<T>>,
    bindings: BindingArena<T>,
    next_subscription: u64,
    /// Last change stamp handed out; the first write gets 1.
    change_tick: u64,
}

impl<T: Component> Column<T> {
    pub(crate) fn new(id: ComponentTypeId) -> Self {
        Self {
            id,
            sparse: Vec::new(),
            entities: Vec::new(),
            values: Values::new(T::STORAGE),
            cells: Vec::new(),
            bindings: BindingArena::default(),
            next_subscription: 0,
            change_tick: 0,
        }
    }

    fn next_change(&mut self) -> u64 {
        self.change_tick += 1;
        self.change_tick
    }

    #[inline]
    fn slot(&self, entity: EntityId) -> Option<usize> {
        let slot = *self.sparse.get(entity.index() as usize)?;
        if slot == EMPTY || self.entities[slot as usize] != entity {
            return None;
        }
        Some(slot as usize)
    }

    pub(crate) fn get(&self, entity: EntityId) -> Option<&T> {
        self.slot(entity).map(|slot| self.values.get(slot))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.entities
            .iter()
            .enumerate()
            .map(move |(slot, &e)| (e, self.values.get(slot)))
    }

    /// Dense values, for packed columns only.
    pub(crate) fn as_slice(&self) -> Option<&[T]> {
        match &self.values {
            Values::Packed(v) => Some(v),
            Values::Boxed(_) => None,
        }
    }

    /// Owning entities, parallel to [`as_slice`](Self::as_slice).
    pub(crate) fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    fn type_mismatch(details: impl ToString) -> EcsError {
        EcsError::TypeMismatch {
            component: T::NAME.to_owned(),
            details: details.to_string(),
        }
    }

    /// Apply `patch`, attaching a fresh instance first if needed.
    ///
    /// The patch is merged into a copy; nothing is stored unless `on_set`
    /// succeeds.
    pub(crate) fn write(
        &mut self,
        entity: EntityId,
        patch: T::Patch,
        commands: &mut CommandBuffer,
    ) -> Result<Write, EcsError> {
        match self.slot(entity) {
            Some(slot) => {
                let mut next = self.values.get(slot).clone();
                next.on_set(patch)?;
                *self.values.get_mut(slot) = next;
                let version = self.next_change();
                self.cells[slot].version = version;
                Ok(Write::Modified)
            }
            None => {
                let mut value = T::init(entity);
                value.on_set(patch)?;
                self.attach(entity, value, commands);
                Ok(Write::Attached)
            }
        }
    }

    /// Store a brand-new instance and start its binding.
    fn attach(&mut self, entity: EntityId, value: T, commands: &mut CommandBuffer) {
        let idx = entity.index() as usize;
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, EMPTY);
        }
        let slot = self.entities.len();
        self.sparse[idx] = slot as u32;
        self.entities.push(entity);
        self.values.push(value);
        let version = self.next_change();
        self.cells.push(CellState::new(version));

        if let Some(binding) = T::binding() {
            let key = self
                .bindings
                .start(entity, binding, self.values.get(slot), commands);
            self.cells[slot].binding = Some(key);
        }
    }

    /// Overwrite the field at a dotted `path` of an existing value.
    pub(crate) fn write_path(
        &mut self,
        entity: EntityId,
        path: &str,
        value: Value,
    ) -> Result<(), EcsError> {
        let slot = self.slot(entity).ok_or(EcsError::MissingComponent {
            entity,
            component: T::NAME,
        })?;
        let mut json = serde_json::to_value(self.values.get(slot)).map_err(Self::type_mismatch)?;
        write_json_path(&mut json, path, value).map_err(Self::type_mismatch)?;
        let next: T = serde_json::from_value(json).map_err(Self::type_mismatch)?;
        next.validate()?;
        *self.values.get_mut(slot) = next;
        let version = self.next_change();
        self.cells[slot].version = version;
        Ok(())
    }

    /// Run `on_remove`, stop the binding, then release the cell.
    pub(crate) fn detach(
        &mut self,
        entity: EntityId,
        commands: &mut CommandBuffer,
    ) -> Result<bool, EcsError> {
        let Some(slot) = self.slot(entity) else {
            return Ok(false);
        };
        let value = self.values.get(slot);
        value.on_remove(entity, commands);
        let stopped = match self.cells[slot].binding.take() {
            Some(key) => self.bindings.stop(key, value, commands),
            None => Ok(()),
        };

        self.values.swap_remove(slot);
        self.cells.swap_remove(slot);
        self.entities.swap_remove(slot);
        self.sparse[entity.index() as usize] = EMPTY;
        if let Some(&moved) = self.entities.get(slot) {
            self.sparse[moved.index() as usize] = slot as u32;
        }
        stopped.map(|()| true)
    }

    /// Deliver one change notification to observers and the binding.
    pub(crate) fn notify(&mut self, entity: EntityId, commands: &mut CommandBuffer) {
        let Some(slot) = self.slot(entity) else {
            return;
        };
        let value = self.values.get(slot);
        let cell = &mut self.cells[slot];
        cell.notify(entity, value);
        if let Some(key) = cell.binding {
            let reran = self.bindings.changed(key, value, commands);
            if reran > 0 {
                tracing::trace!(
                    entity = ?entity,
                    component = T::NAME,
                    effects = reran,
                    "binding effects re-ran"
                );
            }
        }
    }

    pub(crate) fn subscribe(&mut self, entity: EntityId, observer: ObserverFn<T>) -> Option<u64> {
        let slot = self.slot(entity)?;
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.cells[slot].subscribe(id, observer);
        Some(id)
    }
}

// ---------------------------------------------------------------------------
// ErasedColumn
// ---------------------------------------------------------------------------

/// Type-erased column operations used when only a [`ComponentTypeId`] is known.
pub(crate) trait ErasedColumn {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn component_id(&self) -> ComponentTypeId;
    fn name(&self) -> &'static str;
    fn len(&self) -> usize;
    fn contains(&self, entity: EntityId) -> bool;
    fn version(&self, entity: EntityId) -> Option<u64>;
    fn binding_count(&self) -> usize;
    fn set_json(
        &mut self,
        entity: EntityId,
        patch: &Value,
        commands: &mut CommandBuffer,
    ) -> Result<Write, EcsError>;
    fn write_path(&mut self, entity: EntityId, path: &str, value: Value) -> Result<(), EcsError>;
    fn load_json(
        &mut self,
        entity: EntityId,
        patch: &Value,
        map: &EntityMap,
        commands: &mut CommandBuffer,
    ) -> Result<(), EcsError>;
    fn to_json(&self, entity: EntityId) -> Option<Value>;
    fn detach(&mut self, entity: EntityId, commands: &mut CommandBuffer) -> Result<bool, EcsError>;
    fn notify(&mut self, entity: EntityId, commands: &mut CommandBuffer);
    fn unsubscribe(&mut self, entity: EntityId, id: u64) -> bool;
}

impl<T: Component> ErasedColumn for Column<T> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn component_id(&self) -> ComponentTypeId {
        self.id
    }

    fn name(&self) -> &'static str {
        T::NAME
    }

    fn len(&self) -> usize {
        self.entities.len()
    }

    fn contains(&self, entity: EntityId) -> bool {
        self.slot(entity).is_some()
    }

    fn version(&self, entity: EntityId) -> Option<u64> {
        self.slot(entity).map(|slot| self.cells[slot].version)
    }

    fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn set_json(
        &mut self,
        entity: EntityId,
        patch: &Value,
        commands: &mut CommandBuffer,
    ) -> Result<Write, EcsError> {
        let patch: T::Patch =
            serde_json::from_value(patch.clone()).map_err(Self::type_mismatch)?;
        self.write(entity, patch, commands)
    }

    fn write_path(&mut self, entity: EntityId, path: &str, value: Value) -> Result<(), EcsError> {
        Column::write_path(self, entity, path, value)
    }

    fn load_json(
        &mut self,
        entity: EntityId,
        patch: &Value,
        map: &EntityMap,
        commands: &mut CommandBuffer,
    ) -> Result<(), EcsError> {
        if self.slot(entity).is_some() {
            return Err(EcsError::StateError {
                details: format!("{} already attached to {entity} during scene load", T::NAME),
            });
        }
        let patch: T::Patch =
            serde_json::from_value(patch.clone()).map_err(Self::type_mismatch)?;
        let mut value = T::init(entity);
        value.on_set(patch)?;
        value.map_entities(map);
        self.attach(entity, value, commands);
        Ok(())
    }

    fn to_json(&self, entity: EntityId) -> Option<Value> {
        self.get(entity).and_then(|v| v.to_json(entity))
    }

    fn detach(&mut self, entity: EntityId, commands: &mut CommandBuffer) -> Result<bool, EcsError> {
        Column::detach(self, entity, commands)
    }

    fn notify(&mut self, entity: EntityId, commands: &mut CommandBuffer) {
        Column::notify(self, entity, commands)
    }

    fn unsubscribe(&mut self, entity: EntityId, id: u64) -> bool {
        match self.slot(entity) {
            Some(slot) => self.cells[slot].unsubscribe(id),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Path writes
// ---------------------------------------------------------------------------

/// Replace the node at a dotted `path` inside `root`.
///
/// Segments name object fields; numeric segments index arrays
/// (`"position.0"`). Only existing nodes can be replaced, so a path can never
/// invent a field the schema does not have. An empty path replaces the root.
pub(crate) fn write_json_path(root: &mut Value, path: &str, value: Value) -> Result<(), String> {
    let mut target = root;
    if !path.is_empty() {
        for segment in path.split('.') {
            target = match target {
                Value::Object(map) => map.get_mut(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
                _ => None,
            }
            .ok_or_else(|| format!("path '{path}' has no segment '{segment}'"))?;
        }
    }
    *target = value;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
