//! The [`World`] is the top-level container for the ECS. It owns the entity
//! allocator, the component registry, one column per component type, the
//! query index, and the deferred command buffer.
//!
//! # Logical updates
//!
//! Every public mutating call is one logical update, and [`World::batch`]
//! groups several calls into one. Change notifications for each touched
//! (entity, component) pair are collected while the update runs and delivered
//! once when the outermost update closes. After notifications, commands queued
//! by hooks are applied in FIFO rounds until the buffer drains or the round
//! limit is hit.
//!
//! Query membership is the exception: it is updated synchronously inside
//! attach and detach, so a query read inside a batch is always exact.

use std::collections::HashSet;

use crate::cell::Subscription;
use crate::command::{ApplyReport, CommandBuffer};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::{EntityAllocator, EntityId};
use crate::query::{QueryHandle, QueryIndex, QuerySpec};
use crate::storage::{Column, ErasedColumn, Write};
use crate::EcsError;

/// Default number of command-buffer rounds applied per logical update.
pub const DEFAULT_MAX_COMMAND_ROUNDS: usize = 64;

// ---------------------------------------------------------------------------
// World
// ---------------------------------------------------------------------------

/// The ECS world. Owns all entities, component data, and queries.
pub struct World {
    pub(crate) allocator: EntityAllocator,
    pub(crate) registry: ComponentRegistry,
    /// Indexed by `ComponentTypeId.0`.
    pub(crate) columns: Vec<Box<dyn ErasedColumn>>,
    /// Sorted component ids per entity index.
    pub(crate) signatures: Vec<Vec<ComponentTypeId>>,
    queries: QueryIndex,
    commands: CommandBuffer,
    /// Nesting depth of open logical updates.
    depth: u32,
    pending: Vec<(EntityId, ComponentTypeId)>,
    pending_set: HashSet<(EntityId, ComponentTypeId)>,
    tearing_down: HashSet<EntityId>,
    flushing: bool,
    max_command_rounds: usize,
    last_apply_report: ApplyReport,
}

impl std::fmt::Debug for World {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("World")
            .field("entity_count", &self.entity_count())
            .field("component_types", &self.registry.len())
            .field("queries", &self.queries)
            .field("queued_commands", &self.commands.len())
            .finish()
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

fn typed<T: Component>(column: &dyn ErasedColumn) -> Result<&Column<T>, EcsError> {
    column
        .as_any()
        .downcast_ref::<Column<T>>()
        .ok_or_else(|| EcsError::StateError {
            details: format!("column '{}' does not hold {}", column.name(), T::NAME),
        })
}

fn typed_mut<T: Component>(column: &mut dyn ErasedColumn) -> Result<&mut Column<T>, EcsError> {
    let name = column.name();
    column
        .as_any_mut()
        .downcast_mut::<Column<T>>()
        .ok_or_else(|| EcsError::StateError {
            details: format!("column '{name}' does not hold {}", T::NAME),
        })
}

impl World {
    /// Create an empty world.
    pub fn new() -> Self {
        Self {
            allocator: EntityAllocator::new(),
            registry: ComponentRegistry::new(),
            columns: Vec::new(),
            signatures: Vec::new(),
            queries: QueryIndex::new(),
            commands: CommandBuffer::new(),
            depth: 0,
            pending: Vec::new(),
            pending_set: HashSet::new(),
            tearing_down: HashSet::new(),
            flushing: false,
            max_command_rounds: DEFAULT_MAX_COMMAND_ROUNDS,
            last_apply_report: ApplyReport::default(),
        }
    }

    /// Limit how many command-buffer rounds one logical update may apply.
    pub fn set_max_command_rounds(&mut self, rounds: usize) {
        self.max_command_rounds = rounds.max(1);
    }

    /// Reference to the component registry.
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    // -- registration -------------------------------------------------------

    /// Register component type `T`. Registering the same type again returns
    /// the existing id.
    pub fn register<T: Component>(&mut self) -> Result<ComponentTypeId, EcsError> {
        let (id, added) = self.registry.register::<T>()?;
        if added {
            debug_assert_eq!(id.index(), self.columns.len());
            self.columns.push(Box::new(Column::<T>::new(id)));
            tracing::debug!(component = T::NAME, id = ?id, storage = ?T::STORAGE, "component registered");
        }
        Ok(id)
    }

    /// Id of a registered component type.
    pub fn component_id<T: Component>(&self) -> Option<ComponentTypeId> {
        self.registry.lookup::<T>()
    }

    fn require_id<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.registry
            .lookup::<T>()
            .ok_or_else(|| self.registry.unknown(T::NAME))
    }

    fn require_name(&self, name: &str) -> Result<ComponentTypeId, EcsError> {
        self.registry
            .lookup_by_name(name)
            .ok_or_else(|| self.registry.unknown(name))
    }

    fn ensure_alive(&self, entity: EntityId) -> Result<(), EcsError> {
        if self.allocator.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::InvalidEntity { entity })
        }
    }

    // -- entities -----------------------------------------------------------

    /// Allocate a new entity at the lowest free index.
    pub fn spawn(&mut self) -> EntityId {
        let entity = self.allocator.allocate();
        let idx = entity.index() as usize;
        if idx >= self.signatures.len() {
            self.signatures.resize_with(idx + 1, Vec::new);
        }
        self.signatures[idx].clear();
        self.queries.on_spawn(entity);
        entity
    }

    /// Destroy an entity, detaching every component first.
    ///
    /// A no-op for entities that are not alive. Each component's `on_remove`
    /// hook and binding teardown run before the id is freed.
    pub fn despawn(&mut self, entity: EntityId) -> Result<(), EcsError> {
        if !self.allocator.is_alive(entity) {
            return Ok(());
        }
        if !self.tearing_down.insert(entity) {
            return Err(EcsError::StateError {
                details: format!("{entity} is already being destroyed"),
            });
        }

        self.begin();
        let signature = std::mem::take(&mut self.signatures[entity.index() as usize]);
        let mut first_error = None;
        for &tid in &signature {
            if let Err(e) = self.columns[tid.index()].detach(entity, &mut self.commands) {
                first_error.get_or_insert(e);
            }
        }
        self.queries.on_despawn(entity, &signature);
        self.drop_pending(|(e, _)| *e == entity);
        self.allocator.deallocate(entity);
        self.tearing_down.remove(&entity);
        tracing::trace!(entity = ?entity, components = signature.len(), "entity despawned");
        self.end();

        first_error.map_or(Ok(()), Err)
    }

    /// Whether `entity` is currently alive.
    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    /// Number of live entities.
    pub fn entity_count(&self) -> usize {
        self.allocator.alive_count()
    }

    /// Live entities in ascending index order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.allocator.iter_alive().collect()
    }

    /// Sorted component ids attached to `entity`.
    pub fn signature(&self, entity: EntityId) -> Result<&[ComponentTypeId], EcsError> {
        self.ensure_alive(entity)?;
        Ok(&self.signatures[entity.index() as usize])
    }

    // -- component writes ---------------------------------------------------

    /// Apply `patch` to `entity`'s `T`, attaching it first if absent.
    ///
    /// A rejected patch leaves the previous value (or the absence of one)
    /// untouched.
    pub fn set<T: Component>(&mut self, entity: EntityId, patch: T::Patch) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        let id = self.require_id::<T>()?;
        self.begin();
        let result = typed_mut::<T>(self.columns[id.index()].as_mut())
            .and_then(|column| column.write(entity, patch, &mut self.commands));
        if let Ok(write) = result {
            self.after_write(entity, id, write);
        }
        self.end();
        result.map(|_| ())
    }

    /// [`set`](Self::set) for types whose patch is the whole value, so the
    /// component type is inferred from `value`.
    pub fn insert<T: Component<Patch = T>>(&mut self, entity: EntityId, value: T) -> Result<(), EcsError> {
        self.set::<T>(entity, value)
    }

    /// Like [`set`](Self::set), addressed by registered name with a JSON patch.
    pub fn set_by_name(
        &mut self,
        entity: EntityId,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        let id = self.require_name(name)?;
        self.begin();
        let result = self.columns[id.index()].set_json(entity, patch, &mut self.commands);
        if let Ok(write) = result {
            self.after_write(entity, id, write);
        }
        self.end();
        result.map(|_| ())
    }

    /// Replace the field at dotted `path` inside `entity`'s existing `T`.
    ///
    /// The rebuilt value must still deserialize as `T` and pass
    /// [`Component::validate`]; otherwise nothing changes.
    pub fn update<T: Component>(
        &mut self,
        entity: EntityId,
        path: &str,
        value: serde_json::Value,
    ) -> Result<(), EcsError> {
        let id = self.require_id::<T>()?;
        self.update_id(entity, id, path, value)
    }

    /// Like [`update`](Self::update), addressed by registered name.
    pub fn update_by_name(
        &mut self,
        entity: EntityId,
        name: &str,
        path: &str,
        value: serde_json::Value,
    ) -> Result<(), EcsError> {
        let id = self.require_name(name)?;
        self.update_id(entity, id, path, value)
    }

    fn update_id(
        &mut self,
        entity: EntityId,
        id: ComponentTypeId,
        path: &str,
        value: serde_json::Value,
    ) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.begin();
        let result = self.columns[id.index()].write_path(entity, path, value);
        if result.is_ok() {
            self.after_write(entity, id, Write::Modified);
        }
        self.end();
        result
    }

    /// Detach `T` from `entity`. Returns whether it was present.
    pub fn remove<T: Component>(&mut self, entity: EntityId) -> Result<bool, EcsError> {
        let id = self.require_id::<T>()?;
        self.remove_id(entity, id)
    }

    /// Like [`remove`](Self::remove), addressed by registered name.
    pub fn remove_by_name(&mut self, entity: EntityId, name: &str) -> Result<bool, EcsError> {
        let id = self.require_name(name)?;
        self.remove_id(entity, id)
    }

    fn remove_id(&mut self, entity: EntityId, id: ComponentTypeId) -> Result<bool, EcsError> {
        self.ensure_alive(entity)?;
        if !self.columns[id.index()].contains(entity) {
            return Ok(false);
        }
        self.begin();
        let result = self.columns[id.index()].detach(entity, &mut self.commands);
        // The value is gone even if its binding reported a teardown error.
        let signature = &mut self.signatures[entity.index() as usize];
        if let Ok(pos) = signature.binary_search(&id) {
            signature.remove(pos);
        }
        self.queries.on_signature_change(entity, id, signature);
        self.drop_pending(|&(e, t)| e == entity && t == id);
        self.end();
        result
    }

    /// Group several writes into one logical update.
    ///
    /// Observers and binding effects see the combined result once, after `f`
    /// returns; each touched (entity, component) pair is notified at most
    /// once.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut World) -> R) -> R {
        self.begin();
        let out = f(self);
        self.end();
        out
    }

    fn after_write(&mut self, entity: EntityId, id: ComponentTypeId, write: Write) {
        match write {
            Write::Attached => {
                let signature = &mut self.signatures[entity.index() as usize];
                if let Err(pos) = signature.binary_search(&id) {
                    signature.insert(pos, id);
                }
                self.queries.on_signature_change(entity, id, signature);
            }
            Write::Modified => {
                if self.pending_set.insert((entity, id)) {
                    self.pending.push((entity, id));
                }
            }
        }
    }

    fn drop_pending(&mut self, mut matches: impl FnMut(&(EntityId, ComponentTypeId)) -> bool) {
        let pending_set = &mut self.pending_set;
        self.pending.retain(|key| {
            if matches(key) {
                pending_set.remove(key);
                false
            } else {
                true
            }
        });
    }

    // -- logical update bookkeeping ----------------------------------------

    fn begin(&mut self) {
        self.depth += 1;
    }

    fn end(&mut self) {
        self.depth -= 1;
        if self.depth == 0 {
            self.deliver_notifications();
            if !self.flushing {
                self.flush();
            }
        }
    }

    fn deliver_notifications(&mut self) {
        while !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.pending_set.clear();
            for (entity, id) in pending {
                self.columns[id.index()].notify(entity, &mut self.commands);
            }
        }
    }

    /// Apply queued commands now.
    ///
    /// Commands queued while a round is applied run in the next round. After
    /// the configured round limit the remainder is discarded with a warning.
    /// Runs automatically at the end of every logical update; call it
    /// directly after queueing through [`commands`](Self::commands).
    pub fn flush(&mut self) -> ApplyReport {
        if self.flushing {
            return ApplyReport::default();
        }
        self.flushing = true;
        let mut report = ApplyReport::default();
        let mut rounds = 0;
        while !self.commands.is_empty() {
            if rounds == self.max_command_rounds {
                tracing::warn!(
                    rounds,
                    discarded = self.commands.len(),
                    "command rounds exhausted -- discarding remaining commands"
                );
                self.commands = CommandBuffer::new();
                break;
            }
            let mut round = std::mem::take(&mut self.commands);
            round.apply(self);
            report.merge(round.last_apply_report());
            rounds += 1;
        }
        self.flushing = false;
        if rounds > 0 {
            tracing::trace!(rounds, ?report, "command buffer flushed");
            self.last_apply_report = report;
        }
        report
    }

    /// The world's deferred command buffer.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        &mut self.commands
    }

    /// Aggregated report of the most recent non-empty flush.
    pub fn last_apply_report(&self) -> ApplyReport {
        self.last_apply_report
    }

    // -- component reads ----------------------------------------------------

    /// Read `entity`'s `T`.
    pub fn get<T: Component>(&self, entity: EntityId) -> Result<&T, EcsError> {
        self.ensure_alive(entity)?;
        let id = self.require_id::<T>()?;
        typed::<T>(self.columns[id.index()].as_ref())?
            .get(entity)
            .ok_or(EcsError::MissingComponent {
                entity,
                component: T::NAME,
            })
    }

    /// Read `entity`'s `T`, or `None` when the entity or component is absent.
    pub fn get_optional<T: Component>(&self, entity: EntityId) -> Option<&T> {
        self.get::<T>(entity).ok()
    }

    /// Whether `entity` is alive and has `T`.
    pub fn has<T: Component>(&self, entity: EntityId) -> bool {
        match self.registry.lookup::<T>() {
            Some(id) => {
                self.allocator.is_alive(entity) && self.columns[id.index()].contains(entity)
            }
            None => false,
        }
    }

    /// Change stamp of `entity`'s `T` cell, renewed on every committed write
    /// and on attach. Stamps only grow within a component type, so comparing
    /// against a remembered value also catches a remove followed by a
    /// re-attach.
    pub fn version<T: Component>(&self, entity: EntityId) -> Option<u64> {
        let id = self.registry.lookup::<T>()?;
        self.columns[id.index()].version(entity)
    }

    /// Every `(entity, &T)` pair in storage order.
    pub fn iter<T: Component>(&self) -> impl Iterator<Item = (EntityId, &T)> + '_ {
        self.registry
            .lookup::<T>()
            .and_then(|id| typed::<T>(self.columns[id.index()].as_ref()).ok())
            .into_iter()
            .flat_map(|column| column.iter())
    }

    /// Number of entities carrying `T`.
    pub fn count<T: Component>(&self) -> usize {
        self.registry
            .lookup::<T>()
            .map_or(0, |id| self.columns[id.index()].len())
    }

    /// Dense storage of a packed component type: owners and values, parallel.
    pub fn packed_slice<T: Component>(&self) -> Option<(&[EntityId], &[T])> {
        let id = self.registry.lookup::<T>()?;
        let column = typed::<T>(self.columns[id.index()].as_ref()).ok()?;
        Some((column.entities(), column.as_slice()?))
    }

    /// Raw bytes of a packed plain-old-data component type.
    pub fn packed_bytes<T: Component + bytemuck::Pod>(&self) -> Option<&[u8]> {
        self.packed_slice::<T>()
            .map(|(_, values)| bytemuck::cast_slice(values))
    }

    /// Number of live bindings for `T`.
    pub fn binding_count<T: Component>(&self) -> usize {
        self.registry
            .lookup::<T>()
            .map_or(0, |id| self.columns[id.index()].binding_count())
    }

    // -- observers ----------------------------------------------------------

    /// Observe committed changes to `entity`'s `T`.
    ///
    /// The observer is called once per logical update that modified the
    /// value, after the update completes. It ends automatically when the
    /// component is removed.
    pub fn subscribe<T: Component>(
        &mut self,
        entity: EntityId,
        observer: impl FnMut(EntityId, &T) + 'static,
    ) -> Result<Subscription, EcsError> {
        self.ensure_alive(entity)?;
        let id = self.require_id::<T>()?;
        let column = typed_mut::<T>(self.columns[id.index()].as_mut())?;
        let sub = column
            .subscribe(entity, Box::new(observer))
            .ok_or(EcsError::MissingComponent {
                entity,
                component: T::NAME,
            })?;
        Ok(Subscription {
            component: id,
            entity,
            id: sub,
        })
    }

    /// Stop an observer. Returns `false` if it already ended.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.columns
            .get_mut(subscription.component.index())
            .is_some_and(|column| column.unsubscribe(subscription.entity, subscription.id))
    }

    // -- queries ------------------------------------------------------------

    /// Define a query and seed it with the entities that already match.
    pub fn define_query(&mut self, spec: QuerySpec) -> Result<QueryHandle, EcsError> {
        let resolve = |terms: &[crate::query::Term]| {
            terms
                .iter()
                .map(|t| {
                    self.registry
                        .lookup_type_id(t.type_id)
                        .ok_or_else(|| self.registry.unknown(t.name))
                })
                .collect::<Result<Vec<_>, _>>()
        };
        let with = resolve(&spec.with)?;
        let without = resolve(&spec.without)?;
        let signatures = &self.signatures;
        let existing = self
            .allocator
            .iter_alive()
            .map(|e| (e, signatures[e.index() as usize].as_slice()));
        Ok(self.queries.define(with, without, existing))
    }

    /// Current members in insertion order. Also rolls the entered/exited
    /// delta over.
    pub fn evaluate(&mut self, query: QueryHandle) -> Result<Vec<EntityId>, EcsError> {
        self.queries.evaluate(query)
    }

    /// Entities that entered the query between the last two evaluations.
    pub fn entered(&self, query: QueryHandle) -> Result<&[EntityId], EcsError> {
        self.queries.entered(query)
    }

    /// Entities that exited the query between the last two evaluations.
    pub fn exited(&self, query: QueryHandle) -> Result<&[EntityId], EcsError> {
        self.queries.exited(query)
    }

    /// Current member count, without rolling the delta.
    pub fn query_len(&self, query: QueryHandle) -> Result<usize, EcsError> {
        self.queries.member_count(query)
    }

    /// Whether `entity` currently matches, without rolling the delta.
    pub fn query_contains(&self, query: QueryHandle, entity: EntityId) -> Result<bool, EcsError> {
        self.queries.contains(query, entity)
    }

    /// Release a query.
    pub fn remove_query(&mut self, query: QueryHandle) -> Result<(), EcsError> {
        if self.queries.remove(query) {
            Ok(())
        } else {
            Err(EcsError::UnknownQuery { handle: query })
        }
    }

    // -- scene loading support ---------------------------------------------

    /// Attach a component from a scene document, remapping entity references.
    pub(crate) fn load_component(
        &mut self,
        entity: EntityId,
        id: ComponentTypeId,
        value: &serde_json::Value,
        map: &crate::scene::EntityMap,
    ) -> Result<(), EcsError> {
        self.begin();
        let result = self.columns[id.index()].load_json(entity, value, map, &mut self.commands);
        if result.is_ok() {
            self.after_write(entity, id, Write::Attached);
        }
        self.end();
        result
    }

    pub(crate) fn begin_update(&mut self) {
        self.begin();
    }

    pub(crate) fn end_update(&mut self) {
        self.end();
    }

    #[cfg(test)]
    pub(crate) fn mark_tearing_down(&mut self, entity: EntityId) {
        self.tearing_down.insert(entity);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
