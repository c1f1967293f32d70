//! Incrementally maintained queries.
//!
//! A query is a set of entities whose component signature contains every
//! required term and none of the excluded terms. Membership is updated
//! synchronously from the world's attach and detach paths, touching only the
//! queries that mention the changed component type, so a query is never
//! rescanned after it is defined.
//!
//! Each query keeps its members in insertion order and accumulates the
//! entities that entered or exited since the previous evaluation. Calling
//! [`QueryIndex::evaluate`] rolls that pending delta over into the lists
//! returned by [`QueryIndex::entered`] and [`QueryIndex::exited`]. An entity
//! that enters and leaves between two evaluations shows up in neither list.

use std::any::TypeId;
use std::collections::{BTreeMap, HashMap};

use crate::component::{Component, ComponentTypeId};
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// QuerySpec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Term {
    pub(crate) type_id: TypeId,
    pub(crate) name: &'static str,
}

/// Declarative description of a query, resolved against a world's registry
/// by [`World::define_query`](crate::world::World::define_query).
///
/// `QuerySpec::new().with::<Mesh>().without::<Hidden>()` matches entities
/// that carry a `Mesh` but no `Hidden`.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub(crate) with: Vec<Term>,
    pub(crate) without: Vec<Term>,
}

impl QuerySpec {
    /// An empty spec. Without terms it matches every live entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require component `T`.
    pub fn with<T: Component>(mut self) -> Self {
        self.with.push(Term {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
        });
        self
    }

    /// Exclude entities that have component `T`.
    pub fn without<T: Component>(mut self) -> Self {
        self.without.push(Term {
            type_id: TypeId::of::<T>(),
            name: T::NAME,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// QueryHandle
// ---------------------------------------------------------------------------

/// Handle to a defined query. Generational: a handle kept after
/// [`World::remove_query`](crate::world::World::remove_query) is rejected with
/// [`EcsError::UnknownQuery`] instead of reading a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryHandle {
    index: u32,
    generation: u32,
}

// ---------------------------------------------------------------------------
// QueryState
// ---------------------------------------------------------------------------

/// Insertion-ordered entity set with O(log n) removal.
#[derive(Debug, Default)]
struct Membership {
    order: BTreeMap<u64, EntityId>,
    seq_of: HashMap<EntityId, u64>,
    next_seq: u64,
}

impl Membership {
    fn contains(&self, entity: EntityId) -> bool {
        self.seq_of.contains_key(&entity)
    }

    fn insert(&mut self, entity: EntityId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, entity);
        self.seq_of.insert(entity, seq);
    }

    fn remove(&mut self, entity: EntityId) -> bool {
        match self.seq_of.remove(&entity) {
            Some(seq) => {
                self.order.remove(&seq);
                true
            }
            None => false,
        }
    }

    fn iter(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.order.values().copied()
    }

    fn len(&self) -> usize {
        self.seq_of.len()
    }
}

#[derive(Debug)]
struct QueryState {
    with: Vec<ComponentTypeId>,
    without: Vec<ComponentTypeId>,
    members: Membership,
    pending_entered: Vec<EntityId>,
    pending_exited: Vec<EntityId>,
    entered: Vec<EntityId>,
    exited: Vec<EntityId>,
}

impl QueryState {
    fn matches(&self, signature: &[ComponentTypeId]) -> bool {
        self.with.iter().all(|t| signature.binary_search(t).is_ok())
            && self.without.iter().all(|t| signature.binary_search(t).is_err())
    }

    fn enter(&mut self, entity: EntityId) {
        self.members.insert(entity);
        match self.pending_exited.iter().position(|&e| e == entity) {
            Some(pos) => {
                self.pending_exited.swap_remove(pos);
            }
            None => self.pending_entered.push(entity),
        }
    }

    fn exit(&mut self, entity: EntityId) {
        if !self.members.remove(entity) {
            return;
        }
        match self.pending_entered.iter().position(|&e| e == entity) {
            Some(pos) => {
                self.pending_entered.remove(pos);
            }
            None => self.pending_exited.push(entity),
        }
    }

    fn reconcile(&mut self, entity: EntityId, signature: &[ComponentTypeId]) {
        let matches = self.matches(signature);
        let member = self.members.contains(entity);
        if matches && !member {
            self.enter(entity);
        } else if !matches && member {
            self.exit(entity);
        }
    }

    fn mentions(&self) -> impl Iterator<Item = ComponentTypeId> + '_ {
        self.with.iter().chain(self.without.iter()).copied()
    }
}

struct QuerySlot {
    generation: u32,
    state: Option<QueryState>,
}

// ---------------------------------------------------------------------------
// QueryIndex
// ---------------------------------------------------------------------------

/// All live queries of one world, indexed by the component types they mention.
#[derive(Default)]
pub struct QueryIndex {
    slots: Vec<QuerySlot>,
    free: Vec<u32>,
    by_type: HashMap<ComponentTypeId, Vec<u32>>,
    /// Queries with no required term; they follow entity spawn and despawn.
    unconstrained: Vec<u32>,
}

impl std::fmt::Debug for QueryIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryIndex")
            .field("live_queries", &self.len())
            .finish()
    }
}

impl QueryIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Define a query and seed it from the current entity signatures.
    pub(crate) fn define<'a>(
        &mut self,
        mut with: Vec<ComponentTypeId>,
        mut without: Vec<ComponentTypeId>,
        existing: impl Iterator<Item = (EntityId, &'a [ComponentTypeId])>,
    ) -> QueryHandle {
        with.sort_unstable();
        with.dedup();
        without.sort_unstable();
        without.dedup();

        let mut state = QueryState {
            with,
            without,
            members: Membership::default(),
            pending_entered: Vec::new(),
            pending_exited: Vec::new(),
            entered: Vec::new(),
            exited: Vec::new(),
        };
        for (entity, signature) in existing {
            if state.matches(signature) {
                state.enter(entity);
            }
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(QuerySlot {
                    generation: 0,
                    state: None,
                });
                self.slots.len() as u32 - 1
            }
        };
        for tid in state.mentions() {
            self.by_type.entry(tid).or_default().push(index);
        }
        if state.with.is_empty() {
            self.unconstrained.push(index);
        }
        let slot = &mut self.slots[index as usize];
        slot.state = Some(state);
        QueryHandle {
            index,
            generation: slot.generation,
        }
    }

    /// Release a query. Returns `false` for an unknown or already released handle.
    pub(crate) fn remove(&mut self, handle: QueryHandle) -> bool {
        let Some(slot) = self.slots.get_mut(handle.index as usize) else {
            return false;
        };
        if slot.generation != handle.generation {
            return false;
        }
        let Some(state) = slot.state.take() else {
            return false;
        };
        slot.generation = slot.generation.wrapping_add(1);
        for tid in state.mentions() {
            if let Some(list) = self.by_type.get_mut(&tid) {
                list.retain(|&q| q != handle.index);
                if list.is_empty() {
                    self.by_type.remove(&tid);
                }
            }
        }
        self.unconstrained.retain(|&q| q != handle.index);
        self.free.push(handle.index);
        true
    }

    fn state(&self, handle: QueryHandle) -> Result<&QueryState, EcsError> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.as_ref())
            .ok_or(EcsError::UnknownQuery { handle })
    }

    fn state_mut(&mut self, handle: QueryHandle) -> Result<&mut QueryState, EcsError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.state.as_mut())
            .ok_or(EcsError::UnknownQuery { handle })
    }

    /// Current members in insertion order; rolls the pending delta over.
    pub(crate) fn evaluate(&mut self, handle: QueryHandle) -> Result<Vec<EntityId>, EcsError> {
        let state = self.state_mut(handle)?;
        state.entered = std::mem::take(&mut state.pending_entered);
        state.exited = std::mem::take(&mut state.pending_exited);
        Ok(state.members.iter().collect())
    }

    /// Entities that entered between the two most recent evaluations.
    pub(crate) fn entered(&self, handle: QueryHandle) -> Result<&[EntityId], EcsError> {
        Ok(&self.state(handle)?.entered)
    }

    /// Entities that exited between the two most recent evaluations.
    pub(crate) fn exited(&self, handle: QueryHandle) -> Result<&[EntityId], EcsError> {
        Ok(&self.state(handle)?.exited)
    }

    /// Current member count without rolling the delta.
    pub(crate) fn member_count(&self, handle: QueryHandle) -> Result<usize, EcsError> {
        Ok(self.state(handle)?.members.len())
    }

    /// Whether `entity` currently matches, without rolling the delta.
    pub(crate) fn contains(&self, handle: QueryHandle, entity: EntityId) -> Result<bool, EcsError> {
        Ok(self.state(handle)?.members.contains(entity))
    }

    /// `entity`'s signature gained or lost `changed`.
    pub(crate) fn on_signature_change(
        &mut self,
        entity: EntityId,
        changed: ComponentTypeId,
        signature: &[ComponentTypeId],
    ) {
        let Some(queries) = self.by_type.get(&changed) else {
            return;
        };
        for &q in queries {
            if let Some(state) = self.slots[q as usize].state.as_mut() {
                state.reconcile(entity, signature);
            }
        }
    }

    /// A new entity with an empty signature exists.
    pub(crate) fn on_spawn(&mut self, entity: EntityId) {
        for &q in &self.unconstrained {
            if let Some(state) = self.slots[q as usize].state.as_mut() {
                state.reconcile(entity, &[]);
            }
        }
    }

    /// `entity` is being freed. `signature` is what it carried before its
    /// components were detached; every query it could belong to is reached
    /// through those types or the unconstrained list.
    pub(crate) fn on_despawn(&mut self, entity: EntityId, signature: &[ComponentTypeId]) {
        let via_types = signature
            .iter()
            .filter_map(|tid| self.by_type.get(tid))
            .flatten();
        for &q in via_types.chain(self.unconstrained.iter()) {
            if let Some(state) = self.slots[q as usize].state.as_mut() {
                state.exit(entity);
            }
        }
    }

    /// Number of live queries.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.state.is_some()).count()
    }

    /// Whether no queries are defined.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
