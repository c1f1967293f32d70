//! Reactive cells.
//!
//! Every component instance owns one [`CellState`]: a write counter plus the
//! observers subscribed to that instance and the key of its running binding,
//! if any. The value itself lives next to the cell in the column.
//!
//! Observers are notified synchronously once a logical update completes, never
//! in the middle of one. Dropping the cell (on detach) drops its observers.

use std::fmt;

use crate::binding::BindingKey;
use crate::component::ComponentTypeId;
use crate::entity::EntityId;

/// Callback invoked with the entity and the value after a committed change.
pub type ObserverFn<T> = Box<dyn FnMut(EntityId, &T)>;

/// Handle returned by [`World::subscribe`](crate::world::World::subscribe).
///
/// Pass it to [`World::unsubscribe`](crate::world::World::unsubscribe) to stop
/// receiving notifications. Subscriptions end on their own when the
/// component is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use = "dropping a Subscription leaves the observer registered until the component is removed"]
pub struct Subscription {
    pub(crate) component: ComponentTypeId,
    pub(crate) entity: EntityId,
    pub(crate) id: u64,
}

impl Subscription {
    /// The observed entity.
    pub fn entity(&self) -> EntityId {
        self.entity
    }
}

pub(crate) struct CellState<T> {
    /// Column change stamp of the last committed write, attach included.
    /// Stamps never repeat within a column, so a detach followed by a
    /// re-attach still reads as a change.
    pub(crate) version: u64,
    pub(crate) binding: Option<BindingKey>,
    observers: Vec<(u64, ObserverFn<T>)>,
}

impl<T> CellState<T> {
    pub(crate) fn new(version: u64) -> Self {
        Self {
            version,
            binding: None,
            observers: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self, id: u64, observer: ObserverFn<T>) {
        self.observers.push((id, observer));
    }

    pub(crate) fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Invoke every observer in subscription order.
    pub(crate) fn notify(&mut self, entity: EntityId, value: &T) -> usize {
        for (_, observer) in &mut self.observers {
            observer(entity, value);
        }
        self.observers.len()
    }
}

impl<T> fmt::Debug for CellState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CellState")
            .field("version", &self.version)
            .field("observers", &self.observers.len())
            .field("binding", &self.binding)
            .finish()
    }
}
