//! Bindings: side-effect processes scoped to a component instance's lifetime.
//!
//! A component type opts in by returning a [`Binding`] from
//! [`Component::binding`](crate::component::Component::binding). The store
//! starts it when the component is first attached to an entity and stops it
//! exactly once when the component is removed or the entity is destroyed.
//! Re-attaching later starts a fresh binding.
//!
//! During [`Binding::on_attach`] a binding may register nested effects with
//! [`BindingContext::effect`]. Each effect declares a dependency list computed
//! from the current value; after every coalesced change notification the list
//! is compared shallowly against the previous one and the effect re-runs only
//! when it differs. Setup never re-runs.
//!
//! Running bindings live in a per-type [`BindingArena`] keyed by the owning
//! entity, so teardown order is explicit rather than tied to drop order.

use std::fmt;

use crate::command::CommandBuffer;
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Dep
// ---------------------------------------------------------------------------

/// One entry of an effect's dependency list.
///
/// Floats compare by bit pattern, so `NaN == NaN` and `0.0 != -0.0`. A
/// dependency that keeps producing NaN therefore does not re-trigger its
/// effect on every change.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dep {
    Bool(bool),
    Int(i64),
    Float(u64),
    Str(String),
    Entity(EntityId),
    None,
}

impl From<bool> for Dep {
    fn from(v: bool) -> Self {
        Dep::Bool(v)
    }
}

impl From<i32> for Dep {
    fn from(v: i32) -> Self {
        Dep::Int(v as i64)
    }
}

impl From<i64> for Dep {
    fn from(v: i64) -> Self {
        Dep::Int(v)
    }
}

impl From<u32> for Dep {
    fn from(v: u32) -> Self {
        Dep::Int(v as i64)
    }
}

impl From<usize> for Dep {
    fn from(v: usize) -> Self {
        Dep::Int(v as i64)
    }
}

impl From<f32> for Dep {
    fn from(v: f32) -> Self {
        Dep::Float(f64::from(v).to_bits())
    }
}

impl From<f64> for Dep {
    fn from(v: f64) -> Self {
        Dep::Float(v.to_bits())
    }
}

impl From<&str> for Dep {
    fn from(v: &str) -> Self {
        Dep::Str(v.to_owned())
    }
}

impl From<String> for Dep {
    fn from(v: String) -> Self {
        Dep::Str(v)
    }
}

impl From<EntityId> for Dep {
    fn from(v: EntityId) -> Self {
        Dep::Entity(v)
    }
}

impl<D: Into<Dep>> From<Option<D>> for Dep {
    fn from(v: Option<D>) -> Self {
        v.map_or(Dep::None, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Binding trait and contexts
// ---------------------------------------------------------------------------

/// A lifecycle-scoped side effect attached to one component instance.
pub trait Binding<T>: 'static {
    /// Setup, run once when the component is attached.
    fn on_attach(&mut self, cx: &mut BindingContext<'_, T>, value: &T);

    /// Teardown, run once when the component is detached. Effect cleanups
    /// have already run when this is called.
    fn on_detach(&mut self, _cx: &mut BindingContext<'_, T>, _value: &T) {}
}

/// Cleanup returned by an effect run; invoked before the next run of the
/// same effect and at teardown.
pub type Cleanup = Box<dyn FnOnce(&mut EffectContext<'_>)>;

type DepsFn<T> = Box<dyn Fn(&T) -> Vec<Dep>>;
type RunFn<T> = Box<dyn FnMut(&mut EffectContext<'_>, &T) -> Option<Cleanup>>;

/// Handed to [`Binding::on_attach`] and [`Binding::on_detach`].
pub struct BindingContext<'a, T> {
    entity: EntityId,
    commands: &'a mut CommandBuffer,
    effects: Option<&'a mut Vec<Effect<T>>>,
}

impl<'a, T> BindingContext<'a, T> {
    /// The entity owning the component.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Deferred world mutations, applied after the current operation.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        self.commands
    }

    /// Register a nested effect.
    ///
    /// `run` executes right after setup and again whenever `deps` yields a
    /// list that differs from the previous one. Only meaningful during
    /// [`Binding::on_attach`]; registrations made during teardown are ignored.
    pub fn effect<D, R>(&mut self, deps: D, run: R)
    where
        D: Fn(&T) -> Vec<Dep> + 'static,
        R: FnMut(&mut EffectContext<'_>, &T) -> Option<Cleanup> + 'static,
    {
        match self.effects.as_deref_mut() {
            Some(effects) => effects.push(Effect {
                deps: Box::new(deps),
                run: Box::new(run),
                last: None,
                cleanup: None,
            }),
            None => tracing::warn!(
                entity = ?self.entity,
                "effect registered outside of on_attach -- ignored"
            ),
        }
    }
}

/// Handed to effect runs and cleanups.
pub struct EffectContext<'a> {
    entity: EntityId,
    commands: &'a mut CommandBuffer,
}

impl<'a> EffectContext<'a> {
    /// The entity owning the component.
    pub fn entity(&self) -> EntityId {
        self.entity
    }

    /// Deferred world mutations, applied after the current operation.
    pub fn commands(&mut self) -> &mut CommandBuffer {
        self.commands
    }
}

/// A nested effect registered by a binding.
pub struct Effect<T> {
    deps: DepsFn<T>,
    run: RunFn<T>,
    last: Option<Vec<Dep>>,
    cleanup: Option<Cleanup>,
}

impl<T> Effect<T> {
    /// Re-run if the dependency list changed. Returns whether it ran.
    fn refresh(&mut self, entity: EntityId, commands: &mut CommandBuffer, value: &T) -> bool {
        let deps = (self.deps)(value);
        if self.last.as_ref() == Some(&deps) {
            return false;
        }
        let mut cx = EffectContext { entity, commands };
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(&mut cx);
        }
        self.cleanup = (self.run)(&mut cx, value);
        self.last = Some(deps);
        true
    }

    fn teardown(&mut self, entity: EntityId, commands: &mut CommandBuffer) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup(&mut EffectContext { entity, commands });
        }
    }
}

// ---------------------------------------------------------------------------
// BindingArena
// ---------------------------------------------------------------------------

/// Slot handle into a [`BindingArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct BindingKey(u32);

struct BindingState<T> {
    entity: EntityId,
    binding: Box<dyn Binding<T>>,
    effects: Vec<Effect<T>>,
}

/// Arena of running bindings for one component type.
pub(crate) struct BindingArena<T> {
    slots: Vec<Option<BindingState<T>>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for BindingArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }
}

impl<T> fmt::Debug for BindingArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindingArena").field("live", &self.live).finish()
    }
}

impl<T: 'static> BindingArena<T> {
    /// Run setup and the initial pass of every registered effect, then store
    /// the binding.
    pub(crate) fn start(
        &mut self,
        entity: EntityId,
        mut binding: Box<dyn Binding<T>>,
        value: &T,
        commands: &mut CommandBuffer,
    ) -> BindingKey {
        let mut effects = Vec::new();
        {
            let mut cx = BindingContext {
                entity,
                commands: &mut *commands,
                effects: Some(&mut effects),
            };
            binding.on_attach(&mut cx, value);
        }
        for effect in &mut effects {
            effect.refresh(entity, commands, value);
        }

        let state = BindingState {
            entity,
            binding,
            effects,
        };
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(state);
                BindingKey(slot)
            }
            None => {
                self.slots.push(Some(state));
                BindingKey(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Re-run effects whose dependencies changed. Returns how many ran.
    pub(crate) fn changed(
        &mut self,
        key: BindingKey,
        value: &T,
        commands: &mut CommandBuffer,
    ) -> usize {
        let Some(Some(state)) = self.slots.get_mut(key.0 as usize) else {
            return 0;
        };
        let entity = state.entity;
        state
            .effects
            .iter_mut()
            .map(|effect| effect.refresh(entity, commands, value))
            .filter(|ran| *ran)
            .count()
    }

    /// Tear the binding down and release its slot.
    pub(crate) fn stop(
        &mut self,
        key: BindingKey,
        value: &T,
        commands: &mut CommandBuffer,
    ) -> Result<(), EcsError> {
        let state = self
            .slots
            .get_mut(key.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| EcsError::StateError {
                details: format!("binding slot {} torn down twice", key.0),
            })?;
        let BindingState {
            entity,
            mut binding,
            mut effects,
        } = state;

        for effect in effects.iter_mut().rev() {
            effect.teardown(entity, commands);
        }
        let mut cx = BindingContext {
            entity,
            commands,
            effects: None,
        };
        binding.on_detach(&mut cx, value);

        self.free.push(key.0);
        self.live -= 1;
        Ok(())
    }

    /// Number of running bindings.
    pub(crate) fn len(&self) -> usize {
        self.live
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Debug, Clone)]
    struct Light {
        color: u32,
        intensity: f32,
    }

    #[derive(Default)]
    struct Log(Rc<RefCell<Vec<String>>>);

    impl Log {
        fn push(&self, s: impl Into<String>) {
            self.0.borrow_mut().push(s.into());
        }
    }

    struct LightBinding {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Binding<Light> for LightBinding {
        fn on_attach(&mut self, cx: &mut BindingContext<'_, Light>, value: &Light) {
            Log(self.log.clone()).push(format!("setup {}", value.color));
            let log = self.log.clone();
            cx.effect(
                |l: &Light| vec![Dep::from(l.color)],
                move |_cx, l| {
                    Log(log.clone()).push(format!("color {}", l.color));
                    let log = log.clone();
                    let cleanup: Cleanup = Box::new(move |_cx: &mut EffectContext<'_>| {
                        Log(log).push("cleanup color");
                    });
                    Some(cleanup)
                },
            );
        }

        fn on_detach(&mut self, _cx: &mut BindingContext<'_, Light>, value: &Light) {
            Log(self.log.clone()).push(format!("detach {}", value.color));
        }
    }

    fn start(arena: &mut BindingArena<Light>, log: &Rc<RefCell<Vec<String>>>) -> BindingKey {
        let mut cmds = CommandBuffer::new();
        arena.start(
            EntityId::new(0, 0),
            Box::new(LightBinding { log: log.clone() }),
            &Light {
                color: 1,
                intensity: 1.0,
            },
            &mut cmds,
        )
    }

    #[test]
    fn setup_runs_effects_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut arena = BindingArena::default();
        start(&mut arena, &log);
        assert_eq!(*log.borrow(), vec!["setup 1", "color 1"]);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn unrelated_change_does_not_rerun_effect() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut arena = BindingArena::default();
        let key = start(&mut arena, &log);
        let mut cmds = CommandBuffer::new();

        let ran = arena.changed(
            key,
            &Light {
                color: 1,
                intensity: 5.0,
            },
            &mut cmds,
        );
        assert_eq!(ran, 0);

        let ran = arena.changed(
            key,
            &Light {
                color: 2,
                intensity: 5.0,
            },
            &mut cmds,
        );
        assert_eq!(ran, 1);
        assert_eq!(
            *log.borrow(),
            vec!["setup 1", "color 1", "cleanup color", "color 2"]
        );
    }

    #[test]
    fn stop_runs_cleanup_then_detach_and_rejects_second_stop() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut arena = BindingArena::default();
        let key = start(&mut arena, &log);
        let mut cmds = CommandBuffer::new();
        let last = Light {
            color: 9,
            intensity: 0.0,
        };

        arena.stop(key, &last, &mut cmds).unwrap();
        assert_eq!(log.borrow()[2..], ["cleanup color", "detach 9"]);
        assert_eq!(arena.len(), 0);

        let err = arena.stop(key, &last, &mut cmds).unwrap_err();
        assert!(matches!(err, EcsError::StateError { .. }));
    }

    #[test]
    fn float_deps_compare_bitwise() {
        assert_eq!(Dep::from(f32::NAN), Dep::from(f32::NAN));
        assert_ne!(Dep::from(0.0f32), Dep::from(-0.0f32));
        assert_eq!(Dep::from(None::<u32>), Dep::None);
    }
}
