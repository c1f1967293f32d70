//! Fixed-timestep tick loop.
//!
//! The [`TickLoop`] owns the [`World`] and its [`TransformGraph`]. Each tick:
//!
//! 1. [`Stage::PreTransform`] systems run in order, each reading the world
//!    and queueing mutations into the shared [`CommandBuffer`].
//! 2. The command buffer is applied (FIFO).
//! 3. The transform scheduler runs: world matrices and culling flags are
//!    brought up to date.
//! 4. [`Stage::PostTransform`] systems run and their commands are applied.
//!    They see this tick's matrices and dirty flags.
//! 5. Dirty flags are cleared and the tick counter advances.
//!
//! With fixed system order, FIFO command application and seeded randomness,
//! the loop is deterministic: same initial state + same systems = same final
//! state.
//!
//! # Example
//!
//! ```
//! use ember_engine::prelude::*;
//!
//! let mut tick_loop = TickLoop::new(World::new(), EngineConfig::default()).unwrap();
//! tick_loop
//!     .add_system("gameplay", Stage::PreTransform, |_cx, _cmds| {})
//!     .unwrap();
//!
//! for _ in 0..10 {
//!     tick_loop.tick().unwrap();
//! }
//! assert_eq!(tick_loop.tick_count(), 10);
//! ```

use std::time::{Duration, Instant};

use ember_ecs::command::{Command, CommandBuffer};
use ember_ecs::world::World;

use crate::config::{EngineConfig, TickConfig};
use crate::graph::TransformGraph;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Stage / SystemFn
// ---------------------------------------------------------------------------

/// When in the tick a system runs relative to the transform scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Before world matrices are recomputed. Gameplay writing transforms.
    PreTransform,
    /// After world matrices and culling flags are current.
    PostTransform,
}

/// Read-only view handed to systems.
pub struct SystemContext<'a> {
    pub world: &'a World,
    /// Matrices and flags from the last scheduler pass.
    pub transforms: &'a TransformGraph,
    /// Index of the tick being run, starting at 0.
    pub tick: u64,
    /// Fixed step in seconds.
    pub dt: f64,
}

/// A system function run once per tick.
///
/// Systems never mutate the world directly; mutations are queued in the
/// [`CommandBuffer`] and applied at the end of the system's stage.
pub type SystemFn = fn(&SystemContext<'_>, &mut CommandBuffer);

#[derive(Debug)]
struct RegisteredSystem {
    name: String,
    stage: Stage,
    func: SystemFn,
    /// Names of systems that must execute before this one.
    after: Vec<String>,
}

// ---------------------------------------------------------------------------
// TickDiagnostics
// ---------------------------------------------------------------------------

/// Timing and scheduler counters for the last tick.
#[derive(Debug, Clone, Default)]
pub struct TickDiagnostics {
    /// Wall-clock time per system, in execution order.
    pub system_times: Vec<(String, Duration)>,
    pub total_time: Duration,
    /// Summed over both stages.
    pub command_apply_time: Duration,
    pub transform_time: Duration,
    pub nodes_recomposed: usize,
    pub resorted: bool,
    pub cull_updates: usize,
}

// ---------------------------------------------------------------------------
// TickLoop
// ---------------------------------------------------------------------------

/// The deterministic fixed-timestep tick loop.
pub struct TickLoop {
    world: World,
    transforms: TransformGraph,
    command_buffer: CommandBuffer,
    /// Registration order; [`tick`](Self::tick) filters by stage.
    systems: Vec<RegisteredSystem>,
    tick_counter: u64,
    config: TickConfig,
    last_diagnostics: TickDiagnostics,
}

impl TickLoop {
    /// Build a tick loop around `world`, registering the spatial components
    /// and creating the transform graph.
    pub fn new(mut world: World, config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        world.set_max_command_rounds(config.tick.max_command_rounds);
        let transforms = TransformGraph::new(&mut world, config.transform)?;
        Ok(Self {
            world,
            transforms,
            command_buffer: CommandBuffer::new(),
            systems: Vec::new(),
            tick_counter: 0,
            config: config.tick,
            last_diagnostics: TickDiagnostics::default(),
        })
    }

    /// Register a system. Within a stage, systems run in registration order.
    pub fn add_system(&mut self, name: &str, stage: Stage, func: SystemFn) -> Result<(), EngineError> {
        self.add_system_after(name, stage, &[], func)
    }

    /// Register a system that must run after each system named in `after`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidSystem`] for a duplicate name, or a dependency
    /// that is not registered or belongs to a later stage.
    pub fn add_system_after(
        &mut self,
        name: &str,
        stage: Stage,
        after: &[&str],
        func: SystemFn,
    ) -> Result<(), EngineError> {
        let invalid = |details: String| EngineError::InvalidSystem {
            name: name.to_owned(),
            details,
        };
        if self.systems.iter().any(|s| s.name == name) {
            return Err(invalid("duplicate system name".into()));
        }
        for dep in after {
            match self.systems.iter().find(|s| s.name == *dep) {
                None => return Err(invalid(format!("depends on '{dep}', which is not registered"))),
                Some(s) if s.stage == Stage::PostTransform && stage == Stage::PreTransform => {
                    return Err(invalid(format!("depends on '{dep}', which runs in a later stage")))
                }
                Some(_) => {}
            }
        }

        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            stage,
            func,
            after: after.iter().map(|s| s.to_string()).collect(),
        });
        tracing::debug!(system = name, stage = ?stage, "system registered");
        Ok(())
    }

    /// Execute one tick.
    ///
    /// Returns every command processed this tick, in application order.
    ///
    /// # Errors
    ///
    /// Scheduler errors ([`EngineError::CyclicDependency`]). Pre-transform
    /// commands have already been applied when it is returned; the tick
    /// counter does not advance.
    pub fn tick(&mut self) -> Result<Vec<Command>, EngineError> {
        let _span = tracing::debug_span!("tick", tick = self.tick_counter).entered();
        let tick_start = Instant::now();
        let mut system_times = Vec::with_capacity(self.systems.len());
        let mut command_apply_time = Duration::ZERO;

        let mut applied = self.run_stage(Stage::PreTransform, &mut system_times, &mut command_apply_time);

        let transform_start = Instant::now();
        let stats = self.transforms.update(&mut self.world)?;
        let transform_time = transform_start.elapsed();

        applied.extend(self.run_stage(Stage::PostTransform, &mut system_times, &mut command_apply_time));

        self.transforms.clear_dirty();
        self.tick_counter += 1;

        self.last_diagnostics = TickDiagnostics {
            system_times,
            total_time: tick_start.elapsed(),
            command_apply_time,
            transform_time,
            nodes_recomposed: stats.recomposed,
            resorted: stats.resorted,
            cull_updates: stats.cull_updates,
        };
        tracing::trace!(
            tick = self.tick_counter,
            commands = applied.len(),
            recomposed = stats.recomposed,
            "tick complete"
        );
        Ok(applied)
    }

    fn run_stage(
        &mut self,
        stage: Stage,
        system_times: &mut Vec<(String, Duration)>,
        command_apply_time: &mut Duration,
    ) -> Vec<Command> {
        let cx = SystemContext {
            world: &self.world,
            transforms: &self.transforms,
            tick: self.tick_counter,
            dt: self.config.fixed_dt,
        };
        for system in self.systems.iter().filter(|s| s.stage == stage) {
            let start = Instant::now();
            (system.func)(&cx, &mut self.command_buffer);
            system_times.push((system.name.clone(), start.elapsed()));
        }

        let apply_start = Instant::now();
        let applied = self.command_buffer.apply(&mut self.world);
        *command_apply_time += apply_start.elapsed();
        applied
    }

    /// Run `count` ticks. Returns the total number of commands processed.
    pub fn run_ticks(&mut self, count: u64) -> Result<u64, EngineError> {
        let mut total_commands = 0u64;
        for _ in 0..count {
            total_commands += self.tick()?.len() as u64;
        }
        Ok(total_commands)
    }

    // -- accessors ----------------------------------------------------------

    pub fn tick_count(&self) -> u64 {
        self.tick_counter
    }

    /// Simulation time in seconds, `tick_count * fixed_dt` rather than an
    /// accumulated sum.
    pub fn sim_time(&self) -> f64 {
        self.tick_counter as f64 * self.config.fixed_dt
    }

    pub fn fixed_dt(&self) -> f64 {
        self.config.fixed_dt
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Mutable access for setup and tests. During simulation prefer systems
    /// and the command buffer.
    pub fn world_mut(&mut self) -> &mut World {
        &mut self.world
    }

    pub fn transforms(&self) -> &TransformGraph {
        &self.transforms
    }

    pub fn transforms_mut(&mut self) -> &mut TransformGraph {
        &mut self.transforms
    }

    /// World and graph together, for calls like
    /// [`TransformGraph::mark_dirty`] that need both.
    pub fn split_mut(&mut self) -> (&mut World, &mut TransformGraph) {
        (&mut self.world, &mut self.transforms)
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    /// System names in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        [Stage::PreTransform, Stage::PostTransform]
            .into_iter()
            .flat_map(|stage| self.systems.iter().filter(move |s| s.stage == stage))
            .map(|s| s.name.as_str())
            .collect()
    }

    /// Systems `name` was declared to run after.
    pub fn dependencies_of(&self, name: &str) -> Option<&[String]> {
        self.systems
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.after.as_slice())
    }

    pub fn last_diagnostics(&self) -> &TickDiagnostics {
        &self.last_diagnostics
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
