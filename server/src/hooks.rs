//! Server hooks: code that runs beside the simulation for the lifetime of
//! the engine.
//!
//! Every registered hook is loaded, then every loaded hook is enabled. Running
//! hooks are ticked after the simulation on each tick with the time since
//! their previous tick. On shutdown all running hooks are disabled and then
//! all loaded hooks are unloaded, both in reverse registration order.
//!
//! Hooks cannot take the main loop down. An error is logged against the hook;
//! a panic is caught, logged, and disables the hook for the rest of the run.

use crate::error::HookError;
use log::{debug, error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

pub trait Hook: Send {
    fn name(&self) -> &str;

    fn on_load(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn on_enable(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    /// Called once per engine tick while the hook is running. `delta` is
    /// zero on the first tick.
    fn tick(&mut self, delta: Duration) -> Result<(), HookError>;

    fn on_disable(&mut self) -> Result<(), HookError> {
        Ok(())
    }

    fn on_unload(&mut self) -> Result<(), HookError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Registered,
    Loaded,
    Running,
    /// Loaded but no longer ticked: enabling failed, or the hook panicked.
    Disabled,
    /// Failed to load; never enabled or unloaded.
    Failed,
    Unloaded,
}

enum Outcome {
    Done,
    Errored,
    Panicked,
}

struct Entry {
    name: String,
    hook: Box<dyn Hook>,
    state: HookState,
    last_tick: Option<Instant>,
}

impl Entry {
    fn run(
        &mut self,
        stage: &str,
        step: impl FnOnce(&mut dyn Hook) -> Result<(), HookError>,
    ) -> Outcome {
        let hook = &mut *self.hook;
        match panic::catch_unwind(AssertUnwindSafe(|| step(hook))) {
            Ok(Ok(())) => Outcome::Done,
            Ok(Err(e)) => {
                warn!("Hook {} failed to {}: {}", self.name, stage, e);
                Outcome::Errored
            }
            Err(payload) => {
                error!(
                    "Hook {} panicked during {}: {}",
                    self.name,
                    stage,
                    panic_message(payload.as_ref())
                );
                Outcome::Panicked
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic"
    }
}

/// Owns the hooks and drives their lifecycle from the main loop.
#[derive(Default)]
pub struct HookManager {
    entries: Vec<Entry>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook. It is loaded and enabled on the next [`start`](Self::start).
    pub fn register(&mut self, hook: Box<dyn Hook>) {
        let name = hook.name().to_string();
        debug!("Hook {} registered", name);
        self.entries.push(Entry {
            name,
            hook,
            state: HookState::Registered,
            last_tick: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn state(&self, name: &str) -> Option<HookState> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.state)
    }

    pub fn running(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.state == HookState::Running)
            .count()
    }

    /// Loads every newly registered hook, then enables the ones that loaded.
    pub fn start(&mut self) {
        if !self
            .entries
            .iter()
            .any(|entry| entry.state == HookState::Registered)
        {
            return;
        }

        let mut loaded = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.state != HookState::Registered {
                continue;
            }
            entry.state = match entry.run("load", |hook| hook.on_load()) {
                Outcome::Done => {
                    loaded.push(index);
                    HookState::Loaded
                }
                _ => HookState::Failed,
            };
        }

        for index in loaded {
            let entry = &mut self.entries[index];
            entry.state = match entry.run("enable", |hook| hook.on_enable()) {
                Outcome::Done => HookState::Running,
                _ => HookState::Disabled,
            };
        }

        info!("{} of {} hook(s) running", self.running(), self.len());
    }

    /// Ticks every running hook.
    pub fn tick(&mut self, now: Instant) {
        for entry in &mut self.entries {
            if entry.state != HookState::Running {
                continue;
            }
            let delta = entry
                .last_tick
                .map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
            entry.last_tick = Some(now);

            if let Outcome::Panicked = entry.run("tick", |hook| hook.tick(delta)) {
                entry.run("disable", |hook| hook.on_disable());
                entry.state = HookState::Disabled;
            }
        }
    }

    /// Disables running hooks, then unloads loaded ones, last registered
    /// first in both passes.
    pub fn shutdown(&mut self) {
        for entry in self.entries.iter_mut().rev() {
            if entry.state == HookState::Running {
                entry.run("disable", |hook| hook.on_disable());
                entry.state = HookState::Disabled;
            }
        }
        for entry in self.entries.iter_mut().rev() {
            if entry.state == HookState::Disabled || entry.state == HookState::Loaded {
                entry.run("unload", |hook| hook.on_unload());
                entry.state = HookState::Unloaded;
            }
        }
    }
}
