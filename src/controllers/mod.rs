//! Control loops
//!
//! The scheduler loop claims and executes candidates for one kind; the
//! cascade loop propagates desired states on change events and on a timer.
//! Both stop when the shared cancellation token fires.

mod cascade_controller;
mod scheduler;

pub use cascade_controller::run as run_cascade_controller;
pub use scheduler::{run as run_scheduler, CycleReport, ReconciliationScheduler};

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::adapters::DriverRegistry;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::lease::LockManager;
use crate::reconcilers::{CascadeNotifier, ChangeEvent, RetryController, TransitionExecutor};
use crate::store::ResourceStore;

/// Shared context for all control loops
pub struct Context {
    pub store: Arc<dyn ResourceStore>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub locks: LockManager,
    pub executor: TransitionExecutor,
    pub cascades: CascadeNotifier,
}

impl Context {
    /// Wire the engine's components around one store and driver registry
    pub fn new(
        store: Arc<dyn ResourceStore>,
        clock: Arc<dyn Clock>,
        drivers: DriverRegistry,
        config: EngineConfig,
    ) -> Self {
        let locks = LockManager::new(store.clone(), clock.clone());
        let executor = TransitionExecutor::new(
            locks.clone(),
            drivers,
            RetryController::from_config(&config),
            config.driver_timeout(),
        );
        let cascades =
            CascadeNotifier::new(store.clone(), clock.clone(), config.subscription_grace());
        Self {
            store,
            clock,
            config,
            locks,
            executor,
            cascades,
        }
    }

    /// Route the executor's change events to `events`
    pub fn with_events(mut self, events: mpsc::Sender<ChangeEvent>) -> Self {
        self.executor = self.executor.with_events(events);
        self
    }
}
