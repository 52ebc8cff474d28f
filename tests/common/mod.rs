//! Shared fixtures for the integration tests
#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use control_plane_reconciler::adapters::{Driver, DriverRegistry, Outcome};
use control_plane_reconciler::clock::{Clock, ManualClock};
use control_plane_reconciler::config::EngineConfig;
use control_plane_reconciler::controllers::{Context, CycleReport, ReconciliationScheduler};
use control_plane_reconciler::lease::{Acquire, Lease, LockManager};
use control_plane_reconciler::resource::{Action, ResourceKind, ResourceRecord};
use control_plane_reconciler::store::{MemoryStore, ResourceStore};

// ============================================================================
// Engine harness
// ============================================================================

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        lease_duration_secs: 60,
        driver_timeout_secs: 5,
        backoff_base_ms: 1_000,
        backoff_max_ms: 8_000,
        max_attempts: 4,
        batch_size: 50,
        max_concurrent_executions: 4,
        ..EngineConfig::default()
    }
}

/// One engine over a memory store and a manual clock
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub context: Arc<Context>,
}

impl Harness {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self::with_config(drivers, test_config())
    }

    pub fn with_config(drivers: DriverRegistry, config: EngineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let context = Arc::new(Context::new(store.clone(), clock.clone(), drivers, config));
        Self {
            store,
            clock,
            context,
        }
    }

    pub fn locks(&self) -> LockManager {
        self.context.locks.clone()
    }

    pub async fn insert(&self, kind: ResourceKind, id: &str, owner_key: &str) -> ResourceRecord {
        self.insert_record(ResourceRecord::new(kind, id, owner_key, self.clock.now()))
            .await
    }

    pub async fn insert_record(&self, record: ResourceRecord) -> ResourceRecord {
        self.store.insert(record).await.unwrap()
    }

    pub async fn get(&self, id: &str) -> ResourceRecord {
        self.store.get(id).await.unwrap().unwrap()
    }

    pub async fn cycle(&self, kind: ResourceKind) -> CycleReport {
        ReconciliationScheduler::new(kind, "test-worker", self.context.clone())
            .run_cycle()
            .await
            .unwrap()
    }

    /// Cycle every kind until nothing is claimable; returns the cycles used
    pub async fn run_until_idle(&self, max_rounds: usize) -> usize {
        for round in 0..max_rounds {
            let mut idle = true;
            for kind in ResourceKind::ALL {
                idle &= self.cycle(kind).await.is_idle();
            }
            if idle {
                return round;
            }
        }
        panic!("engine still busy after {max_rounds} rounds");
    }

    pub async fn acquire(&self, id: &str) -> Option<(Lease, ResourceRecord)> {
        let lease = self.context.config.lease_duration();
        match self.locks().try_acquire(id, lease).await.unwrap() {
            Acquire::Granted { lease, record } => Some((lease, record)),
            Acquire::Denied => None,
        }
    }
}

// ============================================================================
// Test drivers
// ============================================================================

/// Plays back queued outcomes, then repeats a default
pub struct ScriptedDriver {
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    calls: Mutex<Vec<(String, Action)>>,
}

impl ScriptedDriver {
    pub fn always(outcome: Outcome) -> Arc<Self> {
        Self::scripted(Vec::new(), outcome)
    }

    pub fn scripted(script: Vec<Outcome>, default: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            default,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<(String, Action)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn apply(&self, record: &ResourceRecord, action: Action) -> Outcome {
        self.calls.lock().unwrap().push((record.id.clone(), action));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

/// Models an external system: provisioning adds the resource, teardown
/// removes it, and repeating either is a no-op that still succeeds.
#[derive(Default)]
pub struct IdempotentDriver {
    existing: Mutex<HashSet<String>>,
    effects: Mutex<usize>,
    calls: Mutex<usize>,
}

impl IdempotentDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.existing.lock().unwrap().contains(id)
    }

    /// Calls that actually changed external state
    pub fn effects(&self) -> usize {
        *self.effects.lock().unwrap()
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Driver for IdempotentDriver {
    fn name(&self) -> &str {
        "idempotent"
    }

    async fn apply(&self, record: &ResourceRecord, action: Action) -> Outcome {
        *self.calls.lock().unwrap() += 1;
        let mut existing = self.existing.lock().unwrap();
        let changed = match action {
            Action::Provision => existing.insert(record.id.clone()),
            Action::Teardown => existing.remove(&record.id),
            _ => false,
        };
        if changed {
            *self.effects.lock().unwrap() += 1;
        }
        Outcome::Success
    }
}

/// Simulates a driver call that outlives the lease: while it runs the clock
/// passes the lease expiry and another worker claims the record.
pub struct ReclaimingDriver {
    lease: chrono::Duration,
    engine: Mutex<Option<(Arc<ManualClock>, LockManager)>>,
    reclaimed: Mutex<Option<Lease>>,
}

impl ReclaimingDriver {
    pub fn new(lease: chrono::Duration) -> Arc<Self> {
        Arc::new(Self {
            lease,
            engine: Mutex::new(None),
            reclaimed: Mutex::new(None),
        })
    }

    pub fn attach(&self, clock: Arc<ManualClock>, locks: LockManager) {
        *self.engine.lock().unwrap() = Some((clock, locks));
    }

    /// Lease taken by the competing worker, if it got one
    pub fn reclaimed(&self) -> Option<Lease> {
        self.reclaimed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Driver for ReclaimingDriver {
    fn name(&self) -> &str {
        "reclaiming"
    }

    async fn apply(&self, record: &ResourceRecord, _action: Action) -> Outcome {
        let engine = self.engine.lock().unwrap().clone();
        if let Some((clock, locks)) = engine {
            clock.advance(self.lease);
            if let Ok(Acquire::Granted { lease, .. }) = locks.try_acquire(&record.id, self.lease).await {
                *self.reclaimed.lock().unwrap() = Some(lease);
            }
        }
        Outcome::Success
    }
}

pub fn registry(driver: Arc<dyn Driver>) -> DriverRegistry {
    DriverRegistry::new().with_fallback(driver)
}
