//! Driver supervisor.
//!
//! The [`Supervisor`] builds the shared registry from every driver's
//! descriptor, starts one [`Worker`] per driver, waits a bounded time for
//! them to report `initialized`, and then offers the main control loop a
//! small surface: raise and lower events, read data, attach callbacks to
//! events, schedule periodic triggers and take snapshots.
//!
//! The supervisor never blocks on a worker.  [`Supervisor::tick`] only looks
//! at flags and counters, so a driver stuck inside `measure()` cannot stall
//! callbacks or triggers.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};

use crate::driver::{Driver, DriverContext, DriverDescriptor};
use crate::error::{KernelError, Result};
use crate::ipc::{FleetBus, FleetEvent};
use crate::registry::{EventId, Scalar, SharedRegistry, Snapshot};
use crate::scheduler::{TriggerFn, TriggerScheduler};
use crate::worker::{Worker, WorkerConfig, WorkerHealth};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Startup and worker timing.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Upper bound on the wait for every worker to finish `initialize()`.
    pub startup_timeout: Duration,
    /// How often the startup wait re-checks the `initialized` fields.
    pub init_poll: Duration,
    pub worker: WorkerConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(25),
            init_poll: Duration::from_millis(100),
            worker: WorkerConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

/// Handle passed to an event callback.
#[derive(Debug, Clone, Copy)]
pub struct EventRef<'a> {
    registry: &'a SharedRegistry,
    id: EventId,
}

impl EventRef<'_> {
    /// `"Driver.EVENT"` key of the event that fired.
    pub fn key(&self) -> String {
        self.registry.event_key(self.id)
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn is_set(&self) -> bool {
        self.registry.is_set(self.id)
    }

    /// Lower the event.  Callbacks that consume an edge call this.
    pub fn clear(&self) {
        self.registry.clear(self.id);
    }

    pub fn registry(&self) -> &SharedRegistry {
        self.registry
    }
}

/// Callback invoked on every tick while its event is raised.
pub type EventCallback = Box<dyn FnMut(EventRef<'_>) + Send + Sync>;

struct CallbackSlot {
    name: String,
    callback: EventCallback,
}

/// What one [`Supervisor::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub callbacks_fired: usize,
    pub triggers_fired: usize,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

/// Owns the registry and every worker.
pub struct Supervisor {
    registry: SharedRegistry,
    bus: FleetBus,
    workers: Mutex<Vec<Worker>>,
    callbacks: DashMap<EventId, CallbackSlot>,
    triggers: TriggerScheduler,
    failed_init: Vec<String>,
    reported_hung: DashSet<String>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("drivers", &self.registry.driver_count())
            .field("failed_init", &self.failed_init)
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl Supervisor {
    /// Register `drivers`, start their workers and wait for initialization.
    pub async fn start(drivers: Vec<Box<dyn Driver>>, config: SupervisorConfig) -> Result<Self> {
        Self::start_with_bus(drivers, config, FleetBus::default()).await
    }

    /// Like [`Supervisor::start`], publishing lifecycle events on `bus`.
    ///
    /// Returns an error only when the registry cannot be built (duplicate
    /// driver names) or a thread cannot be spawned.  Drivers that fail or
    /// time out during initialization are listed by
    /// [`Supervisor::failed_to_initialize`] and startup proceeds without them.
    pub async fn start_with_bus(
        drivers: Vec<Box<dyn Driver>>,
        config: SupervisorConfig,
        bus: FleetBus,
    ) -> Result<Self> {
        let mut builder = SharedRegistry::builder();
        let mut ids = Vec::with_capacity(drivers.len());
        for driver in &drivers {
            ids.push(builder.register(&DriverDescriptor::of(driver.as_ref()))?);
        }
        let registry = builder.build();

        let mut workers: Vec<Worker> = Vec::with_capacity(drivers.len());
        for (driver, id) in drivers.into_iter().zip(ids) {
            let ctx = DriverContext::new(registry.clone(), id).with_bus(bus.clone());
            match Worker::start(driver, ctx, config.worker) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &mut workers {
                        worker.stop();
                    }
                    return Err(e);
                }
            }
        }

        let deadline = Instant::now() + config.startup_timeout;
        while Instant::now() < deadline
            && workers.iter().any(|w| !w.stats().initialization_finished())
        {
            tokio::time::sleep(config.init_poll).await;
        }

        let failed_init: Vec<String> = workers
            .iter()
            .filter(|w| !w.is_initialized())
            .map(|w| w.name().to_string())
            .collect();
        for name in &failed_init {
            tracing::error!(driver = %name, "driver not initialized after startup wait");
        }
        tracing::info!(
            drivers = workers.len(),
            failed = failed_init.len(),
            "supervisor started"
        );

        Ok(Self {
            registry,
            bus,
            workers: Mutex::new(workers),
            callbacks: DashMap::new(),
            triggers: TriggerScheduler::new(),
            failed_init,
            reported_hung: DashSet::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn bus(&self) -> &FleetBus {
        &self.bus
    }

    /// Drivers that had not reported `initialized` when startup finished.
    pub fn failed_to_initialize(&self) -> &[String] {
        &self.failed_init
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(KernelError::SupervisorShutdown);
        }
        Ok(())
    }

    // -- Events ---------------------------------------------------------------

    /// Raise `"Driver.EVENT"`.
    pub fn set_event(&self, key: &str) -> Result<()> {
        self.ensure_running()?;
        self.registry.set(self.registry.resolve_event(key)?);
        Ok(())
    }

    /// Lower `"Driver.EVENT"`.
    pub fn clear_event(&self, key: &str) -> Result<()> {
        self.ensure_running()?;
        self.registry.clear(self.registry.resolve_event(key)?);
        Ok(())
    }

    pub fn get_event(&self, key: &str) -> Result<bool> {
        Ok(self.registry.is_set(self.registry.resolve_event(key)?))
    }

    /// Lower every event of every driver.
    pub fn clear_all_events(&self) {
        self.registry.clear_all_events();
    }

    // -- Data -----------------------------------------------------------------

    /// Read `"Driver.field"`.
    pub fn data(&self, key: &str) -> Result<Scalar> {
        self.registry.read_key(key)
    }

    /// Snapshot of the registry with callbacks listed by name.
    pub fn snapshot(&self) -> Snapshot {
        let mut snapshot = self.registry.snapshot();
        for entry in self.callbacks.iter() {
            snapshot
                .callbacks
                .insert(self.registry.event_key(*entry.key()), entry.value().name.clone());
        }
        snapshot
    }

    // -- Callbacks ------------------------------------------------------------

    /// Run `callback` on every tick while `"Driver.EVENT"` is raised.
    ///
    /// Each event has a single slot; registering again replaces the previous
    /// callback.  The event is not lowered automatically.  Callbacks must not
    /// register or remove callbacks themselves.
    pub fn register_callback<F>(&self, key: &str, callback: F) -> Result<()>
    where
        F: FnMut(EventRef<'_>) + Send + Sync + 'static,
    {
        self.register_named_callback(key, std::any::type_name::<F>(), callback)
    }

    /// Like [`Supervisor::register_callback`] with an explicit display name.
    pub fn register_named_callback<F>(&self, key: &str, name: &str, callback: F) -> Result<()>
    where
        F: FnMut(EventRef<'_>) + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let id = self.registry.resolve_event(key)?;
        let slot = CallbackSlot {
            name: name.to_string(),
            callback: Box::new(callback),
        };
        if self.callbacks.insert(id, slot).is_some() {
            tracing::debug!(event = %key, "callback replaced");
        } else {
            tracing::debug!(event = %key, callback = %name, "callback registered");
        }
        Ok(())
    }

    /// Detach the callback of `"Driver.EVENT"`.  Returns whether one existed.
    pub fn remove_callback(&self, key: &str) -> Result<bool> {
        let id = self.registry.resolve_event(key)?;
        Ok(self.callbacks.remove(&id).is_some())
    }

    // -- Triggers -------------------------------------------------------------

    /// Run `work` every `interval` from [`Supervisor::tick`].
    ///
    /// Re-registering `task_id` with the same interval keeps its deadline.
    pub fn trigger_every<F>(&self, interval: Duration, task_id: &str, work: F) -> Result<()>
    where
        F: FnMut() + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let work: TriggerFn = Box::new(work);
        self.triggers.every(interval, task_id, work);
        Ok(())
    }

    pub fn cancel_trigger(&self, task_id: &str) -> bool {
        self.triggers.cancel(task_id)
    }

    // -- Loop -----------------------------------------------------------------

    /// One pass of the control loop: fire callbacks of raised events, run
    /// due triggers and report newly hung workers.
    pub fn tick(&self) -> TickReport {
        if self.is_shut_down() {
            return TickReport::default();
        }

        let mut report = TickReport::default();
        for mut entry in self.callbacks.iter_mut() {
            let id = *entry.key();
            if !self.registry.is_set(id) {
                continue;
            }
            let event = EventRef {
                registry: &self.registry,
                id,
            };
            (entry.value_mut().callback)(event);
            report.callbacks_fired += 1;
        }

        report.triggers_fired = self.triggers.run_due();
        self.scan_hung();
        report
    }

    /// Report each hung worker once per hang.  Skipped while the worker
    /// list is locked by a shutdown.
    fn scan_hung(&self) {
        let Ok(workers) = self.workers.try_lock() else {
            return;
        };
        for worker in workers.iter() {
            let health = worker.health();
            if !health.hung {
                self.reported_hung.remove(&health.driver);
                continue;
            }
            if self.reported_hung.insert(health.driver.clone()) {
                let busy_for_ms = health.busy_for_ms.unwrap_or_default();
                tracing::warn!(driver = %health.driver, busy_for_ms, "worker appears hung");
                self.bus.publish(FleetEvent::WorkerHung {
                    driver: health.driver,
                    busy_for_ms,
                });
            }
        }
    }

    /// Health of every worker, in registration order.
    pub fn health(&self) -> Vec<WorkerHealth> {
        match self.workers.lock() {
            Ok(workers) => workers.iter().map(Worker::health).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(Worker::health).collect(),
        }
    }

    /// Ask `driver` to run its calibration before its next tick.
    pub fn calibrate(&self, driver: &str) -> Result<()> {
        self.ensure_running()?;
        self.registry.driver_id(driver)?;
        let workers = self
            .workers
            .lock()
            .map_err(|_| KernelError::Internal("worker list poisoned".into()))?;
        if let Some(worker) = workers.iter().find(|w| w.name() == driver) {
            worker.request_calibration();
        }
        Ok(())
    }

    /// Stop every worker in registration order.
    ///
    /// Returns the drivers whose threads did not exit within the grace
    /// period.  Calling it again is a no-op.
    pub fn shutdown(&self) -> Vec<String> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut workers = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };

        tracing::info!(workers = workers.len(), "supervisor shutting down");
        for worker in &workers {
            worker.request_stop();
        }
        let stuck: Vec<String> = workers
            .iter_mut()
            .filter_map(|w| (!w.stop()).then(|| w.name().to_string()))
            .collect();
        if !stuck.is_empty() {
            tracing::warn!(?stuck, "workers detached after grace period");
        }
        stuck
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use std::sync::atomic::AtomicU32;

    use crate::error::DriverResult;

    struct Lid {
        closes: Arc<AtomicU32>,
    }

    impl Driver for Lid {
        fn name(&self) -> &str {
            "Lid"
        }

        fn poll_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }

        fn describe_data(&self) -> BTreeMap<String, Scalar> {
            BTreeMap::from([("state".to_string(), Scalar::Int(0))])
        }

        fn list_events(&self) -> BTreeSet<String> {
            BTreeSet::from(["LID_CLOSED".to_string()])
        }

        fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
            if self.closes.load(Ordering::SeqCst) > 0 {
                ctx.write("state", 1)?;
            }
            Ok(())
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            startup_timeout: Duration::from_secs(2),
            init_poll: Duration::from_millis(5),
            worker: WorkerConfig {
                stop_grace: Duration::from_secs(1),
                ..WorkerConfig::default()
            },
        }
    }

    async fn lid_supervisor() -> Supervisor {
        let lid = Lid {
            closes: Arc::new(AtomicU32::new(0)),
        };
        Supervisor::start(vec![Box::new(lid)], fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn callbacks_fire_while_event_is_raised() {
        let supervisor = lid_supervisor().await;
        let fired = Arc::new(AtomicU32::new(0));
        let f = Arc::clone(&fired);
        supervisor
            .register_callback("Lid.LID_CLOSED", move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert_eq!(supervisor.tick().callbacks_fired, 0);
        supervisor.set_event("Lid.LID_CLOSED").unwrap();
        supervisor.tick();
        supervisor.tick();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(supervisor.get_event("Lid.LID_CLOSED").unwrap());
    }

    #[tokio::test]
    async fn callback_can_consume_its_event() {
        let supervisor = lid_supervisor().await;
        supervisor
            .register_callback("Lid.LID_CLOSED", |event: EventRef<'_>| event.clear())
            .unwrap();

        supervisor.set_event("Lid.LID_CLOSED").unwrap();
        assert_eq!(supervisor.tick().callbacks_fired, 1);
        assert_eq!(supervisor.tick().callbacks_fired, 0);
        assert!(!supervisor.get_event("Lid.LID_CLOSED").unwrap());
    }

    #[tokio::test]
    async fn snapshot_names_callbacks() {
        let supervisor = lid_supervisor().await;
        supervisor
            .register_named_callback("Lid.LID_CLOSED", "capture", |_| {})
            .unwrap();
        let snapshot = supervisor.snapshot();
        assert_eq!(
            snapshot.callbacks.get("Lid.LID_CLOSED").map(String::as_str),
            Some("capture")
        );
        assert_eq!(snapshot.value("Lid.initialized"), Some(Scalar::Int(1)));
    }

    #[tokio::test]
    async fn unknown_keys_are_errors() {
        let supervisor = lid_supervisor().await;
        assert!(matches!(
            supervisor.set_event("Lid.NOPE"),
            Err(KernelError::UnknownEvent { .. })
        ));
        assert!(matches!(
            supervisor.get_event("Ghost.LID_CLOSED"),
            Err(KernelError::UnknownDriver { .. })
        ));
        assert!(matches!(
            supervisor.data("Lid.nope"),
            Err(KernelError::UnknownField { .. })
        ));
        assert!(supervisor.register_callback("Lid.NOPE", |_| {}).is_err());
    }

    #[tokio::test]
    async fn triggers_run_from_tick() {
        let supervisor = lid_supervisor().await;
        let runs = Arc::new(AtomicU32::new(0));
        let r = Arc::clone(&runs);
        supervisor
            .trigger_every(Duration::from_millis(1), "scheduled", move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(supervisor.tick().triggers_fired, 1);
        assert!(supervisor.cancel_trigger("scheduled"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fences_control() {
        let supervisor = lid_supervisor().await;
        assert!(supervisor.shutdown().is_empty());
        assert!(supervisor.shutdown().is_empty());
        assert!(supervisor.is_shut_down());
        assert!(matches!(
            supervisor.set_event("Lid.LID_CLOSED"),
            Err(KernelError::SupervisorShutdown)
        ));
        assert!(supervisor.health().is_empty());
    }

    #[tokio::test]
    async fn duplicate_driver_names_fail_startup() {
        let a = Lid {
            closes: Arc::new(AtomicU32::new(0)),
        };
        let b = Lid {
            closes: Arc::new(AtomicU32::new(0)),
        };
        let result = Supervisor::start(vec![Box::new(a), Box::new(b)], fast_config()).await;
        assert!(matches!(result, Err(KernelError::DuplicateDriver { .. })));
    }

    /// Parks in `measure()` until a token arrives or the gate is dropped.
    struct Gate {
        entered: crossbeam::channel::Sender<()>,
        tokens: crossbeam::channel::Receiver<()>,
    }

    impl Driver for Gate {
        fn name(&self) -> &str {
            "Gate"
        }

        fn poll_interval(&self) -> Option<Duration> {
            Some(Duration::from_millis(5))
        }

        fn describe_data(&self) -> BTreeMap<String, Scalar> {
            BTreeMap::new()
        }

        fn list_events(&self) -> BTreeSet<String> {
            BTreeSet::new()
        }

        fn measure(&mut self, _ctx: &DriverContext) -> DriverResult {
            let _ = self.entered.send(());
            let _ = self.tokens.recv();
            Ok(())
        }
    }

    fn hung_reports(rx: &mut tokio::sync::broadcast::Receiver<Arc<crate::ipc::Stamped>>) -> usize {
        let mut count = 0;
        while let Ok(stamped) = rx.try_recv() {
            if matches!(stamped.event, FleetEvent::WorkerHung { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn hung_worker_is_reported_once_per_episode() {
        let (entered_tx, entered) = crossbeam::channel::unbounded();
        let (tokens, tokens_rx) = crossbeam::channel::unbounded();
        let gate = Gate {
            entered: entered_tx,
            tokens: tokens_rx,
        };
        let mut config = fast_config();
        config.worker.hung_floor = Duration::from_millis(30);

        let bus = FleetBus::new(64);
        let mut rx = bus.subscribe();
        let supervisor = Supervisor::start_with_bus(vec![Box::new(gate)], config, bus)
            .await
            .unwrap();

        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(supervisor.health()[0].hung);
        supervisor.tick();
        supervisor.tick();
        supervisor.tick();
        assert_eq!(hung_reports(&mut rx), 1);

        // The next measure starts fresh, which re-arms the report.
        tokens.send(()).unwrap();
        entered.recv_timeout(Duration::from_secs(5)).unwrap();
        supervisor.tick();
        assert_eq!(hung_reports(&mut rx), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        supervisor.tick();
        supervisor.tick();
        assert_eq!(hung_reports(&mut rx), 1);

        drop(tokens);
        assert!(supervisor.shutdown().is_empty());
    }
}
