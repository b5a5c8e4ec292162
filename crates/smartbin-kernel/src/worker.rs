//! Per-driver worker.
//!
//! A [`Worker`] hosts exactly one [`Driver`] on its own OS thread, so a
//! blocking bus read or a stuck camera capture only ever stalls its own
//! driver.  The thread runs:
//!
//! ```text
//! initialize()  ──ok──►  initialized = 1
//!               ──err─►  initialized = 0, park until stopped
//! loop {
//!   wait poll interval (or the minimal tick), wake early on stop
//!   calibrate()  if requested
//!   measure()    errors and panics are logged, the loop continues
//! }
//! kill()
//! ```
//!
//! Stopping is cooperative: [`Worker::stop`] raises the stop flag, wakes the
//! thread and waits up to the grace period for it to run `kill()` and exit.
//! A thread still stuck inside a hook after the grace period is detached.
//! If the driver handed out a [`ReleaseHandle`], `stop()` runs it right away
//! so the hardware is freed while the hook is still blocked; otherwise the
//! thread runs `kill()` whenever the hook returns.  Either way the driver is
//! torn down exactly once.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;

use crate::driver::{Driver, DriverContext, ReleaseHandle};
use crate::error::{KernelError, Result};
use crate::ipc::FleetEvent;
use crate::registry::INITIALIZED_FIELD;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Timing knobs shared by every worker.
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    /// Tick used by event-driven drivers that declare no poll interval.
    pub min_tick: Duration,
    /// How long [`Worker::stop`] waits for the thread to exit.
    pub stop_grace: Duration,
    /// A `measure()` running longer than `hung_factor x interval` is hung.
    pub hung_factor: u32,
    /// Lower bound of the hung threshold.
    pub hung_floor: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min_tick: Duration::from_millis(10),
            stop_grace: Duration::from_secs(5),
            hung_factor: 4,
            hung_floor: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Stats and health
// ---------------------------------------------------------------------------

/// Counters written by the worker thread and read by the supervisor.
#[derive(Debug)]
pub struct WorkerStats {
    epoch: Instant,
    ticks: AtomicU64,
    failures: AtomicU64,
    /// Milliseconds since `epoch` (+1) at which the current `measure()`
    /// started, or 0 while idle.
    busy_since: AtomicU64,
    running: AtomicBool,
    init_done: AtomicBool,
}

impl WorkerStats {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            ticks: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            busy_since: AtomicU64::new(0),
            running: AtomicBool::new(false),
            init_done: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn enter_measure(&self) {
        self.busy_since.store(self.now_ms() + 1, Ordering::Release);
    }

    fn leave_measure(&self) {
        self.busy_since.store(0, Ordering::Release);
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Completed `measure()` calls.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// `measure()` calls that returned an error or panicked.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// How long the in-flight `measure()` has been running, if any.
    pub fn busy_for(&self) -> Option<Duration> {
        match self.busy_since.load(Ordering::Acquire) {
            0 => None,
            since => Some(Duration::from_millis(
                self.now_ms().saturating_sub(since - 1),
            )),
        }
    }

    /// Whether the worker thread is inside its loop.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Whether `initialize()` has returned, successfully or not.
    pub fn initialization_finished(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }
}

/// Health report for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerHealth {
    pub driver: String,
    pub initialized: bool,
    pub running: bool,
    pub ticks: u64,
    pub failures: u64,
    pub busy_for_ms: Option<u64>,
    pub hung: bool,
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Handle to a running driver thread.
pub struct Worker {
    name: String,
    interval: Duration,
    config: WorkerConfig,
    ctx: DriverContext,
    stop: Arc<AtomicBool>,
    calibrate: Arc<AtomicBool>,
    wake: Sender<()>,
    exited: Receiver<()>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<WorkerStats>,
    release: Option<ReleaseHandle>,
    /// Set by whichever of `kill()` or the release handle runs first.
    torn_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("running", &self.stats.is_running())
            .finish()
    }
}

impl Worker {
    /// Spawn the thread hosting `driver`.  `ctx` must be bound to the
    /// driver's own registry slice.
    pub fn start(driver: Box<dyn Driver>, ctx: DriverContext, config: WorkerConfig) -> Result<Self> {
        let name = driver.name().to_string();
        let interval = driver.poll_interval().unwrap_or(config.min_tick);
        let release = driver.release_handle();
        let torn_down = Arc::new(AtomicBool::new(false));

        let stop = Arc::new(AtomicBool::new(false));
        let calibrate = Arc::new(AtomicBool::new(false));
        let ctx = ctx.with_stop_flag(Arc::clone(&stop));
        let stats = Arc::new(WorkerStats::new());
        let (wake_tx, wake_rx) = channel::bounded(1);
        let (exit_tx, exit_rx) = channel::bounded(1);

        let thread = WorkerThread {
            driver,
            ctx: ctx.clone(),
            interval,
            stop: Arc::clone(&stop),
            calibrate: Arc::clone(&calibrate),
            wake: wake_rx,
            stats: Arc::clone(&stats),
            torn_down: Arc::clone(&torn_down),
        };

        let handle = std::thread::Builder::new()
            .name(format!("worker-{name}"))
            .spawn(move || {
                thread.run();
                let _ = exit_tx.send(());
            })
            .map_err(|e| KernelError::WorkerSpawnFailed {
                driver: name.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(driver = %name, interval_ms = interval.as_millis() as u64, "worker started");
        ctx.publish(FleetEvent::WorkerStarted {
            driver: name.clone(),
        });

        Ok(Self {
            name,
            interval,
            config,
            ctx,
            stop,
            calibrate,
            wake: wake_tx,
            exited: exit_rx,
            handle: Some(handle),
            stats,
            release,
            torn_down,
        })
    }

    /// Name of the hosted driver.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective poll interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Whether the driver reports `initialized != 0`.
    pub fn is_initialized(&self) -> bool {
        self.ctx
            .read(INITIALIZED_FIELD)
            .map(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Ask the worker to run `calibrate()` before its next tick.
    pub fn request_calibration(&self) {
        self.calibrate.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    /// Threshold past which an in-flight `measure()` counts as hung.
    pub fn hung_threshold(&self) -> Duration {
        (self.interval * self.config.hung_factor).max(self.config.hung_floor)
    }

    /// Current health of the worker.
    pub fn health(&self) -> WorkerHealth {
        let busy = self.stats.busy_for();
        WorkerHealth {
            driver: self.name.clone(),
            initialized: self.is_initialized(),
            running: self.stats.is_running(),
            ticks: self.stats.ticks(),
            failures: self.stats.failures(),
            busy_for_ms: busy.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            hung: busy.is_some_and(|d| d > self.hung_threshold()),
        }
    }

    /// Raise the stop flag and wake the thread without waiting for it.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    /// Stop the worker and wait up to the grace period for it to exit.
    ///
    /// Returns `true` when the thread exited (or had already been stopped).
    /// On timeout the thread is detached, the release handle runs if the
    /// driver has one, and `false` is returned.  Calling it again is a no-op.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };

        self.request_stop();

        match self.exited.recv_timeout(self.config.stop_grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    tracing::error!(driver = %self.name, "worker thread panicked during shutdown");
                }
                tracing::info!(driver = %self.name, "worker stopped");
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    driver = %self.name,
                    grace_ms = self.config.stop_grace.as_millis() as u64,
                    "worker did not exit within grace period, detaching thread"
                );
                let released = self.release_detached();
                self.ctx.publish(FleetEvent::WorkerDetached {
                    driver: self.name.clone(),
                    released,
                });
                false
            }
        }
    }

    /// Free the hardware of a thread that is being detached.  Returns
    /// whether the driver is torn down once this returns.
    fn release_detached(&self) -> bool {
        let Some(release) = &self.release else {
            tracing::error!(
                driver = %self.name,
                "driver has no release handle, hardware stays held until its hook returns"
            );
            return false;
        };
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return true;
        }
        match catch_unwind(AssertUnwindSafe(|| release.release())) {
            Ok(()) => {
                tracing::info!(driver = %self.name, "hardware released for detached worker");
                true
            }
            Err(panic) => {
                tracing::error!(
                    driver = %self.name,
                    panic = %panic_message(panic.as_ref()),
                    "release handle panicked"
                );
                false
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

// ---------------------------------------------------------------------------
// Thread body
// ---------------------------------------------------------------------------

struct WorkerThread {
    driver: Box<dyn Driver>,
    ctx: DriverContext,
    interval: Duration,
    stop: Arc<AtomicBool>,
    calibrate: Arc<AtomicBool>,
    wake: Receiver<()>,
    stats: Arc<WorkerStats>,
    torn_down: Arc<AtomicBool>,
}

impl WorkerThread {
    fn run(mut self) {
        let name = self.ctx.name().to_string();
        self.stats.running.store(true, Ordering::Release);

        let initialized = self.initialize(&name);
        self.stats.init_done.store(true, Ordering::Release);

        while !self.stopping() {
            match self.wake.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) | Ok(()) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.stopping() {
                break;
            }
            if !initialized {
                continue;
            }
            if self.calibrate.swap(false, Ordering::AcqRel) {
                self.calibrate(&name);
            }
            self.tick(&name);
        }

        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::debug!(driver = %name, "hardware already released, skipping kill()");
        } else if catch_unwind(AssertUnwindSafe(|| self.driver.kill())).is_err() {
            tracing::error!(driver = %name, "driver panicked in kill()");
        }
        self.stats.running.store(false, Ordering::Release);
        self.ctx.publish(FleetEvent::WorkerStopped { driver: name });
    }

    fn stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn initialize(&mut self, name: &str) -> bool {
        let outcome = match catch_unwind(AssertUnwindSafe(|| self.driver.initialize(&self.ctx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(format!("panicked: {}", panic_message(panic.as_ref()))),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.ctx.write(INITIALIZED_FIELD, 1) {
                    tracing::error!(driver = %name, error = %e, "cannot record initialization");
                }
                tracing::info!(driver = %name, "driver initialized");
                self.ctx.publish(FleetEvent::WorkerInitialized {
                    driver: name.to_string(),
                });
                true
            }
            Err(reason) => {
                let _ = self.ctx.write(INITIALIZED_FIELD, 0);
                tracing::error!(driver = %name, error = %reason, "driver failed to initialize");
                self.ctx.publish(FleetEvent::WorkerInitFailed {
                    driver: name.to_string(),
                    reason,
                });
                false
            }
        }
    }

    fn calibrate(&mut self, name: &str) {
        match catch_unwind(AssertUnwindSafe(|| self.driver.calibrate(&self.ctx))) {
            Ok(Ok(())) => tracing::info!(driver = %name, "driver calibrated"),
            Ok(Err(e)) => tracing::warn!(driver = %name, error = %e, "calibration failed"),
            Err(panic) => tracing::error!(
                driver = %name,
                panic = %panic_message(panic.as_ref()),
                "driver panicked in calibrate()"
            ),
        }
    }

    fn tick(&mut self, name: &str) {
        self.stats.enter_measure();
        let result = catch_unwind(AssertUnwindSafe(|| self.driver.measure(&self.ctx)));
        self.stats.leave_measure();

        let reason = match result {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(driver = %name, error = %reason, "measure failed");
        self.ctx.publish(FleetEvent::MeasureFailed {
            driver: name.to_string(),
            reason,
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
