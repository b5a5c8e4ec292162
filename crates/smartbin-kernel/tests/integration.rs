//! Integration tests for the smartbin-kernel crate.
//!
//! These tests run real worker threads under a supervisor and exercise the
//! registry, callbacks, triggers and the lifecycle bus together.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use smartbin_kernel::{
    Driver, DriverContext, DriverError, DriverResult, FleetBus, FleetEvent, KernelError, Scalar,
    Supervisor, SupervisorConfig, WorkerConfig,
};

// ═══════════════════════════════════════════════════════════════════════
//  Test drivers
// ═══════════════════════════════════════════════════════════════════════

/// Writes a fixed weight on its first tick and raises `WEIGHT_CHANGE`.
struct Scale;

impl Driver for Scale {
    fn name(&self) -> &str {
        "Scale"
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(5))
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([("weight".to_string(), Scalar::Float(0.0))])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["WEIGHT_CHANGE".to_string()])
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        if ctx.read("weight")?.as_f64() == 0.0 {
            ctx.write("weight", 5.0)?;
            ctx.set_event("WEIGHT_CHANGE")?;
        }
        Ok(())
    }
}

/// `initialize()` blocks until the worker is asked to stop.
struct StuckCamera;

impl Driver for StuckCamera {
    fn name(&self) -> &str {
        "Camera"
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::new()
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["CAPTURE".to_string()])
    }

    fn initialize(&mut self, ctx: &DriverContext) -> DriverResult {
        while !ctx.stop_requested() {
            std::thread::sleep(Duration::from_millis(5));
        }
        Err(DriverError::NotReady("camera never came up".into()))
    }

    fn measure(&mut self, _ctx: &DriverContext) -> DriverResult {
        Ok(())
    }
}

/// Counts `kill()` calls and fails every other tick.
struct Flaky {
    kills: Arc<AtomicU32>,
    ticks: u32,
}

impl Driver for Flaky {
    fn name(&self) -> &str {
        "Flaky"
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(Duration::from_millis(2))
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([("ticks".to_string(), Scalar::Int(0))])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        self.ticks += 1;
        ctx.write("ticks", self.ticks)?;
        if self.ticks % 2 == 0 {
            return Err(DriverError::Hardware("bus glitch".into()));
        }
        Ok(())
    }

    fn kill(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

/// Event-only driver used as a signal target.
struct Led;

impl Driver for Led {
    fn name(&self) -> &str {
        "Led"
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::new()
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["DONE".to_string(), "ERROR".to_string()])
    }

    fn measure(&mut self, _ctx: &DriverContext) -> DriverResult {
        Ok(())
    }
}

fn config(startup_timeout: Duration) -> SupervisorConfig {
    SupervisorConfig {
        startup_timeout,
        init_poll: Duration::from_millis(5),
        worker: WorkerConfig {
            stop_grace: Duration::from_secs(2),
            ..WorkerConfig::default()
        },
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ═══════════════════════════════════════════════════════════════════════
//  Registry through the supervisor
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn worker_writes_show_up_in_snapshot() {
    let supervisor = Supervisor::start(vec![Box::new(Scale)], config(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(
        wait_until(|| supervisor.get_event("Scale.WEIGHT_CHANGE").unwrap_or(false)).await,
        "scale never raised WEIGHT_CHANGE"
    );

    let snapshot = supervisor.snapshot();
    assert_eq!(snapshot.value("Scale.weight"), Some(Scalar::Float(5.0)));
    assert_eq!(snapshot.event("Scale.WEIGHT_CHANGE"), Some(true));

    let json = snapshot.to_json();
    assert_eq!(json["data"]["Scale"]["weight"], 5.0);
    assert_eq!(json["events"]["Scale"]["WEIGHT_CHANGE"], true);
    assert_eq!(json["data"]["Scale"]["initialized"], 1);
}

#[tokio::test]
async fn set_get_clear_every_event() {
    let supervisor = Supervisor::start(
        vec![Box::new(Led), Box::new(Scale)],
        config(Duration::from_secs(2)),
    )
    .await
    .unwrap();

    for key in ["Led.DONE", "Led.ERROR", "Scale.WEIGHT_CHANGE"] {
        supervisor.set_event(key).unwrap();
        assert!(supervisor.get_event(key).unwrap(), "{key} should be set");
        supervisor.clear_event(key).unwrap();
        assert!(!supervisor.get_event(key).unwrap(), "{key} should be clear");
    }

    supervisor.set_event("Led.DONE").unwrap();
    supervisor.set_event("Led.ERROR").unwrap();
    supervisor.clear_all_events();
    assert!(!supervisor.get_event("Led.DONE").unwrap());
    assert!(!supervisor.get_event("Led.ERROR").unwrap());
}

#[tokio::test]
async fn unknown_keys_report_errors() {
    let supervisor = Supervisor::start(vec![Box::new(Led)], config(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(matches!(
        supervisor.get_event("Led.BLINK"),
        Err(KernelError::UnknownEvent { .. })
    ));
    assert!(matches!(
        supervisor.clear_event("Horn.BEEP"),
        Err(KernelError::UnknownDriver { .. })
    ));
    assert!(matches!(
        supervisor.set_event("no-dot"),
        Err(KernelError::MalformedKey { .. })
    ));
}

// ═══════════════════════════════════════════════════════════════════════
//  Startup and shutdown
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stuck_initialize_is_reported_and_others_run() {
    let supervisor = Supervisor::start(
        vec![Box::new(StuckCamera), Box::new(Scale)],
        config(Duration::from_millis(200)),
    )
    .await
    .unwrap();

    assert_eq!(supervisor.failed_to_initialize(), ["Camera".to_string()]);
    assert_eq!(supervisor.data("Camera.initialized").unwrap(), Scalar::Int(0));
    assert_eq!(supervisor.data("Scale.initialized").unwrap(), Scalar::Int(1));

    assert!(
        wait_until(|| supervisor.data("Scale.weight").map(|v| v.as_f64()).unwrap_or(0.0) == 5.0).await,
        "healthy driver should keep measuring"
    );

    assert!(supervisor.shutdown().is_empty());
}

#[tokio::test]
async fn failing_ticks_do_not_stop_worker_and_kill_runs_once() {
    let kills = Arc::new(AtomicU32::new(0));
    let flaky = Flaky {
        kills: Arc::clone(&kills),
        ticks: 0,
    };
    let supervisor = Supervisor::start(vec![Box::new(flaky)], config(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(
        wait_until(|| supervisor.data("Flaky.ticks").map(|v| v.as_i64()).unwrap_or(0) >= 6).await,
        "worker should survive failing ticks"
    );
    let health = supervisor.health();
    assert_eq!(health.len(), 1);
    assert!(health[0].failures >= 3);
    assert!(health[0].running);

    supervisor.shutdown();
    supervisor.shutdown();
    drop(supervisor);
    assert_eq!(kills.load(Ordering::SeqCst), 1);
}

// ═══════════════════════════════════════════════════════════════════════
//  Callbacks and lifecycle bus
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn callback_observes_worker_event() {
    let supervisor = Supervisor::start(vec![Box::new(Scale)], config(Duration::from_secs(2)))
        .await
        .unwrap();

    let seen = Arc::new(AtomicU32::new(0));
    let s = Arc::clone(&seen);
    supervisor
        .register_callback("Scale.WEIGHT_CHANGE", move |event| {
            assert_eq!(event.key(), "Scale.WEIGHT_CHANGE");
            s.fetch_add(1, Ordering::SeqCst);
            event.clear();
        })
        .unwrap();

    assert!(
        wait_until(|| {
            supervisor.tick();
            seen.load(Ordering::SeqCst) > 0
        })
        .await
    );
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert!(!supervisor.get_event("Scale.WEIGHT_CHANGE").unwrap());
}

#[tokio::test]
async fn lifecycle_events_reach_the_bus() {
    let bus = FleetBus::new(64);
    let mut rx = bus.subscribe();
    let supervisor = Supervisor::start_with_bus(
        vec![Box::new(Led)],
        config(Duration::from_secs(2)),
        bus.clone(),
    )
    .await
    .unwrap();
    supervisor.shutdown();

    let mut seen = Vec::new();
    while let Ok(stamped) = rx.try_recv() {
        seen.push(stamped.event.clone());
    }
    assert!(seen.contains(&FleetEvent::WorkerStarted { driver: "Led".into() }));
    assert!(seen.contains(&FleetEvent::WorkerInitialized { driver: "Led".into() }));
    assert!(seen.contains(&FleetEvent::WorkerStopped { driver: "Led".into() }));
}
