//! Simulation drivers.
//!
//! Stand-ins for the load cell, lid switch and status LED so the fleet can
//! run on a development machine.  They register under the hardware driver
//! names, so registry keys and the `[readings]` map work unchanged.

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use smartbin_kernel::{Driver, DriverContext, DriverResult, Scalar};
use smartbin_publisher::PUBLISHER_NAME;
use smartbin_publisher::publisher::events as publisher_events;
use tracing::{debug, warn};

pub const SCALE_NAME: &str = "NAU7802";
pub const LID_NAME: &str = "LidSwitch";
pub const LIGHT_NAME: &str = "LEDDriver";

pub mod keys {
    pub const TARE: &str = "NAU7802.TARE";
    pub const LID_OPEN: &str = "LidSwitch.lid_open";
    pub const LID_CLOSED: &str = "LidSwitch.LID_CLOSED";
    pub const LIGHT_DONE: &str = "LEDDriver.DONE";
    pub const LIGHT_ERROR: &str = "LEDDriver.ERROR";
}

// ---------------------------------------------------------------------------
// Scale
// ---------------------------------------------------------------------------

/// Load cell whose weight grows while the lid is open.
#[derive(Debug)]
pub struct SimScale {
    poll: Duration,
    /// Grams added per tick while the lid is open.
    step: f64,
    /// Smallest weight change that raises `WEIGHT_CHANGE`.
    threshold: f64,
    raw: f64,
    offset: f64,
    last_reported: f64,
}

impl Default for SimScale {
    fn default() -> Self {
        Self::new()
    }
}

impl SimScale {
    pub fn new() -> Self {
        Self {
            poll: Duration::from_millis(500),
            step: 12.5,
            threshold: 50.0,
            raw: 0.0,
            offset: 0.0,
            last_reported: 0.0,
        }
    }

    pub fn with_step(mut self, step: f64, threshold: f64) -> Self {
        self.step = step;
        self.threshold = threshold;
        self
    }

    fn lid_open(ctx: &DriverContext) -> bool {
        ctx.read_key(keys::LID_OPEN)
            .map(|value| value.as_bool())
            .unwrap_or(false)
    }
}

impl Driver for SimScale {
    fn name(&self) -> &str {
        SCALE_NAME
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll)
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([
            ("weight".to_string(), Scalar::Float(0.0)),
            ("weight_delta".to_string(), Scalar::Float(0.0)),
        ])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["TARE".to_string(), "WEIGHT_CHANGE".to_string()])
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        if ctx.take_event("TARE")? {
            self.offset = self.raw;
            self.last_reported = 0.0;
            debug!(offset = self.offset, "scale tared");
        }
        if Self::lid_open(ctx) {
            self.raw += self.step;
        }

        let weight = self.raw - self.offset;
        let delta = weight - self.last_reported;
        if delta.abs() >= self.threshold {
            self.last_reported = weight;
            ctx.set_event("WEIGHT_CHANGE")?;
        }
        ctx.write("weight", weight)?;
        ctx.write("weight_delta", delta)?;
        Ok(())
    }

    fn calibrate(&mut self, ctx: &DriverContext) -> DriverResult {
        self.raw = 0.0;
        self.offset = 0.0;
        self.last_reported = 0.0;
        ctx.write("weight", 0.0)?;
        ctx.write("weight_delta", 0.0)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Lid
// ---------------------------------------------------------------------------

/// Lid switch that opens and closes on a fixed cycle.
#[derive(Debug)]
pub struct SimLid {
    poll: Duration,
    open_for: Duration,
    closed_for: Duration,
    open: bool,
    changed_at: Option<Instant>,
}

impl Default for SimLid {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLid {
    pub fn new() -> Self {
        Self {
            poll: Duration::from_millis(100),
            open_for: Duration::from_secs(3),
            closed_for: Duration::from_secs(30),
            open: false,
            changed_at: None,
        }
    }

    pub fn with_cycle(mut self, open_for: Duration, closed_for: Duration) -> Self {
        self.open_for = open_for;
        self.closed_for = closed_for;
        self
    }
}

impl Driver for SimLid {
    fn name(&self) -> &str {
        LID_NAME
    }

    fn poll_interval(&self) -> Option<Duration> {
        Some(self.poll)
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([("lid_open".to_string(), Scalar::Bool(false))])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["LID_OPENED".to_string(), "LID_CLOSED".to_string()])
    }

    fn initialize(&mut self, _ctx: &DriverContext) -> DriverResult {
        self.changed_at = Some(Instant::now());
        Ok(())
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        let now = Instant::now();
        let since = now.duration_since(*self.changed_at.get_or_insert(now));
        let hold = if self.open { self.open_for } else { self.closed_for };
        if since < hold {
            return Ok(());
        }

        self.open = !self.open;
        self.changed_at = Some(now);
        ctx.write("lid_open", self.open)?;
        if self.open {
            ctx.set_event("LID_OPENED")?;
        } else {
            ctx.set_event("LID_CLOSED")?;
        }
        debug!(open = self.open, "lid moved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Status light
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LightState {
    Idle = 0,
    Done = 1,
    Error = 2,
}

/// Status LED.  Shows its own `DONE`/`ERROR` requests and the publisher's
/// upload outcomes for a while, then goes back to idle.
///
/// The light services the publisher's events, so it is the one clearing
/// them.
#[derive(Debug)]
pub struct StatusLight {
    hold: Duration,
    watch_done: Vec<String>,
    watch_error: Vec<String>,
    state: LightState,
    until: Option<Instant>,
}

impl Default for StatusLight {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusLight {
    pub fn new() -> Self {
        Self {
            hold: Duration::from_secs(2),
            watch_done: vec![format!("{PUBLISHER_NAME}.{}", publisher_events::UPLOAD_DONE)],
            watch_error: vec![format!("{PUBLISHER_NAME}.{}", publisher_events::UPLOAD_FAILED)],
            state: LightState::Idle,
            until: None,
        }
    }

    pub fn with_hold(mut self, hold: Duration) -> Self {
        self.hold = hold;
        self
    }

    pub fn state(&self) -> LightState {
        self.state
    }

    fn show(&mut self, ctx: &DriverContext, state: LightState) -> DriverResult {
        if state != self.state {
            debug!(?state, "status light changed");
        }
        self.state = state;
        self.until = (state != LightState::Idle).then(|| Instant::now() + self.hold);
        ctx.write("state", state as i64)?;
        Ok(())
    }

    /// Lower every raised event in `keys`; true if any was raised.
    fn consume_any(ctx: &DriverContext, keys: &[String]) -> DriverResult<bool> {
        let mut raised = false;
        for key in keys {
            raised |= ctx.consume(key)?;
        }
        Ok(raised)
    }
}

impl Driver for StatusLight {
    fn name(&self) -> &str {
        LIGHT_NAME
    }

    fn describe_data(&self) -> BTreeMap<String, Scalar> {
        BTreeMap::from([("state".to_string(), Scalar::Int(LightState::Idle as i64))])
    }

    fn list_events(&self) -> BTreeSet<String> {
        BTreeSet::from(["DONE".to_string(), "ERROR".to_string()])
    }

    fn initialize(&mut self, ctx: &DriverContext) -> DriverResult {
        let registry = ctx.registry();
        for watched in [&mut self.watch_done, &mut self.watch_error] {
            watched.retain(|key| match registry.resolve_event(key) {
                Ok(_) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "status light ignores unknown event");
                    false
                }
            });
        }
        Ok(())
    }

    fn measure(&mut self, ctx: &DriverContext) -> DriverResult {
        let error = ctx.take_event("ERROR")? | Self::consume_any(ctx, &self.watch_error)?;
        let done = ctx.take_event("DONE")? | Self::consume_any(ctx, &self.watch_done)?;

        if error {
            self.show(ctx, LightState::Error)
        } else if done {
            self.show(ctx, LightState::Done)
        } else if self.until.is_some_and(|until| Instant::now() >= until) {
            self.show(ctx, LightState::Idle)
        } else {
            Ok(())
        }
    }

    fn kill(&mut self) {
        self.state = LightState::Idle;
        self.until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smartbin_kernel::{DriverDescriptor, SharedRegistry};

    struct Fleet {
        registry: SharedRegistry,
        scale: DriverContext,
        lid: DriverContext,
        light: DriverContext,
    }

    fn fleet(scale: &SimScale, lid: &SimLid, light: &StatusLight) -> Fleet {
        let mut builder = SharedRegistry::builder();
        let scale_id = builder.register(&DriverDescriptor::of(scale)).unwrap();
        let lid_id = builder.register(&DriverDescriptor::of(lid)).unwrap();
        let light_id = builder.register(&DriverDescriptor::of(light)).unwrap();
        builder
            .register(
                &DriverDescriptor::new(PUBLISHER_NAME)
                    .with_event(publisher_events::UPLOAD_DONE)
                    .with_event(publisher_events::UPLOAD_FAILED),
            )
            .unwrap();
        let registry = builder.build();
        Fleet {
            scale: DriverContext::new(registry.clone(), scale_id),
            lid: DriverContext::new(registry.clone(), lid_id),
            light: DriverContext::new(registry.clone(), light_id),
            registry,
        }
    }

    #[test]
    fn lid_cycle_raises_open_and_close_events() {
        let (scale, light) = (SimScale::new(), StatusLight::new());
        let mut lid = SimLid::new().with_cycle(Duration::ZERO, Duration::ZERO);
        let f = fleet(&scale, &lid, &light);
        lid.initialize(&f.lid).unwrap();

        lid.measure(&f.lid).unwrap();
        assert_eq!(f.lid.read("lid_open").unwrap(), Scalar::Bool(true));
        assert!(f.lid.take_event("LID_OPENED").unwrap());

        lid.measure(&f.lid).unwrap();
        assert_eq!(f.lid.read("lid_open").unwrap(), Scalar::Bool(false));
        assert!(f.registry.read_key(keys::LID_OPEN).is_ok());
        assert!(f.lid.is_set("LID_CLOSED").unwrap());
    }

    #[test]
    fn closed_lid_holds_until_cycle_elapses() {
        let (scale, light) = (SimScale::new(), StatusLight::new());
        let mut lid = SimLid::new().with_cycle(Duration::ZERO, Duration::from_secs(3600));
        let f = fleet(&scale, &lid, &light);
        lid.initialize(&f.lid).unwrap();
        lid.measure(&f.lid).unwrap();
        assert_eq!(f.lid.read("lid_open").unwrap(), Scalar::Bool(false));
        assert!(!f.lid.is_set("LID_OPENED").unwrap());
    }

    #[test]
    fn scale_gains_weight_while_lid_open_and_tares() {
        let mut scale = SimScale::new().with_step(30.0, 50.0);
        let mut lid = SimLid::new().with_cycle(Duration::from_secs(3600), Duration::ZERO);
        let light = StatusLight::new();
        let f = fleet(&scale, &lid, &light);
        lid.initialize(&f.lid).unwrap();
        lid.measure(&f.lid).unwrap();

        scale.measure(&f.scale).unwrap();
        assert_eq!(f.scale.read("weight").unwrap(), Scalar::Float(30.0));
        assert!(!f.scale.is_set("WEIGHT_CHANGE").unwrap());

        scale.measure(&f.scale).unwrap();
        assert_eq!(f.scale.read("weight").unwrap(), Scalar::Float(60.0));
        assert!(f.scale.take_event("WEIGHT_CHANGE").unwrap());

        f.registry.set(f.registry.resolve_event(keys::TARE).unwrap());
        scale.measure(&f.scale).unwrap();
        assert_eq!(f.scale.read("weight").unwrap(), Scalar::Float(30.0));
        assert!(!f.scale.is_set("TARE").unwrap());
    }

    #[test]
    fn light_consumes_publisher_events() {
        let (scale, lid) = (SimScale::new(), SimLid::new());
        let mut light = StatusLight::new().with_hold(Duration::ZERO);
        let f = fleet(&scale, &lid, &light);
        light.initialize(&f.light).unwrap();

        let done = f.registry.resolve_event("AsyncPublisher.UPLOAD_DONE").unwrap();
        f.registry.set(done);
        light.measure(&f.light).unwrap();
        assert_eq!(light.state(), LightState::Done);
        assert!(!f.registry.is_set(done));
        assert_eq!(f.light.read("state").unwrap(), Scalar::Int(1));

        let failed = f.registry.resolve_event("AsyncPublisher.UPLOAD_FAILED").unwrap();
        f.registry.set(failed);
        f.registry.set(done);
        light.measure(&f.light).unwrap();
        assert_eq!(light.state(), LightState::Error);
        assert!(!f.registry.is_set(failed));
        assert!(!f.registry.is_set(done));

        light.measure(&f.light).unwrap();
        assert_eq!(light.state(), LightState::Idle);
    }

    #[test]
    fn light_without_publisher_still_serves_own_events() {
        let mut builder = SharedRegistry::builder();
        let mut light = StatusLight::new();
        let id = builder.register(&DriverDescriptor::of(&light)).unwrap();
        let ctx = DriverContext::new(builder.build(), id);
        light.initialize(&ctx).unwrap();

        ctx.set_event("ERROR").unwrap();
        light.measure(&ctx).unwrap();
        assert_eq!(light.state(), LightState::Error);
        assert!(!ctx.is_set("ERROR").unwrap());
    }
}
