//! The driver contract.
//!
//! A [`Driver`] wraps one sensor or actuator.  The kernel never looks inside
//! it: a worker calls [`Driver::initialize`] once, then [`Driver::measure`]
//! every poll interval until it is stopped, then [`Driver::kill`].  Drivers
//! talk to the rest of the device exclusively through the [`DriverContext`]
//! handed to every hook.
//!
//! Hooks are synchronous on purpose: bus reads, camera captures and audio
//! recordings block, and each driver owns a dedicated worker thread for
//! exactly that reason.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{DriverResult, Result};
use crate::ipc::{FleetBus, FleetEvent};
use crate::registry::{DriverId, EventId, FieldId, Scalar, SharedRegistry};

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Immutable description of a driver, captured at registration.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverDescriptor {
    /// Unique driver name; the `Driver` half of every `"Driver.Name"` key.
    pub name: String,
    /// Interval between two `measure()` calls; `None` for event-driven
    /// drivers, which are ticked at the worker's minimal rate instead.
    pub poll_interval: Option<Duration>,
    /// Initial value of every data field.
    pub data_fields: BTreeMap<String, Scalar>,
    /// Events the driver reacts to or raises, each starting cleared.
    pub event_names: BTreeSet<String>,
}

impl DriverDescriptor {
    /// Descriptor with no fields, no events and no poll interval.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_interval: None,
            data_fields: BTreeMap::new(),
            event_names: BTreeSet::new(),
        }
    }

    /// Capture the descriptor of a driver.
    pub fn of(driver: &dyn Driver) -> Self {
        Self {
            name: driver.name().to_string(),
            poll_interval: driver.poll_interval(),
            data_fields: driver.describe_data(),
            event_names: driver.list_events(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, initial: impl Into<Scalar>) -> Self {
        self.data_fields.insert(name.into(), initial.into());
        self
    }

    pub fn with_event(mut self, name: impl Into<String>) -> Self {
        self.event_names.insert(name.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// A unit of sensor or actuator logic hosted by one worker.
///
/// Only `name`, `describe_data`, `list_events` and `measure` are mandatory.
pub trait Driver: Send + 'static {
    /// Unique name of the driver.
    fn name(&self) -> &str;

    /// Time between two `measure()` calls.  `None` means event-driven.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// Fields the driver publishes, with their initial values.
    fn describe_data(&self) -> BTreeMap<String, Scalar>;

    /// Events the driver owns.
    fn list_events(&self) -> BTreeSet<String>;

    /// One-time hardware setup.  A failure is recorded as
    /// `initialized = 0` and never stops the rest of the fleet.
    fn initialize(&mut self, _ctx: &DriverContext) -> DriverResult {
        Ok(())
    }

    /// One poll tick: read hardware, update fields, react to events.
    fn measure(&mut self, ctx: &DriverContext) -> DriverResult;

    /// Optional calibration routine.
    fn calibrate(&mut self, _ctx: &DriverContext) -> DriverResult {
        Ok(())
    }

    /// Release hardware handles.  Must be idempotent.
    fn kill(&mut self) {}

    /// Handle that releases the driver's hardware from outside its worker
    /// thread.
    ///
    /// The worker takes it once at start.  When a stop finds the thread
    /// still stuck in a hook after the grace period, the handle runs in
    /// place of `kill()`; exactly one of the two ever runs.
    fn release_handle(&self) -> Option<ReleaseHandle> {
        None
    }
}

/// Out-of-thread release of a driver's hardware.  See
/// [`Driver::release_handle`].
#[derive(Clone)]
pub struct ReleaseHandle(Arc<dyn Fn() + Send + Sync>);

impl ReleaseHandle {
    pub fn new(release: impl Fn() + Send + Sync + 'static) -> Self {
        Self(Arc::new(release))
    }

    pub fn release(&self) {
        (self.0)();
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReleaseHandle")
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// A driver's view of the shared registry.
///
/// Data writes are limited to the owning driver's own fields, which is what
/// keeps every cell single-writer.  Events may be raised or lowered on any
/// driver.
#[derive(Clone, Debug)]
pub struct DriverContext {
    registry: SharedRegistry,
    driver: DriverId,
    stop: Arc<AtomicBool>,
    bus: Option<FleetBus>,
}

impl DriverContext {
    /// Context for `driver` on `registry`.
    pub fn new(registry: SharedRegistry, driver: DriverId) -> Self {
        Self {
            registry,
            driver,
            stop: Arc::new(AtomicBool::new(false)),
            bus: None,
        }
    }

    pub(crate) fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Attach a fleet bus so the driver can publish lifecycle events.
    pub fn with_bus(mut self, bus: FleetBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Name of the owning driver.
    pub fn name(&self) -> &str {
        self.registry.driver_name(self.driver)
    }

    /// Identifier of the owning driver.
    pub fn driver_id(&self) -> DriverId {
        self.driver
    }

    /// The whole registry, for cross-driver reads and snapshots.
    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    /// Whether the worker has been asked to stop.  Long-running hooks
    /// should poll this.
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Publish on the fleet bus, if one is attached.
    pub fn publish(&self, event: FleetEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    // -- Own data -------------------------------------------------------------

    /// Resolve one of this driver's fields.
    pub fn field(&self, field: &str) -> Result<FieldId> {
        self.registry.field_id(self.driver, field)
    }

    /// Write one of this driver's fields.
    pub fn write(&self, field: &str, value: impl Into<Scalar>) -> Result<()> {
        let id = self.field(field)?;
        self.registry.write(id, value.into());
        Ok(())
    }

    /// Write a pre-resolved field.  Fields of other drivers are rejected.
    pub fn write_id(&self, id: FieldId, value: impl Into<Scalar>) -> Result<()> {
        if id.driver() != self.driver {
            return Err(crate::error::KernelError::UnknownField {
                driver: self.name().to_string(),
                field: self.registry.field_key(id),
            });
        }
        self.registry.write(id, value.into());
        Ok(())
    }

    /// Read one of this driver's fields.
    pub fn read(&self, field: &str) -> Result<Scalar> {
        Ok(self.registry.read(self.field(field)?))
    }

    // -- Own events -----------------------------------------------------------

    /// Resolve one of this driver's events.
    pub fn event(&self, event: &str) -> Result<EventId> {
        self.registry.event_id(self.driver, event)
    }

    pub fn is_set(&self, event: &str) -> Result<bool> {
        Ok(self.registry.is_set(self.event(event)?))
    }

    pub fn set_event(&self, event: &str) -> Result<()> {
        self.registry.set(self.event(event)?);
        Ok(())
    }

    pub fn clear_event(&self, event: &str) -> Result<()> {
        self.registry.clear(self.event(event)?);
        Ok(())
    }

    /// If `event` is raised, lower it and return `true`.
    pub fn take_event(&self, event: &str) -> Result<bool> {
        let id = self.event(event)?;
        let was_set = self.registry.is_set(id);
        if was_set {
            self.registry.clear(id);
        }
        Ok(was_set)
    }

    // -- Other drivers --------------------------------------------------------

    /// Raise another driver's event by `"Driver.EVENT"` key.
    pub fn signal(&self, key: &str) -> Result<()> {
        self.registry.set(self.registry.resolve_event(key)?);
        Ok(())
    }

    /// If another driver's `"Driver.EVENT"` is raised, lower it and return
    /// `true`.  Used by the worker that services the event.
    pub fn consume(&self, key: &str) -> Result<bool> {
        let id = self.registry.resolve_event(key)?;
        let was_set = self.registry.is_set(id);
        if was_set {
            self.registry.clear(id);
        }
        Ok(was_set)
    }

    /// Read another driver's field by `"Driver.field"` key.
    pub fn read_key(&self, key: &str) -> Result<Scalar> {
        self.registry.read_key(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
