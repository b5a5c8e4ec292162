//! Shared registry of per-driver data cells and event flags.
//!
//! The registry is the only state shared between the supervisor and the
//! workers.  Its *shape* (which drivers exist, which fields and events each
//! one has) is fixed when the [`RegistryBuilder`] is consumed; only the
//! *values* change afterwards.  That split keeps every access on the hot path
//! wait-free:
//!
//! - a data cell is a single [`AtomicU64`] holding the bit pattern of a
//!   [`Scalar`] whose kind was fixed at registration, so a reader observes
//!   either the previous or the new value, never a torn one;
//! - an event flag is a single [`AtomicBool`] with `set`, `clear` and
//!   `is_set`.
//!
//! Names are resolved once into typed identifiers ([`DriverId`],
//! [`FieldId`], [`EventId`]).  String lookups use the `"Driver.Name"` form and
//! fail with a typed [`KernelError`] for anything unregistered.
//!
//! # Example
//!
//! ```rust
//! # use smartbin_kernel::driver::DriverDescriptor;
//! # use smartbin_kernel::registry::{Scalar, SharedRegistry};
//! let scale = DriverDescriptor::new("Scale")
//!     .with_field("weight", Scalar::Float(0.0))
//!     .with_event("WEIGHT_CHANGE");
//!
//! let mut builder = SharedRegistry::builder();
//! builder.register(&scale).unwrap();
//! let registry = builder.build();
//!
//! let event = registry.resolve_event("Scale.WEIGHT_CHANGE").unwrap();
//! registry.set(event);
//! assert!(registry.is_set(event));
//! assert!(registry.resolve_event("Scale.LID_OPENED").is_err());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::driver::DriverDescriptor;
use crate::error::{KernelError, Result};

/// Data field every driver slice carries.  The worker writes `1` once
/// `initialize()` succeeds and `0` when it fails.
pub const INITIALIZED_FIELD: &str = "initialized";

// ---------------------------------------------------------------------------
// Scalars
// ---------------------------------------------------------------------------

/// A single registry value.
///
/// Serialized as a bare JSON bool or number.  JSON has no NaN or infinity,
/// so non-finite floats are written as the strings `"NaN"`, `"inf"` and
/// `"-inf"`; `null` reads back as NaN.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

/// The kind of a data cell, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarKind {
    Bool,
    Int,
    Float,
}

impl Scalar {
    /// Kind of this value.
    pub fn kind(&self) -> ScalarKind {
        match self {
            Self::Bool(_) => ScalarKind::Bool,
            Self::Int(_) => ScalarKind::Int,
            Self::Float(_) => ScalarKind::Float,
        }
    }

    /// Numeric view of the value.
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    /// Integer view of the value; floats are truncated toward zero.
    pub fn as_i64(&self) -> i64 {
        match *self {
            Self::Bool(b) => i64::from(b),
            Self::Int(i) => i,
            Self::Float(f) => f as i64,
        }
    }

    /// Truthiness: anything non-zero is `true`.
    pub fn as_bool(&self) -> bool {
        match *self {
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Float(f) => f != 0.0,
        }
    }

    /// Convert to the given kind.
    pub fn coerce(self, kind: ScalarKind) -> Self {
        match kind {
            ScalarKind::Bool => Self::Bool(self.as_bool()),
            ScalarKind::Int => Self::Int(self.as_i64()),
            ScalarKind::Float => Self::Float(self.as_f64()),
        }
    }

    fn to_bits(self, kind: ScalarKind) -> u64 {
        match self.coerce(kind) {
            Self::Bool(b) => u64::from(b),
            Self::Int(i) => i as u64,
            Self::Float(f) => f.to_bits(),
        }
    }

    fn from_bits(kind: ScalarKind, bits: u64) -> Self {
        match kind {
            ScalarKind::Bool => Self::Bool(bits != 0),
            ScalarKind::Int => Self::Int(bits as i64),
            ScalarKind::Float => Self::Float(f64::from_bits(bits)),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
        }
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match *self {
            Self::Bool(b) => serializer.serialize_bool(b),
            Self::Int(i) => serializer.serialize_i64(i),
            Self::Float(f) if f.is_finite() => serializer.serialize_f64(f),
            Self::Float(f) if f.is_nan() => serializer.serialize_str("NaN"),
            Self::Float(f) if f > 0.0 => serializer.serialize_str("inf"),
            Self::Float(_) => serializer.serialize_str("-inf"),
        }
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a bool, a number, \"NaN\", \"inf\", \"-inf\" or null")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Int(i64::try_from(v).unwrap_or(i64::MAX)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Scalar, E> {
        match v.to_ascii_lowercase().as_str() {
            "nan" => Ok(Scalar::Float(f64::NAN)),
            "inf" | "+inf" | "infinity" => Ok(Scalar::Float(f64::INFINITY)),
            "-inf" | "-infinity" => Ok(Scalar::Float(f64::NEG_INFINITY)),
            other => other
                .parse::<f64>()
                .map(Scalar::Float)
                .map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self)),
        }
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Float(f64::NAN))
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Scalar, E> {
        Ok(Scalar::Float(f64::NAN))
    }
}

impl From<bool> for Scalar {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for Scalar {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for Scalar {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for Scalar {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for Scalar {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Index of a registered driver, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriverId(usize);

impl DriverId {
    /// Position of the driver in registration order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A resolved data cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId {
    driver: DriverId,
    slot: usize,
}

impl FieldId {
    /// Driver owning the field.
    pub fn driver(self) -> DriverId {
        self.driver
    }
}

/// A resolved event flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    driver: DriverId,
    slot: usize,
}

impl EventId {
    /// Driver owning the event.
    pub fn driver(self) -> DriverId {
        self.driver
    }
}

/// Split a `"Driver.Name"` key into its two halves.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    match key.split_once('.') {
        Some((driver, name)) if !driver.is_empty() && !name.is_empty() => Ok((driver, name)),
        _ => Err(KernelError::MalformedKey {
            key: key.to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

struct DataCell {
    name: String,
    kind: ScalarKind,
    bits: AtomicU64,
}

struct EventCell {
    name: String,
    flag: AtomicBool,
}

struct DriverSlot {
    name: String,
    fields: Vec<DataCell>,
    field_index: HashMap<String, usize>,
    events: Vec<EventCell>,
    event_index: HashMap<String, usize>,
}

struct RegistryInner {
    slots: Vec<DriverSlot>,
    index: HashMap<String, DriverId>,
}

/// Collects driver descriptors and freezes them into a [`SharedRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    slots: Vec<DriverSlot>,
    index: HashMap<String, DriverId>,
}

impl RegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-allocate the slice for one driver.
    ///
    /// The slice always contains an [`INITIALIZED_FIELD`] integer cell
    /// starting at `0`, plus every described field at its initial value and
    /// every listed event in the cleared state.
    pub fn register(&mut self, descriptor: &DriverDescriptor) -> Result<DriverId> {
        if self.index.contains_key(&descriptor.name) {
            return Err(KernelError::DuplicateDriver {
                driver: descriptor.name.clone(),
            });
        }

        let id = DriverId(self.slots.len());

        let mut fields = Vec::with_capacity(descriptor.data_fields.len() + 1);
        let mut field_index = HashMap::new();
        if !descriptor.data_fields.contains_key(INITIALIZED_FIELD) {
            field_index.insert(INITIALIZED_FIELD.to_string(), 0);
            fields.push(DataCell {
                name: INITIALIZED_FIELD.to_string(),
                kind: ScalarKind::Int,
                bits: AtomicU64::new(0),
            });
        }
        for (name, initial) in &descriptor.data_fields {
            let kind = initial.kind();
            field_index.insert(name.clone(), fields.len());
            fields.push(DataCell {
                name: name.clone(),
                kind,
                bits: AtomicU64::new(initial.to_bits(kind)),
            });
        }

        let mut event_index = HashMap::new();
        let events = descriptor
            .event_names
            .iter()
            .enumerate()
            .map(|(slot, name)| {
                event_index.insert(name.clone(), slot);
                EventCell {
                    name: name.clone(),
                    flag: AtomicBool::new(false),
                }
            })
            .collect();

        tracing::debug!(
            driver = %descriptor.name,
            fields = fields.len(),
            events = descriptor.event_names.len(),
            "registry slice allocated"
        );

        self.index.insert(descriptor.name.clone(), id);
        self.slots.push(DriverSlot {
            name: descriptor.name.clone(),
            fields,
            field_index,
            events,
            event_index,
        });

        Ok(id)
    }

    /// Freeze the shape of the registry.
    pub fn build(self) -> SharedRegistry {
        SharedRegistry {
            inner: Arc::new(RegistryInner {
                slots: self.slots,
                index: self.index,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Handle to the shared registry.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`; one handle is given to
/// every worker when it is spawned.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("drivers", &self.driver_names().collect::<Vec<_>>())
            .finish()
    }
}

impl SharedRegistry {
    /// Start building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Number of registered drivers.
    pub fn driver_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Registered driver names, in registration order.
    pub fn driver_names(&self) -> impl Iterator<Item = &str> {
        self.inner.slots.iter().map(|s| s.name.as_str())
    }

    /// Look up a driver by name.
    pub fn driver_id(&self, driver: &str) -> Result<DriverId> {
        self.inner
            .index
            .get(driver)
            .copied()
            .ok_or_else(|| KernelError::UnknownDriver {
                driver: driver.to_string(),
            })
    }

    /// Name of a registered driver.
    pub fn driver_name(&self, id: DriverId) -> &str {
        &self.slot(id).name
    }

    /// Look up a field of a driver.
    pub fn field_id(&self, driver: DriverId, field: &str) -> Result<FieldId> {
        let slot = self.slot(driver);
        slot.field_index
            .get(field)
            .map(|&slot| FieldId { driver, slot })
            .ok_or_else(|| KernelError::UnknownField {
                driver: slot.name.clone(),
                field: field.to_string(),
            })
    }

    /// Look up an event of a driver.
    pub fn event_id(&self, driver: DriverId, event: &str) -> Result<EventId> {
        let slot = self.slot(driver);
        slot.event_index
            .get(event)
            .map(|&slot| EventId { driver, slot })
            .ok_or_else(|| KernelError::UnknownEvent {
                driver: slot.name.clone(),
                event: event.to_string(),
            })
    }

    /// Resolve a `"Driver.field"` key.
    pub fn resolve_field(&self, key: &str) -> Result<FieldId> {
        let (driver, field) = split_key(key)?;
        self.field_id(self.driver_id(driver)?, field)
    }

    /// Resolve a `"Driver.EVENT"` key.
    pub fn resolve_event(&self, key: &str) -> Result<EventId> {
        let (driver, event) = split_key(key)?;
        self.event_id(self.driver_id(driver)?, event)
    }

    /// `"Driver.field"` form of a field identifier.
    pub fn field_key(&self, id: FieldId) -> String {
        let slot = self.slot(id.driver);
        format!("{}.{}", slot.name, slot.fields[id.slot].name)
    }

    /// `"Driver.EVENT"` form of an event identifier.
    pub fn event_key(&self, id: EventId) -> String {
        let slot = self.slot(id.driver);
        format!("{}.{}", slot.name, slot.events[id.slot].name)
    }

    // -- Data cells -----------------------------------------------------------

    /// Read the latest value of a field.  Wait-free.
    pub fn read(&self, id: FieldId) -> Scalar {
        let cell = &self.slot(id.driver).fields[id.slot];
        Scalar::from_bits(cell.kind, cell.bits.load(Ordering::Acquire))
    }

    /// Read a field by `"Driver.field"` key.
    pub fn read_key(&self, key: &str) -> Result<Scalar> {
        Ok(self.read(self.resolve_field(key)?))
    }

    /// Overwrite a field with a single atomic store.
    ///
    /// Restricted to the crate: outside code writes through a
    /// [`DriverContext`](crate::driver::DriverContext), which only exposes the
    /// owning driver's own cells.
    pub(crate) fn write(&self, id: FieldId, value: Scalar) {
        let cell = &self.slot(id.driver).fields[id.slot];
        cell.bits.store(value.to_bits(cell.kind), Ordering::Release);
    }

    // -- Event flags ----------------------------------------------------------

    /// Raise an event flag.
    pub fn set(&self, id: EventId) {
        self.event_cell(id).flag.store(true, Ordering::Release);
    }

    /// Lower an event flag.  Clearing an already-cleared flag is a no-op.
    pub fn clear(&self, id: EventId) {
        self.event_cell(id).flag.store(false, Ordering::Release);
    }

    /// Whether an event flag is raised.  Wait-free.
    pub fn is_set(&self, id: EventId) -> bool {
        self.event_cell(id).flag.load(Ordering::Acquire)
    }

    /// Every registered event, driver by driver in registration order.
    pub fn events(&self) -> impl Iterator<Item = EventId> + '_ {
        self.inner
            .slots
            .iter()
            .enumerate()
            .flat_map(|(d, slot)| {
                (0..slot.events.len()).map(move |slot| EventId {
                    driver: DriverId(d),
                    slot,
                })
            })
    }

    /// Lower every event flag of every driver.
    pub fn clear_all_events(&self) {
        for slot in &self.inner.slots {
            for event in &slot.events {
                event.flag.store(false, Ordering::Release);
            }
        }
    }

    /// Copy every value and flag into a transport-safe tree.
    pub fn snapshot(&self) -> Snapshot {
        let mut data = BTreeMap::new();
        let mut events = BTreeMap::new();

        for slot in &self.inner.slots {
            let fields = slot
                .fields
                .iter()
                .map(|c| {
                    let value = Scalar::from_bits(c.kind, c.bits.load(Ordering::Acquire));
                    (c.name.clone(), value)
                })
                .collect();
            let flags = slot
                .events
                .iter()
                .map(|e| (e.name.clone(), e.flag.load(Ordering::Acquire)))
                .collect();
            data.insert(slot.name.clone(), fields);
            events.insert(slot.name.clone(), flags);
        }

        Snapshot {
            data,
            events,
            callbacks: BTreeMap::new(),
            taken_at: Utc::now(),
        }
    }

    fn slot(&self, id: DriverId) -> &DriverSlot {
        &self.inner.slots[id.0]
    }

    fn event_cell(&self, id: EventId) -> &EventCell {
        &self.slot(id.driver).events[id.slot]
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

/// Point-in-time copy of the whole registry.
///
/// Serializes as
/// `{"data": {driver: {field: value}}, "events": {driver: {event: bool}}, ...}`.
/// Callbacks appear by name only, keyed by `"Driver.EVENT"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub data: BTreeMap<String, BTreeMap<String, Scalar>>,
    pub events: BTreeMap<String, BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub callbacks: BTreeMap<String, String>,
    pub taken_at: DateTime<Utc>,
}

impl Snapshot {
    /// Value of a `"Driver.field"` key, if present.
    pub fn value(&self, key: &str) -> Option<Scalar> {
        let (driver, field) = split_key(key).ok()?;
        self.data.get(driver)?.get(field).copied()
    }

    /// State of a `"Driver.EVENT"` key, if present.
    pub fn event(&self, key: &str) -> Option<bool> {
        let (driver, event) = split_key(key).ok()?;
        self.events.get(driver)?.get(event).copied()
    }

    /// Render as a JSON value.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
