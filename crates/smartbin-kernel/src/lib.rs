//! Smart bin supervision kernel.
//!
//! Every piece of hardware on the appliance is wrapped in a [`Driver`] and
//! hosted by its own [`Worker`] thread.  Workers share state exclusively
//! through the [`SharedRegistry`]: typed data fields that only their owner
//! writes, and boolean event flags that anyone may raise or lower.
//!
//! - **[`registry`]** -- fixed-shape shared registry with lock-free cells
//!   and `"Driver.Name"` key resolution.
//! - **[`driver`]** -- the driver contract and the per-driver
//!   [`DriverContext`].
//! - **[`worker`]** -- one thread per driver with panic containment,
//!   calibration requests and hung detection.
//! - **[`supervisor`]** -- startup, event callbacks, periodic triggers,
//!   snapshots and ordered shutdown.
//! - **[`scheduler`]** -- supervisor-local periodic triggers.
//! - **[`ipc`]** -- lifecycle notifications over [`tokio::sync::broadcast`].
//! - **[`error`]** -- kernel and driver error types via [`thiserror`].

pub mod driver;
pub mod error;
pub mod ipc;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
pub mod worker;

pub use driver::{Driver, DriverContext, DriverDescriptor, ReleaseHandle};
pub use error::{DriverError, DriverResult, KernelError, Result};
pub use ipc::{FleetBus, FleetEvent, Stamped};
pub use registry::{
    DriverId, EventId, FieldId, INITIALIZED_FIELD, Scalar, ScalarKind, SharedRegistry, Snapshot,
};
pub use scheduler::TriggerScheduler;
pub use supervisor::{EventRef, Supervisor, SupervisorConfig, TickReport};
pub use worker::{Worker, WorkerConfig, WorkerHealth};
