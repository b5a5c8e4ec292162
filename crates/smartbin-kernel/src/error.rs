//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`].  Lookups of
//! unknown drivers, fields or events are always reported through a typed
//! variant; the registry never answers an unknown key with a default value.

/// Unified error type for the smart bin supervision kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Registry errors ----------------------------------------------------
    /// A `"Driver.Name"` key was not of that shape.
    #[error("malformed registry key `{key}`: expected `Driver.Name`")]
    MalformedKey { key: String },

    /// The driver is not registered.
    #[error("unknown driver: {driver}")]
    UnknownDriver { driver: String },

    /// The driver exists but has no data field with that name.
    #[error("unknown data field `{field}` on driver `{driver}`")]
    UnknownField { driver: String, field: String },

    /// The driver exists but has no event with that name.
    #[error("unknown event `{event}` on driver `{driver}`")]
    UnknownEvent { driver: String, event: String },

    /// Two drivers were registered under the same name.
    #[error("driver registered twice: {driver}")]
    DuplicateDriver { driver: String },

    // -- Worker errors ------------------------------------------------------
    /// The OS refused to spawn the worker thread.
    #[error("failed to spawn worker for `{driver}`: {reason}")]
    WorkerSpawnFailed { driver: String, reason: String },

    // -- Supervisor errors --------------------------------------------------
    /// The supervisor has been shut down and no longer controls workers.
    #[error("supervisor is shut down")]
    SupervisorShutdown,

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Error returned by [`Driver`](crate::driver::Driver) operations.
///
/// These never cross the worker boundary: the worker logs them and keeps
/// polling.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The underlying device misbehaved or did not answer.
    #[error("hardware error: {0}")]
    Hardware(String),

    /// The driver was asked to measure before it was ready.
    #[error("driver not ready: {0}")]
    NotReady(String),

    /// A registry access from inside the driver failed.
    #[error(transparent)]
    Registry(#[from] KernelError),

    /// File or device I/O failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else a driver wants to report.
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for driver hooks.
pub type DriverResult<T = ()> = std::result::Result<T, DriverError>;
