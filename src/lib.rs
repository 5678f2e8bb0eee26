//! Supervisor for a small fleet of local long-running services.
//!
//! [`Supervisor`] launches each configured executable, watches it through a
//! per-process monitor thread, and publishes every status transition on a
//! [`StatusBus`]. Frontends (the `procwarden` CLI, a UI) only talk to those
//! two types.

pub mod bus;
pub mod config;
pub mod error;
pub mod policy;
pub mod process;
pub mod status;
pub mod supervisor;

mod monitor;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use bus::{ObserverId, StatusBus, StatusObserver, Subscription};
pub use config::{ServiceConfig, ServiceSpec, SupervisorSettings};
pub use error::{ConfigError, SupervisorError};
pub use policy::AutoRestarter;
pub use status::{Crash, CrashKind, ServiceStatus, StatusEvent};
pub use supervisor::{BatchReport, ServiceSnapshot, StartOutcome, StopOutcome, Supervisor};

/// Lock, ignoring poisoning.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
