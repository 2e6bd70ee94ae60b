//! # damon-driver
//!
//! The orchestrator-facing half of damon: a thread-safe task table keyed by
//! task ID, per-task lifecycle supervision over the containment engine, and
//! streaming stats/fingerprint surfaces.
//!
//! The driver process enrolls itself into a job object with
//! kill-on-job-close before it accepts its first task, so a dying driver
//! takes every contained child with it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
mod error;
pub mod store;

pub use config::{
    Capabilities, DriverConfig, Fingerprint, HealthState, PluginInfo, TaskResources, TaskSpec,
    TaskState, TaskStatus,
};
pub use error::DriverError;
pub use store::TaskStore;

#[cfg(windows)]
mod driver;
#[cfg(windows)]
mod enroll;
#[cfg(windows)]
mod task;

#[cfg(windows)]
pub use driver::{Driver, ExecTaskResult, TaskCpuUsage, TaskMemoryUsage, TaskResourceUsage};
#[cfg(windows)]
pub use task::TaskHandle;
