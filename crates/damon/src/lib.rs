//! # damon
//!
//! Core library for damon - a Windows process supervisor that runs a child
//! executable inside a kernel job object with CPU-rate and committed-memory
//! caps, an optionally restricted security context, and per-job resource
//! accounting.
//!
//! ## Features
//!
//! - **Platform bindings**: Typed wrappers over the job-object, process,
//!   token, registry, and system-information surfaces of the Win32 API
//! - **Containment**: An ordered startup ladder that either yields a fully
//!   contained child or rewinds without leaking a single handle
//! - **Accounting**: Periodic job/process counter sampling and decoding of
//!   kernel limit-violation notifications into typed events
//! - **Metrics**: A Prometheus registry exposing the sampled counters
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(windows)] {
//! use damon::container::{Config, Container, ProcessCommand};
//!
//! let cfg = Config {
//!     name: "damon:example".to_string(),
//!     enforce_cpu: true,
//!     cpu_limit_mhz: 1024,
//!     enforce_memory: true,
//!     memory_limit_mb: 256,
//!     ..Config::default()
//! };
//! let cmd = ProcessCommand::new("worker.exe");
//! let container = Container::run(cmd, &cfg).expect("contained start");
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod container;
pub mod metrics;
pub mod stats;
pub mod version;
pub mod win32;

#[cfg(windows)]
pub mod resources;

pub use container::{Config, ExitResult, LimitViolation, ProcessStats, ViolationKind};
#[cfg(windows)]
pub use container::Container;
pub use metrics::Metrics;
pub use stats::{CpuCollector, CpuSample};
