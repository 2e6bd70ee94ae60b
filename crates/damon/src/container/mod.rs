//! The containment engine: configuration, lifecycle, and the typed events it
//! produces.
//!
//! A [`Container`] owns a job object, the contained child process, and the
//! access token the child runs under. Construction walks a totally ordered
//! ladder of kernel resources and either returns a fully contained child or
//! rewinds without visible side effects.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::win32::Win32Error;

mod violations;
pub use violations::classify;

#[cfg(windows)]
mod engine;
#[cfg(windows)]
mod exec;
#[cfg(windows)]
pub use engine::Container;
#[cfg(windows)]
pub use exec::{ExecConfig, ExecTask};
#[cfg(windows)]
pub use crate::win32::process::ProcessCommand;

/// Bytes per MiB.
pub const MB_TO_BYTES: u64 = 1024 * 1024;

/// Smallest CPU budget a container may enforce.
pub const MINIMUM_CPU_MHZ: u64 = 100;

/// Default grace period before a shutdown escalates to kill.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Container construction parameters.
#[derive(Debug, Clone)]
pub struct Config {
    /// Job-object name; empty creates an anonymous job.
    pub name: String,
    /// Install a kernel CPU-rate cap.
    pub enforce_cpu: bool,
    /// Install a committed-memory cap.
    pub enforce_memory: bool,
    /// Run the child under a restricted token.
    pub restricted_token: bool,
    /// Committed-memory cap in MiB. Going over makes the child's
    /// allocations fail. Zero installs no cap even when enforcement is on.
    pub memory_limit_mb: u64,
    /// CPU budget in MHz; must be at least [`MINIMUM_CPU_MHZ`] when
    /// enforcement is on.
    pub cpu_limit_mhz: u64,
    /// Enforce the CPU budget as a hard cap; off uses a scheduling weight.
    pub cpu_hard_cap: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: String::new(),
            enforce_cpu: false,
            enforce_memory: false,
            restricted_token: false,
            memory_limit_mb: 0,
            cpu_limit_mhz: 0,
            cpu_hard_cap: true,
        }
    }
}

impl Config {
    /// Check the construction invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Config`] when CPU enforcement is requested
    /// with a budget below [`MINIMUM_CPU_MHZ`].
    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.enforce_cpu && self.cpu_limit_mhz < MINIMUM_CPU_MHZ {
            return Err(ContainerError::Config(format!(
                "cpu limit is too low: minimum is {MINIMUM_CPU_MHZ} MHz, got {}",
                self.cpu_limit_mhz
            )));
        }
        Ok(())
    }

    /// The memory cap in bytes.
    #[must_use]
    pub const fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * MB_TO_BYTES
    }
}

/// Containment errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// A configuration invariant failed before any resource was acquired.
    #[error("container config: {0}")]
    Config(String),

    /// A kernel call failed; acquired resources were rewound.
    #[error(transparent)]
    Win32(#[from] Win32Error),

    /// The caller's wait was cancelled. The child keeps running.
    #[error("wait cancelled")]
    Cancelled,

    /// An internal worker disappeared without reporting.
    #[error("internal: {0}")]
    Internal(String),
}

/// The child's final fate, cached once the reaper completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitResult {
    /// The child's exit status; reserved values mark supervisor-side
    /// failures.
    pub exit_status: i32,
    /// Description of a wait failure, when the status is synthetic.
    pub error: Option<String>,
}

/// A signal-like event deliverable to a contained process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// Console ctrl-break to the process group.
    Interrupt,
    /// Immediate termination.
    Kill,
}

impl FromStr for ProcessSignal {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.to_uppercase();
        match name.strip_prefix("SIG").unwrap_or(&name) {
            "INT" | "BREAK" => Ok(Self::Interrupt),
            "KILL" | "TERM" => Ok(Self::Kill),
            other => Err(format!("unsupported signal: {other}")),
        }
    }
}

/// Violation categories surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ViolationKind {
    /// CPU-rate or job-time excursion.
    Cpu,
    /// Committed-memory threshold crossed.
    Memory,
    /// IO or network threshold crossed.
    Io,
}

impl std::fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("CPU"),
            Self::Memory => f.write_str("Memory"),
            Self::Io => f.write_str("IO"),
        }
    }
}

/// One decoded limit violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitViolation {
    /// Violation category.
    pub kind: ViolationKind,
    /// The counter the kernel measured.
    pub measured: u64,
    /// The configured threshold.
    pub limit: u64,
    /// Human-readable description.
    pub message: String,
}

/// CPU totals sampled from job accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuTotals {
    /// Wall-clock time since the child was resumed.
    pub total_run_time: Duration,
    /// Available CPU time: run time x cores.
    pub total_cpu_time: Duration,
    /// Kernel-mode time consumed by the job.
    pub total_kernel_time: Duration,
    /// User-mode time consumed by the job.
    pub total_user_time: Duration,
}

/// Memory counters sampled from the child process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct MemoryStats {
    pub working_set_size_bytes: u64,
    pub peak_working_set_size_bytes: u64,
    pub private_usage_bytes: u64,
    pub peak_pagefile_usage_bytes: u64,
    pub paged_pool_usage_bytes: u64,
    pub peak_paged_pool_usage_bytes: u64,
    pub non_paged_pool_usage_bytes: u64,
    pub peak_non_paged_pool_usage_bytes: u64,
    pub page_fault_count: u64,
}

/// IO counters sampled from job accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct IoStats {
    pub total_operations: u64,
    pub read_operations: u64,
    pub write_operations: u64,
    pub other_operations: u64,
    pub total_transfer_bytes: u64,
    pub read_bytes: u64,
    pub written_bytes: u64,
    pub other_bytes: u64,
}

/// One periodic resource sample for a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// CPU totals.
    pub cpu: CpuTotals,
    /// Memory counters.
    pub memory: MemoryStats,
    /// IO counters.
    pub io: IoStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_low_cpu_limit() {
        let cfg = Config {
            enforce_cpu: true,
            cpu_limit_mhz: 99,
            ..Config::default()
        };
        assert!(matches!(cfg.validate(), Err(ContainerError::Config(_))));
    }

    #[test]
    fn test_validate_accepts_minimum() {
        let cfg = Config {
            enforce_cpu: true,
            cpu_limit_mhz: MINIMUM_CPU_MHZ,
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validate_ignores_cpu_limit_when_not_enforcing() {
        let cfg = Config {
            enforce_cpu: false,
            cpu_limit_mhz: 1,
            ..Config::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_memory_limit_bytes() {
        let cfg = Config {
            memory_limit_mb: 128,
            ..Config::default()
        };
        assert_eq!(cfg.memory_limit_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_signal_parsing() {
        assert_eq!("SIGINT".parse::<ProcessSignal>(), Ok(ProcessSignal::Interrupt));
        assert_eq!("int".parse::<ProcessSignal>(), Ok(ProcessSignal::Interrupt));
        assert_eq!("SIGKILL".parse::<ProcessSignal>(), Ok(ProcessSignal::Kill));
        assert_eq!("TERM".parse::<ProcessSignal>(), Ok(ProcessSignal::Kill));
        assert!("SIGUSR1".parse::<ProcessSignal>().is_err());
    }

    #[test]
    fn test_violation_kind_display() {
        assert_eq!(ViolationKind::Cpu.to_string(), "CPU");
        assert_eq!(ViolationKind::Memory.to_string(), "Memory");
        assert_eq!(ViolationKind::Io.to_string(), "IO");
    }

    #[test]
    fn test_exit_result_serde_round_trip() {
        let result = ExitResult {
            exit_status: 254,
            error: Some("wait failed".to_string()),
        };
        let json = serde_json::to_string(&result).expect("encode");
        let back: ExitResult = serde_json::from_str(&json).expect("decode");
        assert_eq!(result, back);
    }
}
