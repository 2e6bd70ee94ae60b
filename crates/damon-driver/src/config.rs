//! Driver and task configuration schema.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use damon::container::{Config, ExitResult};

const fn default_true() -> bool {
    true
}

/// Driver-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Whether the driver advertises itself as healthy.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Default CPU-cap enforcement for tasks.
    #[serde(default = "default_true")]
    pub enforce_cpu_limit: bool,

    /// Default memory-cap enforcement for tasks.
    #[serde(default = "default_true")]
    pub enforce_memory_limit: bool,

    /// Default restricted-token policy for tasks.
    #[serde(default = "default_true")]
    pub restricted_token: bool,

    /// Enroll the driver process into its own kill-on-close job object
    /// before the first task starts. Embedders that manage their own
    /// enrollment turn this off.
    #[serde(default = "default_true")]
    pub self_enroll: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enforce_cpu_limit: true,
            enforce_memory_limit: true,
            restricted_token: true,
            self_enroll: true,
        }
    }
}

/// The orchestrator-supplied resource allocation a task falls back to when
/// its own limits are absent.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TaskResources {
    /// Allocated CPU in MHz.
    #[serde(default)]
    pub cpu_mhz: u64,
    /// Allocated memory in MiB.
    #[serde(default)]
    pub memory_mb: u64,
}

/// One task start request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Unique task ID; doubles as the job-object name.
    pub id: String,

    /// Human-readable task name.
    #[serde(default)]
    pub name: String,

    /// Executable to run.
    pub command: String,

    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment as `KEY=VALUE` entries; empty inherits the driver's.
    #[serde(default)]
    pub env: Vec<String>,

    /// Working directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// File receiving the child's stdout; absent discards.
    #[serde(default)]
    pub stdout_path: Option<PathBuf>,

    /// File receiving the child's stderr; absent discards.
    #[serde(default)]
    pub stderr_path: Option<PathBuf>,

    /// Enforce the CPU cap.
    #[serde(default = "default_true")]
    pub enforce_cpu_limit: bool,

    /// Enforce the memory cap.
    #[serde(default = "default_true")]
    pub enforce_memory_limit: bool,

    /// Run under a restricted token.
    #[serde(default = "default_true")]
    pub restricted_token: bool,

    /// Enforce the CPU cap as a hard throttle; off schedules the job by
    /// weight instead.
    #[serde(default = "default_true")]
    pub cpu_hard_cap: bool,

    /// CPU cap in MHz; zero falls back to the resource allocation.
    #[serde(default)]
    pub cpu_limit: u64,

    /// Memory cap in MiB; zero falls back to the resource allocation.
    #[serde(default)]
    pub memory_limit: u64,

    /// Orchestrator resource allocation.
    #[serde(default)]
    pub resources: TaskResources,
}

impl TaskSpec {
    /// The effective CPU cap in MHz.
    #[must_use]
    pub const fn effective_cpu_mhz(&self) -> u64 {
        if self.cpu_limit > 0 {
            self.cpu_limit
        } else {
            self.resources.cpu_mhz
        }
    }

    /// The effective memory cap in MiB.
    #[must_use]
    pub const fn effective_memory_mb(&self) -> u64 {
        if self.memory_limit > 0 {
            self.memory_limit
        } else {
            self.resources.memory_mb
        }
    }

    /// Build the container configuration for this task.
    #[must_use]
    pub fn container_config(&self) -> Config {
        Config {
            name: self.id.clone(),
            enforce_cpu: self.enforce_cpu_limit,
            enforce_memory: self.enforce_memory_limit,
            restricted_token: self.restricted_token,
            cpu_limit_mhz: self.effective_cpu_mhz(),
            memory_limit_mb: self.effective_memory_mb(),
            cpu_hard_cap: self.cpu_hard_cap,
        }
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Container construction in progress.
    Starting,
    /// The child is running.
    Running,
    /// The child exited and its result is recorded.
    Exited,
    /// The reaper failed; the child's fate is unknown.
    Unknown,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Running => f.write_str("running"),
            Self::Exited => f.write_str("exited"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Point-in-time task status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    /// Task ID.
    pub id: String,
    /// Task name.
    pub name: String,
    /// Lifecycle state.
    pub state: TaskState,
    /// Child PID.
    pub pid: u32,
    /// When the task started.
    pub started_at: DateTime<Utc>,
    /// When the task completed, once it has.
    pub completed_at: Option<DateTime<Utc>>,
    /// The recorded exit result, once the task completed.
    pub exit_result: Option<ExitResult>,
}

/// Driver health states advertised by the fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// Ready to accept tasks.
    Healthy,
    /// Disabled by configuration.
    Undetected,
}

/// One periodic driver fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Driver health.
    pub health: HealthState,
    /// Human-readable health description.
    pub description: String,
    /// Advertised attributes.
    pub attributes: HashMap<String, String>,
}

/// What the driver can do, advertised to the orchestrator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Capabilities {
    /// Signals can be delivered to tasks.
    pub send_signals: bool,
    /// Commands can be executed inside a task's container.
    pub exec: bool,
    /// No filesystem isolation is provided.
    pub fs_isolation_none: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            send_signals: true,
            exec: true,
            fs_isolation_none: true,
        }
    }
}

/// Driver identity advertised to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Driver version.
    pub version: String,
}

impl Default for PluginInfo {
    fn default() -> Self {
        Self {
            name: "damon".to_string(),
            version: damon::version::get().number.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_spec_defaults() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{"id": "t1", "command": "worker.exe"}"#,
        )
        .expect("decode");
        assert!(spec.enforce_cpu_limit);
        assert!(spec.enforce_memory_limit);
        assert!(spec.restricted_token);
        assert!(spec.cpu_hard_cap);
        assert!(spec.args.is_empty());
        assert_eq!(spec.cpu_limit, 0);
    }

    #[test]
    fn test_command_is_required() {
        let result: Result<TaskSpec, _> = serde_json::from_str(r#"{"id": "t1"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_limit_fallback_to_resources() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{
                "id": "t1",
                "command": "worker.exe",
                "resources": {"cpu_mhz": 1500, "memory_mb": 256}
            }"#,
        )
        .expect("decode");
        assert_eq!(spec.effective_cpu_mhz(), 1500);
        assert_eq!(spec.effective_memory_mb(), 256);

        let spec: TaskSpec = serde_json::from_str(
            r#"{
                "id": "t1",
                "command": "worker.exe",
                "cpu_limit": 2048,
                "memory_limit": 128,
                "resources": {"cpu_mhz": 1500, "memory_mb": 256}
            }"#,
        )
        .expect("decode");
        assert_eq!(spec.effective_cpu_mhz(), 2048);
        assert_eq!(spec.effective_memory_mb(), 128);
    }

    #[test]
    fn test_container_config_mapping() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{
                "id": "alloc-1.main",
                "command": "worker.exe",
                "cpu_limit": 1024,
                "memory_limit": 64,
                "restricted_token": false
            }"#,
        )
        .expect("decode");
        let cfg = spec.container_config();
        assert_eq!(cfg.name, "alloc-1.main");
        assert_eq!(cfg.cpu_limit_mhz, 1024);
        assert_eq!(cfg.memory_limit_mb, 64);
        assert!(cfg.cpu_hard_cap);
        assert!(!cfg.restricted_token);
    }

    #[test]
    fn test_weight_based_cpu_control_selectable() {
        let spec: TaskSpec = serde_json::from_str(
            r#"{
                "id": "t1",
                "command": "worker.exe",
                "cpu_limit": 1024,
                "cpu_hard_cap": false
            }"#,
        )
        .expect("decode");
        assert!(!spec.cpu_hard_cap);
        assert!(!spec.container_config().cpu_hard_cap);
    }

    #[test]
    fn test_capabilities_defaults() {
        let caps = Capabilities::default();
        assert!(caps.send_signals);
        assert!(caps.exec);
        assert!(caps.fs_isolation_none);
        let info = PluginInfo::default();
        assert_eq!(info.name, "damon");
        assert!(!info.version.is_empty());
    }

    #[test]
    fn test_task_state_serialization() {
        assert_eq!(
            serde_json::to_string(&TaskState::Exited).expect("encode"),
            r#""exited""#
        );
        assert_eq!(TaskState::Unknown.to_string(), "unknown");
    }
}
