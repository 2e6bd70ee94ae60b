//! Driver operations over the task store.

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use damon::container::{
    Container, ContainerError, ExecConfig, ExitResult, ProcessSignal, DEFAULT_SHUTDOWN_TIMEOUT,
};
use damon::win32::job::JobObject;
use damon::win32::process::{capture_pipe, EXIT_STATUS_ERROR, ProcessCommand, Stdio};

use crate::config::{DriverConfig, Fingerprint, HealthState, TaskSpec, TaskStatus};
use crate::store::TaskStore;
use crate::task::TaskHandle;
use crate::{enroll, DriverError};

/// Cadence of the wait-task poll loop.
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence of the fingerprint stream.
const FINGERPRINT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period applied when destroying a still-running task.
const DESTROY_GRACE: Duration = Duration::from_secs(60);

/// CPU usage block of a streamed stats record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskCpuUsage {
    /// Consumed CPU in MHz-equivalents over the last window.
    pub total_ticks: f64,
    /// Kernel-mode share over the last window.
    pub system_mode: f64,
    /// User-mode share over the last window.
    pub user_mode: f64,
    /// Combined share over the last window.
    pub percent: f64,
    /// Which fields carry measured values.
    pub measured: Vec<&'static str>,
}

/// Memory usage block of a streamed stats record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskMemoryUsage {
    /// Working-set bytes.
    pub usage: u64,
    /// Peak working-set bytes.
    pub max_usage: u64,
    /// Paged + nonpaged pool bytes.
    pub kernel_usage: u64,
    /// Peak paged + nonpaged pool bytes.
    pub kernel_max_usage: u64,
    /// Which fields carry measured values.
    pub measured: Vec<&'static str>,
}

/// One streamed resource-usage record.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskResourceUsage {
    /// Unix timestamp of the underlying sample.
    pub timestamp: i64,
    /// CPU block.
    pub cpu: TaskCpuUsage,
    /// Memory block.
    pub memory: TaskMemoryUsage,
}

/// Result of an in-container exec.
#[derive(Debug, Clone)]
pub struct ExecTaskResult {
    /// The auxiliary's exit result.
    pub exit_result: ExitResult,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

const MEASURED_CPU_STATS: [&str; 3] = ["System Mode", "User Mode", "Percent"];
const MEASURED_MEMORY_STATS: [&str; 4] =
    ["Usage", "Max Usage", "Kernel Usage", "Kernel Max Usage"];

/// The driver: task table plus lifecycle operations.
pub struct Driver {
    config: DriverConfig,
    store: TaskStore<TaskHandle>,
    shutdown: CancellationToken,
    enrollment: Mutex<Option<JobObject>>,
}

impl Driver {
    /// Build a driver and, unless configured otherwise, enroll the calling
    /// process into its own kill-on-close job object.
    ///
    /// # Errors
    ///
    /// Surfaces self-enrollment failures.
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        let enrollment = if config.self_enroll {
            Some(enroll::wrap_current_process()?)
        } else {
            None
        };
        Ok(Self {
            config,
            store: TaskStore::new(),
            shutdown: CancellationToken::new(),
            enrollment: Mutex::new(enrollment),
        })
    }

    /// Start a task and register it in the store.
    ///
    /// # Errors
    ///
    /// Refuses duplicate IDs before acquiring any resource; otherwise
    /// surfaces container construction failures.
    pub fn start_task(&self, spec: &TaskSpec) -> Result<TaskStatus, DriverError> {
        if self.store.get(&spec.id).is_some() {
            return Err(DriverError::DuplicateTask(spec.id.clone()));
        }
        tracing::info!(
            task_id = %spec.id,
            command = %spec.command,
            "starting damon task"
        );

        let cmd = self.build_command(spec)?;
        let container = Container::run(cmd, &spec.container_config())?;
        let handle = TaskHandle::new(spec.clone(), container)?;
        let status = handle.status();
        self.store.put(&spec.id, handle)?;
        Ok(status)
    }

    fn build_command(&self, spec: &TaskSpec) -> Result<ProcessCommand, DriverError> {
        let stdout = match &spec.stdout_path {
            Some(path) => Stdio::Handle(open_sink(path)?),
            None => Stdio::Null,
        };
        let stderr = match &spec.stderr_path {
            Some(path) => Stdio::Handle(open_sink(path)?),
            None => Stdio::Null,
        };
        Ok(ProcessCommand {
            program: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            dir: spec.working_dir.clone(),
            stdout,
            stderr,
        })
    }

    /// A stream that emits exactly one exit result once the task exits.
    ///
    /// The poll loop checks task state on a fixed cadence and stops on the
    /// caller's cancellation or on driver shutdown.
    ///
    /// # Errors
    ///
    /// [`DriverError::TaskNotFound`] for an unknown ID.
    pub fn wait_task(
        &self,
        id: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<ExitResult>, DriverError> {
        let handle = self.get(id)?;
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WAIT_POLL_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let status = handle.status();
                if !handle.is_running() {
                    let result = status.exit_result.unwrap_or(ExitResult {
                        exit_status: EXIT_STATUS_ERROR,
                        error: Some("task ended without a recorded result".to_string()),
                    });
                    let _ = tx.send(result).await;
                    return;
                }
            }
        });
        Ok(rx)
    }

    /// Gracefully stop a task.
    ///
    /// `signal` is accepted for interface parity; the shutdown path always
    /// raises a console break before escalating to kill.
    ///
    /// # Errors
    ///
    /// Unknown ID or container shutdown failure.
    pub async fn stop_task(
        &self,
        id: &str,
        timeout: Duration,
        signal: &str,
    ) -> Result<(), DriverError> {
        let handle = self.get(id)?;
        tracing::debug!(task_id = %id, signal, "stopping task");
        handle.shutdown(timeout).await
    }

    /// Remove a task from the store, stopping it first when forced.
    ///
    /// # Errors
    ///
    /// Refuses to destroy a running task unless `force` is set.
    pub async fn destroy_task(&self, id: &str, force: bool) -> Result<(), DriverError> {
        let handle = self.get(id)?;
        if handle.is_running() && !force {
            return Err(DriverError::StillRunning(id.to_string()));
        }
        if handle.is_running() {
            if let Err(err) = handle.shutdown(DESTROY_GRACE).await {
                tracing::error!(task_id = %id, error = %err, "failed to stop task on destroy");
            }
        }
        self.store.delete(id);
        tracing::debug!(task_id = %id, "destroyed task");
        Ok(())
    }

    /// A point-in-time task status snapshot.
    ///
    /// # Errors
    ///
    /// [`DriverError::TaskNotFound`] for an unknown ID.
    pub fn inspect_task(&self, id: &str) -> Result<TaskStatus, DriverError> {
        Ok(self.get(id)?.status())
    }

    /// A cancellable stream of resource-usage records at `interval`.
    ///
    /// Records are derived from the latest sampled counters; the stream
    /// stops on the caller's cancellation or driver shutdown.
    ///
    /// # Errors
    ///
    /// [`DriverError::TaskNotFound`] for an unknown ID.
    pub fn task_stats(
        &self,
        id: &str,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TaskResourceUsage>, DriverError> {
        let handle = self.get(id)?;
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let usage = resource_usage(&handle);
                tokio::select! {
                    () = cancel.cancelled() => return,
                    res = tx.send(usage) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    /// Deliver a signal-like event to a task.
    ///
    /// `SIGINT` and `SIGKILL` trigger the graceful shutdown path with the
    /// default grace period; other names are mapped best-effort and fall
    /// back to kill.
    ///
    /// # Errors
    ///
    /// Unknown ID or delivery failure.
    pub async fn signal_task(&self, id: &str, signal: &str) -> Result<(), DriverError> {
        let handle = self.get(id)?;
        match signal {
            "SIGINT" | "SIGKILL" => handle
                .container()
                .shutdown(DEFAULT_SHUTDOWN_TIMEOUT)
                .await
                .map_err(Into::into),
            other => {
                let parsed = other.parse::<ProcessSignal>().unwrap_or_else(|_| {
                    tracing::warn!(
                        task_id = %id,
                        signal = other,
                        "unknown signal, killing instead"
                    );
                    ProcessSignal::Kill
                });
                handle.container().signal(parsed).map_err(Into::into)
            }
        }
    }

    /// Run an auxiliary command inside a task's container, capturing its
    /// output, bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Unknown ID, exec failure, or a wait error other than the timeout
    /// itself (a timeout yields an exit result carrying the cancellation).
    pub async fn exec_task(
        &self,
        id: &str,
        argv: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecTaskResult, DriverError> {
        let handle = self.get(id)?;
        let (stdout_write, stdout_read) = capture_pipe().map_err(ContainerError::from)?;
        let (stderr_write, stderr_read) = capture_pipe().map_err(ContainerError::from)?;
        let task = handle.container().exec(ExecConfig {
            command: argv,
            dir: handle.spec().working_dir.clone(),
            env: handle.spec().env.clone(),
            stdout: Stdio::Handle(stdout_write),
            stderr: Stdio::Handle(stderr_write),
        })?;

        // drain concurrently so a chatty auxiliary cannot fill the pipe
        let stdout_task = tokio::task::spawn_blocking(move || drain(stdout_read));
        let stderr_task = tokio::task::spawn_blocking(move || drain(stderr_read));

        let cancel = CancellationToken::new();
        let deadline = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            deadline.cancel();
        });

        let exit_result = match task.wait(&cancel).await {
            Ok(exit_status) => ExitResult {
                exit_status,
                error: None,
            },
            Err(ContainerError::Cancelled) => ExitResult {
                exit_status: -1,
                error: Some("exec timed out".to_string()),
            },
            Err(err) => return Err(err.into()),
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        Ok(ExecTaskResult {
            exit_result,
            stdout,
            stderr,
        })
    }

    /// A stream of driver fingerprints: one immediately, then one per
    /// period, until cancellation or driver shutdown.
    #[must_use]
    pub fn fingerprint(&self, cancel: CancellationToken) -> mpsc::Receiver<Fingerprint> {
        let fingerprint = self.build_fingerprint();
        let shutdown = self.shutdown.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FINGERPRINT_INTERVAL);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = shutdown.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                if tx.send(fingerprint.clone()).await.is_err() {
                    return;
                }
            }
        });
        rx
    }

    fn build_fingerprint(&self) -> Fingerprint {
        let mut attributes = HashMap::new();
        attributes.insert(
            "driver.damon.version".to_string(),
            damon::version::get().number.to_string(),
        );
        attributes.insert(
            "driver.damon.enforce_cpu_limit".to_string(),
            self.config.enforce_cpu_limit.to_string(),
        );
        attributes.insert(
            "driver.damon.enforce_memory_limit".to_string(),
            self.config.enforce_memory_limit.to_string(),
        );
        attributes.insert(
            "driver.damon.restricted_token".to_string(),
            self.config.restricted_token.to_string(),
        );
        if self.config.enabled {
            Fingerprint {
                health: HealthState::Healthy,
                description: "ready".to_string(),
                attributes,
            }
        } else {
            Fingerprint {
                health: HealthState::Undetected,
                description: "disabled".to_string(),
                attributes,
            }
        }
    }

    /// The driver's global shutdown token; streams and waits observe it.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Shut the driver down: cancel every stream and close the enrollment
    /// job object. With kill-on-job-close set, closing the enrollment kills
    /// the driver process and every contained task with it.
    pub fn shutdown(&self) {
        tracing::info!("shutting down damon driver");
        self.shutdown.cancel();
        if let Some(job) = self
            .enrollment
            .lock()
            .expect("enrollment lock poisoned")
            .take()
        {
            if let Err(err) = job.close() {
                tracing::error!(error = %err, "failed to close enrollment job object");
            }
        }
    }

    fn get(&self, id: &str) -> Result<Arc<TaskHandle>, DriverError> {
        self.store
            .get(id)
            .ok_or_else(|| DriverError::TaskNotFound(id.to_string()))
    }
}

fn drain(mut reader: std::fs::File) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf) {
        tracing::warn!(error = %err, "failed to drain exec output pipe");
    }
    buf
}

fn open_sink(path: &std::path::Path) -> Result<damon::win32::OwnedHandle, DriverError> {
    use std::os::windows::io::IntoRawHandle;
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| DriverError::Config(format!("cannot open {}: {err}", path.display())))?;
    // the handle crosses into the child; ownership moves out of File
    Ok(unsafe { damon::win32::OwnedHandle::from_raw(file.into_raw_handle().cast()) })
}

fn resource_usage(handle: &Arc<TaskHandle>) -> TaskResourceUsage {
    let counters = handle.metrics().perf_counters();
    let percent = counters.cpu_kernel.percent + counters.cpu_user.percent;
    TaskResourceUsage {
        timestamp: counters
            .timestamp
            .map_or_else(|| chrono::Utc::now().timestamp(), |ts| ts.timestamp()),
        cpu: TaskCpuUsage {
            total_ticks: (counters.cpu_kernel.hz + counters.cpu_user.hz) as f64 / 1_000_000.0,
            system_mode: counters.cpu_kernel.percent,
            user_mode: counters.cpu_user.percent,
            percent,
            measured: MEASURED_CPU_STATS.to_vec(),
        },
        memory: TaskMemoryUsage {
            usage: counters.memory_working_set_bytes,
            max_usage: counters.memory_peak_working_set_bytes,
            kernel_usage: counters.memory_paged_pool_usage_bytes
                + counters.memory_non_paged_pool_usage_bytes,
            kernel_max_usage: counters.memory_peak_paged_pool_usage_bytes
                + counters.memory_peak_non_paged_pool_usage_bytes,
            measured: MEASURED_MEMORY_STATS.to_vec(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_driver() -> Driver {
        Driver::new(DriverConfig {
            self_enroll: false,
            restricted_token: false,
            ..DriverConfig::default()
        })
        .expect("driver")
    }

    fn spec(id: &str, args: &str) -> TaskSpec {
        serde_json::from_str(&format!(
            r#"{{
                "id": "{id}",
                "name": "test",
                "command": "cmd.exe",
                "args": ["/C", "{args}"],
                "enforce_cpu_limit": false,
                "enforce_memory_limit": false,
                "restricted_token": false
            }}"#
        ))
        .expect("spec")
    }

    #[tokio::test]
    async fn test_duplicate_start_task_refused() {
        let driver = test_driver();
        driver
            .start_task(&spec("t1", "ping -n 10 127.0.0.1 > NUL"))
            .expect("first start");
        let err = driver.start_task(&spec("t1", "exit 0")).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateTask(_)));
        // the first task is unaffected
        assert!(driver.inspect_task("t1").expect("inspect").pid > 0);
        driver.destroy_task("t1", true).await.expect("cleanup");
    }

    #[tokio::test]
    async fn test_wait_task_emits_one_result() {
        let driver = test_driver();
        driver.start_task(&spec("t2", "exit 5")).expect("start");
        let mut rx = driver
            .wait_task("t2", CancellationToken::new())
            .expect("wait stream");
        let result = rx.recv().await.expect("exit result");
        assert_eq!(result.exit_status, 5);
        assert!(rx.recv().await.is_none());
        driver.destroy_task("t2", false).await.expect("destroy");
    }

    #[tokio::test]
    async fn test_destroy_running_needs_force() {
        let driver = test_driver();
        driver
            .start_task(&spec("t3", "ping -n 30 127.0.0.1 > NUL"))
            .expect("start");
        let err = driver.destroy_task("t3", false).await.unwrap_err();
        assert!(matches!(err, DriverError::StillRunning(_)));
        driver.destroy_task("t3", true).await.expect("forced destroy");
        assert!(matches!(
            driver.inspect_task("t3"),
            Err(DriverError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exec_task_captures_output() {
        let driver = test_driver();
        driver
            .start_task(&spec("t4", "ping -n 30 127.0.0.1 > NUL"))
            .expect("start");
        let result = driver
            .exec_task(
                "t4",
                vec!["cmd.exe".to_string(), "/C".to_string(), "echo from-exec".to_string()],
                Duration::from_secs(30),
            )
            .await
            .expect("exec");
        assert_eq!(result.exit_result.exit_status, 0);
        assert!(String::from_utf8_lossy(&result.stdout).contains("from-exec"));
        driver.destroy_task("t4", true).await.expect("cleanup");
    }

    #[tokio::test]
    async fn test_unknown_task_operations() {
        let driver = test_driver();
        assert!(matches!(
            driver.inspect_task("nope"),
            Err(DriverError::TaskNotFound(_))
        ));
        assert!(matches!(
            driver.stop_task("nope", Duration::from_secs(1), "SIGINT").await,
            Err(DriverError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_reports_health() {
        let driver = test_driver();
        let cancel = CancellationToken::new();
        let mut rx = driver.fingerprint(cancel.clone());
        let fp = rx.recv().await.expect("fingerprint");
        assert_eq!(fp.health, HealthState::Healthy);
        assert!(fp.attributes.contains_key("driver.damon.version"));
        cancel.cancel();
    }
}
