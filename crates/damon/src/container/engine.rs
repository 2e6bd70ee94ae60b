//! Container construction and runtime protocol.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::resources;
use crate::win32::job::{
    CpuRateControl, ExtendedLimits, JobObject, NotificationLimits, RateTolerance,
};
use crate::win32::job_info::{
    JobMsgCode, mhz_to_cpu_rate, mhz_to_weight, RateControlTolerance,
    RateControlToleranceInterval,
};
use crate::win32::process::{ChildProcess, EXIT_STATUS_ERROR, ProcessCommand};
use crate::win32::token::{Token, TokenRestrictions};

use super::{
    classify, Config, ContainerError, CpuTotals, ExitResult, IoStats, LimitViolation,
    MemoryStats, ProcessSignal, ProcessStats,
};

/// Cadence of the stats poller.
const STATS_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Dequeue timeout of the violation poller; bounds how long a completed
/// container keeps its poller alive.
const NOTIFICATION_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep inserted after consecutive notification-poll failures.
const NOTIFICATION_POLL_BACKOFF: Duration = Duration::from_millis(500);

/// A child process contained in a job object.
///
/// The job-object handle lives exactly as long as this value; closing it is
/// the authoritative kill switch for everything still inside the job.
#[derive(Debug)]
pub struct Container {
    name: String,
    pid: u32,
    start_time: Instant,
    started_at: DateTime<Utc>,
    job: JobObject,
    process: ChildProcess,
    token: Token,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    result: OnceLock<ExitResult>,
}

impl Container {
    /// Start `cmd` contained under `cfg`.
    ///
    /// The construction ladder: create the job and its completion port,
    /// acquire (and optionally restrict) the token, spawn the child
    /// suspended in a new process group, assign it to the job, install
    /// extended and CPU limits, resume, and start the reaper. A failure at
    /// any rung kills the child if it was spawned and closes every handle
    /// acquired so far.
    ///
    /// Must be called from within a tokio runtime; the reaper runs on the
    /// blocking pool.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before any resource is acquired, or
    /// the failing kernel operation afterwards.
    pub fn run(cmd: ProcessCommand, cfg: &Config) -> Result<Arc<Self>, ContainerError> {
        cfg.validate()?;

        let job = JobObject::create(&cfg.name)?;

        let mut token = Token::current_process()?;
        if cfg.restricted_token {
            tracing::info!(container = %cfg.name, "creating restricted token");
            let restricted = token.create_restricted(&TokenRestrictions {
                disable_max_privilege: true,
                lua_token: true,
                disable_sids: vec!["BUILTIN\\Administrator".to_string()],
                ..TokenRestrictions::default()
            })?;
            if let Err(err) = token.close() {
                tracing::warn!(error = %err, "could not close process token");
            }
            token = restricted;
        }

        let process = ChildProcess::spawn(&cmd, Some(&token), true)?;
        let pid = process.pid();

        if let Err(err) = job.assign(process.handle()) {
            kill_rewind(&process);
            return Err(err.into());
        }

        let mut limits = ExtendedLimits {
            kill_on_job_close: true,
            ..ExtendedLimits::default()
        };
        if cfg.enforce_memory {
            limits.job_memory_limit = cfg.memory_limit_bytes();
        }
        if let Err(err) = job.set_extended_limits(&limits) {
            kill_rewind(&process);
            return Err(err.into());
        }

        if cfg.enforce_cpu {
            let sr = resources::get();
            let notification = NotificationLimits {
                cpu_rate: Some(RateTolerance {
                    level: RateControlTolerance::Low,
                    interval: RateControlToleranceInterval::Long,
                }),
                ..NotificationLimits::default()
            };
            if let Err(err) = job.set_notification_limits(&notification) {
                kill_rewind(&process);
                return Err(err.into());
            }
            let control = if cfg.cpu_hard_cap {
                CpuRateControl::Cap {
                    rate: mhz_to_cpu_rate(cfg.cpu_limit_mhz, sr.cpu_total_ticks),
                    hard: true,
                }
            } else {
                CpuRateControl::Weight(mhz_to_weight(cfg.cpu_limit_mhz, sr.cpu_total_ticks))
            };
            if let Err(err) = job.set_cpu_rate_control(control, true) {
                kill_rewind(&process);
                return Err(err.into());
            }
        }

        if let Err(err) = process.resume() {
            kill_rewind(&process);
            return Err(err.into());
        }

        let (done_tx, done_rx) = watch::channel(false);
        let container = Arc::new(Self {
            name: cfg.name.clone(),
            pid,
            start_time: Instant::now(),
            started_at: Utc::now(),
            job,
            process,
            token,
            done_tx,
            done_rx,
            result: OnceLock::new(),
        });
        container.spawn_reaper();
        Ok(container)
    }

    /// The job-object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The contained child's PID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Monotonic instant just after the child was resumed.
    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Wall-clock start timestamp.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(super) fn job(&self) -> &JobObject {
        &self.job
    }

    pub(super) fn token(&self) -> &Token {
        &self.token
    }

    /// A receiver that flips to `true` once the child has been reaped.
    #[must_use]
    pub fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Whether the child has been reaped.
    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.done_rx.borrow()
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let container = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let result = match container.process.wait() {
                Ok(exit_status) => {
                    tracing::info!(
                        container = %container.name,
                        pid = container.pid,
                        exit_status,
                        "process exited"
                    );
                    ExitResult {
                        exit_status,
                        error: None,
                    }
                }
                Err(err) => {
                    tracing::error!(
                        container = %container.name,
                        pid = container.pid,
                        error = %err,
                        "process wait error"
                    );
                    ExitResult {
                        exit_status: EXIT_STATUS_ERROR,
                        error: Some(err.to_string()),
                    }
                }
            };
            // result is readable strictly before done fires
            let _ = container.result.set(result);
            let _ = container.done_tx.send(true);
        });
    }

    /// Wait for the child's exit result.
    ///
    /// Cancelling detaches this waiter only; the reaper always runs to
    /// completion and the child is never killed by a cancelled wait. A
    /// second call after completion returns the same cached result.
    ///
    /// # Errors
    ///
    /// [`ContainerError::Cancelled`] when `cancel` fires first.
    pub async fn wait_for_result(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ExitResult, ContainerError> {
        let mut done = self.done_rx.clone();
        tokio::select! {
            () = cancel.cancelled() => Err(ContainerError::Cancelled),
            changed = done.wait_for(|done| *done) => {
                changed.map_err(|_| {
                    ContainerError::Internal("reaper disappeared".to_string())
                })?;
                Ok(self.cached_result())
            }
        }
    }

    fn cached_result(&self) -> ExitResult {
        self.result
            .get()
            .cloned()
            .unwrap_or_else(|| ExitResult {
                exit_status: EXIT_STATUS_ERROR,
                error: Some("exit result missing".to_string()),
            })
    }

    /// Attempt graceful termination: ctrl-break the process group, wait up
    /// to `timeout`, then kill. Idempotent once the child has been reaped.
    ///
    /// # Errors
    ///
    /// Surfaces a kill failure on a child that is still running.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ContainerError> {
        tracing::info!(container = %self.name, pid = self.pid, "shutdown triggered");
        if self.is_done() {
            return Ok(());
        }
        if let Err(err) = self.process.send_console_break() {
            tracing::warn!(
                container = %self.name,
                error = %err,
                "console break not delivered, killing"
            );
            self.kill()?;
        } else {
            let mut done = self.done_rx.clone();
            tokio::select! {
                _ = done.wait_for(|done| *done) => return Ok(()),
                () = tokio::time::sleep(timeout) => {
                    tracing::info!(
                        container = %self.name,
                        pid = self.pid,
                        "graceful shutdown timed out, killing"
                    );
                    self.kill()?;
                }
            }
        }
        let mut done = self.done_rx.clone();
        let _ = done.wait_for(|done| *done).await;
        Ok(())
    }

    /// Deliver a signal-like event to the child.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of the underlying delivery.
    pub fn signal(&self, signal: ProcessSignal) -> Result<(), ContainerError> {
        match signal {
            ProcessSignal::Interrupt => self.process.send_console_break().map_err(Into::into),
            ProcessSignal::Kill => self.kill(),
        }
    }

    /// Forcibly terminate the child. Settled children are not an error.
    ///
    /// # Errors
    ///
    /// Surfaces a kill failure on a child that is still running.
    pub fn kill(&self) -> Result<(), ContainerError> {
        if self.is_done() {
            return Ok(());
        }
        match self.process.kill() {
            Ok(()) => Ok(()),
            // lost the race against exit
            Err(_) if self.is_done() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Sample the job and process counters once.
    ///
    /// # Errors
    ///
    /// Surfaces accounting or memory-info query failures.
    pub fn sample_stats(&self) -> Result<ProcessStats, ContainerError> {
        let accounting = self.job.query_accounting()?;
        let memory = self.process.memory_info()?;
        let run_time = self.start_time.elapsed();
        let cores = resources::get().cpu_cores as u32;
        Ok(ProcessStats {
            cpu: CpuTotals {
                total_run_time: run_time,
                total_cpu_time: run_time * cores,
                total_kernel_time: accounting.basic.total_kernel_time,
                total_user_time: accounting.basic.total_user_time,
            },
            memory: MemoryStats {
                working_set_size_bytes: memory.working_set_size,
                peak_working_set_size_bytes: memory.peak_working_set_size,
                private_usage_bytes: memory.private_usage,
                peak_pagefile_usage_bytes: memory.peak_pagefile_usage,
                paged_pool_usage_bytes: memory.quota_paged_pool_usage,
                peak_paged_pool_usage_bytes: memory.quota_peak_paged_pool_usage,
                non_paged_pool_usage_bytes: memory.quota_non_paged_pool_usage,
                peak_non_paged_pool_usage_bytes: memory.quota_peak_non_paged_pool_usage,
                page_fault_count: u64::from(memory.page_fault_count),
            },
            io: IoStats {
                total_operations: accounting.io.read_operation_count
                    + accounting.io.write_operation_count
                    + accounting.io.other_operation_count,
                read_operations: accounting.io.read_operation_count,
                write_operations: accounting.io.write_operation_count,
                other_operations: accounting.io.other_operation_count,
                total_transfer_bytes: accounting.io.read_transfer_count
                    + accounting.io.write_transfer_count
                    + accounting.io.other_transfer_count,
                read_bytes: accounting.io.read_transfer_count,
                written_bytes: accounting.io.write_transfer_count,
                other_bytes: accounting.io.other_transfer_count,
            },
        })
    }

    /// Feed `on_stats` with a counter sample every poll interval until the
    /// child has been reaped. Transient sampling failures are logged and
    /// retried.
    pub fn poll_stats<F>(self: &Arc<Self>, on_stats: F)
    where
        F: Fn(ProcessStats) + Send + Sync + 'static,
    {
        let container = Arc::clone(self);
        tokio::spawn(async move {
            let mut done = container.done_rx.clone();
            loop {
                tokio::select! {
                    _ = done.wait_for(|done| *done) => return,
                    () = tokio::time::sleep(STATS_POLL_INTERVAL) => {}
                }
                let sampler = Arc::clone(&container);
                match tokio::task::spawn_blocking(move || sampler.sample_stats()).await {
                    Ok(Ok(stats)) => on_stats(stats),
                    Ok(Err(err)) => {
                        tracing::error!(
                            container = %container.name,
                            error = %err,
                            "stats poll error"
                        );
                    }
                    Err(_) => return,
                }
            }
        });
    }

    /// Feed `on_violation` with every decoded limit violation until the
    /// child has been reaped.
    ///
    /// The dequeue blocks on the completion port with a bounded timeout and
    /// re-checks the done signal between iterations; consecutive failures
    /// back off briefly instead of spinning.
    pub fn poll_violations<F>(self: &Arc<Self>, on_violation: F)
    where
        F: Fn(LimitViolation) + Send + Sync + 'static,
    {
        let container = Arc::clone(self);
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                if container.is_done() {
                    return;
                }
                let poller = Arc::clone(&container);
                let polled = tokio::task::spawn_blocking(move || {
                    poller.job.poll_notification(Some(NOTIFICATION_POLL_TIMEOUT))
                })
                .await;
                match polled {
                    Ok(Ok(Some(notification))) => {
                        failures = 0;
                        if notification.code == JobMsgCode::NotificationLimit {
                            if let Some(record) = notification.violation {
                                for violation in classify(&record) {
                                    on_violation(violation);
                                }
                            }
                        }
                    }
                    Ok(Ok(None)) => failures = 0,
                    Ok(Err(err)) => {
                        failures += 1;
                        tracing::error!(
                            container = %container.name,
                            error = %err,
                            failures,
                            "poll notifications error"
                        );
                        if failures > 1 {
                            tokio::time::sleep(NOTIFICATION_POLL_BACKOFF).await;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
    }
}

fn kill_rewind(process: &ChildProcess) {
    if let Err(err) = process.kill() {
        tracing::error!(
            pid = process.pid(),
            error = %err,
            "unable to kill child process during rewind"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::win32::process::Stdio;

    fn cmd(args: &str) -> ProcessCommand {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), args.to_string()];
        cmd.stdout = Stdio::Null;
        cmd.stderr = Stdio::Null;
        cmd
    }

    fn config(name: &str) -> Config {
        Config {
            name: format!("damon-test:{name}"),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_happy_path_exit_zero() {
        let container = Container::run(cmd("exit 0"), &config("happy")).expect("run");
        assert!(container.pid() > 0);
        let cancel = CancellationToken::new();
        let result = container.wait_for_result(&cancel).await.expect("wait");
        assert_eq!(result.exit_status, 0);
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_wait_returns_same_result_twice() {
        let container = Container::run(cmd("exit 3"), &config("repeat")).expect("run");
        let cancel = CancellationToken::new();
        let first = container.wait_for_result(&cancel).await.expect("wait");
        let second = container.wait_for_result(&cancel).await.expect("wait again");
        assert_eq!(first, second);
        assert_eq!(first.exit_status, 3);
    }

    #[tokio::test]
    async fn test_cancelled_wait_does_not_kill() {
        let container =
            Container::run(cmd("ping -n 10 127.0.0.1 > NUL"), &config("cancel")).expect("run");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = container.wait_for_result(&cancel).await.unwrap_err();
        assert!(matches!(err, ContainerError::Cancelled));
        assert!(!container.is_done());
        container.shutdown(Duration::from_millis(100)).await.expect("shutdown");
    }

    #[tokio::test]
    async fn test_low_cpu_limit_fails_before_spawn() {
        let cfg = Config {
            enforce_cpu: true,
            cpu_limit_mhz: 99,
            ..config("low-cpu")
        };
        let err = Container::run(cmd("exit 0"), &cfg).unwrap_err();
        assert!(matches!(err, ContainerError::Config(_)));
    }

    #[tokio::test]
    async fn test_memory_cap_zero_constructs() {
        let cfg = Config {
            enforce_memory: true,
            memory_limit_mb: 0,
            ..config("mem-zero")
        };
        let container = Container::run(cmd("exit 0"), &cfg).expect("run");
        let cancel = CancellationToken::new();
        let result = container.wait_for_result(&cancel).await.expect("wait");
        assert_eq!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let container =
            Container::run(cmd("ping -n 30 127.0.0.1 > NUL"), &config("idem")).expect("run");
        container.shutdown(Duration::from_millis(200)).await.expect("first");
        container.shutdown(Duration::from_millis(200)).await.expect("second");
        assert!(container.is_done());
    }

    #[tokio::test]
    async fn test_uncooperative_child_is_killed_nonzero() {
        let container =
            Container::run(cmd("ping -n 60 127.0.0.1 > NUL"), &config("stubborn")).expect("run");
        container.shutdown(Duration::from_millis(300)).await.expect("shutdown");
        let cancel = CancellationToken::new();
        let result = container.wait_for_result(&cancel).await.expect("wait");
        assert_ne!(result.exit_status, 0);
    }

    #[tokio::test]
    async fn test_memory_hog_is_contained() {
        let cfg = Config {
            enforce_memory: true,
            memory_limit_mb: 16,
            ..config("mem-hog")
        };
        // powershell allocating 64 MiB trips the kernel cap
        let mut hog = ProcessCommand::new("powershell.exe");
        hog.args = vec![
            "-NoProfile".to_string(),
            "-Command".to_string(),
            "$x = New-Object byte[] (64MB); exit 0".to_string(),
        ];
        let container = Container::run(hog, &cfg).expect("run");
        let cancel = CancellationToken::new();
        let result = tokio::time::timeout(
            Duration::from_secs(60),
            container.wait_for_result(&cancel),
        )
        .await
        .expect("bounded wait")
        .expect("wait");
        assert_ne!(result.exit_status, 0);
    }
}
