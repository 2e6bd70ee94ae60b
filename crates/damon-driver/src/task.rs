//! Per-task record: container, metrics plumbing, and lifecycle state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use damon::container::{Container, ExitResult};
use damon::metrics::Metrics;
use damon::resources;

use crate::config::{TaskSpec, TaskState, TaskStatus};
use crate::DriverError;

#[derive(Debug)]
struct RunState {
    proc_state: TaskState,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    exit_result: Option<ExitResult>,
}

/// The per-task record held by the driver.
///
/// The container and metrics are shared with background workers; everything
/// mutable sits behind the per-task state lock.
pub struct TaskHandle {
    spec: TaskSpec,
    container: Arc<Container>,
    metrics: Arc<Metrics>,
    state: RwLock<RunState>,
}

impl TaskHandle {
    /// Wrap a freshly started container, wire its stats and violation
    /// streams into a metrics registry, and mark the task running.
    pub(crate) fn new(spec: TaskSpec, container: Arc<Container>) -> Result<Arc<Self>, DriverError> {
        let sr = resources::get();
        let mut labels = HashMap::new();
        labels.insert("task_id".to_string(), spec.id.clone());
        if !spec.name.is_empty() {
            labels.insert("task_name".to_string(), spec.name.clone());
        }
        let metrics = Arc::new(
            Metrics::new(sr.cpu_cores, sr.cpu_mhz_per_core, labels)
                .map_err(|err| DriverError::Metrics(err.to_string()))?,
        );
        metrics.set_limits(
            spec.effective_cpu_mhz(),
            spec.effective_memory_mb() * damon::container::MB_TO_BYTES,
            sr.cpu_total_ticks,
        );

        let stats_sink = Arc::clone(&metrics);
        container.poll_stats(move |stats| stats_sink.on_stats(&stats));
        let violation_sink = Arc::clone(&metrics);
        container.poll_violations(move |violation| {
            tracing::warn!(
                kind = %violation.kind,
                message = %violation.message,
                "limit violation"
            );
            violation_sink.on_violation(&violation);
        });

        let handle = Arc::new(Self {
            state: RwLock::new(RunState {
                proc_state: TaskState::Running,
                started_at: container.started_at(),
                completed_at: None,
                exit_result: None,
            }),
            spec,
            container,
            metrics,
        });
        handle.spawn_reaper();
        Ok(handle)
    }

    fn spawn_reaper(self: &Arc<Self>) {
        let handle = Arc::clone(self);
        tokio::spawn(async move {
            let never = CancellationToken::new();
            let result = handle.container.wait_for_result(&never).await;
            let mut state = handle.state.write().expect("task state lock poisoned");
            state.completed_at = Some(Utc::now());
            match result {
                Ok(exit) => {
                    state.proc_state = if exit.error.is_some() {
                        TaskState::Unknown
                    } else {
                        TaskState::Exited
                    };
                    state.exit_result = Some(exit);
                }
                Err(err) => {
                    tracing::error!(
                        task_id = %handle.spec.id,
                        error = %err,
                        "task reaper error"
                    );
                    state.proc_state = TaskState::Unknown;
                }
            }
        });
    }

    /// The task's start request.
    #[must_use]
    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// The underlying container.
    #[must_use]
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// The task's metrics registry.
    #[must_use]
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// A point-in-time status snapshot.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        let state = self.state.read().expect("task state lock poisoned");
        TaskStatus {
            id: self.spec.id.clone(),
            name: self.spec.name.clone(),
            state: state.proc_state,
            pid: self.container.pid(),
            started_at: state.started_at,
            completed_at: state.completed_at,
            exit_result: state.exit_result.clone(),
        }
    }

    /// Whether the task has not yet exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state
                .read()
                .expect("task state lock poisoned")
                .proc_state,
            TaskState::Starting | TaskState::Running
        )
    }

    /// Gracefully stop the task's container.
    ///
    /// # Errors
    ///
    /// Surfaces container shutdown failures.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DriverError> {
        self.container.shutdown(timeout).await.map_err(Into::into)
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.spec.id)
            .field("pid", &self.container.pid())
            .finish_non_exhaustive()
    }
}
