//! Prometheus metrics derived from container samples and violations.
//!
//! One [`Metrics`] instance serves one container. Gauges carry the latest
//! sampled counters; the same values are folded into a [`PerfCounters`]
//! snapshot readable without blocking the sampler.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};
use tokio::sync::watch;

use crate::container::{LimitViolation, ProcessStats, ViolationKind};
use crate::stats::{CpuCollector, CpuMeasurement};

const NAMESPACE: &str = "damon";

/// Errors from metric registration or encoding.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// A metric failed to register.
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    /// Text exposition failed.
    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// One CPU counter in the snapshot: total plus derived rate.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CpuTime {
    /// Accumulated time.
    pub total: Duration,
    /// Derived rate in Hz over the last window.
    pub hz: u64,
    /// Share of available CPU time over the last window.
    pub percent: f64,
}

/// Snapshot of the latest sampled counters.
#[derive(Debug, Clone, Default, PartialEq)]
#[allow(missing_docs)]
pub struct PerfCounters {
    pub timestamp: Option<DateTime<Utc>>,
    // cpu
    pub cpu_user: CpuTime,
    pub cpu_kernel: CpuTime,
    pub cpu_total_time: Duration,
    pub cpu_violations: u64,
    // memory
    pub memory_private_usage_bytes: u64,
    pub memory_working_set_bytes: u64,
    pub memory_peak_working_set_bytes: u64,
    pub memory_peak_pagefile_usage_bytes: u64,
    pub memory_paged_pool_usage_bytes: u64,
    pub memory_peak_paged_pool_usage_bytes: u64,
    pub memory_non_paged_pool_usage_bytes: u64,
    pub memory_peak_non_paged_pool_usage_bytes: u64,
    pub memory_page_faults: u64,
    pub memory_violations: u64,
    // io
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub io_other_bytes: u64,
    pub io_total_bytes: u64,
    pub io_read_ops: u64,
    pub io_write_ops: u64,
    pub io_other_ops: u64,
    pub io_total_ops: u64,
    pub io_violations: u64,
}

/// Container metrics: Prometheus series plus the snapshot cell.
pub struct Metrics {
    registry: Registry,
    collector: CpuCollector,
    write_lock: Mutex<()>,
    perf_tx: watch::Sender<PerfCounters>,
    perf_rx: watch::Receiver<PerfCounters>,

    // cpu
    cpu_kernel_seconds: Gauge,
    cpu_user_seconds: Gauge,
    cpu_kernel_percent: Gauge,
    cpu_user_percent: Gauge,
    cpu_kernel_hz: Gauge,
    cpu_user_hz: Gauge,
    cpu_limit_hz: Gauge,
    cpu_limit_percent: Gauge,
    cpu_notifications: Counter,

    // memory
    memory_working_set: Gauge,
    memory_commit_charge: Gauge,
    memory_peak_working_set: Gauge,
    memory_peak_pagefile_usage: Gauge,
    memory_quota_paged_pool: Gauge,
    memory_quota_nonpaged_pool: Gauge,
    memory_quota_peak_paged_pool: Gauge,
    memory_quota_peak_nonpaged_pool: Gauge,
    memory_page_faults: Gauge,
    memory_limit_bytes: Gauge,
    memory_notifications: Counter,

    // io
    io_read_bytes: Gauge,
    io_write_bytes: Gauge,
    io_other_bytes: Gauge,
    io_total_bytes: Gauge,
    io_read_ops: Gauge,
    io_write_ops: Gauge,
    io_other_ops: Gauge,
    io_total_ops: Gauge,
    io_notifications: Counter,
}

fn gauge(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
    labels: &HashMap<String, String>,
) -> Result<Gauge, prometheus::Error> {
    let gauge = Gauge::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .const_labels(labels.clone()),
    )?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn counter(
    registry: &Registry,
    subsystem: &str,
    name: &str,
    help: &str,
    labels: &HashMap<String, String>,
) -> Result<Counter, prometheus::Error> {
    let counter = Counter::with_opts(
        Opts::new(name, help)
            .namespace(NAMESPACE)
            .subsystem(subsystem)
            .const_labels(labels.clone()),
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl Metrics {
    /// Build the registry for a machine with `cores` processors at
    /// `mhz_per_core`, attaching `labels` to every series.
    ///
    /// # Errors
    ///
    /// Surfaces metric registration failures.
    pub fn new(
        cores: usize,
        mhz_per_core: f64,
        labels: HashMap<String, String>,
    ) -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let (perf_tx, perf_rx) = watch::channel(PerfCounters::default());

        let metrics = Self {
            cpu_kernel_seconds: gauge(
                &registry,
                "cpu",
                "kernel_seconds",
                "The number of seconds the process spent in kernel-mode",
                &labels,
            )?,
            cpu_user_seconds: gauge(
                &registry,
                "cpu",
                "user_seconds",
                "The number of seconds the process spent in user-mode",
                &labels,
            )?,
            cpu_kernel_percent: gauge(
                &registry,
                "cpu",
                "kernel_percent",
                "Share of the total available cpu time (cores * uptime) this \
                 process executed in kernel mode",
                &labels,
            )?,
            cpu_user_percent: gauge(
                &registry,
                "cpu",
                "user_percent",
                "Share of the total available cpu time (cores * uptime) this \
                 process executed in user mode",
                &labels,
            )?,
            cpu_kernel_hz: gauge(
                &registry,
                "cpu",
                "kernel_hz",
                "Kernel-mode share converted to Hz (share * cores * hz per core)",
                &labels,
            )?,
            cpu_user_hz: gauge(
                &registry,
                "cpu",
                "user_hz",
                "User-mode share converted to Hz (share * cores * hz per core)",
                &labels,
            )?,
            cpu_limit_hz: gauge(
                &registry,
                "cpu",
                "limit_hz",
                "The configured CPU cap converted to Hz",
                &labels,
            )?,
            cpu_limit_percent: gauge(
                &registry,
                "cpu",
                "limit_percent",
                "The configured CPU cap as a share of total machine CPU time",
                &labels,
            )?,
            cpu_notifications: counter(
                &registry,
                "cpu",
                "notifications_total",
                "Total number of CPU limit exceeded notifications",
                &labels,
            )?,
            memory_working_set: gauge(
                &registry,
                "memory",
                "working_set_bytes",
                "The current working set size, in bytes",
                &labels,
            )?,
            memory_commit_charge: gauge(
                &registry,
                "memory",
                "commit_charge_bytes",
                "The total amount of memory the memory manager has committed \
                 for the process, in bytes",
                &labels,
            )?,
            memory_peak_working_set: gauge(
                &registry,
                "memory",
                "peak_working_set_bytes",
                "The peak working set size, in bytes",
                &labels,
            )?,
            memory_peak_pagefile_usage: gauge(
                &registry,
                "memory",
                "peak_pagefile_usage_bytes",
                "The peak commit charge during the lifetime of the process, in bytes",
                &labels,
            )?,
            memory_quota_paged_pool: gauge(
                &registry,
                "memory",
                "quota_paged_pool_usage",
                "The current paged pool usage, in bytes",
                &labels,
            )?,
            memory_quota_nonpaged_pool: gauge(
                &registry,
                "memory",
                "quota_nonpaged_pool_usage",
                "The current nonpaged pool usage, in bytes",
                &labels,
            )?,
            memory_quota_peak_paged_pool: gauge(
                &registry,
                "memory",
                "quota_peak_paged_pool_usage",
                "The peak paged pool usage, in bytes",
                &labels,
            )?,
            memory_quota_peak_nonpaged_pool: gauge(
                &registry,
                "memory",
                "quota_peak_nonpaged_pool_usage",
                "The peak nonpaged pool usage, in bytes",
                &labels,
            )?,
            memory_page_faults: gauge(
                &registry,
                "memory",
                "page_fault_total",
                "The number of page faults",
                &labels,
            )?,
            memory_limit_bytes: gauge(
                &registry,
                "memory",
                "limit_bytes",
                "The configured committed-memory cap, in bytes",
                &labels,
            )?,
            memory_notifications: counter(
                &registry,
                "memory",
                "notifications_total",
                "Total number of memory limit exceeded notifications",
                &labels,
            )?,
            io_read_bytes: gauge(
                &registry,
                "io",
                "read_bytes",
                "Total number of IO read bytes transferred",
                &labels,
            )?,
            io_write_bytes: gauge(
                &registry,
                "io",
                "write_bytes",
                "Total number of IO write bytes transferred",
                &labels,
            )?,
            io_other_bytes: gauge(
                &registry,
                "io",
                "other_bytes",
                "Total number of IO other bytes transferred",
                &labels,
            )?,
            io_total_bytes: gauge(
                &registry,
                "io",
                "total_bytes",
                "Total number of IO bytes transferred",
                &labels,
            )?,
            io_read_ops: gauge(
                &registry,
                "io",
                "read_operations_total",
                "Total number of read IO operations",
                &labels,
            )?,
            io_write_ops: gauge(
                &registry,
                "io",
                "write_operations_total",
                "Total number of write IO operations",
                &labels,
            )?,
            io_other_ops: gauge(
                &registry,
                "io",
                "other_operations_total",
                "Total number of other IO operations",
                &labels,
            )?,
            io_total_ops: gauge(
                &registry,
                "io",
                "operations_total",
                "Total number of IO operations",
                &labels,
            )?,
            io_notifications: counter(
                &registry,
                "io",
                "notifications_total",
                "Total number of IO limit exceeded notifications",
                &labels,
            )?,
            collector: CpuCollector::new(cores, mhz_per_core),
            write_lock: Mutex::new(()),
            perf_tx,
            perf_rx,
            registry,
        };
        Ok(metrics)
    }

    /// Publish the configured caps so scrapes can relate usage to limits.
    pub fn set_limits(&self, cpu_limit_mhz: u64, memory_limit_bytes: u64, total_ticks: f64) {
        if cpu_limit_mhz > 0 {
            self.cpu_limit_hz.set(cpu_limit_mhz as f64 * 1_000_000.0);
            if total_ticks > 0.0 {
                self.cpu_limit_percent.set(cpu_limit_mhz as f64 / total_ticks);
            }
        }
        if memory_limit_bytes > 0 {
            self.memory_limit_bytes.set(memory_limit_bytes as f64);
        }
    }

    /// Fold one counter sample into the gauges and the snapshot.
    ///
    /// When no CPU time window elapsed since the previous sample the
    /// percent and Hz series keep their previous values.
    pub fn on_stats(&self, stats: &ProcessStats) {
        let _guard = self.write_lock.lock().expect("metrics write lock poisoned");
        let sample = self.collector.sample(CpuMeasurement {
            total: stats.cpu.total_cpu_time,
            kernel: stats.cpu.total_kernel_time,
            user: stats.cpu.total_user_time,
        });

        self.cpu_kernel_seconds.set(stats.cpu.total_kernel_time.as_secs_f64());
        self.cpu_user_seconds.set(stats.cpu.total_user_time.as_secs_f64());
        if let Some(sample) = sample {
            self.cpu_kernel_percent.set(sample.kernel_percent);
            self.cpu_user_percent.set(sample.user_percent);
            self.cpu_kernel_hz.set(sample.kernel_hz as f64);
            self.cpu_user_hz.set(sample.user_hz as f64);
        }

        self.memory_working_set.set(stats.memory.working_set_size_bytes as f64);
        self.memory_commit_charge.set(stats.memory.private_usage_bytes as f64);
        self.memory_peak_working_set.set(stats.memory.peak_working_set_size_bytes as f64);
        self.memory_peak_pagefile_usage.set(stats.memory.peak_pagefile_usage_bytes as f64);
        self.memory_quota_paged_pool.set(stats.memory.paged_pool_usage_bytes as f64);
        self.memory_quota_nonpaged_pool.set(stats.memory.non_paged_pool_usage_bytes as f64);
        self.memory_quota_peak_paged_pool.set(stats.memory.peak_paged_pool_usage_bytes as f64);
        self.memory_quota_peak_nonpaged_pool
            .set(stats.memory.peak_non_paged_pool_usage_bytes as f64);
        self.memory_page_faults.set(stats.memory.page_fault_count as f64);

        self.io_read_bytes.set(stats.io.read_bytes as f64);
        self.io_write_bytes.set(stats.io.written_bytes as f64);
        self.io_other_bytes.set(stats.io.other_bytes as f64);
        self.io_total_bytes.set(stats.io.total_transfer_bytes as f64);
        self.io_read_ops.set(stats.io.read_operations as f64);
        self.io_write_ops.set(stats.io.write_operations as f64);
        self.io_other_ops.set(stats.io.other_operations as f64);
        self.io_total_ops.set(stats.io.total_operations as f64);

        self.perf_tx.send_modify(|counters| {
            counters.timestamp = Some(Utc::now());
            if let Some(sample) = sample {
                counters.cpu_kernel = CpuTime {
                    total: stats.cpu.total_kernel_time,
                    hz: sample.kernel_hz,
                    percent: sample.kernel_percent,
                };
                counters.cpu_user = CpuTime {
                    total: stats.cpu.total_user_time,
                    hz: sample.user_hz,
                    percent: sample.user_percent,
                };
            } else {
                counters.cpu_kernel.total = stats.cpu.total_kernel_time;
                counters.cpu_user.total = stats.cpu.total_user_time;
            }
            counters.cpu_total_time = stats.cpu.total_cpu_time;
            counters.memory_private_usage_bytes = stats.memory.private_usage_bytes;
            counters.memory_working_set_bytes = stats.memory.working_set_size_bytes;
            counters.memory_peak_working_set_bytes = stats.memory.peak_working_set_size_bytes;
            counters.memory_peak_pagefile_usage_bytes = stats.memory.peak_pagefile_usage_bytes;
            counters.memory_paged_pool_usage_bytes = stats.memory.paged_pool_usage_bytes;
            counters.memory_peak_paged_pool_usage_bytes = stats.memory.peak_paged_pool_usage_bytes;
            counters.memory_non_paged_pool_usage_bytes = stats.memory.non_paged_pool_usage_bytes;
            counters.memory_peak_non_paged_pool_usage_bytes =
                stats.memory.peak_non_paged_pool_usage_bytes;
            counters.memory_page_faults = stats.memory.page_fault_count;
            counters.io_read_bytes = stats.io.read_bytes;
            counters.io_write_bytes = stats.io.written_bytes;
            counters.io_other_bytes = stats.io.other_bytes;
            counters.io_total_bytes = stats.io.total_transfer_bytes;
            counters.io_read_ops = stats.io.read_operations;
            counters.io_write_ops = stats.io.write_operations;
            counters.io_other_ops = stats.io.other_operations;
            counters.io_total_ops = stats.io.total_operations;
        });
    }

    /// Count one limit violation.
    pub fn on_violation(&self, violation: &LimitViolation) {
        let _guard = self.write_lock.lock().expect("metrics write lock poisoned");
        match violation.kind {
            ViolationKind::Cpu => {
                self.cpu_notifications.inc();
                self.perf_tx.send_modify(|c| c.cpu_violations += 1);
            }
            ViolationKind::Memory => {
                self.memory_notifications.inc();
                self.perf_tx.send_modify(|c| c.memory_violations += 1);
            }
            ViolationKind::Io => {
                self.io_notifications.inc();
                self.perf_tx.send_modify(|c| c.io_violations += 1);
            }
        }
    }

    /// The latest counter snapshot, read without blocking the sampler.
    #[must_use]
    pub fn perf_counters(&self) -> PerfCounters {
        self.perf_rx.borrow().clone()
    }

    /// The underlying registry, for serving.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Encode every series in Prometheus text format.
    ///
    /// # Errors
    ///
    /// Surfaces encoder failures.
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder
            .encode(&self.registry.gather(), &mut buf)
            .map_err(|err| MetricsError::Encoding(err.to_string()))?;
        String::from_utf8(buf).map_err(|err| MetricsError::Encoding(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{CpuTotals, IoStats, MemoryStats};

    fn sample_stats(total_secs: u64, kernel_secs: u64, user_secs: u64) -> ProcessStats {
        ProcessStats {
            cpu: CpuTotals {
                total_run_time: Duration::from_secs(total_secs / 4),
                total_cpu_time: Duration::from_secs(total_secs),
                total_kernel_time: Duration::from_secs(kernel_secs),
                total_user_time: Duration::from_secs(user_secs),
            },
            memory: MemoryStats {
                working_set_size_bytes: 10 << 20,
                peak_working_set_size_bytes: 12 << 20,
                private_usage_bytes: 8 << 20,
                page_fault_count: 42,
                ..MemoryStats::default()
            },
            io: IoStats {
                read_operations: 5,
                write_operations: 3,
                other_operations: 2,
                total_operations: 10,
                read_bytes: 1000,
                written_bytes: 2000,
                other_bytes: 30,
                total_transfer_bytes: 3030,
                ..IoStats::default()
            },
        }
    }

    fn metrics() -> Metrics {
        Metrics::new(4, 2400.0, HashMap::new()).expect("metrics")
    }

    #[test]
    fn test_all_series_registered() {
        let m = metrics();
        m.on_stats(&sample_stats(40, 1, 3));
        m.on_violation(&LimitViolation {
            kind: ViolationKind::Cpu,
            measured: 1,
            limit: 1,
            message: String::new(),
        });
        m.set_limits(2048, 128 << 20, 9600.0);
        let text = m.encode_text().expect("encode");
        for name in [
            "damon_cpu_kernel_seconds",
            "damon_cpu_user_seconds",
            "damon_cpu_kernel_percent",
            "damon_cpu_user_percent",
            "damon_cpu_kernel_hz",
            "damon_cpu_user_hz",
            "damon_cpu_limit_hz",
            "damon_cpu_limit_percent",
            "damon_cpu_notifications_total",
            "damon_memory_working_set_bytes",
            "damon_memory_commit_charge_bytes",
            "damon_memory_peak_working_set_bytes",
            "damon_memory_peak_pagefile_usage_bytes",
            "damon_memory_quota_paged_pool_usage",
            "damon_memory_quota_nonpaged_pool_usage",
            "damon_memory_quota_peak_paged_pool_usage",
            "damon_memory_quota_peak_nonpaged_pool_usage",
            "damon_memory_page_fault_total",
            "damon_memory_limit_bytes",
            "damon_memory_notifications_total",
            "damon_io_read_bytes",
            "damon_io_write_bytes",
            "damon_io_other_bytes",
            "damon_io_total_bytes",
            "damon_io_read_operations_total",
            "damon_io_write_operations_total",
            "damon_io_other_operations_total",
            "damon_io_operations_total",
            "damon_io_notifications_total",
        ] {
            assert!(text.contains(name), "missing series {name}");
        }
    }

    #[test]
    fn test_snapshot_follows_samples() {
        let m = metrics();
        m.on_stats(&sample_stats(40, 1, 3));
        let counters = m.perf_counters();
        assert!(counters.timestamp.is_some());
        assert_eq!(counters.cpu_kernel.total, Duration::from_secs(1));
        assert_eq!(counters.cpu_user.total, Duration::from_secs(3));
        assert_eq!(counters.memory_working_set_bytes, 10 << 20);
        assert_eq!(counters.io_total_ops, 10);
        assert!((counters.cpu_kernel.percent - 0.025).abs() < 1e-9);
    }

    #[test]
    fn test_zero_window_keeps_previous_rates() {
        let m = metrics();
        m.on_stats(&sample_stats(40, 1, 3));
        let before = m.perf_counters();
        // same totals: no CPU window elapsed
        m.on_stats(&sample_stats(40, 1, 3));
        let after = m.perf_counters();
        assert_eq!(before.cpu_kernel.percent, after.cpu_kernel.percent);
        assert_eq!(before.cpu_user.hz, after.cpu_user.hz);
    }

    #[test]
    fn test_violations_count_by_kind() {
        let m = metrics();
        for kind in [ViolationKind::Cpu, ViolationKind::Io, ViolationKind::Io] {
            m.on_violation(&LimitViolation {
                kind,
                measured: 0,
                limit: 0,
                message: String::new(),
            });
        }
        let counters = m.perf_counters();
        assert_eq!(counters.cpu_violations, 1);
        assert_eq!(counters.io_violations, 2);
        assert_eq!(counters.memory_violations, 0);
        let text = m.encode_text().expect("encode");
        assert!(text.contains("damon_io_notifications_total 2"));
    }

    #[test]
    fn test_limit_gauges() {
        let m = metrics();
        m.set_limits(2048, 128 << 20, 9600.0);
        let text = m.encode_text().expect("encode");
        assert!(text.contains("damon_cpu_limit_hz 2048000000"));
        assert!(text.contains("damon_memory_limit_bytes 134217728"));
    }
}
