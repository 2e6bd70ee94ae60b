//! Job-object information classes as typed values.
//!
//! The kernel talks in flat `JOBOBJECT_*` structures, bitfields, and
//! 100-nanosecond ticks; this module is the typed vocabulary the rest of the
//! crate uses instead. The structures themselves are marshalled in
//! [`super::job`]; everything here is plain data and compiles on any host.

use std::fmt;
use std::time::Duration;

// JOB_OBJECT_LIMIT_* flags, winnt.h.
/// Per-job user-mode execution time limit is set.
pub const LIMIT_JOB_TIME: u32 = 0x0000_0004;
/// Committed-memory cap for the whole job (also the "high" notification
/// threshold).
pub const LIMIT_JOB_MEMORY: u32 = 0x0000_0200;
/// Low committed-memory notification threshold.
pub const LIMIT_JOB_MEMORY_LOW: u32 = 0x0000_8000;
/// All processes in the job are killed when the last job handle closes.
pub const LIMIT_KILL_ON_JOB_CLOSE: u32 = 0x0000_2000;
/// Cumulative read-byte notification threshold.
pub const LIMIT_JOB_READ_BYTES: u32 = 0x0001_0000;
/// Cumulative written-byte notification threshold.
pub const LIMIT_JOB_WRITE_BYTES: u32 = 0x0002_0000;
/// CPU rate control is installed.
pub const LIMIT_CPU_RATE_CONTROL: u32 = 0x0004_0000;
/// IO rate control is installed.
pub const LIMIT_IO_RATE_CONTROL: u32 = 0x0008_0000;
/// Network rate control is installed.
pub const LIMIT_NET_RATE_CONTROL: u32 = 0x0010_0000;

// JOB_OBJECT_CPU_RATE_CONTROL_* flags, winnt.h.
/// Rate control takes effect.
pub const CPU_RATE_CONTROL_ENABLE: u32 = 0x1;
/// The rate field is a scheduling weight, not a portion.
pub const CPU_RATE_CONTROL_WEIGHT_BASED: u32 = 0x2;
/// Throttle instead of best-effort.
pub const CPU_RATE_CONTROL_HARD_CAP: u32 = 0x4;
/// Raise completion-port messages on tolerance excursions.
pub const CPU_RATE_CONTROL_NOTIFY: u32 = 0x8;
/// The rate field packs a min/max band.
pub const CPU_RATE_CONTROL_MIN_MAX_RATE: u32 = 0x10;

/// Upper bound of the kernel's CPU rate unit (10000 = one full core's time,
/// 0.01% granularity).
pub const MAX_CPU_RATE: u32 = 10_000;
/// Lower bound of the kernel's CPU rate unit.
pub const MIN_CPU_RATE: u32 = 1;
/// Upper bound of the weight-based scheduling alternative.
pub const MAX_CPU_WEIGHT: u32 = 9;
/// Lower bound of the weight-based scheduling alternative.
pub const MIN_CPU_WEIGHT: u32 = 1;

/// Convert a MHz budget into the kernel's per-core rate unit.
///
/// `total_ticks` is the machine total (`cores * mhz_per_core`). The result
/// clamps to `[MIN_CPU_RATE, MAX_CPU_RATE]` for every positive input and is
/// `0` exactly when `mhz` is `0`.
#[must_use]
pub fn mhz_to_cpu_rate(mhz: u64, total_ticks: f64) -> u32 {
    if mhz == 0 {
        return 0;
    }
    let rate = (mhz as f64 / total_ticks * 10_000.0) as u32;
    rate.clamp(MIN_CPU_RATE, MAX_CPU_RATE)
}

/// Convert a MHz budget into a scheduling weight in `[1, 9]`.
///
/// Used when rate control runs in weight mode instead of a hard cap.
#[must_use]
pub fn mhz_to_weight(mhz: u64, total_ticks: f64) -> u32 {
    if mhz == 0 {
        return 0;
    }
    let weight = (mhz as f64 / total_ticks * f64::from(MAX_CPU_WEIGHT)) as u32;
    weight.clamp(MIN_CPU_WEIGHT, MAX_CPU_WEIGHT)
}

/// Message codes delivered on a job's completion port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum JobMsgCode {
    EndOfJobTime,
    EndOfProcessTime,
    ActiveProcessLimit,
    ActiveProcessZero,
    NewProcess,
    ExitProcess,
    AbnormalExitProcess,
    ProcessMemoryLimit,
    JobMemoryLimit,
    NotificationLimit,
    JobCycleTimeLimit,
    SiloTerminated,
}

impl JobMsgCode {
    /// Decode a raw completion-port message code.
    #[must_use]
    pub fn from_raw(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::EndOfJobTime),
            2 => Some(Self::EndOfProcessTime),
            3 => Some(Self::ActiveProcessLimit),
            4 => Some(Self::ActiveProcessZero),
            6 => Some(Self::NewProcess),
            7 => Some(Self::ExitProcess),
            8 => Some(Self::AbnormalExitProcess),
            9 => Some(Self::ProcessMemoryLimit),
            10 => Some(Self::JobMemoryLimit),
            11 => Some(Self::NotificationLimit),
            12 => Some(Self::JobCycleTimeLimit),
            13 => Some(Self::SiloTerminated),
            _ => None,
        }
    }
}

/// Soft-limit notification threshold: how far past the limit, as a share of
/// the measurement interval, before the kernel raises a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlTolerance {
    /// Exceeded more than 20% of the interval.
    Low = 1,
    /// Exceeded more than 40% of the interval.
    Medium = 2,
    /// Exceeded more than 60% of the interval.
    High = 3,
}

impl RateControlTolerance {
    /// The threshold as a percentage of the measurement interval.
    #[must_use]
    pub const fn percent(self) -> f64 {
        match self {
            Self::Low => 20.0,
            Self::Medium => 40.0,
            Self::High => 60.0,
        }
    }

    /// Decode the numeric payload of a violation record.
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Low),
            2 => Some(Self::Medium),
            3 => Some(Self::High),
            _ => None,
        }
    }
}

impl fmt::Display for RateControlTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}%", self.percent())
    }
}

/// Measurement window for soft-limit notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateControlToleranceInterval {
    /// 10 seconds.
    Short = 1,
    /// 1 minute.
    Medium = 2,
    /// 10 minutes.
    Long = 3,
}

impl RateControlToleranceInterval {
    /// The window duration.
    #[must_use]
    pub const fn duration(self) -> Duration {
        match self {
            Self::Short => Duration::from_secs(10),
            Self::Medium => Duration::from_secs(60),
            Self::Long => Duration::from_secs(600),
        }
    }
}

impl fmt::Display for RateControlToleranceInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.duration())
    }
}

/// Convert the kernel's 100ns tick counters to a [`Duration`].
#[must_use]
pub fn ticks_100ns(ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(100))
}

/// IO operation and transfer counters for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct IoCounters {
    pub read_operation_count: u64,
    pub write_operation_count: u64,
    pub other_operation_count: u64,
    pub read_transfer_count: u64,
    pub write_transfer_count: u64,
    pub other_transfer_count: u64,
}

/// Basic accounting: process time and process counts for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BasicAccounting {
    pub total_user_time: Duration,
    pub total_kernel_time: Duration,
    pub this_period_total_user_time: Duration,
    pub this_period_total_kernel_time: Duration,
    pub total_page_fault_count: u32,
    pub total_processes: u32,
    pub active_processes: u32,
    pub total_terminated_processes: u32,
}

/// Combined basic + IO accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct BasicAndIoAccounting {
    pub basic: BasicAccounting,
    pub io: IoCounters,
}

/// A limit-violation record as reported by the kernel.
///
/// `limit_flags` is the set of limits configured on the job and
/// `violation_flags` the set the kernel saw breached; only their intersection
/// is meaningful.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct LimitViolationRecord {
    pub limit_flags: u32,
    pub violation_flags: u32,
    pub io_read_bytes: u64,
    pub io_read_bytes_limit: u64,
    pub io_write_bytes: u64,
    pub io_write_bytes_limit: u64,
    pub per_job_user_time: u64,
    pub per_job_user_time_limit: u64,
    pub job_memory: u64,
    pub job_memory_limit: u64,
    pub job_low_memory_limit: u64,
    pub cpu_rate_tolerance: u32,
    pub cpu_rate_tolerance_limit: u32,
    pub io_rate_tolerance: u32,
    pub io_rate_tolerance_limit: u32,
    pub net_rate_tolerance: u32,
    pub net_rate_tolerance_limit: u32,
}

impl LimitViolationRecord {
    /// Configured-and-violated flags; the effective violation set.
    #[must_use]
    pub const fn effective_flags(&self) -> u32 {
        self.limit_flags & self.violation_flags
    }
}

/// One message dequeued from a job's completion port.
#[derive(Debug, Clone)]
pub struct JobNotification {
    /// What the kernel reported.
    pub code: JobMsgCode,
    /// PID the message concerns, when the message carries one.
    pub pid: Option<u32>,
    /// Populated for [`JobMsgCode::NotificationLimit`] messages.
    pub violation: Option<LimitViolationRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mhz_to_cpu_rate_zero() {
        assert_eq!(mhz_to_cpu_rate(0, 9600.0), 0);
    }

    #[test]
    fn test_mhz_to_cpu_rate_clamps() {
        // 4 cores * 2400 MHz
        let ticks = 9600.0;
        assert_eq!(mhz_to_cpu_rate(1, ticks), MIN_CPU_RATE);
        assert_eq!(mhz_to_cpu_rate(9600, ticks), MAX_CPU_RATE);
        assert_eq!(mhz_to_cpu_rate(1_000_000, ticks), MAX_CPU_RATE);
        // 2048 MHz of 9600 total -> 21.33% -> 2133
        assert_eq!(mhz_to_cpu_rate(2048, ticks), 2133);
    }

    #[test]
    fn test_mhz_to_weight_bounds() {
        let ticks = 9600.0;
        assert_eq!(mhz_to_weight(0, ticks), 0);
        assert_eq!(mhz_to_weight(10, ticks), MIN_CPU_WEIGHT);
        assert_eq!(mhz_to_weight(9600, ticks), MAX_CPU_WEIGHT);
        assert_eq!(mhz_to_weight(4800, ticks), 4);
    }

    #[test]
    fn test_msg_code_round_trip() {
        assert_eq!(JobMsgCode::from_raw(11), Some(JobMsgCode::NotificationLimit));
        assert_eq!(JobMsgCode::from_raw(6), Some(JobMsgCode::NewProcess));
        assert_eq!(JobMsgCode::from_raw(5), None);
        assert_eq!(JobMsgCode::from_raw(99), None);
    }

    #[test]
    fn test_tolerance_display() {
        assert_eq!(RateControlTolerance::Low.to_string(), "20.00%");
        assert_eq!(RateControlTolerance::High.percent(), 60.0);
        assert_eq!(
            RateControlToleranceInterval::Long.duration(),
            Duration::from_secs(600)
        );
    }

    #[test]
    fn test_effective_flags_is_intersection() {
        let rec = LimitViolationRecord {
            limit_flags: LIMIT_JOB_MEMORY | LIMIT_CPU_RATE_CONTROL,
            violation_flags: LIMIT_CPU_RATE_CONTROL | LIMIT_JOB_READ_BYTES,
            ..Default::default()
        };
        assert_eq!(rec.effective_flags(), LIMIT_CPU_RATE_CONTROL);
    }

    #[test]
    fn test_ticks_conversion() {
        assert_eq!(ticks_100ns(10_000_000), Duration::from_secs(1));
        assert_eq!(ticks_100ns(0), Duration::ZERO);
    }
}
