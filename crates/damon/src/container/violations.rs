//! Decoding of kernel limit-violation records into typed events.

use crate::win32::job_info::{
    LIMIT_CPU_RATE_CONTROL, LIMIT_IO_RATE_CONTROL, LIMIT_JOB_MEMORY, LIMIT_JOB_MEMORY_LOW,
    LIMIT_JOB_READ_BYTES, LIMIT_JOB_TIME, LIMIT_JOB_WRITE_BYTES, LIMIT_NET_RATE_CONTROL,
    LimitViolationRecord, RateControlTolerance,
};

use super::{LimitViolation, ViolationKind};

/// Decode a violation record into one event per configured-and-violated
/// limit, in a fixed order.
///
/// Flags the record carries but this decoder does not know are ignored.
#[must_use]
pub fn classify(record: &LimitViolationRecord) -> Vec<LimitViolation> {
    let effective = record.effective_flags();
    let mut violations = Vec::new();

    if effective & LIMIT_JOB_MEMORY != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Memory,
            measured: record.job_memory,
            limit: record.job_memory_limit,
            message: format!(
                "Memory exceeded threshold: {} > {}",
                record.job_memory, record.job_memory_limit
            ),
        });
    }
    if effective & LIMIT_JOB_MEMORY_LOW != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Memory,
            measured: record.job_memory,
            limit: record.job_low_memory_limit,
            message: format!(
                "Memory fell below threshold: {} < {}",
                record.job_memory, record.job_low_memory_limit
            ),
        });
    }
    if effective & LIMIT_JOB_READ_BYTES != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Io,
            measured: record.io_read_bytes,
            limit: record.io_read_bytes_limit,
            message: format!(
                "IO read bytes exceeded threshold: {} > {}",
                record.io_read_bytes, record.io_read_bytes_limit
            ),
        });
    }
    if effective & LIMIT_JOB_WRITE_BYTES != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Io,
            measured: record.io_write_bytes,
            limit: record.io_write_bytes_limit,
            message: format!(
                "IO write bytes exceeded threshold: {} > {}",
                record.io_write_bytes, record.io_write_bytes_limit
            ),
        });
    }
    if effective & LIMIT_JOB_TIME != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Cpu,
            measured: record.per_job_user_time,
            limit: record.per_job_user_time_limit,
            message: format!(
                "Job time exceeded threshold: {} > {}",
                record.per_job_user_time, record.per_job_user_time_limit
            ),
        });
    }
    if effective & LIMIT_CPU_RATE_CONTROL != 0 {
        let tolerance = RateControlTolerance::from_raw(record.cpu_rate_tolerance_limit)
            .map_or(String::new(), |t| {
                format!(" > {:.0}% of the time", t.percent())
            });
        violations.push(LimitViolation {
            kind: ViolationKind::Cpu,
            measured: u64::from(record.cpu_rate_tolerance),
            limit: u64::from(record.cpu_rate_tolerance_limit),
            message: format!("CPU rate exceeded threshold{tolerance}"),
        });
    }
    if effective & LIMIT_IO_RATE_CONTROL != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Io,
            measured: u64::from(record.io_rate_tolerance),
            limit: u64::from(record.io_rate_tolerance_limit),
            message: format!(
                "IO rate exceeded threshold: {} > {}",
                record.io_rate_tolerance, record.io_rate_tolerance_limit
            ),
        });
    }
    if effective & LIMIT_NET_RATE_CONTROL != 0 {
        violations.push(LimitViolation {
            kind: ViolationKind::Io,
            measured: u64::from(record.net_rate_tolerance),
            limit: u64::from(record.net_rate_tolerance_limit),
            message: format!(
                "Network rate exceeded threshold: {} > {}",
                record.net_rate_tolerance, record.net_rate_tolerance_limit
            ),
        });
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    const KNOWN: [u32; 8] = [
        LIMIT_JOB_MEMORY,
        LIMIT_JOB_MEMORY_LOW,
        LIMIT_JOB_READ_BYTES,
        LIMIT_JOB_WRITE_BYTES,
        LIMIT_JOB_TIME,
        LIMIT_CPU_RATE_CONTROL,
        LIMIT_IO_RATE_CONTROL,
        LIMIT_NET_RATE_CONTROL,
    ];

    #[test]
    fn test_memory_high_violation() {
        let record = LimitViolationRecord {
            limit_flags: LIMIT_JOB_MEMORY,
            violation_flags: LIMIT_JOB_MEMORY,
            job_memory: 64 << 20,
            job_memory_limit: 32 << 20,
            ..LimitViolationRecord::default()
        };
        let violations = classify(&record);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Memory);
        assert_eq!(violations[0].measured, 64 << 20);
        assert_eq!(violations[0].limit, 32 << 20);
        assert!(violations[0].message.contains("Memory exceeded"));
    }

    #[test]
    fn test_cpu_rate_violation_carries_tolerance_level() {
        let record = LimitViolationRecord {
            limit_flags: LIMIT_CPU_RATE_CONTROL,
            violation_flags: LIMIT_CPU_RATE_CONTROL,
            cpu_rate_tolerance: 2,
            cpu_rate_tolerance_limit: 1,
            ..LimitViolationRecord::default()
        };
        let violations = classify(&record);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Cpu);
        assert_eq!(violations[0].measured, 2);
        assert!(violations[0].message.contains("> 20% of the time"));
    }

    #[test]
    fn test_violated_but_unconfigured_flag_is_ignored() {
        let record = LimitViolationRecord {
            limit_flags: LIMIT_JOB_MEMORY,
            violation_flags: LIMIT_JOB_READ_BYTES,
            ..LimitViolationRecord::default()
        };
        assert!(classify(&record).is_empty());
    }

    #[test]
    fn test_one_violation_per_effective_known_flag() {
        let all: u32 = KNOWN.iter().copied().fold(0, |acc, f| acc | f);
        for violated in [
            LIMIT_JOB_MEMORY,
            LIMIT_JOB_MEMORY | LIMIT_CPU_RATE_CONTROL,
            LIMIT_JOB_READ_BYTES | LIMIT_JOB_WRITE_BYTES | LIMIT_NET_RATE_CONTROL,
            all,
        ] {
            let record = LimitViolationRecord {
                limit_flags: all,
                violation_flags: violated,
                ..LimitViolationRecord::default()
            };
            let effective = record.effective_flags();
            let expected = KNOWN.iter().filter(|&&f| effective & f != 0).count();
            assert_eq!(classify(&record).len(), expected);
        }
    }

    #[test]
    fn test_unknown_flags_do_not_decode() {
        let record = LimitViolationRecord {
            limit_flags: 0x0000_0001 | LIMIT_JOB_TIME,
            violation_flags: 0x0000_0001 | LIMIT_JOB_TIME,
            per_job_user_time: 500,
            per_job_user_time_limit: 100,
            ..LimitViolationRecord::default()
        };
        let violations = classify(&record);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Cpu);
    }

    #[test]
    fn test_order_is_stable() {
        let record = LimitViolationRecord {
            limit_flags: LIMIT_CPU_RATE_CONTROL | LIMIT_JOB_MEMORY | LIMIT_JOB_WRITE_BYTES,
            violation_flags: LIMIT_CPU_RATE_CONTROL | LIMIT_JOB_MEMORY | LIMIT_JOB_WRITE_BYTES,
            ..LimitViolationRecord::default()
        };
        let kinds: Vec<ViolationKind> = classify(&record).into_iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![ViolationKind::Memory, ViolationKind::Io, ViolationKind::Cpu]
        );
    }
}
