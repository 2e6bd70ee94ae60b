//! Job objects: creation, process assignment, limit installation, accounting
//! queries, and completion-port notifications.
//!
//! The `JOBOBJECT_*` information structures are declared here `#[repr(C)]`
//! rather than pulled from generated bindings: the notification-limit and
//! limit-violation v2 classes need exact field layout including tail padding,
//! and keeping them next to their marshalling code makes the layout auditable
//! against winnt.h.

use std::ffi::c_void;
use std::ptr;
use std::time::Duration;

use windows_sys::Win32::Foundation::{ERROR_ALREADY_EXISTS, GetLastError, INVALID_HANDLE_VALUE, WAIT_TIMEOUT};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, FreeMemoryJobObject, QueryInformationJobObject,
    QueryIoRateControlInformationJobObject, SetInformationJobObject,
    SetIoRateControlInformationJobObject,
};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, INFINITE};
use windows_sys::Win32::System::IO::{CreateIoCompletionPort, GetQueuedCompletionStatus};

use super::job_info::{
    BasicAccounting, BasicAndIoAccounting, CPU_RATE_CONTROL_ENABLE, CPU_RATE_CONTROL_HARD_CAP,
    CPU_RATE_CONTROL_MIN_MAX_RATE, CPU_RATE_CONTROL_NOTIFY, CPU_RATE_CONTROL_WEIGHT_BASED,
    IoCounters, JobMsgCode, JobNotification, LIMIT_CPU_RATE_CONTROL, LIMIT_IO_RATE_CONTROL,
    LIMIT_JOB_MEMORY, LIMIT_JOB_MEMORY_LOW, LIMIT_JOB_READ_BYTES, LIMIT_JOB_TIME,
    LIMIT_JOB_WRITE_BYTES, LIMIT_KILL_ON_JOB_CLOSE, LIMIT_NET_RATE_CONTROL,
    LimitViolationRecord, RateControlTolerance, RateControlToleranceInterval, ticks_100ns,
};
use super::strings::to_wide_opt;
use super::{OwnedHandle, Win32Error};

// JOBOBJECTINFOCLASS values, winnt.h (do not reorder).
const JOB_OBJECT_ASSOCIATE_COMPLETION_PORT_INFORMATION: u32 = 7;
const JOB_OBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION: u32 = 8;
const JOB_OBJECT_EXTENDED_LIMIT_INFORMATION: u32 = 9;
const JOB_OBJECT_CPU_RATE_CONTROL_INFORMATION: u32 = 15;
const JOB_OBJECT_NET_RATE_CONTROL_INFORMATION: u32 = 32;
const JOB_OBJECT_NOTIFICATION_LIMIT_INFORMATION_2: u32 = 33;
const JOB_OBJECT_LIMIT_VIOLATION_INFORMATION_2: u32 = 34;

const IO_RATE_CONTROL_ENABLE: u32 = 0x1;
const NET_RATE_CONTROL_ENABLE: u32 = 0x1;
const NET_RATE_CONTROL_MAX_BANDWIDTH: u32 = 0x2;
const NET_RATE_CONTROL_DSCP_TAG: u32 = 0x4;

const JOB_OBJECT_LIMIT_WORKINGSET: u32 = 0x0000_0001;
const JOB_OBJECT_LIMIT_AFFINITY: u32 = 0x0000_0010;
const JOB_OBJECT_LIMIT_PRIORITY_CLASS: u32 = 0x0000_0020;
const JOB_OBJECT_LIMIT_SCHEDULING_CLASS: u32 = 0x0000_0080;
const JOB_OBJECT_LIMIT_PROCESS_MEMORY: u32 = 0x0000_0100;

#[repr(C)]
#[derive(Default)]
struct BasicLimitInformationRaw {
    per_process_user_time_limit: i64,
    per_job_user_time_limit: i64,
    limit_flags: u32,
    minimum_working_set_size: usize,
    maximum_working_set_size: usize,
    active_process_limit: u32,
    affinity: usize,
    priority_class: u32,
    scheduling_class: u32,
}

#[repr(C)]
#[derive(Default)]
struct IoCountersRaw {
    read_operation_count: u64,
    write_operation_count: u64,
    other_operation_count: u64,
    read_transfer_count: u64,
    write_transfer_count: u64,
    other_transfer_count: u64,
}

#[repr(C)]
#[derive(Default)]
struct ExtendedLimitInformationRaw {
    basic: BasicLimitInformationRaw,
    io_info: IoCountersRaw,
    process_memory_limit: usize,
    job_memory_limit: usize,
    peak_process_memory_used: usize,
    peak_job_memory_used: usize,
}

#[repr(C)]
struct AssociateCompletionPortRaw {
    completion_key: *mut c_void,
    completion_port: *mut c_void,
}

#[repr(C)]
#[derive(Default)]
struct CpuRateControlInformationRaw {
    control_flags: u32,
    // union of CpuRate / Weight / { MinRate: u16, MaxRate: u16 }
    rate: u32,
}

#[repr(C)]
#[derive(Default)]
struct NetRateControlInformationRaw {
    max_bandwidth: u64,
    control_flags: u32,
    dscp_tag: u8,
    _pad: [u8; 3],
}

#[repr(C)]
#[derive(Default)]
struct NotificationLimitInformation2Raw {
    io_read_bytes_limit: u64,
    io_write_bytes_limit: u64,
    per_job_user_time_limit: u64,
    job_memory_limit: u64,
    rate_control_tolerance: u32,
    rate_control_tolerance_interval: u32,
    limit_flags: u32,
    io_rate_control_tolerance: u32,
    job_low_memory_limit: u64,
    io_rate_control_tolerance_interval: u32,
    net_rate_control_tolerance: u32,
    net_rate_control_tolerance_interval: u32,
    _pad: [u8; 4],
}

#[repr(C)]
#[derive(Default)]
struct LimitViolationInformation2Raw {
    limit_flags: u32,
    violation_limit_flags: u32,
    io_read_bytes: u64,
    io_read_bytes_limit: u64,
    io_write_bytes: u64,
    io_write_bytes_limit: u64,
    per_job_user_time: u64,
    per_job_user_time_limit: u64,
    job_memory: u64,
    job_memory_limit: u64,
    rate_control_tolerance: u32,
    rate_control_tolerance_limit: u32,
    job_low_memory_limit: u64,
    io_rate_control_tolerance: u32,
    io_rate_control_tolerance_limit: u32,
    net_rate_control_tolerance: u32,
    net_rate_control_tolerance_limit: u32,
}

#[repr(C)]
#[derive(Default)]
struct BasicAccountingInformationRaw {
    total_user_time: u64,
    total_kernel_time: u64,
    this_period_total_user_time: u64,
    this_period_total_kernel_time: u64,
    total_page_fault_count: u32,
    total_processes: u32,
    active_processes: u32,
    total_terminated_processes: u32,
}

#[repr(C)]
#[derive(Default)]
struct BasicAndIoAccountingInformationRaw {
    basic: BasicAccountingInformationRaw,
    io: IoCountersRaw,
}

#[repr(C)]
struct IoRateControlInformationRaw {
    max_iops: i64,
    max_bandwidth: i64,
    reservation_iops: i64,
    volume_name: *const u16,
    base_io_size: u32,
    control_flags: u32,
}

/// Priority classes settable through a job's basic limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
}

impl PriorityClass {
    const fn raw(self) -> u32 {
        match self {
            Self::Idle => 0x40,
            Self::BelowNormal => 0x4000,
            Self::Normal => 0x20,
            Self::AboveNormal => 0x8000,
            Self::High => 0x80,
        }
    }
}

/// Basic scheduling limits carried inside [`ExtendedLimits`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicLimits {
    /// Process priority class for members of the job.
    pub priority_class: Option<PriorityClass>,
    /// Scheduling class 1..=9.
    pub scheduling_class: Option<u32>,
    /// Working-set bounds in bytes (min, max); max must exceed min.
    pub working_set: Option<(usize, usize)>,
    /// Processor affinity mask.
    pub affinity: Option<u64>,
}

impl BasicLimits {
    fn fill(&self, raw: &mut BasicLimitInformationRaw) {
        if let Some((min, max)) = self.working_set {
            if max > min && max > 0 {
                raw.limit_flags |= JOB_OBJECT_LIMIT_WORKINGSET;
                raw.minimum_working_set_size = min;
                raw.maximum_working_set_size = max;
            }
        }
        if let Some(class) = self.priority_class {
            raw.limit_flags |= JOB_OBJECT_LIMIT_PRIORITY_CLASS;
            raw.priority_class = class.raw();
        }
        if let Some(class) = self.scheduling_class {
            if (1..=9).contains(&class) {
                raw.limit_flags |= JOB_OBJECT_LIMIT_SCHEDULING_CLASS;
                raw.scheduling_class = class;
            }
        }
        if let Some(mask) = self.affinity {
            if mask != 0 {
                raw.limit_flags |= JOB_OBJECT_LIMIT_AFFINITY;
                raw.affinity = mask as usize;
            }
        }
    }
}

/// Extended limit information for a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtendedLimits {
    /// Basic scheduling limits, if any.
    pub basic: BasicLimits,
    /// Kill every process in the job when the last job handle closes.
    pub kill_on_job_close: bool,
    /// Committed-memory cap for the whole job, in bytes. Zero installs no cap.
    pub job_memory_limit: u64,
    /// Committed-memory cap per process, in bytes. Zero installs no cap.
    pub process_memory_limit: u64,
}

/// CPU rate control variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuRateControl {
    /// A portion of total CPU time in the kernel's 1..=10000 unit;
    /// `hard` turns throttling on instead of best-effort weighting.
    Cap {
        /// Rate in 10000-per-core units.
        rate: u32,
        /// Enforce as a hard cap.
        hard: bool,
    },
    /// Scheduling weight 1..=9 relative to other jobs.
    Weight(u32),
    /// Band between a guaranteed minimum and a ceiling, both in the
    /// 10000-per-core unit.
    MinMax {
        /// Guaranteed portion.
        min: u16,
        /// Ceiling.
        max: u16,
    },
}

/// Tolerance configuration for one rate-controlled resource.
#[derive(Debug, Clone, Copy)]
pub struct RateTolerance {
    /// Threshold level.
    pub level: RateControlTolerance,
    /// Measurement window.
    pub interval: RateControlToleranceInterval,
}

/// Notification-limit information: soft limits that raise completion-port
/// messages instead of enforcing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationLimits {
    /// Per-job user-time budget.
    pub user_time_limit: Option<Duration>,
    /// CPU rate-control tolerance.
    pub cpu_rate: Option<RateTolerance>,
    /// IO rate-control tolerance.
    pub io_rate: Option<RateTolerance>,
    /// Network rate-control tolerance.
    pub net_rate: Option<RateTolerance>,
    /// High committed-memory threshold in bytes.
    pub job_memory_high: Option<u64>,
    /// Low committed-memory threshold in bytes.
    pub job_memory_low: Option<u64>,
    /// Cumulative read-bytes threshold.
    pub io_read_bytes: Option<u64>,
    /// Cumulative written-bytes threshold.
    pub io_write_bytes: Option<u64>,
}

/// IO rate control for one volume.
#[derive(Debug, Clone, Default)]
pub struct IoRateControl {
    /// Maximum IO operations per second; zero for unlimited.
    pub max_iops: i64,
    /// Maximum bandwidth in bytes per second; zero for unlimited.
    pub max_bandwidth: i64,
    /// Reserved IO operations per second.
    pub reservation_iops: i64,
    /// Base IO size used for accounting, reported on query.
    pub base_io_size: u32,
    /// Volume the control applies to; empty for the system volume.
    pub volume_name: String,
}

/// Network rate control for the job.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetRateControl {
    /// Maximum outgoing bandwidth in bytes per second; zero for unlimited.
    pub max_bandwidth: u64,
    /// DSCP tag (6 bits) stamped on outgoing packets; zero leaves untagged.
    pub dscp_tag: u8,
}

/// A named kernel job object with an associated completion port.
#[derive(Debug)]
pub struct JobObject {
    job: OwnedHandle,
    completion: OwnedHandle,
}

impl JobObject {
    /// Create a named job object and attach an I/O completion port for
    /// limit-violation messages.
    ///
    /// # Errors
    ///
    /// Fails when the name is already in use by another security context or
    /// when either kernel object cannot be created.
    pub fn create(name: &str) -> Result<Self, Win32Error> {
        let wide = to_wide_opt(name);
        let raw = unsafe {
            CreateJobObjectW(
                ptr::null(),
                wide.as_ref().map_or(ptr::null(), |w| w.as_ptr()),
            )
        };
        if raw.is_null() {
            return Err(Win32Error::last("CreateJobObjectW"));
        }
        if unsafe { GetLastError() } == ERROR_ALREADY_EXISTS {
            tracing::debug!(name, "opened existing job object");
        }
        let job = unsafe { OwnedHandle::from_raw(raw) };

        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 1) };
        if port.is_null() {
            return Err(Win32Error::last("CreateIoCompletionPort"));
        }
        let completion = unsafe { OwnedHandle::from_raw(port) };

        let assoc = AssociateCompletionPortRaw {
            completion_key: job.as_raw(),
            completion_port: completion.as_raw(),
        };
        set_information(
            &job,
            JOB_OBJECT_ASSOCIATE_COMPLETION_PORT_INFORMATION,
            &assoc,
        )?;
        Ok(Self { job, completion })
    }

    /// Assign a process to this job. The process should still be suspended so
    /// no user code runs outside the job's limits.
    ///
    /// # Errors
    ///
    /// Fails when the process already belongs to an incompatible job or the
    /// handle lacks the required access.
    pub fn assign(&self, process: &OwnedHandle) -> Result<(), Win32Error> {
        if unsafe { AssignProcessToJobObject(self.job.as_raw(), process.as_raw()) } == 0 {
            return Err(Win32Error::last("AssignProcessToJobObject"));
        }
        Ok(())
    }

    /// Assign the calling process to this job.
    ///
    /// # Errors
    ///
    /// Fails when the calling process already belongs to an incompatible job.
    pub fn assign_current_process(&self) -> Result<(), Win32Error> {
        if unsafe { AssignProcessToJobObject(self.job.as_raw(), GetCurrentProcess()) } == 0 {
            return Err(Win32Error::last("AssignProcessToJobObject"));
        }
        Ok(())
    }

    /// Install extended limit information.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `SetInformationJobObject`.
    pub fn set_extended_limits(&self, limits: &ExtendedLimits) -> Result<(), Win32Error> {
        let mut raw = ExtendedLimitInformationRaw::default();
        limits.basic.fill(&mut raw.basic);
        if limits.kill_on_job_close {
            raw.basic.limit_flags |= LIMIT_KILL_ON_JOB_CLOSE;
        }
        if limits.job_memory_limit > 0 {
            raw.basic.limit_flags |= LIMIT_JOB_MEMORY;
            raw.job_memory_limit = limits.job_memory_limit as usize;
        }
        if limits.process_memory_limit > 0 {
            raw.basic.limit_flags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
            raw.process_memory_limit = limits.process_memory_limit as usize;
        }
        set_information(&self.job, JOB_OBJECT_EXTENDED_LIMIT_INFORMATION, &raw)
    }

    /// Install CPU rate control.
    ///
    /// With `notify` set, tolerance excursions raise completion-port
    /// messages in addition to whatever enforcement the variant requests.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `SetInformationJobObject`.
    pub fn set_cpu_rate_control(
        &self,
        control: CpuRateControl,
        notify: bool,
    ) -> Result<(), Win32Error> {
        let mut raw = CpuRateControlInformationRaw::default();
        match control {
            CpuRateControl::Cap { rate, hard } => {
                raw.control_flags = CPU_RATE_CONTROL_ENABLE;
                if hard {
                    raw.control_flags |= CPU_RATE_CONTROL_HARD_CAP;
                }
                raw.rate = rate;
            }
            CpuRateControl::Weight(weight) => {
                raw.control_flags = CPU_RATE_CONTROL_ENABLE | CPU_RATE_CONTROL_WEIGHT_BASED;
                raw.rate = weight;
            }
            CpuRateControl::MinMax { min, max } => {
                raw.control_flags = CPU_RATE_CONTROL_ENABLE | CPU_RATE_CONTROL_MIN_MAX_RATE;
                raw.rate = u32::from(min) | (u32::from(max) << 16);
            }
        }
        if notify {
            raw.control_flags |= CPU_RATE_CONTROL_NOTIFY;
        }
        set_information(&self.job, JOB_OBJECT_CPU_RATE_CONTROL_INFORMATION, &raw)
    }

    /// Install notification limits (information class 2).
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `SetInformationJobObject`.
    pub fn set_notification_limits(&self, limits: &NotificationLimits) -> Result<(), Win32Error> {
        let mut raw = NotificationLimitInformation2Raw::default();
        if let Some(user_time) = limits.user_time_limit {
            raw.limit_flags |= LIMIT_JOB_TIME;
            raw.per_job_user_time_limit = (user_time.as_nanos() / 100) as u64;
        }
        if let Some(tol) = limits.cpu_rate {
            raw.limit_flags |= LIMIT_CPU_RATE_CONTROL;
            raw.rate_control_tolerance = tol.level as u32;
            raw.rate_control_tolerance_interval = tol.interval as u32;
        }
        if let Some(tol) = limits.io_rate {
            raw.limit_flags |= LIMIT_IO_RATE_CONTROL;
            raw.io_rate_control_tolerance = tol.level as u32;
            raw.io_rate_control_tolerance_interval = tol.interval as u32;
        }
        if let Some(tol) = limits.net_rate {
            raw.limit_flags |= LIMIT_NET_RATE_CONTROL;
            raw.net_rate_control_tolerance = tol.level as u32;
            raw.net_rate_control_tolerance_interval = tol.interval as u32;
        }
        if let Some(bytes) = limits.job_memory_high {
            raw.limit_flags |= LIMIT_JOB_MEMORY;
            raw.job_memory_limit = bytes;
        }
        if let Some(bytes) = limits.job_memory_low {
            raw.limit_flags |= LIMIT_JOB_MEMORY_LOW;
            raw.job_low_memory_limit = bytes;
        }
        if let Some(bytes) = limits.io_read_bytes {
            raw.limit_flags |= LIMIT_JOB_READ_BYTES;
            raw.io_read_bytes_limit = bytes;
        }
        if let Some(bytes) = limits.io_write_bytes {
            raw.limit_flags |= LIMIT_JOB_WRITE_BYTES;
            raw.io_write_bytes_limit = bytes;
        }
        set_information(&self.job, JOB_OBJECT_NOTIFICATION_LIMIT_INFORMATION_2, &raw)
    }

    /// Install or clear IO rate control for one volume. Zero limits clear.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of
    /// `SetIoRateControlInformationJobObject`.
    pub fn set_io_rate_control(&self, control: &IoRateControl) -> Result<(), Win32Error> {
        let volume = to_wide_opt(&control.volume_name);
        let enable = control.max_bandwidth > 0 || control.reservation_iops > 0 || control.max_iops > 0;
        let raw = IoRateControlInformationRaw {
            max_iops: if enable { control.max_iops } else { 0 },
            max_bandwidth: if enable { control.max_bandwidth } else { 0 },
            reservation_iops: if enable { control.reservation_iops } else { 0 },
            volume_name: volume.as_ref().map_or(ptr::null(), |w| w.as_ptr()),
            base_io_size: 0,
            control_flags: if enable { IO_RATE_CONTROL_ENABLE } else { 0 },
        };
        let status = unsafe {
            SetIoRateControlInformationJobObject(self.job.as_raw(), (&raw as *const IoRateControlInformationRaw).cast())
        };
        if status == 0 {
            return Err(Win32Error::last("SetIoRateControlInformationJobObject"));
        }
        Ok(())
    }

    /// Query the IO rate controls installed for `volume`.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of
    /// `QueryIoRateControlInformationJobObject`.
    pub fn query_io_rate_control(&self, volume: &str) -> Result<Vec<IoRateControl>, Win32Error> {
        let wide = to_wide_opt(volume);
        let mut blocks: *mut c_void = ptr::null_mut();
        let mut count: u32 = 0;
        let status = unsafe {
            QueryIoRateControlInformationJobObject(
                self.job.as_raw(),
                wide.as_ref().map_or(ptr::null(), |w| w.as_ptr()),
                std::ptr::addr_of_mut!(blocks).cast(),
                &mut count,
            )
        };
        if status == 0 {
            return Err(Win32Error::last("QueryIoRateControlInformationJobObject"));
        }
        let mut controls = Vec::with_capacity(count as usize);
        let raw = blocks.cast::<IoRateControlInformationRaw>();
        for i in 0..count as usize {
            let info = unsafe { &*raw.add(i) };
            controls.push(IoRateControl {
                max_iops: info.max_iops,
                max_bandwidth: info.max_bandwidth,
                reservation_iops: info.reservation_iops,
                base_io_size: info.base_io_size,
                volume_name: unsafe { super::strings::from_wide_ptr(info.volume_name) },
            });
        }
        unsafe { FreeMemoryJobObject(blocks as *const _) };
        Ok(controls)
    }

    /// Install network rate control.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `SetInformationJobObject`.
    pub fn set_net_rate_control(&self, control: &NetRateControl) -> Result<(), Win32Error> {
        let mut raw = NetRateControlInformationRaw::default();
        if control.max_bandwidth > 0 {
            raw.max_bandwidth = control.max_bandwidth;
            raw.control_flags |= NET_RATE_CONTROL_ENABLE | NET_RATE_CONTROL_MAX_BANDWIDTH;
        }
        if control.dscp_tag > 0 {
            raw.dscp_tag = control.dscp_tag & 0x3F;
            raw.control_flags |= NET_RATE_CONTROL_ENABLE | NET_RATE_CONTROL_DSCP_TAG;
        }
        set_information(&self.job, JOB_OBJECT_NET_RATE_CONTROL_INFORMATION, &raw)
    }

    /// Query combined basic + IO accounting for the job.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `QueryInformationJobObject`.
    pub fn query_accounting(&self) -> Result<BasicAndIoAccounting, Win32Error> {
        let raw: BasicAndIoAccountingInformationRaw =
            query_information(&self.job, JOB_OBJECT_BASIC_AND_IO_ACCOUNTING_INFORMATION)?;
        Ok(BasicAndIoAccounting {
            basic: BasicAccounting {
                total_user_time: ticks_100ns(raw.basic.total_user_time),
                total_kernel_time: ticks_100ns(raw.basic.total_kernel_time),
                this_period_total_user_time: ticks_100ns(raw.basic.this_period_total_user_time),
                this_period_total_kernel_time: ticks_100ns(raw.basic.this_period_total_kernel_time),
                total_page_fault_count: raw.basic.total_page_fault_count,
                total_processes: raw.basic.total_processes,
                active_processes: raw.basic.active_processes,
                total_terminated_processes: raw.basic.total_terminated_processes,
            },
            io: IoCounters {
                read_operation_count: raw.io.read_operation_count,
                write_operation_count: raw.io.write_operation_count,
                other_operation_count: raw.io.other_operation_count,
                read_transfer_count: raw.io.read_transfer_count,
                write_transfer_count: raw.io.write_transfer_count,
                other_transfer_count: raw.io.other_transfer_count,
            },
        })
    }

    /// Query the latest limit-violation record.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `QueryInformationJobObject`.
    pub fn query_limit_violation(&self) -> Result<LimitViolationRecord, Win32Error> {
        let raw: LimitViolationInformation2Raw =
            query_information(&self.job, JOB_OBJECT_LIMIT_VIOLATION_INFORMATION_2)?;
        Ok(LimitViolationRecord {
            limit_flags: raw.limit_flags,
            violation_flags: raw.violation_limit_flags,
            io_read_bytes: raw.io_read_bytes,
            io_read_bytes_limit: raw.io_read_bytes_limit,
            io_write_bytes: raw.io_write_bytes,
            io_write_bytes_limit: raw.io_write_bytes_limit,
            per_job_user_time: raw.per_job_user_time,
            per_job_user_time_limit: raw.per_job_user_time_limit,
            job_memory: raw.job_memory,
            job_memory_limit: raw.job_memory_limit,
            job_low_memory_limit: raw.job_low_memory_limit,
            cpu_rate_tolerance: raw.rate_control_tolerance,
            cpu_rate_tolerance_limit: raw.rate_control_tolerance_limit,
            io_rate_tolerance: raw.io_rate_control_tolerance,
            io_rate_tolerance_limit: raw.io_rate_control_tolerance_limit,
            net_rate_tolerance: raw.net_rate_control_tolerance,
            net_rate_tolerance_limit: raw.net_rate_control_tolerance_limit,
        })
    }

    /// Dequeue the next job message, waiting up to `timeout` (forever when
    /// `None`). Returns `Ok(None)` on timeout.
    ///
    /// Messages that carry a PID report it; a notification-limit message is
    /// enriched with the current violation record.
    ///
    /// # Errors
    ///
    /// Surfaces dequeue failures and completion-key mismatches.
    pub fn poll_notification(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Option<JobNotification>, Win32Error> {
        let millis = timeout.map_or(INFINITE, |t| u32::try_from(t.as_millis()).unwrap_or(INFINITE));
        let mut code: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED = ptr::null_mut();
        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.completion.as_raw(),
                &mut code,
                &mut key,
                &mut overlapped,
                millis,
            )
        };
        if ok == 0 {
            if unsafe { GetLastError() } == WAIT_TIMEOUT {
                return Ok(None);
            }
            return Err(Win32Error::last("GetQueuedCompletionStatus"));
        }
        if key != self.job.as_raw() as usize {
            return Err(Win32Error::from_code("GetQueuedCompletionStatus", 0));
        }
        let Some(code) = JobMsgCode::from_raw(code) else {
            tracing::warn!(code, "unknown job message code");
            return Ok(None);
        };
        let pid = match code {
            JobMsgCode::EndOfJobTime | JobMsgCode::JobMemoryLimit => None,
            _ => Some(overlapped as usize as u32),
        };
        let violation = if code == JobMsgCode::NotificationLimit {
            Some(self.query_limit_violation()?)
        } else {
            None
        };
        Ok(Some(JobNotification {
            code,
            pid,
            violation,
        }))
    }

    /// Close the job handle, reporting the OS status.
    ///
    /// Dropping the object closes it as well; this variant surfaces errors.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `CloseHandle`.
    pub fn close(self) -> Result<(), Win32Error> {
        let Self { job, completion } = self;
        if let Err(err) = completion.close() {
            tracing::warn!(error = %err, "failed to close job completion port");
        }
        job.close()
    }
}

fn set_information<T>(job: &OwnedHandle, class: u32, info: &T) -> Result<(), Win32Error> {
    let status = unsafe {
        SetInformationJobObject(
            job.as_raw(),
            class,
            (info as *const T).cast(),
            std::mem::size_of::<T>() as u32,
        )
    };
    if status == 0 {
        return Err(Win32Error::last("SetInformationJobObject"));
    }
    Ok(())
}

fn query_information<T: Default>(job: &OwnedHandle, class: u32) -> Result<T, Win32Error> {
    let mut info = T::default();
    let status = unsafe {
        QueryInformationJobObject(
            job.as_raw(),
            class,
            std::ptr::addr_of_mut!(info).cast(),
            std::mem::size_of::<T>() as u32,
            ptr::null_mut(),
        )
    };
    if status == 0 {
        return Err(Win32Error::last("QueryInformationJobObject"));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_assign_and_account() {
        let job = JobObject::create("damon-test-job-account").expect("create job");
        job.assign_current_process().expect("assign self");
        let accounting = job.query_accounting().expect("accounting");
        assert!(accounting.basic.active_processes >= 1);
    }

    #[test]
    fn test_notification_poll_times_out() {
        let job = JobObject::create("damon-test-job-poll").expect("create job");
        let msg = job
            .poll_notification(Some(Duration::from_millis(50)))
            .expect("poll");
        assert!(msg.is_none());
    }

    #[test]
    fn test_set_limits_on_empty_job() {
        let job = JobObject::create("").expect("anonymous job");
        job.set_extended_limits(&ExtendedLimits {
            kill_on_job_close: false,
            job_memory_limit: 64 * 1024 * 1024,
            ..ExtendedLimits::default()
        })
        .expect("extended limits");
        job.set_notification_limits(&NotificationLimits {
            cpu_rate: Some(RateTolerance {
                level: RateControlTolerance::Low,
                interval: RateControlToleranceInterval::Long,
            }),
            ..NotificationLimits::default()
        })
        .expect("notification limits");
    }
}
