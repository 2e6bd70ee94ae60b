//! Child-process creation and control.
//!
//! Processes are started with an explicit primary token, in a new process
//! group, optionally suspended so they can be assigned to a job object before
//! any user code runs. Standard streams are wired to caller-supplied handles
//! or to the null device.

use std::fs::File;
use std::mem;
use std::os::windows::io::FromRawHandle;
use std::path::PathBuf;
use std::ptr;
use std::sync::Mutex;
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    GENERIC_READ, GENERIC_WRITE, HANDLE_FLAG_INHERIT, SetHandleInformation, WAIT_FAILED,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, TH32CS_SNAPTHREAD, THREADENTRY32, Thread32First, Thread32Next,
};
use windows_sys::Win32::System::Pipes::CreatePipe;
use windows_sys::Win32::System::ProcessStatus::K32GetProcessMemoryInfo;
use windows_sys::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW,
    CreateProcessW, GetExitCodeProcess, GetProcessAffinityMask, INFINITE, OpenThread,
    PROCESS_INFORMATION, ResumeThread, STARTF_USESTDHANDLES, STARTUPINFOW,
    TerminateProcess, THREAD_SUSPEND_RESUME, WaitForSingleObject,
};

use super::strings::{command_line, environment_block, to_wide, to_wide_opt};
use super::token::Token;
use super::{OwnedHandle, Win32Error};

/// Exit status reported when the child could not be started.
pub const EXIT_STATUS_START_ERROR: i32 = 253;
/// Exit status reported when waiting on the child failed.
pub const EXIT_STATUS_ERROR: i32 = 254;
/// Exit status reported when the child's fate is unknown.
pub const EXIT_STATUS_UNKNOWN: i32 = 255;

/// Where a child's standard stream goes.
#[derive(Debug)]
pub enum Stdio {
    /// Discard via the null device.
    Null,
    /// An open file or pipe handle the child inherits.
    Handle(OwnedHandle),
}

impl Default for Stdio {
    fn default() -> Self {
        Self::Null
    }
}

/// A command to start inside a container.
#[derive(Debug, Default)]
pub struct ProcessCommand {
    /// Executable path.
    pub program: String,
    /// Arguments, quoted into the command line as needed.
    pub args: Vec<String>,
    /// Environment as `KEY=VALUE` entries; empty inherits the parent's.
    pub env: Vec<String>,
    /// Working directory; `None` inherits the parent's.
    pub dir: Option<PathBuf>,
    /// Standard output destination.
    pub stdout: Stdio,
    /// Standard error destination.
    pub stderr: Stdio,
}

impl ProcessCommand {
    /// A command running `program` with empty arguments and null streams.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }
}

/// Point-in-time memory counters for a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ProcessMemoryInfo {
    pub page_fault_count: u32,
    pub peak_working_set_size: u64,
    pub working_set_size: u64,
    pub quota_peak_paged_pool_usage: u64,
    pub quota_paged_pool_usage: u64,
    pub quota_peak_non_paged_pool_usage: u64,
    pub quota_non_paged_pool_usage: u64,
    pub pagefile_usage: u64,
    pub peak_pagefile_usage: u64,
    pub private_usage: u64,
}

#[repr(C)]
#[derive(Default)]
struct ProcessMemoryCountersExRaw {
    cb: u32,
    page_fault_count: u32,
    peak_working_set_size: usize,
    working_set_size: usize,
    quota_peak_paged_pool_usage: usize,
    quota_paged_pool_usage: usize,
    quota_peak_non_paged_pool_usage: usize,
    quota_non_paged_pool_usage: usize,
    pagefile_usage: usize,
    peak_pagefile_usage: usize,
    private_usage: usize,
}

/// A started child process.
///
/// The wrapper exclusively owns the process handle; the handle closes when
/// the value drops, which does not terminate the process.
#[derive(Debug)]
pub struct ChildProcess {
    handle: OwnedHandle,
    pid: u32,
    suspended: Mutex<bool>,
}

impl ChildProcess {
    /// Start `cmd` with `token` as the primary token (the caller's own token
    /// when `None`), in a new process group.
    ///
    /// With `suspended` set, the main thread does not run until
    /// [`ChildProcess::resume`]; use this to assign the process to a job
    /// object before any user code executes.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of process creation or stream setup.
    pub fn spawn(
        cmd: &ProcessCommand,
        token: Option<&Token>,
        suspended: bool,
    ) -> Result<Self, Win32Error> {
        let mut line = to_wide(&command_line(&cmd.program, &cmd.args));
        let env_block = environment_block(&cmd.env);
        let dir = cmd
            .dir
            .as_ref()
            .and_then(|d| to_wide_opt(&d.display().to_string()));

        let stdin = open_null(GENERIC_READ)?;
        let stdout = inheritable(&cmd.stdout, GENERIC_WRITE)?;
        let stderr = inheritable(&cmd.stderr, GENERIC_WRITE)?;

        let mut startup: STARTUPINFOW = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOW>() as u32;
        startup.dwFlags = STARTF_USESTDHANDLES;
        startup.hStdInput = stdin.as_raw();
        startup.hStdOutput = stdout.raw();
        startup.hStdError = stderr.raw();

        let mut flags = CREATE_NEW_PROCESS_GROUP | CREATE_UNICODE_ENVIRONMENT;
        if suspended {
            flags |= CREATE_SUSPENDED;
        }

        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        let ok = unsafe {
            match token {
                Some(token) => CreateProcessAsUserW(
                    token.as_raw(),
                    ptr::null(),
                    line.as_mut_ptr(),
                    ptr::null(),
                    ptr::null(),
                    1,
                    flags,
                    env_block
                        .as_ref()
                        .map_or(ptr::null(), |b| b.as_ptr().cast()),
                    dir.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                    &startup,
                    &mut info,
                ),
                None => CreateProcessW(
                    ptr::null(),
                    line.as_mut_ptr(),
                    ptr::null(),
                    ptr::null(),
                    1,
                    flags,
                    env_block
                        .as_ref()
                        .map_or(ptr::null(), |b| b.as_ptr().cast()),
                    dir.as_ref().map_or(ptr::null(), |d| d.as_ptr()),
                    &startup,
                    &mut info,
                ),
            }
        };
        if ok == 0 {
            return Err(Win32Error::last(if token.is_some() {
                "CreateProcessAsUserW"
            } else {
                "CreateProcessW"
            }));
        }
        // The main thread is reached again through a toolhelp snapshot at
        // resume time; the creation-time handle is not kept.
        let thread = unsafe { OwnedHandle::from_raw(info.hThread) };
        drop(thread);
        Ok(Self {
            handle: unsafe { OwnedHandle::from_raw(info.hProcess) },
            pid: info.dwProcessId,
            suspended: Mutex::new(suspended),
        })
    }

    /// The child's process ID.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The raw process handle, for job assignment.
    #[must_use]
    pub fn handle(&self) -> &OwnedHandle {
        &self.handle
    }

    /// Resume the main thread of a process started suspended.
    ///
    /// Threads are enumerated through a toolhelp snapshot; the first thread
    /// owned by this PID is opened with resume access and resumed. A no-op
    /// when the process is not suspended.
    ///
    /// # Errors
    ///
    /// Surfaces snapshot, open, or resume failures.
    pub fn resume(&self) -> Result<(), Win32Error> {
        let mut suspended = self.suspended.lock().expect("suspended flag poisoned");
        if !*suspended {
            return Ok(());
        }
        let thread = self.open_main_thread()?;
        if unsafe { ResumeThread(thread.as_raw()) } == u32::MAX {
            return Err(Win32Error::last("ResumeThread"));
        }
        *suspended = false;
        Ok(())
    }

    fn open_main_thread(&self) -> Result<OwnedHandle, Win32Error> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) };
        let snapshot = unsafe { OwnedHandle::from_raw(snapshot) };
        if snapshot.is_invalid() {
            return Err(Win32Error::last("CreateToolhelp32Snapshot"));
        }
        let mut entry: THREADENTRY32 = unsafe { mem::zeroed() };
        entry.dwSize = mem::size_of::<THREADENTRY32>() as u32;
        if unsafe { Thread32First(snapshot.as_raw(), &mut entry) } == 0 {
            return Err(Win32Error::last("Thread32First"));
        }
        loop {
            if entry.th32OwnerProcessID == self.pid {
                let thread =
                    unsafe { OpenThread(THREAD_SUSPEND_RESUME, 0, entry.th32ThreadID) };
                if thread.is_null() {
                    return Err(Win32Error::last("OpenThread"));
                }
                return Ok(unsafe { OwnedHandle::from_raw(thread) });
            }
            if unsafe { Thread32Next(snapshot.as_raw(), &mut entry) } == 0 {
                return Err(Win32Error::last("Thread32Next"));
            }
        }
    }

    /// Block until the process exits and return its exit code.
    ///
    /// Call from a blocking-capable context; the wait is uninterruptible.
    ///
    /// # Errors
    ///
    /// Surfaces wait or exit-code query failures.
    pub fn wait(&self) -> Result<i32, Win32Error> {
        match unsafe { WaitForSingleObject(self.handle.as_raw(), INFINITE) } {
            WAIT_OBJECT_0 => self.exit_code(),
            WAIT_FAILED => Err(Win32Error::last("WaitForSingleObject")),
            other => Err(Win32Error::from_code("WaitForSingleObject", other)),
        }
    }

    /// Wait up to `timeout` for exit; `Ok(None)` when still running.
    ///
    /// # Errors
    ///
    /// Surfaces wait or exit-code query failures.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<i32>, Win32Error> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(INFINITE);
        match unsafe { WaitForSingleObject(self.handle.as_raw(), millis) } {
            WAIT_OBJECT_0 => self.exit_code().map(Some),
            WAIT_TIMEOUT => Ok(None),
            WAIT_FAILED => Err(Win32Error::last("WaitForSingleObject")),
            other => Err(Win32Error::from_code("WaitForSingleObject", other)),
        }
    }

    fn exit_code(&self) -> Result<i32, Win32Error> {
        let mut code: u32 = 0;
        if unsafe { GetExitCodeProcess(self.handle.as_raw(), &mut code) } == 0 {
            return Err(Win32Error::last("GetExitCodeProcess"));
        }
        Ok(code as i32)
    }

    /// Forcibly terminate the process.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `TerminateProcess`; terminating an
    /// already-exited process fails with access denied, which callers treat
    /// as settled.
    pub fn kill(&self) -> Result<(), Win32Error> {
        if unsafe { TerminateProcess(self.handle.as_raw(), 1) } == 0 {
            return Err(Win32Error::last("TerminateProcess"));
        }
        Ok(())
    }

    /// Raise a console ctrl-break event on the child's process group.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `GenerateConsoleCtrlEvent`.
    pub fn send_console_break(&self) -> Result<(), Win32Error> {
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, self.pid) } == 0 {
            return Err(Win32Error::last("GenerateConsoleCtrlEvent"));
        }
        Ok(())
    }

    /// Sample the process memory counters.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of the counter query.
    pub fn memory_info(&self) -> Result<ProcessMemoryInfo, Win32Error> {
        let mut raw = ProcessMemoryCountersExRaw {
            cb: mem::size_of::<ProcessMemoryCountersExRaw>() as u32,
            ..ProcessMemoryCountersExRaw::default()
        };
        let ok = unsafe {
            K32GetProcessMemoryInfo(
                self.handle.as_raw(),
                std::ptr::addr_of_mut!(raw).cast(),
                mem::size_of::<ProcessMemoryCountersExRaw>() as u32,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("GetProcessMemoryInfo"));
        }
        Ok(ProcessMemoryInfo {
            page_fault_count: raw.page_fault_count,
            peak_working_set_size: raw.peak_working_set_size as u64,
            working_set_size: raw.working_set_size as u64,
            quota_peak_paged_pool_usage: raw.quota_peak_paged_pool_usage as u64,
            quota_paged_pool_usage: raw.quota_paged_pool_usage as u64,
            quota_peak_non_paged_pool_usage: raw.quota_peak_non_paged_pool_usage as u64,
            quota_non_paged_pool_usage: raw.quota_non_paged_pool_usage as u64,
            pagefile_usage: raw.pagefile_usage as u64,
            peak_pagefile_usage: raw.peak_pagefile_usage as u64,
            private_usage: raw.private_usage as u64,
        })
    }

    /// The process and system affinity masks.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `GetProcessAffinityMask`.
    pub fn affinity_mask(&self) -> Result<(u64, u64), Win32Error> {
        let mut process_mask: usize = 0;
        let mut system_mask: usize = 0;
        let ok = unsafe {
            GetProcessAffinityMask(self.handle.as_raw(), &mut process_mask, &mut system_mask)
        };
        if ok == 0 {
            return Err(Win32Error::last("GetProcessAffinityMask"));
        }
        Ok((process_mask as u64, system_mask as u64))
    }
}

/// An anonymous pipe for capturing a child's output: the write end is
/// inheritable and handed to the child, the read end is drained by the
/// caller.
///
/// # Errors
///
/// Surfaces the kernel status of pipe creation.
pub fn capture_pipe() -> Result<(OwnedHandle, File), Win32Error> {
    let sa = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };
    let mut read = ptr::null_mut();
    let mut write = ptr::null_mut();
    if unsafe { CreatePipe(&mut read, &mut write, &sa, 0) } == 0 {
        return Err(Win32Error::last("CreatePipe"));
    }
    let write = unsafe { OwnedHandle::from_raw(write) };
    // only the write end crosses into the child
    if unsafe { SetHandleInformation(read, HANDLE_FLAG_INHERIT, 0) } == 0 {
        let err = Win32Error::last("SetHandleInformation");
        drop(unsafe { OwnedHandle::from_raw(read) });
        return Err(err);
    }
    let reader = unsafe { File::from_raw_handle(read as _) };
    Ok((write, reader))
}

enum InheritableStdio {
    Owned(OwnedHandle),
    Borrowed(windows_sys::Win32::Foundation::HANDLE),
}

impl InheritableStdio {
    fn raw(&self) -> windows_sys::Win32::Foundation::HANDLE {
        match self {
            Self::Owned(handle) => handle.as_raw(),
            Self::Borrowed(raw) => *raw,
        }
    }
}

fn inheritable(stdio: &Stdio, access: u32) -> Result<InheritableStdio, Win32Error> {
    match stdio {
        Stdio::Null => open_null(access).map(InheritableStdio::Owned),
        Stdio::Handle(handle) => {
            let ok = unsafe {
                SetHandleInformation(handle.as_raw(), HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT)
            };
            if ok == 0 {
                return Err(Win32Error::last("SetHandleInformation"));
            }
            Ok(InheritableStdio::Borrowed(handle.as_raw()))
        }
    }
}

fn open_null(access: u32) -> Result<OwnedHandle, Win32Error> {
    let sa = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: 1,
    };
    let name = to_wide("NUL");
    let handle = unsafe {
        CreateFileW(
            name.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            &sa,
            OPEN_EXISTING,
            0,
            ptr::null_mut(),
        )
    };
    let handle = unsafe { OwnedHandle::from_raw(handle) };
    if handle.is_invalid() {
        return Err(Win32Error::last("CreateFileW"));
    }
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_spawn_wait_exit_code() {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "exit 7".to_string()];
        let child = ChildProcess::spawn(&cmd, None, false).expect("spawn");
        assert!(child.pid() > 0);
        assert_eq!(child.wait().expect("wait"), 7);
    }

    #[test]
    fn test_suspended_process_runs_after_resume() {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "exit 0".to_string()];
        let child = ChildProcess::spawn(&cmd, None, true).expect("spawn");
        assert_eq!(
            child
                .wait_timeout(Duration::from_millis(200))
                .expect("poll"),
            None
        );
        child.resume().expect("resume");
        assert_eq!(child.wait().expect("wait"), 0);
    }

    #[test]
    fn test_kill_reports_exit_one() {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "ping -n 30 127.0.0.1 > NUL".to_string()];
        let child = ChildProcess::spawn(&cmd, None, false).expect("spawn");
        child.kill().expect("kill");
        assert_eq!(child.wait().expect("wait"), 1);
    }

    #[test]
    fn test_capture_pipe_round_trip() {
        let (write, mut read) = capture_pipe().expect("pipe");
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "echo captured".to_string()];
        cmd.stdout = Stdio::Handle(write);
        let child = ChildProcess::spawn(&cmd, None, false).expect("spawn");
        assert_eq!(child.wait().expect("wait"), 0);
        drop(cmd);
        let mut out = String::new();
        read.read_to_string(&mut out).expect("drain");
        assert!(out.contains("captured"));
    }

    #[test]
    fn test_memory_info_nonzero_working_set() {
        let mut cmd = ProcessCommand::new("cmd.exe");
        cmd.args = vec!["/C".to_string(), "ping -n 5 127.0.0.1 > NUL".to_string()];
        let child = ChildProcess::spawn(&cmd, None, false).expect("spawn");
        let info = child.memory_info().expect("memory info");
        assert!(info.working_set_size > 0);
        let (process_mask, system_mask) = child.affinity_mask().expect("affinity");
        assert_ne!(process_mask, 0);
        assert_ne!(system_mask, 0);
        child.kill().ok();
        child.wait().ok();
    }
}
