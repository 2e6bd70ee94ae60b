//! System information: processor count, memory totals, and the TCP
//! connection tables used for diagnostics.

use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ptr;

use windows_sys::Win32::Foundation::ERROR_INSUFFICIENT_BUFFER;
use windows_sys::Win32::NetworkManagement::IpHelper::GetExtendedTcpTable;
use windows_sys::Win32::System::SystemInformation::{
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
};

use super::Win32Error;

const AF_INET: u32 = 2;
const AF_INET6: u32 = 23;
const TCP_TABLE_OWNER_PID_ALL: i32 = 5;

/// Number of logical processors.
///
/// # Errors
///
/// This query cannot fail at the kernel level; the `Result` keeps the
/// contract uniform with the other probes.
pub fn num_cores() -> Result<usize, Win32Error> {
    let mut info: SYSTEM_INFO = unsafe { mem::zeroed() };
    unsafe { GetSystemInfo(&mut info) };
    Ok(info.dwNumberOfProcessors as usize)
}

/// Global memory totals in bytes.
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct MemoryStatus {
    pub total_physical: u64,
    pub available_physical: u64,
    pub total_virtual: u64,
    pub available_virtual: u64,
    pub total_page_file: u64,
    pub available_page_file: u64,
    pub load_percent: u32,
}

/// Query the machine-wide memory status.
///
/// # Errors
///
/// Surfaces the kernel status of `GlobalMemoryStatusEx`.
pub fn memory_status() -> Result<MemoryStatus, Win32Error> {
    let mut raw: MEMORYSTATUSEX = unsafe { mem::zeroed() };
    raw.dwLength = mem::size_of::<MEMORYSTATUSEX>() as u32;
    if unsafe { GlobalMemoryStatusEx(&mut raw) } == 0 {
        return Err(Win32Error::last("GlobalMemoryStatusEx"));
    }
    Ok(MemoryStatus {
        total_physical: raw.ullTotalPhys,
        available_physical: raw.ullAvailPhys,
        total_virtual: raw.ullTotalVirtual,
        available_virtual: raw.ullAvailVirtual,
        total_page_file: raw.ullTotalPageFile,
        available_page_file: raw.ullAvailPageFile,
        load_percent: raw.dwMemoryLoad,
    })
}

/// One row of the TCP connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpConnection {
    /// Local endpoint.
    pub local: SocketAddr,
    /// Remote endpoint.
    pub remote: SocketAddr,
    /// Raw MIB_TCP_STATE value.
    pub state: u32,
    /// Owning process.
    pub pid: u32,
}

impl TcpConnection {
    /// Human-readable connection state.
    #[must_use]
    pub fn state_name(&self) -> &'static str {
        match self.state {
            1 => "CLOSED",
            2 => "LISTEN",
            3 => "SYN-SENT",
            4 => "SYN-RECEIVED",
            5 => "ESTABLISHED",
            6 => "FIN-WAIT-1",
            7 => "FIN-WAIT-2",
            8 => "CLOSE-WAIT",
            9 => "CLOSING",
            10 => "LAST-ACK",
            11 => "TIME-WAIT",
            12 => "DELETE-TCB",
            _ => "UNKNOWN",
        }
    }
}

#[repr(C)]
struct TcpRowOwnerPidRaw {
    state: u32,
    local_addr: u32,
    local_port: u32,
    remote_addr: u32,
    remote_port: u32,
    owning_pid: u32,
}

#[repr(C)]
struct Tcp6RowOwnerPidRaw {
    local_addr: [u8; 16],
    local_scope_id: u32,
    local_port: u32,
    remote_addr: [u8; 16],
    remote_scope_id: u32,
    remote_port: u32,
    state: u32,
    owning_pid: u32,
}

fn port(raw: u32) -> u16 {
    u16::from_be((raw & 0xFFFF) as u16)
}

fn tcp_table(family: u32) -> Result<Vec<u8>, Win32Error> {
    let mut size: u32 = 0;
    unsafe {
        GetExtendedTcpTable(
            ptr::null_mut(),
            &mut size,
            0,
            family,
            TCP_TABLE_OWNER_PID_ALL,
            0,
        )
    };
    loop {
        let mut buf = vec![0u8; size as usize];
        let status = unsafe {
            GetExtendedTcpTable(
                buf.as_mut_ptr().cast(),
                &mut size,
                0,
                family,
                TCP_TABLE_OWNER_PID_ALL,
                0,
            )
        };
        match status {
            0 => return Ok(buf),
            ERROR_INSUFFICIENT_BUFFER => {}
            other => return Err(Win32Error::from_code("GetExtendedTcpTable", other)),
        }
    }
}

/// The IPv4 TCP connection table with owning PIDs.
///
/// # Errors
///
/// Surfaces the kernel status of `GetExtendedTcpTable`.
pub fn tcp4_connections() -> Result<Vec<TcpConnection>, Win32Error> {
    let buf = tcp_table(AF_INET)?;
    let count = u32::from_ne_bytes(buf[..4].try_into().expect("table header")) as usize;
    let rows = unsafe { buf.as_ptr().add(4).cast::<TcpRowOwnerPidRaw>() };
    let mut connections = Vec::with_capacity(count);
    for i in 0..count {
        let row = unsafe { &*rows.add(i) };
        connections.push(TcpConnection {
            local: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(row.local_addr.to_ne_bytes())),
                port(row.local_port),
            ),
            remote: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::from(row.remote_addr.to_ne_bytes())),
                port(row.remote_port),
            ),
            state: row.state,
            pid: row.owning_pid,
        });
    }
    Ok(connections)
}

/// The IPv6 TCP connection table with owning PIDs.
///
/// # Errors
///
/// Surfaces the kernel status of `GetExtendedTcpTable`.
pub fn tcp6_connections() -> Result<Vec<TcpConnection>, Win32Error> {
    let buf = tcp_table(AF_INET6)?;
    let count = u32::from_ne_bytes(buf[..4].try_into().expect("table header")) as usize;
    let rows = unsafe { buf.as_ptr().add(4).cast::<Tcp6RowOwnerPidRaw>() };
    let mut connections = Vec::with_capacity(count);
    for i in 0..count {
        let row = unsafe { &*rows.add(i) };
        connections.push(TcpConnection {
            local: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(row.local_addr)),
                port(row.local_port),
            ),
            remote: SocketAddr::new(
                IpAddr::V6(Ipv6Addr::from(row.remote_addr)),
                port(row.remote_port),
            ),
            state: row.state,
            pid: row.owning_pid,
        });
    }
    Ok(connections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_num_cores_positive() {
        assert!(num_cores().expect("cores") >= 1);
    }

    #[test]
    fn test_memory_status_totals() {
        let status = memory_status().expect("memory status");
        assert!(status.total_physical > 0);
        assert!(status.total_virtual > 0);
    }

    #[test]
    fn test_tcp4_table_readable() {
        // table may legitimately be empty; the call itself must succeed
        let connections = tcp4_connections().expect("tcp4 table");
        for conn in connections {
            assert!(conn.local.is_ipv4());
        }
    }
}
