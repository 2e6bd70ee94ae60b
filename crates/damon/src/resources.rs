//! One-shot discovery of the machine's CPU and memory resources.
//!
//! The probe runs at most once; every later call reads the cached value
//! lock-free. A machine whose core count, clock speed, or memory totals
//! cannot be determined cannot run contained workloads at all, so a failed
//! probe is fatal.

use std::sync::OnceLock;

use crate::win32::registry::{RegistryKey, RegistryPermissions};
use crate::win32::{sysinfo, Win32Error};

const PROCESSOR_KEY: &str = r"HARDWARE\DESCRIPTION\System\CentralProcessor\0";

/// Immutable system-wide resource totals.
#[derive(Debug, Clone, Copy)]
pub struct SystemResources {
    /// Logical processor count.
    pub cpu_cores: usize,
    /// Clock speed per core in MHz, from the hardware description key.
    pub cpu_mhz_per_core: f64,
    /// `cpu_cores * cpu_mhz_per_core`, floored.
    pub cpu_total_ticks: f64,
    /// Physical memory in KiB.
    pub memory_total_physical_kb: f64,
    /// Virtual address space in KiB.
    pub memory_total_virtual_kb: f64,
}

static SYSTEM_RESOURCES: OnceLock<SystemResources> = OnceLock::new();

/// The machine's resource totals.
///
/// # Panics
///
/// Panics when the first probe fails; see the module docs.
#[must_use]
pub fn get() -> SystemResources {
    *SYSTEM_RESOURCES.get_or_init(|| match probe() {
        Ok(resources) => resources,
        Err(err) => panic!("unable to determine system resources: {err}"),
    })
}

fn probe() -> Result<SystemResources, Win32Error> {
    let cores = sysinfo::num_cores()?;
    let mhz = processor_mhz()?;
    let memory = sysinfo::memory_status()?;
    Ok(SystemResources {
        cpu_cores: cores,
        cpu_mhz_per_core: f64::from(mhz),
        cpu_total_ticks: (cores as f64 * f64::from(mhz)).floor(),
        memory_total_physical_kb: memory.total_physical as f64 / 1024.0,
        memory_total_virtual_kb: memory.total_virtual as f64 / 1024.0,
    })
}

fn processor_mhz() -> Result<u32, Win32Error> {
    let key = RegistryKey::open(
        "HKLM",
        PROCESSOR_KEY,
        RegistryPermissions {
            read: true,
            write: false,
        },
    )?;
    key.read_dword("~MHz")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_is_consistent() {
        let first = get();
        let second = get();
        assert!(first.cpu_cores >= 1);
        assert!(first.cpu_mhz_per_core > 0.0);
        assert_eq!(first.cpu_total_ticks, second.cpu_total_ticks);
        assert!(first.memory_total_physical_kb > 0.0);
    }
}
