//! Minimal registry access: open a key, read a value, close.

use std::fmt;
use std::ptr;

use windows_sys::Win32::System::Registry::{
    HKEY, HKEY_CLASSES_ROOT, HKEY_CURRENT_CONFIG, HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE,
    HKEY_USERS, KEY_READ, KEY_WRITE, REG_DWORD, REG_DWORD_BIG_ENDIAN, RegCloseKey,
    RegOpenKeyExW, RegQueryValueExW,
};

use super::strings::to_wide;
use super::Win32Error;

/// Desired access for [`RegistryKey::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryPermissions {
    /// Request read access.
    pub read: bool,
    /// Request write access.
    pub write: bool,
}

/// An open registry key, closed on drop.
pub struct RegistryKey {
    hkey: HKEY,
    path: String,
}

// Registry handles are process-global; the kernel serializes access.
unsafe impl Send for RegistryKey {}

fn root_key(name: &str) -> Option<HKEY> {
    match name.to_uppercase().as_str() {
        "HKLM" | "HKEY_LOCAL_MACHINE" => Some(HKEY_LOCAL_MACHINE),
        "HKCU" | "HKEY_CURRENT_USER" => Some(HKEY_CURRENT_USER),
        "HKCR" | "HKEY_CLASSES_ROOT" => Some(HKEY_CLASSES_ROOT),
        "HKU" | "HKEY_USERS" => Some(HKEY_USERS),
        "HKCC" | "HKEY_CURRENT_CONFIG" => Some(HKEY_CURRENT_CONFIG),
        _ => None,
    }
}

impl RegistryKey {
    /// Open `root\subkey` with the requested permissions.
    ///
    /// # Errors
    ///
    /// Fails on an unknown root name or a kernel open failure.
    pub fn open(
        root: &str,
        subkey: &str,
        perms: RegistryPermissions,
    ) -> Result<Self, Win32Error> {
        let Some(hroot) = root_key(root) else {
            return Err(Win32Error {
                op: "RegOpenKeyExW",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("root key name '{root}' not valid"),
                ),
            });
        };
        let mut access = 0u32;
        if perms.read {
            access |= KEY_READ;
        }
        if perms.write {
            access |= KEY_WRITE;
        }
        let wide = to_wide(subkey);
        let mut hkey: HKEY = ptr::null_mut();
        let status =
            unsafe { RegOpenKeyExW(hroot, wide.as_ptr(), 0, access, &mut hkey) };
        if status != 0 {
            return Err(Win32Error::from_code("RegOpenKeyExW", status));
        }
        Ok(Self {
            hkey,
            path: format!("{}\\{subkey}", root.to_uppercase()),
        })
    }

    /// Read a raw value: bytes plus the registry type code.
    ///
    /// # Errors
    ///
    /// Fails when the value does not exist or cannot be read.
    pub fn read_value(&self, name: &str) -> Result<(Vec<u8>, u32), Win32Error> {
        let wide = to_wide(name);
        let mut kind: u32 = 0;
        let mut len: u32 = 0;
        let status = unsafe {
            RegQueryValueExW(
                self.hkey,
                wide.as_ptr(),
                ptr::null(),
                &mut kind,
                ptr::null_mut(),
                &mut len,
            )
        };
        if status != 0 {
            return Err(Win32Error::from_code("RegQueryValueExW", status));
        }
        let mut buf = vec![0u8; len as usize];
        let status = unsafe {
            RegQueryValueExW(
                self.hkey,
                wide.as_ptr(),
                ptr::null(),
                &mut kind,
                buf.as_mut_ptr(),
                &mut len,
            )
        };
        if status != 0 {
            return Err(Win32Error::from_code("RegQueryValueExW", status));
        }
        buf.truncate(len as usize);
        Ok((buf, kind))
    }

    /// Read a DWORD value, honoring both little- and big-endian storage.
    ///
    /// # Errors
    ///
    /// Fails when the value is absent or not a DWORD type.
    pub fn read_dword(&self, name: &str) -> Result<u32, Win32Error> {
        let (bytes, kind) = self.read_value(name)?;
        let quad: [u8; 4] = match bytes.as_slice().try_into() {
            Ok(quad) => quad,
            Err(_) => {
                return Err(Win32Error {
                    op: "RegQueryValueExW",
                    source: std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("value '{name}' is not 4 bytes"),
                    ),
                });
            }
        };
        match kind {
            REG_DWORD => Ok(u32::from_le_bytes(quad)),
            REG_DWORD_BIG_ENDIAN => Ok(u32::from_be_bytes(quad)),
            other => Err(Win32Error {
                op: "RegQueryValueExW",
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("value '{name}' has type {other}, not DWORD"),
                ),
            }),
        }
    }
}

impl fmt::Display for RegistryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

impl Drop for RegistryKey {
    fn drop(&mut self) {
        let status = unsafe { RegCloseKey(self.hkey) };
        if status != 0 {
            tracing::warn!(key = %self.path, status, "failed to close registry key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_unknown_root_fails() {
        let err = RegistryKey::open("HKXX", "SOFTWARE", RegistryPermissions { read: true, write: false })
            .unwrap_err();
        assert_eq!(err.op, "RegOpenKeyExW");
    }

    #[test]
    fn test_read_processor_mhz() {
        let key = RegistryKey::open(
            "HKLM",
            r"HARDWARE\DESCRIPTION\System\CentralProcessor\0",
            RegistryPermissions { read: true, write: false },
        )
        .expect("open cpu key");
        let mhz = key.read_dword("~MHz").expect("read ~MHz");
        assert!(mhz > 0);
    }

    #[test]
    fn test_missing_value_errors() {
        let key = RegistryKey::open(
            "HKLM",
            r"HARDWARE\DESCRIPTION\System\CentralProcessor\0",
            RegistryPermissions { read: true, write: false },
        )
        .expect("open cpu key");
        assert!(key.read_dword("no-such-value-damon").is_err());
    }
}
