//! Local security policy: account-rights management.
//!
//! Only test setup uses this (granting a service account the batch-logon
//! right); the wrappers still close every policy handle and LSA buffer they
//! open.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows_sys::Win32::Security::Authentication::Identity::{
    LSA_OBJECT_ATTRIBUTES, LSA_UNICODE_STRING, LsaAddAccountRights, LsaClose,
    LsaEnumerateAccountRights, LsaFreeMemory, LsaNtStatusToWinError, LsaOpenPolicy,
    LsaRemoveAccountRights,
};
use windows_sys::Win32::Security::LookupAccountNameW;

use super::strings::to_wide;
use super::Win32Error;

// POLICY_* access bits, ntsecapi.h.
const POLICY_VIEW_LOCAL_INFORMATION: u32 = 0x0001;
const POLICY_LOOKUP_NAMES: u32 = 0x0800;
const POLICY_CREATE_ACCOUNT: u32 = 0x0010;

/// The account right that allows batch (scheduled/service) logons.
pub const SE_BATCH_LOGON_RIGHT: &str = "SeBatchLogonRight";

fn nt_error(op: &'static str, status: i32) -> Win32Error {
    Win32Error::from_code(op, unsafe { LsaNtStatusToWinError(status) })
}

/// Resolve an account name to its SID bytes.
///
/// # Errors
///
/// Surfaces the kernel status of `LookupAccountNameW`.
pub fn account_sid(account: &str) -> Result<Vec<u8>, Win32Error> {
    let wide = to_wide(account);
    let mut sid_len: u32 = 0;
    let mut domain_len: u32 = 0;
    let mut use_kind: i32 = 0;
    unsafe {
        LookupAccountNameW(
            ptr::null(),
            wide.as_ptr(),
            ptr::null_mut(),
            &mut sid_len,
            ptr::null_mut(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if sid_len == 0 {
        return Err(Win32Error::last("LookupAccountNameW"));
    }
    let mut sid = vec![0u8; sid_len as usize];
    let mut domain = vec![0u16; domain_len as usize];
    let ok = unsafe {
        LookupAccountNameW(
            ptr::null(),
            wide.as_ptr(),
            sid.as_mut_ptr().cast(),
            &mut sid_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if ok == 0 {
        return Err(Win32Error::last("LookupAccountNameW"));
    }
    Ok(sid)
}

/// An open handle to the local security policy.
pub struct LsaPolicy {
    handle: *mut c_void,
}

unsafe impl Send for LsaPolicy {}

impl LsaPolicy {
    /// Open the local policy with enough access to read and edit account
    /// rights.
    ///
    /// # Errors
    ///
    /// Surfaces the NT status of `LsaOpenPolicy` converted to a Win32 code.
    pub fn open() -> Result<Self, Win32Error> {
        let mut attrs: LSA_OBJECT_ATTRIBUTES = unsafe { mem::zeroed() };
        attrs.Length = mem::size_of::<LSA_OBJECT_ATTRIBUTES>() as u32;
        let mut handle = ptr::null_mut();
        let status = unsafe {
            LsaOpenPolicy(
                ptr::null(),
                &attrs,
                POLICY_VIEW_LOCAL_INFORMATION | POLICY_LOOKUP_NAMES | POLICY_CREATE_ACCOUNT,
                &mut handle,
            )
        };
        if status != 0 {
            return Err(nt_error("LsaOpenPolicy", status));
        }
        Ok(Self { handle })
    }

    /// The rights currently granted to `sid`.
    ///
    /// An account with no granted rights reports an empty list rather than
    /// an error.
    ///
    /// # Errors
    ///
    /// Surfaces the NT status of `LsaEnumerateAccountRights`.
    pub fn account_rights(&self, sid: &[u8]) -> Result<Vec<String>, Win32Error> {
        const STATUS_OBJECT_NAME_NOT_FOUND: i32 = 0xC000_0034_u32 as i32;
        let mut rights: *mut LSA_UNICODE_STRING = ptr::null_mut();
        let mut count: u32 = 0;
        let status = unsafe {
            LsaEnumerateAccountRights(
                self.handle,
                sid.as_ptr() as *mut c_void,
                &mut rights,
                &mut count,
            )
        };
        if status == STATUS_OBJECT_NAME_NOT_FOUND {
            return Ok(Vec::new());
        }
        if status != 0 {
            return Err(nt_error("LsaEnumerateAccountRights", status));
        }
        let mut names = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let entry = unsafe { &*rights.add(i) };
            let chars = entry.Length as usize / 2;
            let slice = unsafe { std::slice::from_raw_parts(entry.Buffer, chars) };
            names.push(String::from_utf16_lossy(slice));
        }
        unsafe { LsaFreeMemory(rights.cast()) };
        Ok(names)
    }

    /// Grant `right` to `sid`.
    ///
    /// # Errors
    ///
    /// Surfaces the NT status of `LsaAddAccountRights`.
    pub fn add_account_right(&self, sid: &[u8], right: &str) -> Result<(), Win32Error> {
        let wide = to_wide(right);
        let entry = unicode_string(&wide);
        let status = unsafe {
            LsaAddAccountRights(self.handle, sid.as_ptr() as *mut c_void, &entry, 1)
        };
        if status != 0 {
            return Err(nt_error("LsaAddAccountRights", status));
        }
        Ok(())
    }

    /// Revoke `right` from `sid`.
    ///
    /// # Errors
    ///
    /// Surfaces the NT status of `LsaRemoveAccountRights`.
    pub fn remove_account_right(&self, sid: &[u8], right: &str) -> Result<(), Win32Error> {
        let wide = to_wide(right);
        let entry = unicode_string(&wide);
        let status = unsafe {
            LsaRemoveAccountRights(self.handle, sid.as_ptr() as *mut c_void, 0, &entry, 1)
        };
        if status != 0 {
            return Err(nt_error("LsaRemoveAccountRights", status));
        }
        Ok(())
    }
}

/// Build an `LSA_UNICODE_STRING` view over a null-terminated wide buffer.
fn unicode_string(wide: &[u16]) -> LSA_UNICODE_STRING {
    let chars = wide.len() - 1;
    LSA_UNICODE_STRING {
        Length: (chars * 2) as u16,
        MaximumLength: (wide.len() * 2) as u16,
        Buffer: wide.as_ptr() as *mut u16,
    }
}

impl Drop for LsaPolicy {
    fn drop(&mut self) {
        let status = unsafe { LsaClose(self.handle) };
        if status != 0 {
            tracing::warn!(status, "failed to close LSA policy handle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_sid_lookup() {
        let sid = account_sid("Everyone").expect("well-known sid");
        assert!(!sid.is_empty());
        assert!(account_sid("no-such-account-damon-test").is_err());
    }

    #[test]
    fn test_open_policy_and_enumerate() {
        // policy access needs elevation on most machines
        let Ok(policy) = LsaPolicy::open() else {
            return;
        };
        let sid = account_sid("Everyone").expect("well-known sid");
        // enumeration must not error even when the list is empty
        let _rights = policy.account_rights(&sid).expect("rights");
    }
}
