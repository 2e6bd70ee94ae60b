//! Access tokens: duplication of the supervisor's own token and derivation
//! of restricted tokens for downgraded children.

use std::ffi::c_void;
use std::mem;
use std::ptr;

use windows_sys::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, GENERIC_ALL};
use windows_sys::Win32::Security::{
    CreateRestrictedToken, DuplicateTokenEx, GetTokenInformation, ImpersonateLoggedOnUser,
    LUID_AND_ATTRIBUTES, LogonUserW, LookupAccountSidW, LookupPrivilegeValueW, RevertToSelf,
    SID_AND_ATTRIBUTES, TOKEN_ASSIGN_PRIMARY, TOKEN_ADJUST_DEFAULT, TOKEN_DUPLICATE,
    TOKEN_GROUPS, TOKEN_QUERY, TokenGroups, TokenType,
};
use windows_sys::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::strings::{environment_block_entries, from_wide, to_wide};
use super::{OwnedHandle, Win32Error};

// CreateRestrictedToken flags, winnt.h.
const DISABLE_MAX_PRIVILEGE: u32 = 0x1;
const SANDBOX_INERT: u32 = 0x2;
const LUA_TOKEN: u32 = 0x4;
const WRITE_RESTRICTED: u32 = 0x8;

// SID_NAME_USE values that identify group-like accounts.
const SID_TYPE_GROUP: i32 = 2;
const SID_TYPE_ALIAS: i32 = 4;
const SID_TYPE_WELL_KNOWN_GROUP: i32 = 5;

// LogonUserW / DuplicateTokenEx parameters, winbase.h and winnt.h.
const LOGON32_LOGON_BATCH: u32 = 4;
const LOGON32_PROVIDER_DEFAULT: u32 = 0;
const SECURITY_IMPERSONATION: i32 = 2;
const TOKEN_TYPE_PRIMARY: i32 = 1;

/// Primary vs impersonation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum TokenKind {
    Primary,
    Impersonation,
}

/// Restriction policy for [`Token::create_restricted`].
#[derive(Debug, Clone, Default)]
pub struct TokenRestrictions {
    /// Strip every privilege except `SeChangeNotifyPrivilege`.
    pub disable_max_privilege: bool,
    /// Mark the token exempt from `AppLocker`/SRP checks.
    pub sandbox_inert: bool,
    /// Derive a least-privileged-user token.
    pub lua_token: bool,
    /// Deny-only for write access checks.
    pub write_restricted: bool,
    /// Group names (`DOMAIN\account`) converted to deny-only SIDs.
    /// Names absent from the token are skipped, not errors.
    pub disable_sids: Vec<String>,
    /// Privilege names removed from the token.
    pub disable_privileges: Vec<String>,
    /// Group names added to the restricting SID list.
    pub restrict_sids: Vec<String>,
}

/// Login credentials for a batch-logon token.
#[derive(Debug, Clone)]
pub struct UserLogin {
    /// Account domain; `.` for the local machine.
    pub domain: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

/// An owned access-token handle.
#[derive(Debug)]
pub struct Token {
    handle: OwnedHandle,
}

/// Reverts thread impersonation on drop so a panicking closure cannot leave
/// the thread running as another user.
struct RevertGuard;

impl Drop for RevertGuard {
    fn drop(&mut self) {
        if unsafe { RevertToSelf() } == 0 {
            tracing::error!(
                error = %std::io::Error::last_os_error(),
                "RevertToSelf failed"
            );
        }
    }
}

impl Token {
    /// The raw token handle for process creation.
    #[must_use]
    pub fn as_raw(&self) -> *mut c_void {
        self.handle.as_raw()
    }

    /// Duplicate the current process token with the access rights needed to
    /// start children and derive restricted tokens.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `OpenProcessToken`.
    pub fn current_process() -> Result<Self, Win32Error> {
        let mut raw = ptr::null_mut();
        let ok = unsafe {
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_DUPLICATE | TOKEN_ADJUST_DEFAULT | TOKEN_QUERY | TOKEN_ASSIGN_PRIMARY,
                &mut raw,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("OpenProcessToken"));
        }
        Ok(Self {
            handle: unsafe { OwnedHandle::from_raw(raw) },
        })
    }

    /// Whether this is a primary or impersonation token.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `GetTokenInformation`.
    pub fn kind(&self) -> Result<TokenKind, Win32Error> {
        let mut value: u32 = 0;
        let mut returned: u32 = 0;
        let ok = unsafe {
            GetTokenInformation(
                self.handle.as_raw(),
                TokenType,
                std::ptr::addr_of_mut!(value).cast(),
                mem::size_of::<u32>() as u32,
                &mut returned,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("GetTokenInformation"));
        }
        Ok(if value == 1 {
            TokenKind::Primary
        } else {
            TokenKind::Impersonation
        })
    }

    /// Derive a restricted token.
    ///
    /// Named groups in the policy are resolved against this token's own group
    /// list; a name the token does not carry simply contributes nothing, so a
    /// policy denying an absent group still succeeds with an empty deny list.
    ///
    /// # Errors
    ///
    /// Surfaces group enumeration, privilege lookup, or
    /// `CreateRestrictedToken` failures.
    pub fn create_restricted(&self, res: &TokenRestrictions) -> Result<Self, Win32Error> {
        let group_buf = self.token_groups()?;
        let groups = parse_groups(&group_buf);

        let mut flags = 0u32;
        if res.disable_max_privilege {
            flags |= DISABLE_MAX_PRIVILEGE;
        }
        if res.sandbox_inert {
            flags |= SANDBOX_INERT;
        }
        if res.lua_token {
            flags |= LUA_TOKEN;
        }
        if res.write_restricted {
            flags |= WRITE_RESTRICTED;
        }

        let disable = resolve_sids(&groups, &res.disable_sids);
        let restrict = resolve_sids(&groups, &res.restrict_sids);

        let mut privileges: Vec<LUID_AND_ATTRIBUTES> = Vec::new();
        for name in &res.disable_privileges {
            let wide = to_wide(name);
            let mut entry: LUID_AND_ATTRIBUTES = unsafe { mem::zeroed() };
            let ok = unsafe {
                LookupPrivilegeValueW(ptr::null(), wide.as_ptr(), &mut entry.Luid)
            };
            if ok == 0 {
                return Err(Win32Error::last("LookupPrivilegeValueW"));
            }
            privileges.push(entry);
        }

        let mut raw = ptr::null_mut();
        let ok = unsafe {
            CreateRestrictedToken(
                self.handle.as_raw(),
                flags,
                disable.len() as u32,
                if disable.is_empty() {
                    ptr::null()
                } else {
                    disable.as_ptr()
                },
                privileges.len() as u32,
                if privileges.is_empty() {
                    ptr::null()
                } else {
                    privileges.as_ptr()
                },
                restrict.len() as u32,
                if restrict.is_empty() {
                    ptr::null()
                } else {
                    restrict.as_ptr()
                },
                &mut raw,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("CreateRestrictedToken"));
        }
        Ok(Self {
            handle: unsafe { OwnedHandle::from_raw(raw) },
        })
    }

    /// Log a user on as a batch job and return a primary token suitable for
    /// process creation.
    ///
    /// The account must hold the batch-logon right
    /// ([`super::lsa::SE_BATCH_LOGON_RIGHT`]); the logon token is duplicated
    /// into a primary token and closed.
    ///
    /// # Errors
    ///
    /// Surfaces `LogonUserW` or `DuplicateTokenEx` failures.
    pub fn logon_batch_user(login: &UserLogin) -> Result<Self, Win32Error> {
        let username = to_wide(&login.username);
        let domain = to_wide(&login.domain);
        let password = to_wide(&login.password);
        let mut raw = ptr::null_mut();
        let ok = unsafe {
            LogonUserW(
                username.as_ptr(),
                domain.as_ptr(),
                password.as_ptr(),
                LOGON32_LOGON_BATCH,
                LOGON32_PROVIDER_DEFAULT,
                &mut raw,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("LogonUserW"));
        }
        let logon = unsafe { OwnedHandle::from_raw(raw) };

        let mut primary = ptr::null_mut();
        let ok = unsafe {
            DuplicateTokenEx(
                logon.as_raw(),
                GENERIC_ALL,
                ptr::null(),
                SECURITY_IMPERSONATION,
                TOKEN_TYPE_PRIMARY,
                &mut primary,
            )
        };
        if ok == 0 {
            return Err(Win32Error::last("DuplicateTokenEx"));
        }
        Ok(Self {
            handle: unsafe { OwnedHandle::from_raw(primary) },
        })
    }

    /// The environment block a process started with this token would see,
    /// as `KEY=VALUE` entries.
    ///
    /// With `inherit` set, the supervisor's own environment is merged in.
    ///
    /// # Errors
    ///
    /// Surfaces `CreateEnvironmentBlock` failures. The kernel block is
    /// destroyed after decoding; a destroy failure is logged, not surfaced.
    pub fn environment(&self, inherit: bool) -> Result<Vec<String>, Win32Error> {
        let mut block: *mut c_void = ptr::null_mut();
        let ok = unsafe {
            CreateEnvironmentBlock(&mut block, self.handle.as_raw(), i32::from(inherit))
        };
        if ok == 0 {
            return Err(Win32Error::last("CreateEnvironmentBlock"));
        }
        let entries = unsafe { environment_block_entries(block.cast()) };
        if unsafe { DestroyEnvironmentBlock(block) } == 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to destroy environment block"
            );
        }
        Ok(entries)
    }

    /// Run `f` on the calling thread while impersonating this token,
    /// reverting to the process identity afterwards.
    ///
    /// # Errors
    ///
    /// Surfaces `ImpersonateLoggedOnUser` failures; `f` does not run in
    /// that case.
    pub fn run_as<R>(&self, f: impl FnOnce() -> R) -> Result<R, Win32Error> {
        if unsafe { ImpersonateLoggedOnUser(self.handle.as_raw()) } == 0 {
            return Err(Win32Error::last("ImpersonateLoggedOnUser"));
        }
        let guard = RevertGuard;
        let value = f();
        drop(guard);
        Ok(value)
    }

    /// Close the token handle, reporting the OS status.
    ///
    /// # Errors
    ///
    /// Surfaces the kernel status of `CloseHandle`.
    pub fn close(self) -> Result<(), Win32Error> {
        self.handle.close()
    }

    fn token_groups(&self) -> Result<Vec<u8>, Win32Error> {
        let mut len: u32 = 0;
        unsafe {
            GetTokenInformation(self.handle.as_raw(), TokenGroups, ptr::null_mut(), 0, &mut len)
        };
        if len == 0 {
            return Err(Win32Error::last("GetTokenInformation"));
        }
        loop {
            let mut buf = vec![0u8; len as usize];
            let ok = unsafe {
                GetTokenInformation(
                    self.handle.as_raw(),
                    TokenGroups,
                    buf.as_mut_ptr().cast(),
                    len,
                    &mut len,
                )
            };
            if ok != 0 {
                return Ok(buf);
            }
            let err = Win32Error::last("GetTokenInformation");
            if err.code() != Some(ERROR_INSUFFICIENT_BUFFER as i32) {
                return Err(err);
            }
        }
    }
}

struct NamedGroup {
    name: String,
    sid: *mut c_void,
}

/// Resolve the group SIDs in a token-groups buffer to `DOMAIN\account`
/// names. The returned pointers alias `buf`.
fn parse_groups(buf: &[u8]) -> Vec<NamedGroup> {
    let tg = buf.as_ptr().cast::<TOKEN_GROUPS>();
    let count = unsafe { (*tg).GroupCount } as usize;
    let entries: &[SID_AND_ATTRIBUTES] =
        unsafe { std::slice::from_raw_parts((*tg).Groups.as_ptr(), count) };
    let mut groups = Vec::new();
    for entry in entries {
        if let Some(name) = lookup_account(entry.Sid) {
            groups.push(NamedGroup {
                name: name.to_lowercase(),
                sid: entry.Sid,
            });
        }
    }
    groups
}

fn lookup_account(sid: *mut c_void) -> Option<String> {
    let mut name = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain = [0u16; 256];
    let mut domain_len = domain.len() as u32;
    let mut use_kind: i32 = 0;
    let ok = unsafe {
        LookupAccountSidW(
            ptr::null(),
            sid,
            name.as_mut_ptr(),
            &mut name_len,
            domain.as_mut_ptr(),
            &mut domain_len,
            &mut use_kind,
        )
    };
    if ok == 0 {
        return None;
    }
    if !matches!(
        use_kind,
        SID_TYPE_GROUP | SID_TYPE_ALIAS | SID_TYPE_WELL_KNOWN_GROUP
    ) {
        return None;
    }
    let account = from_wide(&name);
    let domain = from_wide(&domain);
    Some(if domain.is_empty() {
        account
    } else {
        format!("{domain}\\{account}")
    })
}

fn resolve_sids(groups: &[NamedGroup], names: &[String]) -> Vec<SID_AND_ATTRIBUTES> {
    let mut sids = Vec::new();
    for name in names {
        let wanted = name.to_lowercase();
        if let Some(group) = groups.iter().find(|g| g.name == wanted) {
            sids.push(SID_AND_ATTRIBUTES {
                Sid: group.sid,
                Attributes: 0,
            });
        }
    }
    sids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_token_is_primary() {
        let token = Token::current_process().expect("current token");
        assert_eq!(token.kind().expect("kind"), TokenKind::Primary);
    }

    #[test]
    fn test_environment_block_for_current_token() {
        let token = Token::current_process().expect("current token");
        let env = token.environment(false).expect("environment");
        assert!(!env.is_empty());
        assert!(env.iter().all(|entry| entry.contains('=')));
    }

    #[test]
    fn test_run_as_returns_closure_value() {
        let token = Token::current_process().expect("current token");
        let value = token.run_as(|| 40 + 2).expect("impersonate self");
        assert_eq!(value, 42);
    }

    #[test]
    fn test_batch_logon_rejects_bad_credentials() {
        let err = Token::logon_batch_user(&UserLogin {
            domain: ".".to_string(),
            username: "damon-no-such-user".to_string(),
            password: "wrong".to_string(),
        })
        .unwrap_err();
        assert_eq!(err.op, "LogonUserW");
    }

    #[test]
    fn test_restricted_token_with_absent_sid() {
        let token = Token::current_process().expect("current token");
        let restricted = token
            .create_restricted(&TokenRestrictions {
                disable_max_privilege: true,
                lua_token: true,
                disable_sids: vec!["BUILTIN\\NoSuchGroupAnywhere".to_string()],
                ..TokenRestrictions::default()
            })
            .expect("restricted token");
        assert_eq!(restricted.kind().expect("kind"), TokenKind::Primary);
        restricted.close().expect("close restricted");
        token.close().expect("close original");
    }
}
