use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};

/// An owned kernel handle, closed on drop.
///
/// Close failures during drop are logged, not surfaced; explicit teardown
/// paths that need the error call [`OwnedHandle::close`].
#[derive(Debug)]
pub struct OwnedHandle {
    raw: HANDLE,
}

// Kernel handles are process-global tokens; the kernel serializes access.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// Take ownership of a raw handle.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid handle owned by the caller and not closed
    /// elsewhere.
    #[must_use]
    pub unsafe fn from_raw(raw: HANDLE) -> Self {
        Self { raw }
    }

    /// The raw handle value for FFI calls.
    #[must_use]
    pub fn as_raw(&self) -> HANDLE {
        self.raw
    }

    /// `true` when the handle value is null or the invalid sentinel.
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        self.raw.is_null() || self.raw == INVALID_HANDLE_VALUE
    }

    /// Close the handle now, reporting the OS status.
    pub fn close(mut self) -> Result<(), super::Win32Error> {
        let raw = std::mem::replace(&mut self.raw, std::ptr::null_mut());
        std::mem::forget(self);
        if raw.is_null() {
            return Ok(());
        }
        if unsafe { CloseHandle(raw) } == 0 {
            return Err(super::Win32Error::last("CloseHandle"));
        }
        Ok(())
    }

    /// Release ownership without closing.
    #[must_use]
    pub fn into_raw(self) -> HANDLE {
        let raw = self.raw;
        std::mem::forget(self);
        raw
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.raw.is_null() || self.raw == INVALID_HANDLE_VALUE {
            return;
        }
        if unsafe { CloseHandle(self.raw) } == 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to close handle"
            );
        }
    }
}
