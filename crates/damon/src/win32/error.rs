use std::io;

/// Error returned by a kernel call, tagged with the operation name.
#[derive(Debug, thiserror::Error)]
#[error("{op} failed: {source}")]
pub struct Win32Error {
    /// Name of the failing kernel call.
    pub op: &'static str,
    /// Originating OS status.
    #[source]
    pub source: io::Error,
}

impl Win32Error {
    /// Capture the calling thread's last OS error for `op`.
    #[must_use]
    pub fn last(op: &'static str) -> Self {
        Self {
            op,
            source: io::Error::last_os_error(),
        }
    }

    /// Wrap an explicit OS status code.
    #[must_use]
    pub fn from_code(op: &'static str, code: u32) -> Self {
        Self {
            op,
            source: io::Error::from_raw_os_error(code as i32),
        }
    }

    /// The raw OS status code, if one was recorded.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_carries_op_and_code() {
        let err = Win32Error::from_code("CreateJobObjectW", 5);
        assert_eq!(err.op, "CreateJobObjectW");
        assert_eq!(err.code(), Some(5));
        assert!(err.to_string().starts_with("CreateJobObjectW failed"));
    }
}
