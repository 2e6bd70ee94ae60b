//! Build version information.

use std::fmt;

/// Version details stamped into the binary.
#[derive(Debug, Clone)]
pub struct Info {
    /// Semantic version number.
    pub number: &'static str,
    /// Git revision, when the build script provided one.
    pub revision: Option<&'static str>,
}

/// The version information for this build.
#[must_use]
pub fn get() -> Info {
    Info {
        number: env!("CARGO_PKG_VERSION"),
        revision: option_env!("DAMON_GIT_COMMIT"),
    }
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Damon v{}", self.number)?;
        if let Some(revision) = self.revision {
            write!(f, " ({revision})")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_string() {
        let info = get();
        assert!(!info.number.is_empty());
        assert!(info.to_string().starts_with("Damon v"));
    }
}
