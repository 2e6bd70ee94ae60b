//! Environment-variable configuration surface.
//!
//! Every reader takes the environment as a lookup function so the parsing
//! rules are testable without mutating process state; `main` passes
//! [`std::env::var`] through [`process_env`].

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Result};

use damon::container::Config;

pub const ENV_CONTAINER_NAME: &str = "DAMON_CONTAINER_NAME";
pub const ENV_ENFORCE_CPU_LIMIT: &str = "DAMON_ENFORCE_CPU_LIMIT";
pub const ENV_ENFORCE_MEMORY_LIMIT: &str = "DAMON_ENFORCE_MEMORY_LIMIT";
pub const ENV_CPU_LIMIT: &str = "DAMON_CPU_LIMIT";
pub const ENV_CPU_HARD_CAP: &str = "DAMON_CPU_HARD_CAP";
pub const ENV_MEMORY_LIMIT: &str = "DAMON_MEMORY_LIMIT";
pub const ENV_RESTRICTED_TOKEN: &str = "DAMON_RESTRICTED_TOKEN";
pub const ENV_ADDRESS: &str = "DAMON_ADDR";
pub const ENV_METRICS_ENDPOINT: &str = "DAMON_METRICS_ENDPOINT";
pub const ENV_LOG_DIR: &str = "DAMON_LOG_DIR";
pub const ENV_LOG_NAME: &str = "DAMON_LOG_NAME";
pub const ENV_LOG_MAX_FILES: &str = "DAMON_LOG_MAX_FILES";
pub const ENV_LOG_MAX_SIZE: &str = "DAMON_LOG_MAX_SIZE";
pub const ENV_NOMAD_LOG_SUFFIX: &str = "DAMON_NOMAD_LOG_SUFFIX";

pub const ENV_NOMAD_CPU_LIMIT: &str = "NOMAD_CPU_LIMIT";
pub const ENV_NOMAD_MEMORY_LIMIT: &str = "NOMAD_MEMORY_LIMIT";
pub const ENV_NOMAD_ALLOC_DIR: &str = "NOMAD_ALLOC_DIR";
pub const ENV_NOMAD_TASK_NAME: &str = "NOMAD_TASK_NAME";
pub const ENV_NOMAD_ALLOC_ID: &str = "NOMAD_ALLOC_ID";
pub const ENV_NOMAD_DAMON_ADDRESS: &str = "NOMAD_ADDR_damon";

const DEFAULT_METRICS_ENDPOINT: &str = "/metrics";
const DEFAULT_LOG_NAME: &str = "damon.log";
const DEFAULT_NOMAD_LOG_SUFFIX: &str = ".damon.log";
const DEFAULT_LOG_MAX_FILES: u64 = 5;
const DEFAULT_LOG_MAX_SIZE_MB: u64 = 10;

/// The process environment as a lookup function.
#[must_use]
pub fn process_env() -> impl Fn(&str) -> Option<String> {
    |name: &str| std::env::var(name).ok()
}

fn env_bool(env: &dyn Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match env(name) {
        Some(value) => match value.trim().to_lowercase().as_str() {
            "y" | "yes" | "true" | "1" => true,
            "n" | "no" | "false" | "0" => false,
            _ => default,
        },
        None => default,
    }
}

fn env_first(env: &dyn Fn(&str) -> Option<String>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| env(name).filter(|v| !v.is_empty()))
}

fn env_int(env: &dyn Fn(&str) -> Option<String>, names: &[&str]) -> Result<Option<i64>> {
    for name in names {
        if let Some(value) = env(name).filter(|v| !v.is_empty()) {
            match value.parse::<i64>() {
                Ok(parsed) => return Ok(Some(parsed)),
                Err(err) => bail!("error parsing environment {name}={value} as integer: {err}"),
            }
        }
    }
    Ok(None)
}

fn nomad_container_name(env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    let alloc = env(ENV_NOMAD_ALLOC_ID).filter(|v| !v.is_empty())?;
    let task = env(ENV_NOMAD_TASK_NAME).filter(|v| !v.is_empty())?;
    Some(format!("damon:{alloc}.{task}"))
}

/// Build the container configuration from the environment.
///
/// Limits come from the `DAMON_*` variables with `NOMAD_*` fallbacks; a
/// missing or zero limit leaves the corresponding enforcement off. The
/// container name falls back to `damon:<alloc-id>.<task-name>` when the
/// orchestrator variables are present.
///
/// # Errors
///
/// Fails on unparseable integers or an enforced CPU cap below the minimum.
pub fn container_config(env: &dyn Fn(&str) -> Option<String>) -> Result<Config> {
    let mut cfg = Config {
        name: env(ENV_CONTAINER_NAME)
            .filter(|v| !v.is_empty())
            .or_else(|| nomad_container_name(env))
            .unwrap_or_default(),
        ..Config::default()
    };
    if let Some(cpu) = env_int(env, &[ENV_CPU_LIMIT, ENV_NOMAD_CPU_LIMIT])? {
        if cpu > 0 {
            cfg.enforce_cpu = env_bool(env, ENV_ENFORCE_CPU_LIMIT, true);
            cfg.cpu_limit_mhz = cpu as u64;
        }
    }
    cfg.cpu_hard_cap = env_bool(env, ENV_CPU_HARD_CAP, true);
    if let Some(memory) = env_int(env, &[ENV_MEMORY_LIMIT, ENV_NOMAD_MEMORY_LIMIT])? {
        if memory > 0 {
            cfg.enforce_memory = env_bool(env, ENV_ENFORCE_MEMORY_LIMIT, true);
            cfg.memory_limit_mb = memory as u64;
        }
    }
    cfg.restricted_token = env_bool(env, ENV_RESTRICTED_TOKEN, false);
    if let Err(err) = cfg.validate() {
        bail!("{err}");
    }
    Ok(cfg)
}

/// The metrics listen address, when one is configured.
#[must_use]
pub fn listen_address(env: &dyn Fn(&str) -> Option<String>) -> Option<String> {
    env_first(env, &[ENV_ADDRESS, ENV_NOMAD_DAMON_ADDRESS])
}

/// The metrics URL path.
#[must_use]
pub fn metrics_endpoint(env: &dyn Fn(&str) -> Option<String>) -> String {
    env(ENV_METRICS_ENDPOINT)
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_METRICS_ENDPOINT.to_string())
}

/// Log-sink configuration; the rotation itself belongs to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Maximum rotated files to keep.
    pub max_files: u64,
    /// Maximum file size in MiB before rotation.
    pub max_size_mb: u64,
    log_dir: Option<PathBuf>,
    log_name: Option<String>,
    nomad_alloc_dir: Option<PathBuf>,
    nomad_task_name: Option<String>,
    nomad_log_suffix: Option<String>,
}

impl LogConfig {
    /// The directory log files land in: the configured directory, the
    /// orchestrator's `logs` directory, or the working directory.
    #[must_use]
    pub fn dir(&self) -> PathBuf {
        if let Some(dir) = &self.log_dir {
            return dir.clone();
        }
        if let Some(alloc) = &self.nomad_alloc_dir {
            return alloc.join("logs");
        }
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }

    /// The log file name.
    #[must_use]
    pub fn file_name(&self) -> String {
        if let Some(name) = &self.log_name {
            return name.clone();
        }
        if let Some(task) = &self.nomad_task_name {
            let suffix = self
                .nomad_log_suffix
                .as_deref()
                .unwrap_or(DEFAULT_NOMAD_LOG_SUFFIX);
            return format!("{task}{suffix}");
        }
        DEFAULT_LOG_NAME.to_string()
    }

    /// The full log file path.
    #[must_use]
    pub fn path(&self) -> PathBuf {
        self.dir().join(self.file_name())
    }
}

/// Read the log-sink configuration from the environment.
#[must_use]
pub fn log_config(env: &dyn Fn(&str) -> Option<String>) -> LogConfig {
    let parse = |name: &str, default: u64| {
        env(name)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(default)
    };
    LogConfig {
        max_files: parse(ENV_LOG_MAX_FILES, DEFAULT_LOG_MAX_FILES),
        max_size_mb: parse(ENV_LOG_MAX_SIZE, DEFAULT_LOG_MAX_SIZE_MB),
        log_dir: env(ENV_LOG_DIR).filter(|v| !v.is_empty()).map(PathBuf::from),
        log_name: env(ENV_LOG_NAME).filter(|v| !v.is_empty()),
        nomad_alloc_dir: env(ENV_NOMAD_ALLOC_DIR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from),
        nomad_task_name: env(ENV_NOMAD_TASK_NAME).filter(|v| !v.is_empty()),
        nomad_log_suffix: env(ENV_NOMAD_LOG_SUFFIX).filter(|v| !v.is_empty()),
    }
}

const NOMAD_FIELD_ENVS: [(&str, &str); 7] = [
    ("NOMAD_DC", "nomad_dc"),
    ("NOMAD_REGION", "nomad_region"),
    ("NOMAD_JOB_NAME", "nomad_job_name"),
    ("NOMAD_GROUP_NAME", "nomad_group_name"),
    ("NOMAD_TASK_NAME", "nomad_task_name"),
    ("NOMAD_ALLOC_ID", "nomad_alloc_id"),
    ("NOMAD_ALLOC_INDEX", "nomad_alloc_index"),
];

/// Orchestrator context attached to logs and metric labels.
#[must_use]
pub fn nomad_fields(env: &dyn Fn(&str) -> Option<String>) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for (name, field) in NOMAD_FIELD_ENVS {
        if let Some(value) = env(name).filter(|v| !v.is_empty()) {
            fields.insert(field.to_string(), value);
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_bool_grammar() {
        for truthy in ["y", "yes", "true", "1", "Y", "TRUE"] {
            let env = env_of(&[(ENV_RESTRICTED_TOKEN, truthy)]);
            assert!(env_bool(&env, ENV_RESTRICTED_TOKEN, false), "{truthy}");
        }
        for falsy in ["n", "no", "false", "0", "N", "FALSE"] {
            let env = env_of(&[(ENV_RESTRICTED_TOKEN, falsy)]);
            assert!(!env_bool(&env, ENV_RESTRICTED_TOKEN, true), "{falsy}");
        }
        let env = env_of(&[(ENV_RESTRICTED_TOKEN, "maybe")]);
        assert!(env_bool(&env, ENV_RESTRICTED_TOKEN, true));
        assert!(!env_bool(&env_of(&[]), ENV_RESTRICTED_TOKEN, false));
    }

    #[test]
    fn test_container_config_defaults() {
        let cfg = container_config(&env_of(&[])).expect("config");
        assert!(!cfg.enforce_cpu);
        assert!(!cfg.enforce_memory);
        assert!(!cfg.restricted_token);
        assert!(cfg.name.is_empty());
    }

    #[test]
    fn test_container_config_limits_with_fallbacks() {
        let env = env_of(&[
            (ENV_NOMAD_CPU_LIMIT, "1500"),
            (ENV_MEMORY_LIMIT, "256"),
            (ENV_NOMAD_MEMORY_LIMIT, "512"),
        ]);
        let cfg = container_config(&env).expect("config");
        assert!(cfg.enforce_cpu);
        assert_eq!(cfg.cpu_limit_mhz, 1500);
        assert!(cfg.enforce_memory);
        // DAMON_MEMORY_LIMIT takes precedence over the fallback
        assert_eq!(cfg.memory_limit_mb, 256);
    }

    #[test]
    fn test_container_config_rejects_low_cpu() {
        let env = env_of(&[(ENV_CPU_LIMIT, "99")]);
        assert!(container_config(&env).is_err());
    }

    #[test]
    fn test_container_config_rejects_bad_integer() {
        let env = env_of(&[(ENV_CPU_LIMIT, "lots")]);
        assert!(container_config(&env).is_err());
    }

    #[test]
    fn test_enforcement_opt_out() {
        let env = env_of(&[(ENV_CPU_LIMIT, "1024"), (ENV_ENFORCE_CPU_LIMIT, "no")]);
        let cfg = container_config(&env).expect("config");
        assert!(!cfg.enforce_cpu);
        assert_eq!(cfg.cpu_limit_mhz, 1024);
    }

    #[test]
    fn test_cpu_hard_cap_selects_weight_mode() {
        let cfg = container_config(&env_of(&[(ENV_CPU_LIMIT, "1024")])).expect("config");
        assert!(cfg.cpu_hard_cap);
        let env = env_of(&[(ENV_CPU_LIMIT, "1024"), (ENV_CPU_HARD_CAP, "false")]);
        let cfg = container_config(&env).expect("config");
        assert!(!cfg.cpu_hard_cap);
    }

    #[test]
    fn test_container_name_fallback() {
        let env = env_of(&[
            (ENV_NOMAD_ALLOC_ID, "a1b2"),
            (ENV_NOMAD_TASK_NAME, "web"),
        ]);
        let cfg = container_config(&env).expect("config");
        assert_eq!(cfg.name, "damon:a1b2.web");

        let env = env_of(&[
            (ENV_CONTAINER_NAME, "explicit"),
            (ENV_NOMAD_ALLOC_ID, "a1b2"),
            (ENV_NOMAD_TASK_NAME, "web"),
        ]);
        assert_eq!(container_config(&env).expect("config").name, "explicit");
    }

    #[test]
    fn test_listen_address_fallback() {
        assert_eq!(listen_address(&env_of(&[])), None);
        let env = env_of(&[(ENV_NOMAD_DAMON_ADDRESS, "127.0.0.1:9200")]);
        assert_eq!(listen_address(&env).as_deref(), Some("127.0.0.1:9200"));
        let env = env_of(&[
            (ENV_ADDRESS, "0.0.0.0:9100"),
            (ENV_NOMAD_DAMON_ADDRESS, "127.0.0.1:9200"),
        ]);
        assert_eq!(listen_address(&env).as_deref(), Some("0.0.0.0:9100"));
    }

    #[test]
    fn test_metrics_endpoint_default() {
        assert_eq!(metrics_endpoint(&env_of(&[])), "/metrics");
        let env = env_of(&[(ENV_METRICS_ENDPOINT, "/stats")]);
        assert_eq!(metrics_endpoint(&env), "/stats");
    }

    #[test]
    fn test_log_config_fallbacks() {
        let cfg = log_config(&env_of(&[]));
        assert_eq!(cfg.max_files, 5);
        assert_eq!(cfg.max_size_mb, 10);
        assert_eq!(cfg.file_name(), "damon.log");

        let cfg = log_config(&env_of(&[
            (ENV_NOMAD_ALLOC_DIR, "C:\\alloc"),
            (ENV_NOMAD_TASK_NAME, "web"),
        ]));
        assert_eq!(cfg.dir(), PathBuf::from("C:\\alloc").join("logs"));
        assert_eq!(cfg.file_name(), "web.damon.log");

        let cfg = log_config(&env_of(&[
            (ENV_LOG_DIR, "D:\\logs"),
            (ENV_LOG_NAME, "custom.log"),
            (ENV_LOG_MAX_FILES, "9"),
            (ENV_NOMAD_LOG_SUFFIX, ".d.log"),
        ]));
        assert_eq!(cfg.path(), PathBuf::from("D:\\logs").join("custom.log"));
        assert_eq!(cfg.max_files, 9);
    }

    #[test]
    fn test_nomad_fields() {
        let env = env_of(&[
            ("NOMAD_DC", "dc1"),
            ("NOMAD_TASK_NAME", "web"),
            ("NOMAD_ALLOC_INDEX", "0"),
        ]);
        let fields = nomad_fields(&env);
        assert_eq!(fields.get("nomad_dc").map(String::as_str), Some("dc1"));
        assert_eq!(fields.get("nomad_task_name").map(String::as_str), Some("web"));
        assert_eq!(fields.len(), 3);
    }
}
