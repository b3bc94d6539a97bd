//! Debugger settings. Defaults reproduce the classic behaviour; everything can
//! be overridden from a JSON file and/or `HEAPDBG_*` environment variables, or
//! programmatically through [`crate::DebuggerGuardBuilder`].

use std::{fs, path::PathBuf, str::FromStr};

use serde::Deserialize;

use crate::{error::ConfigError, escalation::Escalation, report::HeaderPolicy};

/// Largest single request we accept, in bytes
pub const DEFAULT_MAX_ALLOC_SIZE: usize = 16_711_568;

pub const DEFAULT_LOG_PATH: &str = "DebugLog.csv";

pub const ENV_CONFIG: &str = "HEAPDBG_CONFIG";
pub const ENV_LOG: &str = "HEAPDBG_LOG";
pub const ENV_MAX_ALLOC: &str = "HEAPDBG_MAX_ALLOC";
pub const ENV_ON_ANOMALY: &str = "HEAPDBG_ON_ANOMALY";
pub const ENV_HEADER: &str = "HEAPDBG_HEADER";
pub const ENV_CALL_SITES: &str = "HEAPDBG_CALL_SITES";
pub const ENV_QUIET: &str = "HEAPDBG_QUIET";

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DebuggerConfig {
    /// Where the diagnostic log goes, relative to the working directory
    pub log_path: PathBuf,
    /// Requests above this many bytes are refused
    pub max_alloc_size: usize,
    pub on_anomaly: Escalation,
    pub header_policy: HeaderPolicy,
    /// Walk the stack on every allocation and deallocation so rows can name a
    /// file and line. Turning this off makes every row `Unknown,0`.
    pub capture_call_sites: bool,
    /// Print a line to stderr for every anomaly
    pub console: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            max_alloc_size: DEFAULT_MAX_ALLOC_SIZE,
            on_anomaly: Escalation::default(),
            header_policy: HeaderPolicy::default(),
            capture_call_sites: true,
            console: true,
        }
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_var<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
{
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { var, value })
}

impl DebuggerConfig {
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
    }

    /// Read the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from `HEAPDBG_*` variables as returned by `lookup`.
    /// `HEAPDBG_CONFIG` names a JSON file that is loaded first; the other
    /// variables override individual fields.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = match lookup(ENV_CONFIG) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(path) = lookup(ENV_LOG) {
            config.log_path = PathBuf::from(path);
        }
        if let Some(value) = lookup(ENV_MAX_ALLOC) {
            config.max_alloc_size = parse_var(ENV_MAX_ALLOC, value)?;
        }
        if let Some(value) = lookup(ENV_ON_ANOMALY) {
            config.on_anomaly = parse_var(ENV_ON_ANOMALY, value)?;
        }
        if let Some(value) = lookup(ENV_HEADER) {
            config.header_policy = parse_var(ENV_HEADER, value)?;
        }
        if let Some(value) = lookup(ENV_CALL_SITES) {
            config.capture_call_sites = parse_bool(&value).ok_or(ConfigError::InvalidValue {
                var: ENV_CALL_SITES,
                value,
            })?;
        }
        if let Some(value) = lookup(ENV_QUIET) {
            // an empty HEAPDBG_QUIET still means "be quiet"
            let quiet = value.trim().is_empty() || parse_bool(&value) != Some(false);
            config.console = !quiet;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_the_classic_debugger() {
        let config = DebuggerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, DebuggerConfig::default());
        assert_eq!(config.max_alloc_size, 16_711_568);
        assert_eq!(config.log_path, PathBuf::from("DebugLog.csv"));
        assert_eq!(config.on_anomaly, Escalation::Trap);
        assert_eq!(config.header_policy, HeaderPolicy::Once);
    }

    #[test]
    fn environment_overrides_fields() {
        let config = DebuggerConfig::from_lookup(lookup(&[
            (ENV_LOG, "/tmp/heap.csv"),
            (ENV_MAX_ALLOC, "4096"),
            (ENV_ON_ANOMALY, "continue"),
            (ENV_HEADER, "per-anomaly"),
            (ENV_CALL_SITES, "off"),
            (ENV_QUIET, "1"),
        ]))
        .unwrap();
        assert_eq!(config.log_path, PathBuf::from("/tmp/heap.csv"));
        assert_eq!(config.max_alloc_size, 4096);
        assert_eq!(config.on_anomaly, Escalation::Continue);
        assert_eq!(config.header_policy, HeaderPolicy::PerAnomaly);
        assert!(!config.capture_call_sites);
        assert!(!config.console);
    }

    #[test]
    fn quiet_accepts_empty_and_false() {
        let quiet = DebuggerConfig::from_lookup(lookup(&[(ENV_QUIET, "")])).unwrap();
        assert!(!quiet.console);
        let loud = DebuggerConfig::from_lookup(lookup(&[(ENV_QUIET, "0")])).unwrap();
        assert!(loud.console);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = DebuggerConfig::from_lookup(lookup(&[(ENV_MAX_ALLOC, "lots")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                var: ENV_MAX_ALLOC,
                ..
            }
        ));
        assert!(DebuggerConfig::from_lookup(lookup(&[(ENV_ON_ANOMALY, "shrug")])).is_err());
        assert!(DebuggerConfig::from_lookup(lookup(&[(ENV_CALL_SITES, "maybe")])).is_err());
    }

    #[test]
    fn config_files_are_overridden_by_variables() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("heapdbg.json");
        fs::write(
            &file,
            r#"{ "max_alloc_size": 1024, "on_anomaly": "abort", "log_path": "from-file.csv" }"#,
        )
        .unwrap();
        let file = file.to_string_lossy().into_owned();
        let config =
            DebuggerConfig::from_lookup(lookup(&[(ENV_CONFIG, &file), (ENV_LOG, "env.csv")]))
                .unwrap();
        assert_eq!(config.max_alloc_size, 1024);
        assert_eq!(config.on_anomaly, Escalation::Abort);
        assert_eq!(config.log_path, PathBuf::from("env.csv"));
        assert!(config.capture_call_sites);
    }

    #[test]
    fn broken_config_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("heapdbg.json");
        fs::write(&file, r#"{ "max_alloc_size": "#).unwrap();
        let file = file.to_string_lossy().into_owned();
        assert!(matches!(
            DebuggerConfig::from_lookup(lookup(&[(ENV_CONFIG, &file)])),
            Err(ConfigError::Parse { .. })
        ));
        assert!(matches!(
            DebuggerConfig::from_lookup(lookup(&[(ENV_CONFIG, "/nonexistent/heapdbg.json")])),
            Err(ConfigError::Read { .. })
        ));
    }
}
