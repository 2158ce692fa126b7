use std::collections::BTreeMap;
use std::env;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::retry::{
    RetryPolicy, DEFAULT_DISABLE_FAILURES, DEFAULT_DISABLE_HARD_TIMEOUT, DEFAULT_FAILURE_WINDOW,
};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Prefix for environment overrides, e.g. `BATCHD_SCHEDULER_RETRY_DELAY`.
const ENV_PREFIX: &str = "BATCHD";

/// Option names recognized in the `[scheduler]` section.
pub const SCHEDULER_KEYS: &[&str] = &[
    "disable-num-failures",
    "disable-hard-timeout",
    "disable-window-seconds",
    "retry-delay",
    "worker-disconnect-delay",
    "upstream-status-when-all",
];

/// Anything that knows how long a worker may stay silent before it is pruned.
pub trait PruneConfig {
    /// Seconds of silence after which a worker is forgotten.
    fn worker_disconnect_delay(&self) -> u64;
}

// ── Configuration file ────────────────────────────────────────

/// Raw contents of the configuration file.
///
/// Values are kept as text exactly like an INI-style config and only coerced
/// when [`SchedulerConfig::resolve`] runs. Keys are normalized so `retry_delay`
/// and `retry-delay` are the same option.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub scheduler: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Deserialize)]
struct RawConfigFile {
    #[serde(default)]
    scheduler: toml::Table,
    #[serde(default)]
    resources: toml::Table,
}

impl ConfigFile {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, CoreError> {
        let raw: RawConfigFile = toml::from_str(toml_str)?;
        let mut config = Self {
            scheduler: normalize_section(raw.scheduler),
            resources: raw
                .resources
                .into_iter()
                .map(|(k, v)| (k, value_text(v)))
                .collect(),
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Set a `[scheduler]` option.
    pub fn with_scheduler(mut self, key: &str, value: impl Into<String>) -> Self {
        self.scheduler.insert(normalize_key(key), value.into());
        self
    }

    /// Set a `[resources]` capacity.
    pub fn with_resource(mut self, name: &str, value: impl Into<String>) -> Self {
        self.resources.insert(name.to_string(), value.into());
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `BATCHD_SCHEDULER_<KEY>` overrides `scheduler.<key>` (dashes
    /// become underscores) and `BATCHD_RESOURCES_<NAME>` sets the capacity of
    /// resource `<name>` (lower-cased).
    pub(crate) fn apply_env_overrides(&mut self) {
        for key in SCHEDULER_KEYS {
            let var = format!("{ENV_PREFIX}_SCHEDULER_{}", key.replace('-', "_").to_uppercase());
            if let Ok(v) = env::var(&var) {
                self.scheduler.insert((*key).to_string(), v);
            }
        }

        let resource_prefix = format!("{ENV_PREFIX}_RESOURCES_");
        for (var, value) in env::vars_os() {
            let (Some(var), Some(value)) = (var.to_str(), value.into_string().ok()) else {
                continue;
            };
            if let Some(name) = var.strip_prefix(&resource_prefix) {
                if !name.is_empty() {
                    self.resources.insert(name.to_lowercase(), value);
                }
            }
        }
    }

    fn scheduler_value<T: FromStr>(&self, key: &str) -> Result<Option<T>, CoreError> {
        match self.scheduler.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(&format!("scheduler.{key}"), raw)),
            None => Ok(None),
        }
    }

    fn scheduler_flag(&self, key: &str) -> Result<Option<bool>, CoreError> {
        match self.scheduler.get(key) {
            Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                _ => Err(invalid(&format!("scheduler.{key}"), raw)),
            },
            None => Ok(None),
        }
    }

    /// Coerce the `[resources]` section into integer capacities.
    pub fn resource_capacities(&self) -> Result<BTreeMap<String, u32>, CoreError> {
        self.resources
            .iter()
            .map(|(name, raw)| {
                raw.trim()
                    .parse::<u32>()
                    .map(|units| (name.clone(), units))
                    .map_err(|_| invalid(&format!("resources.{name}"), raw))
            })
            .collect()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().replace('_', "-").to_lowercase()
}

fn normalize_section(table: toml::Table) -> BTreeMap<String, String> {
    table
        .into_iter()
        .map(|(k, v)| (normalize_key(&k), value_text(v)))
        .collect()
}

fn value_text(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

fn invalid(key: &str, value: &str) -> CoreError {
    CoreError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

// ── Constructor options ───────────────────────────────────────

/// Values supplied directly to the scheduler constructor.
///
/// Every field left as `None` falls back to the configuration file and then
/// to the built-in default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerOptions {
    pub disable_failures: Option<u32>,
    pub disable_hard_timeout: Option<u64>,
    pub disable_window: Option<u64>,
    pub retry_delay: Option<u64>,
    pub worker_disconnect_delay: Option<u64>,
    pub upstream_status_when_all: Option<bool>,
    pub resources: Option<BTreeMap<String, u32>>,
}

impl SchedulerOptions {
    pub fn disable_failures(mut self, n: u32) -> Self {
        self.disable_failures = Some(n);
        self
    }

    pub fn disable_hard_timeout(mut self, secs: u64) -> Self {
        self.disable_hard_timeout = Some(secs);
        self
    }

    pub fn disable_window(mut self, secs: u64) -> Self {
        self.disable_window = Some(secs);
        self
    }

    pub fn retry_delay(mut self, secs: u64) -> Self {
        self.retry_delay = Some(secs);
        self
    }

    pub fn worker_disconnect_delay(mut self, secs: u64) -> Self {
        self.worker_disconnect_delay = Some(secs);
        self
    }

    pub fn upstream_status_when_all(mut self, all: bool) -> Self {
        self.upstream_status_when_all = Some(all);
        self
    }

    pub fn resource(mut self, name: &str, capacity: u32) -> Self {
        self.resources
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), capacity);
        self
    }
}

// ── Resolved scheduler config ─────────────────────────────────

/// Fully resolved scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Default failure limit for tasks without an explicit policy.
    pub disable_failures: u32,
    /// Default hard timeout in seconds.
    pub disable_hard_timeout: u64,
    /// Default failure window in seconds.
    pub disable_window: u64,
    /// Seconds a FAILED task waits before it becomes PENDING again.
    pub retry_delay: u64,
    /// Seconds of silence before a worker is pruned.
    pub worker_disconnect_delay: u64,
    /// Default upstream semantics for new tasks.
    pub upstream_status_when_all: bool,
    /// Resource name -> total capacity.
    pub resources: BTreeMap<String, u32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            disable_failures: DEFAULT_DISABLE_FAILURES,
            disable_hard_timeout: DEFAULT_DISABLE_HARD_TIMEOUT,
            disable_window: DEFAULT_FAILURE_WINDOW,
            retry_delay: 900,
            worker_disconnect_delay: 60,
            upstream_status_when_all: false,
            resources: BTreeMap::new(),
        }
    }
}

impl SchedulerConfig {
    /// Resolve constructor options over file values over built-in defaults.
    pub fn resolve(options: &SchedulerOptions, file: &ConfigFile) -> Result<Self, CoreError> {
        Ok(Self::from_file(file)?.overridden_by(options))
    }

    /// File values over built-in defaults.
    pub fn from_file(file: &ConfigFile) -> Result<Self, CoreError> {
        let defaults = Self::default();
        Ok(Self {
            disable_failures: file
                .scheduler_value("disable-num-failures")?
                .unwrap_or(defaults.disable_failures),
            disable_hard_timeout: file
                .scheduler_value("disable-hard-timeout")?
                .unwrap_or(defaults.disable_hard_timeout),
            disable_window: file
                .scheduler_value("disable-window-seconds")?
                .unwrap_or(defaults.disable_window),
            retry_delay: file
                .scheduler_value("retry-delay")?
                .unwrap_or(defaults.retry_delay),
            worker_disconnect_delay: file
                .scheduler_value("worker-disconnect-delay")?
                .unwrap_or(defaults.worker_disconnect_delay),
            upstream_status_when_all: file
                .scheduler_flag("upstream-status-when-all")?
                .unwrap_or(defaults.upstream_status_when_all),
            resources: file.resource_capacities()?,
        })
    }

    /// Replace every value the constructor supplied.
    pub fn overridden_by(self, options: &SchedulerOptions) -> Self {
        Self {
            disable_failures: options.disable_failures.unwrap_or(self.disable_failures),
            disable_hard_timeout: options
                .disable_hard_timeout
                .unwrap_or(self.disable_hard_timeout),
            disable_window: options.disable_window.unwrap_or(self.disable_window),
            retry_delay: options.retry_delay.unwrap_or(self.retry_delay),
            worker_disconnect_delay: options
                .worker_disconnect_delay
                .unwrap_or(self.worker_disconnect_delay),
            upstream_status_when_all: options
                .upstream_status_when_all
                .unwrap_or(self.upstream_status_when_all),
            resources: options.resources.clone().unwrap_or(self.resources),
        }
    }

    /// Policy given to tasks that carry no explicit override.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.disable_failures,
            self.disable_hard_timeout,
            self.disable_window,
            self.upstream_status_when_all,
        )
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Scheduler config:");
        tracing::info!(
            "  retry:     disable_failures={}, hard_timeout={}s, window={}s, retry_delay={}s",
            self.disable_failures,
            self.disable_hard_timeout,
            self.disable_window,
            self.retry_delay
        );
        tracing::info!("  workers:   disconnect_delay={}s", self.worker_disconnect_delay);
        tracing::info!("  resources: {:?}", self.resources);
    }
}

impl PruneConfig for SchedulerConfig {
    fn worker_disconnect_delay(&self) -> u64 {
        self.worker_disconnect_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let cfg = SchedulerConfig::resolve(&SchedulerOptions::default(), &ConfigFile::default())
            .unwrap();
        assert_eq!(cfg, SchedulerConfig::default());
        assert_eq!(cfg.default_retry_policy(), RetryPolicy::default());
    }

    #[test]
    fn file_values_are_coerced() {
        let file = ConfigFile::from_toml(
            r#"
            [scheduler]
            disable-num-failures = "44"
            worker-disconnect-delay = "55"
            upstream_status_when_all = "True"

            [resources]
            a = "100"
            b = 200
            "#,
        )
        .unwrap();

        let cfg = SchedulerConfig::resolve(&SchedulerOptions::default(), &file).unwrap();
        assert_eq!(cfg.disable_failures, 44);
        assert_eq!(cfg.worker_disconnect_delay, 55);
        assert!(cfg.upstream_status_when_all);
        assert_eq!(cfg.resources.get("a"), Some(&100));
        assert_eq!(cfg.resources.get("b"), Some(&200));
        assert_eq!(cfg.default_retry_policy(), RetryPolicy::new(44, 999_999_999, 3600, true));
    }

    #[test]
    fn constructor_overrides_file() {
        let file = ConfigFile::default()
            .with_scheduler("disable-num-failures", "44")
            .with_scheduler("worker-disconnect-delay", "55")
            .with_resource("a", "100");
        let options = SchedulerOptions::default()
            .disable_failures(66)
            .worker_disconnect_delay(77)
            .resource("z", 1);

        let cfg = SchedulerConfig::resolve(&options, &file).unwrap();
        assert_eq!(cfg.disable_failures, 66);
        assert_eq!(cfg.worker_disconnect_delay, 77);
        assert_eq!(cfg.resources, BTreeMap::from([("z".to_string(), 1)]));
    }

    #[test]
    fn options_alone_override_defaults() {
        let cfg = SchedulerConfig::default().overridden_by(
            &SchedulerOptions::default()
                .disable_hard_timeout(5)
                .disable_window(10)
                .retry_delay(1)
                .upstream_status_when_all(true),
        );
        assert_eq!(cfg.disable_failures, 999_999_999);
        assert_eq!(cfg.default_retry_policy(), RetryPolicy::new(999_999_999, 5, 10, true));
        assert_eq!(cfg.retry_delay, 1);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let file = ConfigFile::default().with_scheduler("retry-delay", "soon");
        let err = SchedulerConfig::resolve(&SchedulerOptions::default(), &file).unwrap_err();
        assert!(matches!(err, CoreError::InvalidValue { ref key, .. } if key == "scheduler.retry-delay"));

        let file = ConfigFile::default().with_resource("gpu", "-1");
        let err = SchedulerConfig::resolve(&SchedulerOptions::default(), &file).unwrap_err();
        assert!(matches!(err, CoreError::InvalidValue { ref key, .. } if key == "resources.gpu"));
    }

    #[test]
    fn keys_are_normalized() {
        let file = ConfigFile::default().with_scheduler("Retry_Delay", "5");
        assert_eq!(file.scheduler.get("retry-delay").map(String::as_str), Some("5"));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("batchd.toml");
        std::fs::write(&path, "[scheduler]\nretry-delay = 30\n").unwrap();

        let file = ConfigFile::from_file(&path).unwrap();
        let cfg = SchedulerConfig::resolve(&SchedulerOptions::default(), &file).unwrap();
        assert_eq!(cfg.retry_delay, 30);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = ConfigFile::from_file("/nonexistent/batchd.toml").unwrap_err();
        assert!(matches!(err, CoreError::ConfigIo(_)));
    }

    #[cfg(unix)]
    #[test]
    fn env_overrides_skip_non_unicode_values() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        env::set_var("BATCHD_RESOURCES_ENVTEST_BAD", OsStr::from_bytes(b"\xff\xfe"));
        env::set_var("BATCHD_RESOURCES_ENVTEST_GOOD", "3");

        let file = ConfigFile::from_toml("").unwrap();
        assert_eq!(file.resources.get("envtest_good").map(String::as_str), Some("3"));
        assert!(!file.resources.contains_key("envtest_bad"));

        env::remove_var("BATCHD_RESOURCES_ENVTEST_BAD");
        env::remove_var("BATCHD_RESOURCES_ENVTEST_GOOD");
    }

    #[test]
    fn scheduler_config_is_a_prune_config() {
        let cfg = SchedulerConfig {
            worker_disconnect_delay: 12,
            ..Default::default()
        };
        assert_eq!(PruneConfig::worker_disconnect_delay(&cfg), 12);
    }
}
