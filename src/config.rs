//! Typed settings loaded once at startup.
//!
//! Precedence, lowest first: built-in defaults, the TOML settings file,
//! `KUBE_PICO_CD_*` environment variables, then CLI flags applied by the caller.

use crate::message::DEFAULT_IDENTIFIER_KEY;
use crate::queue::sqs::{MAX_BATCH, MAX_WAIT_SECONDS};
use crate::reconcile::ApplyFailurePolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides (`KUBE_PICO_CD_DEPLOY_QUEUE_NAME`, ...).
pub const ENV_PREFIX: &str = "KUBE_PICO_CD_";
/// Environment variable naming the settings file when `--settings` is absent.
pub const SETTINGS_PATH_ENV: &str = "KUBE_PICO_CD_SETTINGS";
/// Namespace file mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

pub const DEFAULT_CONFIG_MAP_NAME: &str = "build-info";
pub const DEFAULT_WAIT_TIME_SECONDS: u64 = 20;
pub const DEFAULT_MAX_MESSAGES: usize = 1;
pub const DEFAULT_IDLE_LOG_INTERVAL: u64 = 50;
pub const DEFAULT_RECEIVE_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_RECEIVE_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_KUBECTL: &str = "kubectl";

const NUMERIC_KEYS: &[&str] = &[
    "wait_time_seconds",
    "max_messages",
    "idle_log_interval",
    "receive_backoff_ms",
    "receive_backoff_max_ms",
];
const STRING_KEYS: &[&str] = &[
    "deploy_queue_name",
    "namespace",
    "config_map_name",
    "identifier_key",
    "apply_failure_policy",
    "kubectl",
    "aws_region",
    "sqs_endpoint",
    "log_level",
    "log_format",
];

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Raw settings as read from file and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub deploy_queue_name: Option<String>,
    pub namespace: Option<String>,
    pub config_map_name: String,
    pub identifier_key: String,
    pub wait_time_seconds: u64,
    pub max_messages: usize,
    pub idle_log_interval: u64,
    pub apply_failure_policy: ApplyFailurePolicy,
    pub receive_backoff_ms: u64,
    pub receive_backoff_max_ms: u64,
    pub kubectl: String,
    pub aws_region: Option<String>,
    pub sqs_endpoint: Option<String>,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            deploy_queue_name: None,
            namespace: None,
            config_map_name: DEFAULT_CONFIG_MAP_NAME.into(),
            identifier_key: DEFAULT_IDENTIFIER_KEY.into(),
            wait_time_seconds: DEFAULT_WAIT_TIME_SECONDS,
            max_messages: DEFAULT_MAX_MESSAGES,
            idle_log_interval: DEFAULT_IDLE_LOG_INTERVAL,
            apply_failure_policy: ApplyFailurePolicy::default(),
            receive_backoff_ms: DEFAULT_RECEIVE_BACKOFF_MS,
            receive_backoff_max_ms: DEFAULT_RECEIVE_BACKOFF_MAX_MS,
            kubectl: DEFAULT_KUBECTL.into(),
            aws_region: None,
            sqs_endpoint: None,
            log_level: "info".into(),
            log_format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Loads settings from the process environment and an optional file.
    ///
    /// Without an explicit path the file named by `KUBE_PICO_CD_SETTINGS` is used,
    /// if set. A missing namespace falls back to the service-account namespace.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(SETTINGS_PATH_ENV).map(PathBuf::from));
        let file = match path {
            Some(path) => Some(fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?),
            None => None,
        };
        let mut settings = Self::from_sources(file.as_deref(), env::vars())?;
        if settings.namespace.is_none() {
            settings.namespace = service_account_namespace(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH));
        }
        if settings.aws_region.is_none() {
            settings.aws_region = env::var("AWS_REGION")
                .or_else(|_| env::var("AWS_DEFAULT_REGION"))
                .ok()
                .filter(|region| !region.is_empty());
        }
        Ok(settings)
    }

    /// Builds settings from TOML text and `KUBE_PICO_CD_*` variables, without touching the process.
    pub fn from_sources<I>(file: Option<&str>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut table = match file {
            Some(text) => toml::from_str::<toml::Table>(text).map_err(ConfigError::Parse)?,
            None => toml::Table::new(),
        };
        for (var, value) in vars {
            let Some(key) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let key = key.to_ascii_lowercase();
            if NUMERIC_KEYS.contains(&key.as_str()) {
                let number = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| ConfigError::InvalidEnv {
                        var: var.clone(),
                        value: value.clone(),
                    })?;
                table.insert(key, toml::Value::Integer(number));
            } else if STRING_KEYS.contains(&key.as_str()) {
                table.insert(key, toml::Value::String(value));
            }
        }
        toml::Value::Table(table)
            .try_into()
            .map_err(ConfigError::Parse)
    }

    /// Validated configuration for the reconciliation loop.
    pub fn listener(&self) -> Result<ListenerConfig, ConfigError> {
        let queue_name = required(&self.deploy_queue_name, "deploy_queue_name")?;
        let namespace = required(&self.namespace, "namespace")?;
        if self.config_map_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "config_map_name",
                reason: "must not be empty".into(),
            });
        }
        if self.identifier_key.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "identifier_key",
                reason: "must not be empty".into(),
            });
        }
        if !(1..=MAX_BATCH).contains(&self.max_messages) {
            return Err(ConfigError::Invalid {
                key: "max_messages",
                reason: format!("must be between 1 and {MAX_BATCH}"),
            });
        }
        if self.wait_time_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "wait_time_seconds",
                reason: "must be at least 1 so receives long-poll".into(),
            });
        }
        if self.idle_log_interval == 0 {
            return Err(ConfigError::Invalid {
                key: "idle_log_interval",
                reason: "must be at least 1".into(),
            });
        }
        Ok(ListenerConfig {
            queue_name,
            namespace,
            default_config_map: self.config_map_name.clone(),
            identifier_key: self.identifier_key.clone(),
            wait: Duration::from_secs(self.wait_time_seconds.min(MAX_WAIT_SECONDS)),
            max_messages: self.max_messages,
            idle_log_interval: self.idle_log_interval,
            apply_failure_policy: self.apply_failure_policy,
            receive_backoff: Duration::from_millis(self.receive_backoff_ms),
            receive_backoff_max: Duration::from_millis(
                self.receive_backoff_max_ms.max(self.receive_backoff_ms),
            ),
        })
    }

    /// Configuration for the publisher; the queue name stays optional until publish time.
    pub fn publisher(&self) -> PublisherConfig {
        PublisherConfig {
            config_map_name: self.config_map_name.clone(),
            identifier_key: self.identifier_key.clone(),
        }
    }
}

/// Everything the reconciliation loop needs, fixed at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub queue_name: String,
    pub namespace: String,
    pub default_config_map: String,
    pub identifier_key: String,
    pub wait: Duration,
    pub max_messages: usize,
    pub idle_log_interval: u64,
    pub apply_failure_policy: ApplyFailurePolicy,
    pub receive_backoff: Duration,
    pub receive_backoff_max: Duration,
}

impl ListenerConfig {
    /// Config with every optional knob at its default.
    pub fn new(queue_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            namespace: namespace.into(),
            default_config_map: DEFAULT_CONFIG_MAP_NAME.into(),
            identifier_key: DEFAULT_IDENTIFIER_KEY.into(),
            wait: Duration::from_secs(DEFAULT_WAIT_TIME_SECONDS),
            max_messages: DEFAULT_MAX_MESSAGES,
            idle_log_interval: DEFAULT_IDLE_LOG_INTERVAL,
            apply_failure_policy: ApplyFailurePolicy::default(),
            receive_backoff: Duration::from_millis(DEFAULT_RECEIVE_BACKOFF_MS),
            receive_backoff_max: Duration::from_millis(DEFAULT_RECEIVE_BACKOFF_MAX_MS),
        }
    }
}

/// Metadata conventions shared by every publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfig {
    pub config_map_name: String,
    pub identifier_key: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            config_map_name: DEFAULT_CONFIG_MAP_NAME.into(),
            identifier_key: DEFAULT_IDENTIFIER_KEY.into(),
        }
    }
}

/// Errors surfaced while loading or validating settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("environment variable {var} has invalid value {value:?}")]
    InvalidEnv { var: String, value: String },
    #[error("{0} is not configured")]
    Missing(&'static str),
    #[error("setting {key} {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Reads the namespace of the pod's service account, if mounted.
pub fn service_account_namespace(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|namespace| !namespace.is_empty())
}

fn required(value: &Option<String>, key: &'static str) -> Result<String, ConfigError> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or(ConfigError::Missing(key))
}
