//! Configuration: per-connection connect-time parameters and process-wide
//! runtime knobs.
//!
//! `ClientConfig` is what a caller hands to `connect` — immutable for that
//! connection's lifetime. `RuntimeConfig` is process-wide and can be built
//! from defaults, a builder, or a TOML file with `${VAR}`-style in-file
//! substitution and `MQTT_RUNTIME__` environment overrides.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::connection::SerializerOverrides;
use crate::protocol::Will;

/// Substitute environment variables in a string. Supports `${VAR}` and
/// `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Config(config::ConfigError),
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Config(e) => write!(f, "config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// AWS IoT keep-alive clamp range, in seconds.
pub const AWS_MIN_KEEP_ALIVE_SECS: u16 = 30;
pub const AWS_MAX_KEEP_ALIVE_SECS: u16 = 1200;

/// Connect-time parameters for a single connection. Immutable once passed to
/// `connect`; nothing here changes for the life of the connection.
#[derive(Clone)]
pub struct ClientConfig {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive_secs: u16,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub will: Option<Will>,
    /// Enforce the AWS IoT profile's keep-alive clamp and will-payload limit.
    pub aws_mode: bool,
    pub retry_limit: u32,
    pub retry_ms: u32,
    /// Per-packet-type wire serialization override, consulted only when
    /// `RuntimeConfig::enable_serializer_overrides` is also set.
    pub serializer_overrides: Option<Arc<dyn SerializerOverrides>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("username", &self.username)
            .field("will", &self.will)
            .field("aws_mode", &self.aws_mode)
            .field("retry_limit", &self.retry_limit)
            .field("retry_ms", &self.retry_ms)
            .field("serializer_overrides", &self.serializer_overrides.is_some())
            .finish_non_exhaustive()
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            clean_session: true,
            keep_alive_secs: 60,
            username: None,
            password: None,
            will: None,
            aws_mode: false,
            retry_limit: 3,
            retry_ms: 1000,
            serializer_overrides: None,
        }
    }

    /// Keep-alive seconds after the AWS IoT profile clamp, if `aws_mode` is
    /// set: 0 maps to the maximum, and the range is otherwise clamped to
    /// `[30, 1200]`.
    pub fn effective_keep_alive_secs(&self) -> u16 {
        if !self.aws_mode {
            return self.keep_alive_secs;
        }
        if self.keep_alive_secs == 0 {
            return AWS_MAX_KEEP_ALIVE_SECS;
        }
        self.keep_alive_secs
            .clamp(AWS_MIN_KEEP_ALIVE_SECS, AWS_MAX_KEEP_ALIVE_SECS)
    }
}

/// Process-wide runtime knobs, set once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Gate internal consistency assertions (`debug_assert!`-style checks).
    pub enable_asserts: bool,
    pub enable_metrics: bool,
    pub enable_serializer_overrides: bool,
    /// How long a blocking wait holds for a response before giving up.
    pub response_wait_ms: u64,
    /// Upper bound for QoS 1 retry backoff.
    pub retry_ms_ceiling: u64,
    /// Static-pool allocator sizing; only consulted when the `static-pool`
    /// feature is enabled.
    pub message_buffers: usize,
    pub message_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enable_asserts: cfg!(debug_assertions),
            enable_metrics: false,
            enable_serializer_overrides: false,
            response_wait_ms: 5_000,
            retry_ms_ceiling: 30_000,
            message_buffers: 64,
            message_buffer_size: 2048,
        }
    }
}

impl RuntimeConfig {
    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }

    pub fn retry_ms_ceiling(&self) -> Duration {
        Duration::from_millis(self.retry_ms_ceiling)
    }

    /// Load from a TOML file with `${VAR}` in-file substitution and
    /// `MQTT_RUNTIME__SECTION__KEY`-style environment overrides. A missing
    /// file falls back to defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("enable_asserts", cfg!(debug_assertions))?
            .set_default("enable_metrics", false)?
            .set_default("enable_serializer_overrides", false)?
            .set_default("response_wait_ms", 5_000)?
            .set_default("retry_ms_ceiling", 30_000)?
            .set_default("message_buffers", 64)?
            .set_default("message_buffer_size", 2048)?;

        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ConfigError::Io(e)),
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("MQTT_RUNTIME")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: RuntimeConfig = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse from a string, for tests (no environment overrides).
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.response_wait_ms == 0 {
            return Err(ConfigError::Validation(
                "response_wait_ms must be > 0".to_string(),
            ));
        }
        if self.retry_ms_ceiling == 0 {
            return Err(ConfigError::Validation(
                "retry_ms_ceiling must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aws_mode_clamps_keep_alive() {
        let mut config = ClientConfig::new("device-1");
        config.aws_mode = true;
        config.keep_alive_secs = 0;
        assert_eq!(config.effective_keep_alive_secs(), AWS_MAX_KEEP_ALIVE_SECS);

        config.keep_alive_secs = 5;
        assert_eq!(config.effective_keep_alive_secs(), AWS_MIN_KEEP_ALIVE_SECS);

        config.keep_alive_secs = 10_000;
        assert_eq!(config.effective_keep_alive_secs(), AWS_MAX_KEEP_ALIVE_SECS);

        config.keep_alive_secs = 60;
        assert_eq!(config.effective_keep_alive_secs(), 60);
    }

    #[test]
    fn non_aws_mode_leaves_keep_alive_unclamped() {
        let mut config = ClientConfig::new("device-1");
        config.keep_alive_secs = 10_000;
        assert_eq!(config.effective_keep_alive_secs(), 10_000);
    }

    #[test]
    fn runtime_config_defaults_are_valid() {
        assert!(RuntimeConfig::default().validate().is_ok());
    }

    #[test]
    fn runtime_config_rejects_zero_response_wait() {
        let parsed = RuntimeConfig::parse("response_wait_ms = 0").unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn substitute_env_vars_applies_default_when_unset() {
        std::env::remove_var("MQTT_RUNTIME_TEST_VAR_NOT_SET");
        let out = substitute_env_vars("level = \"${MQTT_RUNTIME_TEST_VAR_NOT_SET:-info}\"");
        assert_eq!(out, "level = \"info\"");
    }
}
