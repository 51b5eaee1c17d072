//! Configuration loading
//!
//! Call settings and bundling settings can be read from a TOML file or
//! overridden from environment variables. Durations are written as integer
//! milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::builder::ApiCallSettings;
use crate::bundling::BundlingSettings;
use crate::error::{CallError, Result};
use crate::status::Code;

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Everything needed to build one method's callable stack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub call: ApiCallSettings,

    #[serde(default)]
    pub bundling: Option<BundlingSettings>,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(params) = &self.call.retry_params {
            params.validate()?;
        }
        if let Some(bundling) = &self.bundling {
            bundling.validate()?;
        }
        Ok(())
    }
}

/// Apply environment overrides on top of `base`.
///
/// Recognized variables:
/// - `CALLABLE_TOTAL_TIMEOUT_MS`
/// - `CALLABLE_RETRYABLE_CODES` (comma separated, e.g. `UNAVAILABLE,ABORTED`)
/// - `CALLABLE_BUNDLE_DELAY_MS`
/// - `CALLABLE_BUNDLE_ELEMENT_COUNT`
///
/// Values that fail to parse are ignored.
pub fn apply_env(mut config: ClientConfig) -> ClientConfig {
    if let Ok(total) = std::env::var("CALLABLE_TOTAL_TIMEOUT_MS") {
        if let Ok(ms) = total.parse::<u64>() {
            let mut params = config.call.retry_params.unwrap_or_default();
            params.total_timeout = Duration::from_millis(ms);
            config.call.retry_params = Some(params);
        }
    }

    if let Ok(codes) = std::env::var("CALLABLE_RETRYABLE_CODES") {
        let parsed: Option<Vec<Code>> = codes
            .split(',')
            .filter(|c| !c.trim().is_empty())
            .map(|c| c.parse::<Code>().ok())
            .collect();
        if let Some(parsed) = parsed {
            config.call.retryable_codes = Some(parsed.into_iter().collect());
        }
    }

    if let Ok(delay) = std::env::var("CALLABLE_BUNDLE_DELAY_MS") {
        if let Ok(ms) = delay.parse::<u64>() {
            let mut bundling = config.bundling.unwrap_or_default();
            bundling.delay_threshold = Duration::from_millis(ms);
            config.bundling = Some(bundling);
        }
    }

    if let Ok(count) = std::env::var("CALLABLE_BUNDLE_ELEMENT_COUNT") {
        if let Ok(n) = count.parse::<u64>() {
            let mut bundling = config.bundling.unwrap_or_default();
            bundling.element_count_threshold = Some(n);
            config.bundling = Some(bundling);
        }
    }

    config
}

/// Load configuration from environment variables only
pub fn from_env() -> ClientConfig {
    apply_env(ClientConfig::default())
}

/// Load configuration from a TOML string
pub fn from_toml_str(contents: &str) -> Result<ClientConfig> {
    let config: ClientConfig =
        toml::from_str(contents).map_err(|e| CallError::Config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<ClientConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CallError::Config(format!("{}: {e}", path.display())))?;
    from_toml_str(&contents)
}
