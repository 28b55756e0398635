use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Process configuration. Priority: CLI flags > environment > YAML file >
/// defaults; the file is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub auth_dir: String,
    pub api_keys: Vec<String>,
    pub disable_auth: bool,
    /// Bytes.
    pub max_request_size: usize,
    /// Bytes.
    pub max_response_size: usize,
    pub request_retry: u32,
    /// Seconds; cap for backoff waits between attempts.
    pub max_retry_interval: u64,
    pub disable_cooling: bool,
    pub proxy_url: Option<String>,
    /// Seconds without a chunk before an open stream is abandoned.
    pub stream_timeout: u64,
    /// Canonical model names that must never ride on OAuth credentials.
    pub oauth_excluded_models: Vec<String>,
    pub quota_exceeded: QuotaExceededConfig,
    pub usage: UsageConfig,
}

/// Recovery behaviors when an upstream reports quota exhaustion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuotaExceededConfig {
    /// Rotate a Gemini-family credential to its backup project id.
    pub switch_project: bool,
    /// Retry once on the `-preview` variant of the model.
    pub switch_preview_model: bool,
}

/// Usage-record emission. The core only emits; this controls the built-in
/// JSONL sink.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UsageConfig {
    pub enabled: bool,
    pub database_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8318,
            debug: false,
            auth_dir: default_auth_dir(),
            api_keys: Vec::new(),
            disable_auth: false,
            max_request_size: 50 * 1024 * 1024,
            max_response_size: 100 * 1024 * 1024,
            request_retry: 3,
            max_retry_interval: 30 * 60,
            disable_cooling: false,
            proxy_url: None,
            stream_timeout: 300,
            oauth_excluded_models: Vec::new(),
            quota_exceeded: QuotaExceededConfig::default(),
            usage: UsageConfig::default(),
        }
    }
}

fn default_auth_dir() -> String {
    std::env::var("HOME")
        .map(|home| format!("{home}/.lmux/auths"))
        .unwrap_or_else(|_| ".lmux/auths".to_string())
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&text)?
            }
            _ => Config::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// `LMUX_*` variables override file values (12-factor priority; flags
    /// override these again in the CLI layer).
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("LMUX_HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("LMUX_PORT")
            && let Ok(port) = port.parse()
        {
            self.port = port;
        }
        if let Ok(dir) = std::env::var("LMUX_AUTH_DIR") {
            self.auth_dir = dir;
        }
        if let Ok(keys) = std::env::var("LMUX_API_KEYS") {
            self.api_keys = keys
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(value) = std::env::var("LMUX_DISABLE_AUTH") {
            self.disable_auth = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("LMUX_DISABLE_COOLING") {
            self.disable_cooling = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(proxy) = std::env::var("LMUX_PROXY_URL") {
            self.proxy_url = (!proxy.is_empty()).then_some(proxy);
        }
        if let Ok(value) = std::env::var("LMUX_DEBUG") {
            self.debug = value == "1" || value.eq_ignore_ascii_case("true");
        }
        if let Ok(value) = std::env::var("LMUX_REQUEST_RETRY")
            && let Ok(value) = value.parse()
        {
            self.request_retry = value;
        }
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout.max(1))
    }

    pub fn max_retry_interval(&self) -> Duration {
        Duration::from_secs(self.max_retry_interval.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_round_trip_with_kebab_keys() {
        let yaml = "port: 9000\napi-keys: [k1, k2]\nmax-request-size: 1024\ndisable-cooling: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_keys, vec!["k1", "k2"]);
        assert_eq!(config.max_request_size, 1024);
        assert!(config.disable_cooling);
        // Untouched fields keep defaults.
        assert_eq!(config.request_retry, 3);
    }
}
