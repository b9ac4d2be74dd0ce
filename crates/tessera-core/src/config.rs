//! Application configuration.
//!
//! Configuration is loaded from a TOML file and overridden by CLI flags.
//! Durations accept humantime strings (`"30s"`, `"2h"`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("read config {path}: {source}")]
    Read {
        /// Path that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file could not be parsed.
    #[error("parse config {path}: {source}")]
    Parse {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the governance server.
    pub server_url: String,

    /// Directory holding per-proposal vote journals.
    pub vote_dir: PathBuf,

    /// Wallet gRPC host:port.
    pub wallet_host: String,

    /// Wallet server certificate (PEM) used as the TLS root of trust.
    pub wallet_cert: PathBuf,

    /// Client certificate (PEM) presented to the wallet.
    pub client_cert: PathBuf,

    /// Client private key (PEM) presented to the wallet.
    pub client_key: PathBuf,

    /// Wallet passphrase; prompted for interactively when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_passphrase: Option<String>,

    /// Outbound proxy URL (`socks5h://...` or `http://...`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Skip TLS certificate verification against the governance server.
    pub skip_verify: bool,

    /// Spread votes over the voting window. Disabled, the whole ballot is
    /// submitted in one request.
    pub trickle: bool,

    /// Target duration to spread votes over. Derived from the remaining
    /// voting window when unset.
    #[serde(with = "humantime_serde")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vote_duration: Option<Duration>,

    /// Base interval of the retry backoff.
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Retry attempts per vote before it is abandoned.
    pub max_retries: u32,

    /// Target time between blocks on the backing chain.
    #[serde(with = "humantime_serde")]
    pub block_time: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            vote_dir: default_vote_dir(),
            wallet_host: default_wallet_host(),
            wallet_cert: default_wallet_cert(),
            client_cert: home_config_path("client.pem"),
            client_key: home_config_path("client-key.pem"),
            wallet_passphrase: None,
            proxy: None,
            skip_verify: false,
            trickle: true,
            vote_duration: None,
            retry_interval: default_retry_interval(),
            max_retries: default_max_retries(),
            block_time: default_block_time(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Blocks mined per hour at the configured block time.
    #[must_use]
    pub fn blocks_per_hour(&self) -> u32 {
        let secs = self.block_time.as_secs().max(1);
        u32::try_from(3600 / secs).unwrap_or(1).max(1)
    }
}

fn default_server_url() -> String {
    "https://127.0.0.1:4443".to_string()
}

fn default_wallet_host() -> String {
    "127.0.0.1:19111".to_string()
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn home_config_path(file: &str) -> PathBuf {
    home_dir().join(".tessera").join(file)
}

fn default_vote_dir() -> PathBuf {
    home_config_path("votes")
}

fn default_wallet_cert() -> PathBuf {
    home_config_path("wallet.cert")
}

const fn default_retry_interval() -> Duration {
    Duration::from_secs(30)
}

const fn default_max_retries() -> u32 {
    5
}

const fn default_block_time() -> Duration {
    Duration::from_secs(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.trickle);
        assert_eq!(config.retry_interval, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.blocks_per_hour(), 12);
    }

    #[test]
    fn parses_humantime_durations() {
        let config: Config = toml::from_str(
            r#"
            server_url = "https://gov.example.org"
            trickle = true
            vote_duration = "12h"
            retry_interval = "1m"
            "#,
        )
        .expect("parse config");
        assert_eq!(config.vote_duration, Some(Duration::from_secs(12 * 3600)));
        assert_eq!(config.retry_interval, Duration::from_secs(60));
        assert_eq!(config.block_time, default_block_time());
    }
}
