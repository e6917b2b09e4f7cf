//! CLI configuration.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/agentproxy/config.toml`
//! (falling back to `~/.config`). Secrets are never stored in the file; it
//! names the environment variables holding them instead.
//!
//! ## Example Configuration
//!
//! ```toml
//! [broker]
//! base_url = "https://broker.example.com"
//! timeout_seconds = 30
//! max_retries = 19
//! initial_delay_ms = 250
//! max_delay_ms = 10000
//!
//! [issuer]
//! url = "https://auth.example.com/oauth/token"
//! client_id = "agentproxy-cli"
//! client_secret_env = "AGENTPROXY_CLIENT_SECRET"
//! audience = "https://broker.example.com"
//!
//! [overrides]
//! host = "localhost"
//! port = 1080
//! ```
//!
//! Without an `[issuer]` table, `broker.token_env` must name a variable that
//! holds a pre-issued broker token.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use agentproxy_common::config::DEFAULT_EXPIRY_LEEWAY;
use agentproxy_common::{BrokerConfig, IssuerConfig, RetryConfig, SessionOverrides};

/// CLI configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct CliConfig {
    /// Broker connection settings
    pub broker: BrokerSection,

    /// Client-credentials issuer, if tokens are minted locally
    #[serde(default)]
    pub issuer: Option<IssuerSection>,

    /// Session overrides applied to every proxy session
    #[serde(default)]
    pub overrides: SessionOverrides,
}

/// `[broker]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerSection {
    pub base_url: String,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Retries after the first attempt (default: 19)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Environment variable holding a pre-issued broker token
    #[serde(default)]
    pub token_env: Option<String>,
}

/// `[issuer]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct IssuerSection {
    pub url: String,
    pub client_id: String,
    pub client_secret_env: String,
    pub audience: String,

    #[serde(default = "default_expiry_leeway_secs")]
    pub expiry_leeway_secs: u64,
}

fn default_max_retries() -> u32 {
    RetryConfig::default().max_retries
}

fn default_initial_delay_ms() -> u64 {
    millis(RetryConfig::default().initial_delay)
}

fn default_max_delay_ms() -> u64 {
    millis(RetryConfig::default().max_delay)
}

const fn default_expiry_leeway_secs() -> u64 {
    DEFAULT_EXPIRY_LEEWAY.as_secs()
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl CliConfig {
    /// Loads configuration from `path`, or the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The config directory cannot be determined
    /// - The file doesn't exist or cannot be read
    /// - Deserialization or validation fails
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            bail!("Configuration file not found: {}", path.display());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }

    /// Returns the default configuration file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined.
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .context("Failed to determine config directory")?;

        Ok(config_dir.join("agentproxy").join("config.toml"))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Broker or issuer settings are invalid
    /// - Neither an issuer nor a token variable is configured
    pub fn validate(&self) -> Result<()> {
        self.broker_config().validate()?;

        match (&self.issuer, &self.broker.token_env) {
            (Some(issuer), _) => {
                if issuer.client_secret_env.trim().is_empty() {
                    bail!("issuer.client_secret_env must not be empty");
                }
                IssuerConfig::new(&issuer.url, &issuer.client_id, "", &issuer.audience)
                    .validate()?;
            }
            (None, Some(var)) if !var.trim().is_empty() => {}
            (None, _) => bail!("Configure either an [issuer] table or broker.token_env"),
        }

        Ok(())
    }

    /// Broker settings as consumed by the client library.
    #[must_use]
    pub fn broker_config(&self) -> BrokerConfig {
        let mut config = BrokerConfig::new(&self.broker.base_url)
            .with_retry_config(RetryConfig {
                max_retries: self.broker.max_retries,
                initial_delay: Duration::from_millis(self.broker.initial_delay_ms),
                max_delay: Duration::from_millis(self.broker.max_delay_ms),
            })
            .with_overrides(self.overrides.clone());
        if let Some(timeout) = self.broker.timeout_seconds {
            config = config.with_timeout(timeout);
        }
        config
    }

    /// Issuer settings with the client secret read from the environment.
    ///
    /// Returns `Ok(None)` when no issuer is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret variable is unset.
    pub fn issuer_config(&self) -> Result<Option<IssuerConfig>> {
        let Some(issuer) = &self.issuer else {
            return Ok(None);
        };

        let secret = std::env::var(&issuer.client_secret_env).with_context(|| {
            format!(
                "Client secret variable {} is not set",
                issuer.client_secret_env
            )
        })?;

        Ok(Some(
            IssuerConfig::new(&issuer.url, &issuer.client_id, secret, &issuer.audience)
                .with_expiry_leeway(Duration::from_secs(issuer.expiry_leeway_secs)),
        ))
    }
}
