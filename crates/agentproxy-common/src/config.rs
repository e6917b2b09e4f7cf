use std::fmt;
use std::time::Duration;

use secrecy::SecretString;

use crate::session::SessionOverrides;

/// Default safety margin subtracted from issued token lifetimes.
pub const DEFAULT_EXPIRY_LEEWAY: Duration = Duration::from_secs(120);

/// Client-credentials settings for the token issuer that authenticates
/// callers to the broker.
///
/// # Examples
///
/// ```
/// use agentproxy_common::IssuerConfig;
///
/// let issuer = IssuerConfig::new(
///     "https://auth.example.com/oauth/token",
///     "client-id",
///     "client-secret",
///     "https://broker.example.com",
/// );
/// assert!(issuer.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct IssuerConfig {
    /// Token endpoint that accepts the client-credentials grant.
    pub url: String,
    /// OAuth client identifier.
    pub client_id: String,
    /// OAuth client secret (stored securely).
    pub client_secret: SecretString,
    /// Audience requested for the broker token.
    pub audience: String,
    /// Margin subtracted from every issued lifetime before the token is
    /// considered expired.
    pub expiry_leeway: Duration,
}

// Custom Debug implementation to avoid exposing the client secret
impl fmt::Debug for IssuerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuerConfig")
            .field("url", &self.url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("audience", &self.audience)
            .field("expiry_leeway", &self.expiry_leeway)
            .finish()
    }
}

impl IssuerConfig {
    /// Creates issuer settings with the default expiry leeway.
    pub fn new(
        url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        audience: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            client_id: client_id.into(),
            client_secret: SecretString::new(client_secret.into().into()),
            audience: audience.into(),
            expiry_leeway: DEFAULT_EXPIRY_LEEWAY,
        }
    }

    /// Overrides the expiry leeway.
    #[must_use]
    pub const fn with_expiry_leeway(mut self, leeway: Duration) -> Self {
        self.expiry_leeway = leeway;
        self
    }

    /// Validates the issuer settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse or the client id or
    /// audience is blank.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.url)
            .map_err(|e| anyhow::anyhow!("Invalid issuer URL '{}': {e}", self.url))?;

        if self.client_id.trim().is_empty() {
            anyhow::bail!("Issuer client_id must not be empty");
        }
        if self.audience.trim().is_empty() {
            anyhow::bail!("Issuer audience must not be empty");
        }

        Ok(())
    }
}

/// Configuration for exponential backoff retry behavior against the broker.
///
/// Only network errors and retryable statuses (5xx, 408, 429) are retried.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use agentproxy_common::RetryConfig;
///
/// let config = RetryConfig {
///     max_retries: 5,
///     initial_delay: Duration::from_millis(500),
///     max_delay: Duration::from_secs(60),
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first request.
    pub max_retries: u32,
    /// Initial delay before the first retry attempt.
    pub initial_delay: Duration,
    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 19,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Total number of attempts, including the first.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Broker connection settings.
///
/// # Examples
///
/// ```
/// use agentproxy_common::{BrokerConfig, SessionOverrides};
///
/// let config = BrokerConfig::new("https://broker.example.com")
///     .with_timeout(30)
///     .with_overrides(SessionOverrides::default().with_host("localhost"));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the broker API.
    pub base_url: String,
    /// Per-request timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Retry behavior for broker calls.
    pub retry_config: RetryConfig,
    /// Values that take precedence over negotiated proxy sessions.
    pub overrides: SessionOverrides,
}

impl BrokerConfig {
    /// Creates a broker configuration with default retry behavior.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_seconds: None,
            retry_config: RetryConfig::default(),
            overrides: SessionOverrides::default(),
        }
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    /// Sets the retry behavior.
    #[must_use]
    pub const fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Sets the session overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: SessionOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Validates the broker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL does not parse or the retry delays
    /// are out of order.
    pub fn validate(&self) -> anyhow::Result<()> {
        url::Url::parse(&self.base_url)
            .map_err(|e| anyhow::anyhow!("Invalid broker URL '{}': {e}", self.base_url))?;

        if self.retry_config.initial_delay > self.retry_config.max_delay {
            anyhow::bail!(
                "Retry initial_delay ({:?}) must not exceed max_delay ({:?})",
                self.retry_config.initial_delay,
                self.retry_config.max_delay
            );
        }

        if self.timeout_seconds == Some(0) {
            anyhow::bail!("Broker timeout must be greater than zero");
        }

        Ok(())
    }
}
