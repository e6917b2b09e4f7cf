//! Broker authentication credentials.
//!
//! The broker accepts bearer tokens minted by an OAuth issuer through the
//! client-credentials grant. [`ClientCredentialsSupplier`] caches one token at
//! a time and replaces it once its jittered expiry passes.
//!
//! # Expiry
//!
//! An issued token with `expires_in = E` is cached until
//! `now + random(0, E) - leeway`. The random term spreads renewals of many
//! client instances over the token lifetime; the leeway (120 s by default)
//! keeps a cached token from being used right up to its real expiry.
//!
//! # Concurrency
//!
//! The cache lock is held only to read or replace the stored credential,
//! never across the issuer call. Callers racing on an expired cache may each
//! refresh; every refreshed credential is independently valid.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use log::{debug, error};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::RwLock;

use agentproxy_common::IssuerConfig;

use crate::error::{ClientError, Result, read_bounded_body};

/// Default total request timeout for issuer calls (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Issued lifetimes are clamped to this many seconds.
const MAX_TOKEN_LIFETIME_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// A bearer credential for the broker.
///
/// Immutable once issued; refreshing produces a new value.
#[derive(Clone)]
pub struct Credential {
    /// The access token (stored securely).
    pub token: SecretString,
    /// Token type reported by the issuer, usually `Bearer`.
    pub token_type: String,
    /// Instant from which the credential must no longer be used.
    pub expires_at: DateTime<Utc>,
}

// Custom Debug implementation to avoid exposing the token
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    /// Whether the credential must be replaced at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Source of bearer credentials for broker calls.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// Returns a credential that is valid now.
    ///
    /// # Errors
    ///
    /// Returns an error if a fresh credential is needed and cannot be issued.
    async fn token(&self) -> Result<Credential>;
}

/// Token endpoint response for the client-credentials grant.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: SecretString,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Computes the cache expiry for a token issued at `now`.
///
/// Returns `now + jitter - leeway` where `jitter` is drawn uniformly from
/// `[0, expires_in)` seconds.
#[must_use]
pub fn jittered_expiry(now: DateTime<Utc>, expires_in: u64, leeway: Duration) -> DateTime<Utc> {
    let lifetime = expires_in.min(MAX_TOKEN_LIFETIME_SECS);
    let jitter = if lifetime == 0 {
        0
    } else {
        rand::rng().random_range(0..lifetime)
    };
    expiry_with_jitter(now, jitter, leeway)
}

fn expiry_with_jitter(now: DateTime<Utc>, jitter_secs: u64, leeway: Duration) -> DateTime<Utc> {
    // both bounded by MAX_TOKEN_LIFETIME_SECS or a small leeway
    let jitter = TimeDelta::seconds(i64::try_from(jitter_secs).unwrap_or(i64::MAX / 1000));
    let leeway = TimeDelta::from_std(leeway).unwrap_or_else(|_| TimeDelta::zero());

    now.checked_add_signed(jitter - leeway).unwrap_or(now)
}

/// Caching client-credentials token supplier.
///
/// # Security
///
/// The client secret and cached token are held in `SecretString` and are
/// redacted from `Debug` output.
///
/// # Examples
///
/// ```no_run
/// use agentproxy_client::{ClientCredentialsSupplier, TokenSupplier};
/// use agentproxy_common::IssuerConfig;
///
/// # async fn example() -> anyhow::Result<()> {
/// let supplier = ClientCredentialsSupplier::new(IssuerConfig::new(
///     "https://auth.example.com/oauth/token",
///     "client-id",
///     "client-secret",
///     "https://broker.example.com",
/// ))?;
///
/// let credential = supplier.token().await?;
/// println!("{} token valid until {}", credential.token_type, credential.expires_at);
/// # Ok(())
/// # }
/// ```
pub struct ClientCredentialsSupplier {
    client: reqwest::Client,
    config: Arc<IssuerConfig>,
    cached: RwLock<Option<Arc<Credential>>>,
}

impl fmt::Debug for ClientCredentialsSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCredentialsSupplier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ClientCredentialsSupplier {
    /// Creates a supplier for the given issuer.
    ///
    /// # Errors
    ///
    /// Returns an error if the issuer settings are invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: IssuerConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ClientError::ConfigurationError(e.to_string()))?;

        let client = reqwest::Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
            cached: RwLock::new(None),
        })
    }

    /// Drops the cached credential so the next call fetches a new one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    async fn fetch(&self) -> Result<Credential> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("audience", self.config.audience.as_str()),
        ];

        debug!("Requesting broker token from {}", self.config.url);

        let response = self
            .client
            .post(&self.config.url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = read_bounded_body(response).await;
            error!(
                "Token issuer rejected client credentials with status {}",
                status.as_u16()
            );
            return Err(ClientError::AuthenticationError { status, body });
        }

        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body)?;

        let now = Utc::now();
        let expires_at = jittered_expiry(now, parsed.expires_in, self.config.expiry_leeway);
        debug!(
            "Issued {} token, expires_in={}s, cached until {expires_at}",
            parsed.token_type, parsed.expires_in
        );

        Ok(Credential {
            token: parsed.access_token,
            token_type: parsed.token_type,
            expires_at,
        })
    }
}

#[async_trait]
impl TokenSupplier for ClientCredentialsSupplier {
    async fn token(&self) -> Result<Credential> {
        {
            let cached = self.cached.read().await;
            if let Some(credential) = cached.as_ref()
                && !credential.is_expired_at(Utc::now())
            {
                return Ok(credential.as_ref().clone());
            }
        }

        let fresh = Arc::new(self.fetch().await?);
        *self.cached.write().await = Some(Arc::clone(&fresh));

        Ok(fresh.as_ref().clone())
    }
}

/// Supplier that always returns the same pre-issued token.
///
/// Useful when a token is injected by the environment or for local testing.
#[derive(Clone)]
pub struct StaticTokenSupplier {
    credential: Credential,
}

impl fmt::Debug for StaticTokenSupplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSupplier")
            .field("credential", &self.credential)
            .finish()
    }
}

impl StaticTokenSupplier {
    /// Creates a supplier for a bearer token that never expires locally.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            credential: Credential {
                token: SecretString::new(token.into().into()),
                token_type: default_token_type(),
                expires_at: DateTime::<Utc>::MAX_UTC,
            },
        }
    }
}

#[async_trait]
impl TokenSupplier for StaticTokenSupplier {
    async fn token(&self) -> Result<Credential> {
        Ok(self.credential.clone())
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn expiry_is_before_true_expiry(expires_in in 1u64..10_000_000) {
            let now = Utc::now();
            let leeway = Duration::from_secs(120);
            let expiry = jittered_expiry(now, expires_in, leeway);

            let true_expiry = now + TimeDelta::seconds(i64::try_from(expires_in).unwrap_or(i64::MAX));
            prop_assert!(expiry < true_expiry);
            prop_assert!(expiry >= now - TimeDelta::seconds(120));
        }
    }
}
