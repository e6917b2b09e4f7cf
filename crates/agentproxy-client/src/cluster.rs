//! Remote Kubernetes API configuration.
//!
//! A cluster config needs two independent broker negotiations: cluster
//! credentials (CA bundle, bearer token, API address) and a proxy session
//! for reaching that address. Both run concurrently and the result is
//! consistent for one operation even if the session expires afterwards.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use log::debug;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use agentproxy_common::{AgentGroup, KubernetesCredentials};

use crate::ClusterCredentialFetcher;
use crate::error::{ClientError, Result};
use crate::proxy::{ProxyBuilder, ProxyFunction};

/// Ready-to-use configuration for a cluster API behind an agent.
#[derive(Clone)]
pub struct ClusterConfig {
    /// API server base URL, `https://host:port`.
    pub host: String,
    /// PEM bundle of the cluster CA.
    pub ca_data: Vec<u8>,
    /// Bearer token for the cluster API (stored securely).
    pub bearer_token: SecretString,
    /// Proxy that tunnels requests to the API server.
    pub proxy: ProxyFunction,
}

// Custom Debug implementation to avoid exposing the bearer token
impl fmt::Debug for ClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfig")
            .field("host", &self.host)
            .field("ca_data_len", &self.ca_data.len())
            .field("bearer_token", &"[REDACTED]")
            .field("proxy", &self.proxy)
            .finish()
    }
}

impl ClusterConfig {
    /// Builds an HTTP client for the cluster API.
    ///
    /// The client trusts only the cluster CA, tunnels through the proxy and
    /// sends the bearer token on every request.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConfigurationError`] if the CA bundle or token
    /// cannot be used or the client cannot be built.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        let certificates = reqwest::Certificate::from_pem_bundle(&self.ca_data)
            .map_err(|e| ClientError::ConfigurationError(format!("Invalid cluster CA: {e}")))?;

        let mut auth =
            HeaderValue::from_str(&format!("Bearer {}", self.bearer_token.expose_secret()))
                .map_err(|_| {
                    ClientError::ConfigurationError(
                        "Cluster token is not a valid header value".to_string(),
                    )
                })?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);

        let mut builder = reqwest::Client::builder()
            .tls_built_in_root_certs(false)
            .default_headers(headers)
            .proxy(self.proxy.to_proxy());
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }

        builder.build().map_err(|e| {
            ClientError::ConfigurationError(format!("Failed to build cluster client: {e}"))
        })
    }
}

/// Assembles [`ClusterConfig`]s from broker negotiations.
#[derive(Clone)]
pub struct ClusterConfigAssembler {
    credentials: Arc<dyn ClusterCredentialFetcher>,
    proxies: ProxyBuilder,
}

impl fmt::Debug for ClusterConfigAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterConfigAssembler")
            .field("proxies", &self.proxies)
            .finish_non_exhaustive()
    }
}

impl ClusterConfigAssembler {
    /// Creates an assembler from a credential source and a proxy builder.
    #[must_use]
    pub fn new(credentials: Arc<dyn ClusterCredentialFetcher>, proxies: ProxyBuilder) -> Self {
        Self {
            credentials,
            proxies,
        }
    }

    /// Negotiates cluster credentials and a proxy session for `group`.
    ///
    /// # Errors
    ///
    /// Returns the first broker error of either negotiation, or a decode
    /// error ([`ClientError::InvalidBase64`], [`ClientError::InvalidUtf8`])
    /// if the credentials are malformed.
    pub async fn build_cluster_config(&self, group: &AgentGroup) -> Result<ClusterConfig> {
        let (credentials, proxy) = tokio::try_join!(
            self.credentials.fetch_cluster_credentials(group),
            self.proxies.build_proxy_function(group),
        )?;

        let config = assemble(&credentials, proxy)?;
        debug!("Assembled cluster config for {group} targeting {}", config.host);
        Ok(config)
    }
}

fn assemble(credentials: &KubernetesCredentials, proxy: ProxyFunction) -> Result<ClusterConfig> {
    let ca_data = STANDARD
        .decode(credentials.root_ca_base64.trim())
        .map_err(|source| ClientError::InvalidBase64 {
            field: "rootCaBase64",
            source,
        })?;

    let token = STANDARD
        .decode(credentials.token_base64.expose_secret().trim())
        .map_err(|source| ClientError::InvalidBase64 {
            field: "tokenBase64",
            source,
        })?;
    let token = String::from_utf8(token).map_err(|_| ClientError::InvalidUtf8 {
        field: "tokenBase64",
    })?;

    let host = if credentials.host.contains(':') && !credentials.host.starts_with('[') {
        format!("https://[{}]:{}", credentials.host, credentials.port)
    } else {
        format!("https://{}:{}", credentials.host, credentials.port)
    };

    Ok(ClusterConfig {
        host,
        ca_data,
        bearer_token: SecretString::new(token.into()),
        proxy,
    })
}
