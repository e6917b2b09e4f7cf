//! Broker API client.
//!
//! Talks to the three internal broker endpoints:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | proxy session | `POST {base}/internal/auth/session` |
//! | cluster credentials | `POST {base}/internal/auth/kubernetes-cluster-credentials-for-agent` |
//! | agent listing | `GET {base}/internal/agent-metadata?orgId=&envId=` |
//!
//! # Retries
//!
//! Requests go through `reqwest-retry` with exponential backoff. Network
//! failures and 5xx/408/429 responses are retried up to the configured
//! budget; other 4xx responses are returned immediately. `Retry-After`
//! headers are honoured first.
//!
//! # Cancellation
//!
//! Dropping a returned future (for example through `tokio::time::timeout`)
//! aborts the in-flight request and any pending backoff sleep.
//!
//! # Error Handling
//!
//! - **404**: [`ClientError::AgentNotFound`]
//! - **422** (cluster credentials only): [`ClientError::CapabilityNotSupported`]
//! - **200 with `error` set** (cluster credentials only): [`ClientError::BrokerError`]
//! - **Other non-200**: [`ClientError::UnexpectedStatus`] with a truncated body

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use reqwest_retry_after::RetryAfterMiddleware;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use url::Url;

use agentproxy_common::{
    Agent, AgentGroup, BrokerConfig, KubernetesCredentials, KubernetesCredentialsResponse,
    SessionCredentials,
};

use crate::error::{ClientError, Result, read_bounded_body};
use crate::token::TokenSupplier;
use crate::{AgentDirectory, ClusterCredentialFetcher, SessionFetcher};

const SESSION_PATH: &str = "internal/auth/session";
const CLUSTER_CREDENTIALS_PATH: &str = "internal/auth/kubernetes-cluster-credentials-for-agent";
const AGENT_METADATA_PATH: &str = "internal/agent-metadata";

/// Client for the broker's internal API.
///
/// Cheap to clone. A fresh bearer token is requested from the
/// [`TokenSupplier`] for every call; the client never stores one itself.
#[derive(Clone)]
pub struct BrokerClient {
    client: ClientWithMiddleware,
    base_url: Url,
    tokens: Arc<dyn TokenSupplier>,
}

impl fmt::Debug for BrokerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerClient")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl BrokerClient {
    /// Create a new broker client.
    ///
    /// # Arguments
    ///
    /// * `config` - Broker base URL, timeout and retry settings
    /// * `tokens` - Source of bearer credentials for every request
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use agentproxy_client::{BrokerClient, StaticTokenSupplier};
    /// use agentproxy_common::BrokerConfig;
    ///
    /// let client = BrokerClient::new(
    ///     &BrokerConfig::new("https://broker.example.com").with_timeout(30),
    ///     Arc::new(StaticTokenSupplier::new("token")),
    /// )?;
    /// # Ok::<(), agentproxy_client::ClientError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(config: &BrokerConfig, tokens: Arc<dyn TokenSupplier>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ClientError::ConfigurationError(e.to_string()))?;

        // join() treats a base without a trailing slash as a file, so force one
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).map_err(|e| {
            ClientError::ConfigurationError(format!("Invalid broker URL '{base}': {e}"))
        })?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(
                config.retry_config.initial_delay,
                config.retry_config.max_delay,
            )
            .build_with_max_retries(config.retry_config.max_retries);

        // None means no timeout
        let reqwest_client = match config.timeout_seconds {
            Some(timeout) => reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout))
                .build()?,
            None => reqwest::Client::builder().build()?,
        };

        // NOTE: RetryAfterMiddleware should be added before RetryTransientMiddleware
        // so that Retry-After headers are respected before falling back to exponential backoff
        let client = reqwest_middleware::ClientBuilder::new(reqwest_client)
            .with(RetryAfterMiddleware::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    /// The broker base URL, always ending in `/`.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url.join(path).map_err(|e| {
            ClientError::ConfigurationError(format!("Invalid broker endpoint '{path}': {e}"))
        })
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let credential = self.tokens.token().await?;
        Ok(request
            .header(
                AUTHORIZATION,
                format!("Bearer {}", credential.token.expose_secret()),
            )
            .header(ACCEPT, "application/json"))
    }

    async fn post_group(&self, path: &str, group: &AgentGroup) -> Result<reqwest::Response> {
        let url = self.endpoint(path)?;
        let body = serde_json::to_string(group)?;

        let request = self
            .authorized(self.client.post(url))
            .await?
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        debug!("Requesting {path} for agent {group}");
        Ok(request.send().await?)
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| {
            warn!("Failed to decode broker response: {e}");
            ClientError::SerializationError(e)
        })
    }

    async fn unexpected_status(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let body = read_bounded_body(response).await;
        error!(
            "Broker request failed with status {}: {body}",
            status.as_u16()
        );
        ClientError::UnexpectedStatus { status, body }
    }
}

#[async_trait]
impl SessionFetcher for BrokerClient {
    async fn fetch_proxy_session(&self, group: &AgentGroup) -> Result<SessionCredentials> {
        let response = self.post_group(SESSION_PATH, group).await?;

        match response.status() {
            StatusCode::OK => {
                let session: SessionCredentials = Self::decode(response).await?;
                debug!(
                    "Negotiated proxy session for agent {group}, expires at {}",
                    session.expires_at
                );
                Ok(session)
            }
            StatusCode::NOT_FOUND => {
                debug!("Broker has no agent {group}");
                Err(ClientError::AgentNotFound {
                    agent_identifier: group.agent_identifier.clone(),
                })
            }
            _ => Err(Self::unexpected_status(response).await),
        }
    }
}

#[async_trait]
impl ClusterCredentialFetcher for BrokerClient {
    async fn fetch_cluster_credentials(
        &self,
        group: &AgentGroup,
    ) -> Result<KubernetesCredentials> {
        let response = self.post_group(CLUSTER_CREDENTIALS_PATH, group).await?;

        match response.status() {
            StatusCode::OK => {
                let wire: KubernetesCredentialsResponse = Self::decode(response).await?;
                wire.into_result().map_err(|e| {
                    error!("Broker failed to issue cluster credentials for {group}: {e}");
                    ClientError::BrokerError(e)
                })
            }
            StatusCode::NOT_FOUND => {
                debug!("Broker has no agent {group}");
                Err(ClientError::AgentNotFound {
                    agent_identifier: group.agent_identifier.clone(),
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => Err(ClientError::CapabilityNotSupported {
                agent_identifier: group.agent_identifier.clone(),
            }),
            _ => Err(Self::unexpected_status(response).await),
        }
    }
}

#[async_trait]
impl AgentDirectory for BrokerClient {
    async fn list_agents(&self, organization_id: &str, environment_id: &str) -> Result<Vec<Agent>> {
        if organization_id.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "organization id must not be empty".to_string(),
            ));
        }
        if environment_id.trim().is_empty() {
            return Err(ClientError::InvalidRequest(
                "environment id must not be empty".to_string(),
            ));
        }

        let url = self.endpoint(AGENT_METADATA_PATH)?;
        let response = self
            .authorized(self.client.get(url))
            .await?
            .query(&[("orgId", organization_id), ("envId", environment_id)])
            .send()
            .await?;

        if response.status() != StatusCode::OK {
            return Err(Self::unexpected_status(response).await);
        }

        let agents: Vec<Agent> = Self::decode(response).await?;
        debug!(
            "Broker listed {} agents for {organization_id}/{environment_id}",
            agents.len()
        );
        Ok(agents)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::panic)]

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use agentproxy_common::RetryConfig;
    use chrono::Utc;
    use secrecy::{ExposeSecret, SecretString};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::token::{Credential, StaticTokenSupplier};

    /// Token supplier that counts how often it is asked.
    #[derive(Default)]
    struct CountingSupplier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TokenSupplier for CountingSupplier {
        async fn token(&self) -> Result<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                token: SecretString::new(format!("token-{n}").into()),
                token_type: "Bearer".to_string(),
                expires_at: Utc::now(),
            })
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    fn create_test_client(base_url: &str) -> BrokerClient {
        let config = BrokerConfig::new(base_url).with_retry_config(fast_retry(5));
        BrokerClient::new(&config, Arc::new(StaticTokenSupplier::new("test-token"))).unwrap()
    }

    fn group() -> AgentGroup {
        AgentGroup::new("agent-7", "org-1", "prod")
    }

    fn session_body() -> serde_json::Value {
        serde_json::json!({
            "user": "session-user",
            "password": "session-pass",
            "host": "proxy.broker.internal",
            "port": 1080,
            "expiresAt": "2030-01-01T00:00:00Z",
        })
    }

    fn cluster_body() -> serde_json::Value {
        serde_json::json!({
            "rootCaBase64": "LS0tLS1CRUdJTg==",
            "tokenBase64": "Y2x1c3Rlci10b2tlbg==",
            "host": "10.96.0.1",
            "port": 443,
        })
    }

    #[tokio::test]
    async fn test_fetch_proxy_session() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("accept", "application/json"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({
                "agentIdentifier": "agent-7",
                "organizationId": "org-1",
                "environmentId": "prod",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let session = client.fetch_proxy_session(&group()).await.unwrap();

        assert_eq!(session.user, "session-user");
        assert_eq!(session.password.expose_secret(), "session-pass");
        assert_eq!(session.host, "proxy.broker.internal");
        assert_eq!(session.port, 1080);
    }

    #[tokio::test]
    async fn test_base_url_with_path_prefix() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/broker/internal/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&format!("{}/broker", mock_server.uri()));
        client.fetch_proxy_session(&group()).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_not_found_is_typed() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such agent"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let missing = AgentGroup::new("does-not-exist", "org-1", "prod");
        let err = client.fetch_proxy_session(&missing).await.unwrap_err();

        assert!(err.is_agent_not_found());
        assert!(matches!(
            err,
            ClientError::AgentNotFound { ref agent_identifier } if agent_identifier == "does-not-exist"
        ));
    }

    #[tokio::test]
    async fn test_retries_server_errors_then_succeeds() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(3)
            .expect(3)
            .mount(&mock_server)
            .await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let session = client.fetch_proxy_session(&group()).await.unwrap();

        assert_eq!(session.user, "session-user");
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_status_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(503).set_body_string("deploying"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let config = BrokerConfig::new(mock_server.uri()).with_retry_config(fast_retry(2));
        let client =
            BrokerClient::new(&config, Arc::new(StaticTokenSupplier::new("test-token"))).unwrap();

        let err = client.fetch_proxy_session(&group()).await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(err.is_retryable());
        assert!(err.to_string().contains("deploying"));
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_proxy_session(&group()).await.unwrap_err();

        assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_error_body_is_truncated() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(100_000)))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_proxy_session(&group()).await.unwrap_err();

        match err {
            ClientError::UnexpectedStatus { body, .. } => {
                assert_eq!(body.len(), crate::error::MAX_ERROR_BODY_BYTES);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let config = BrokerConfig::new(mock_server.uri()).with_retry_config(RetryConfig {
            max_retries: 10,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        });
        let client =
            BrokerClient::new(&config, Arc::new(StaticTokenSupplier::new("test-token"))).unwrap();

        let started = Instant::now();
        let result = tokio::time::timeout(
            Duration::from_millis(200),
            client.fetch_proxy_session(&group()),
        )
        .await;

        assert!(result.is_err(), "call should have been cancelled");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_token_is_requested_for_every_call() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(session_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let supplier = Arc::new(CountingSupplier::default());
        let config = BrokerConfig::new(mock_server.uri()).with_retry_config(fast_retry(0));
        let client = BrokerClient::new(&config, supplier.clone()).unwrap();

        client.fetch_proxy_session(&group()).await.unwrap();
        client.fetch_proxy_session(&group()).await.unwrap();

        assert_eq!(supplier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_cluster_credentials() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/internal/auth/kubernetes-cluster-credentials-for-agent",
            ))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(cluster_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let creds = client.fetch_cluster_credentials(&group()).await.unwrap();

        assert_eq!(creds.host, "10.96.0.1");
        assert_eq!(creds.port, 443);
        assert_eq!(creds.token_base64.expose_secret(), "Y2x1c3Rlci10b2tlbg==");
    }

    #[tokio::test]
    async fn test_cluster_credentials_embedded_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/internal/auth/kubernetes-cluster-credentials-for-agent",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "error": "service account missing",
                "stackTrace": "at issue()",
                "rootCaBase64": "",
                "tokenBase64": "",
                "host": "",
                "port": 0,
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_cluster_credentials(&group()).await.unwrap_err();

        assert!(err.is_broker_error());
        match err {
            ClientError::BrokerError(domain) => {
                assert_eq!(domain.message, "service account missing");
                assert_eq!(domain.stack_trace, "at issue()");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cluster_credentials_unsupported() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/internal/auth/kubernetes-cluster-credentials-for-agent",
            ))
            .respond_with(ResponseTemplate::new(422))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_cluster_credentials(&group()).await.unwrap_err();

        assert!(err.is_capability_not_supported());
    }

    #[tokio::test]
    async fn test_cluster_credentials_not_found() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path(
                "/internal/auth/kubernetes-cluster-credentials-for-agent",
            ))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_cluster_credentials(&group()).await.unwrap_err();

        assert!(err.is_agent_not_found());
    }

    #[tokio::test]
    async fn test_malformed_session_is_decode_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/internal/auth/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "user": "only-a-user"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let err = client.fetch_proxy_session(&group()).await.unwrap_err();

        assert!(err.is_decode_error());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_agents() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/internal/agent-metadata"))
            .and(query_param("orgId", "org-1"))
            .and(query_param("envId", "prod"))
            .and(header("authorization", "Bearer test-token"))
            .and(header("accept", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "agentIdentifier": "agent-7",
                    "organizationId": "org-1",
                    "environmentId": "prod",
                    "ipAddress": "10.0.4.2",
                    "lastHeartbeat": "2026-10-01T12:00:00Z",
                    "kubernetesEnabled": true,
                },
                {
                    "agentIdentifier": "agent-8",
                    "organizationId": "org-1",
                    "environmentId": "prod",
                    "ipAddress": "",
                }
            ])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = create_test_client(&mock_server.uri());
        let agents = client.list_agents("org-1", "prod").await.unwrap();

        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].agent_identifier, "agent-7");
        assert!(agents[0].kubernetes_enabled);
        assert!(!agents[1].kubernetes_enabled);
        assert!(agents[1].ip_address.is_none());
    }

    #[tokio::test]
    async fn test_list_agents_validates_before_network() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(0)
            .mount(&mock_server)
            .await;

        let supplier = Arc::new(CountingSupplier::default());
        let config = BrokerConfig::new(mock_server.uri()).with_retry_config(fast_retry(0));
        let client = BrokerClient::new(&config, supplier.clone()).unwrap();

        let missing_org = client.list_agents("", "env").await.unwrap_err();
        let missing_env = client.list_agents("org", "").await.unwrap_err();
        let blank_org = client.list_agents("   ", "env").await.unwrap_err();

        assert!(matches!(missing_org, ClientError::InvalidRequest(_)));
        assert!(matches!(missing_env, ClientError::InvalidRequest(_)));
        assert!(matches!(blank_org, ClientError::InvalidRequest(_)));
        assert_eq!(supplier.calls.load(Ordering::SeqCst), 0);
        assert!(mock_server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = BrokerClient::new(
            &BrokerConfig::new("not a url"),
            Arc::new(StaticTokenSupplier::new("t")),
        )
        .unwrap_err();

        assert!(matches!(err, ClientError::ConfigurationError(_)));
    }
}
