//! # agentproxy-client
//!
//! Client library for reaching private tunnel agents through a broker.
//!
//! Operations are built from four layers:
//! - [`ClientCredentialsSupplier`] caches the bearer credential used against the broker
//! - [`BrokerClient`] negotiates proxy sessions, cluster credentials and agent listings
//! - [`ProxyBuilder`] turns a fresh session into a SOCKS5 proxy function or transport
//! - [`ClusterConfigAssembler`] combines cluster credentials and a proxy function
//!
//! Nothing except the broker credential is cached. Every operation negotiates
//! its own session.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agentproxy_client::{BrokerClient, ClientCredentialsSupplier, ClusterConfigAssembler, ProxyBuilder};
//! use agentproxy_common::{AgentGroup, BrokerConfig, IssuerConfig};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let issuer = IssuerConfig::new(
//!     "https://auth.example.com/oauth/token",
//!     "client-id",
//!     "client-secret",
//!     "https://broker.example.com",
//! );
//! let tokens = Arc::new(ClientCredentialsSupplier::new(issuer)?);
//! let broker = Arc::new(BrokerClient::new(
//!     &BrokerConfig::new("https://broker.example.com"),
//!     tokens,
//! )?);
//!
//! let group = AgentGroup::new("agent-7", "org-1", "prod");
//!
//! // Plain HTTP through the agent's network
//! let transport = ProxyBuilder::new(broker.clone()).build_transport(&group).await?;
//! let response = transport.get("http://db-admin.internal/health").send().await?;
//! println!("{}", response.status());
//!
//! // Kubernetes API behind the agent
//! let assembler = ClusterConfigAssembler::new(broker.clone(), ProxyBuilder::new(broker));
//! let cluster = assembler.build_cluster_config(&group).await?;
//! println!("API server: {}", cluster.host);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;

use agentproxy_common::{Agent, AgentGroup, KubernetesCredentials, SessionCredentials};

pub mod broker;
pub mod cluster;
pub mod error;
pub mod proxy;
pub mod token;

pub use broker::BrokerClient;
pub use cluster::{ClusterConfig, ClusterConfigAssembler};
pub use error::{ClientError, Result};
pub use proxy::{ProxyBuilder, ProxyFunction};
pub use token::{ClientCredentialsSupplier, Credential, StaticTokenSupplier, TokenSupplier};

/// Negotiates SOCKS5 proxy sessions for an agent.
#[async_trait]
pub trait SessionFetcher: Send + Sync {
    /// Fetch fresh SOCKS5 session credentials for `group`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::AgentNotFound`] when the broker does not know the
    /// agent, or a network, status or decode error.
    async fn fetch_proxy_session(&self, group: &AgentGroup) -> Result<SessionCredentials>;
}

/// Negotiates Kubernetes cluster credentials for an agent.
#[async_trait]
pub trait ClusterCredentialFetcher: Send + Sync {
    /// Fetch fresh cluster credentials for `group`.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The agent is unknown ([`ClientError::AgentNotFound`])
    /// - The agent cannot issue cluster credentials ([`ClientError::CapabilityNotSupported`])
    /// - The broker embeds a failure in a 200 response ([`ClientError::BrokerError`])
    /// - Network communication or decoding fails
    async fn fetch_cluster_credentials(&self, group: &AgentGroup)
    -> Result<KubernetesCredentials>;
}

/// Lists agents known to the broker.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// List agents registered for one organization and environment.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] without touching the network if
    /// either identifier is blank, otherwise a network, status or decode error.
    async fn list_agents(&self, organization_id: &str, environment_id: &str) -> Result<Vec<Agent>>;
}
