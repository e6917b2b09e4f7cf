//! # agentproxy-common
//!
//! Shared types for reaching operator-controlled tunnel agents through a broker.
//!
//! This crate holds the data exchanged with the broker and the configuration
//! consumed by `agentproxy-client`:
//! - Agent addressing and directory records
//! - Ephemeral proxy-session and cluster credentials
//! - Caller-supplied session overrides
//! - Issuer, retry and broker configuration
//!
//! It performs no I/O.
//!
//! ## Example
//!
//! ```
//! use agentproxy_common::{AgentGroup, SessionOverrides};
//!
//! let group = AgentGroup::new("agent-7", "org-1", "env-prod");
//! let overrides = SessionOverrides::default().with_host("localhost");
//!
//! assert_eq!(group.agent_identifier, "agent-7");
//! assert!(!overrides.is_empty());
//! ```

/// Agent addressing and directory records.
///
/// Provides the `AgentGroup` tuple used in every broker request and the
/// `Agent` listing record.
pub mod agent;
/// Issuer, retry and broker configuration.
pub mod config;
/// Ephemeral credentials negotiated with the broker.
///
/// Contains proxy-session and cluster credential bundles and the override
/// rules applied to them.
pub mod session;

pub use agent::{Agent, AgentGroup};
pub use config::{BrokerConfig, IssuerConfig, RetryConfig};
pub use session::{
    BrokerDomainError, KubernetesCredentials, KubernetesCredentialsResponse, SessionCredentials,
    SessionOverrides,
};
