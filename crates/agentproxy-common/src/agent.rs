use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// The addressing tuple identifying one tunnel endpoint.
///
/// Sent as the JSON body of every session and credential request.
///
/// # Examples
///
/// ```
/// use agentproxy_common::AgentGroup;
///
/// let group = AgentGroup::new("agent-7", "org-1", "env-prod");
/// let json = serde_json::to_value(&group).unwrap();
/// assert_eq!(json["agentIdentifier"], "agent-7");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentGroup {
    /// Identifier of the agent within its organization and environment.
    pub agent_identifier: String,
    /// Owning organization.
    pub organization_id: String,
    /// Environment the agent is registered in.
    pub environment_id: String,
}

impl AgentGroup {
    /// Creates a new addressing tuple.
    pub fn new(
        agent_identifier: impl Into<String>,
        organization_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_identifier: agent_identifier.into(),
            organization_id: organization_id.into(),
            environment_id: environment_id.into(),
        }
    }
}

impl fmt::Display for AgentGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.organization_id, self.environment_id, self.agent_identifier
        )
    }
}

/// Directory record describing a connected tunnel agent.
///
/// Owned by the broker and returned by the agent listing endpoint. Fields the
/// broker omits fall back to their defaults so older brokers still decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    /// Identifier of the agent.
    pub agent_identifier: String,
    /// Owning organization.
    pub organization_id: String,
    /// Environment the agent is registered in.
    pub environment_id: String,
    /// Address the agent last connected from.
    #[serde(default, deserialize_with = "lenient_ip")]
    pub ip_address: Option<IpAddr>,
    /// Reported agent version.
    #[serde(default)]
    pub version: Option<String>,
    /// Time of the last heartbeat received by the broker.
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Whether the agent can issue Kubernetes cluster credentials.
    #[serde(default)]
    pub kubernetes_enabled: bool,
    /// Whether the agent accepts SOCKS5 proxy sessions.
    #[serde(default)]
    pub socks_enabled: bool,
}

impl Agent {
    /// Returns the addressing tuple for this agent.
    #[must_use]
    pub fn group(&self) -> AgentGroup {
        AgentGroup::new(
            &self.agent_identifier,
            &self.organization_id,
            &self.environment_id,
        )
    }
}

/// Decodes an optional address, treating empty or unparseable values as
/// absent so one bad record does not fail a whole listing.
fn lenient_ip<'de, D>(deserializer: D) -> Result<Option<IpAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.trim().parse().ok()))
}
