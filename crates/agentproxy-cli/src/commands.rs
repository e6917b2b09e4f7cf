//! Command implementations for the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use secrecy::ExposeSecret;
use tracing::info;

use agentproxy_client::{AgentDirectory, BrokerClient, ClusterConfigAssembler, ProxyBuilder};
use agentproxy_common::{Agent, AgentGroup};

/// Lists the agents of one organization and environment.
pub async fn list_agents(
    broker: &BrokerClient,
    organization_id: &str,
    environment_id: &str,
    json: bool,
) -> Result<()> {
    let agents = broker.list_agents(organization_id, environment_id).await?;
    info!("Broker returned {} agent(s)", agents.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }

    if agents.is_empty() {
        println!("No agents registered for {organization_id}/{environment_id}");
        return Ok(());
    }

    for agent in &agents {
        println!("{}", format_agent(agent));
    }
    Ok(())
}

fn format_agent(agent: &Agent) -> String {
    let mut capabilities = Vec::new();
    if agent.socks_enabled {
        capabilities.push("socks");
    }
    if agent.kubernetes_enabled {
        capabilities.push("kubernetes");
    }
    let capabilities = if capabilities.is_empty() {
        "-".to_string()
    } else {
        capabilities.join(",")
    };

    let heartbeat = agent
        .last_heartbeat
        .map_or_else(|| "never".to_string(), |t| t.to_rfc3339());
    let version = agent.version.as_deref().unwrap_or("unknown");

    format!(
        "{:<24} {:<12} {:<20} last heartbeat {heartbeat}",
        agent.agent_identifier, version, capabilities
    )
}

/// Negotiates a proxy session and prints its redacted endpoint.
pub async fn show_session(proxies: &ProxyBuilder, group: &AgentGroup) -> Result<()> {
    let function = proxies.build_proxy_function(group).await?;

    println!("proxy:   {}", function.redacted_url());
    println!("expires: {}", function.expires_at().to_rfc3339());
    Ok(())
}

/// Assembles a cluster config and prints a summary.
///
/// With `probe`, also calls the API server's `/version` endpoint through
/// the proxy.
pub async fn show_cluster(
    broker: Arc<BrokerClient>,
    proxies: ProxyBuilder,
    group: &AgentGroup,
    probe: bool,
) -> Result<()> {
    let assembler = ClusterConfigAssembler::new(broker, proxies);
    let cluster = assembler.build_cluster_config(group).await?;

    println!("host:    {}", cluster.host);
    println!("ca:      {} bytes", cluster.ca_data.len());
    println!(
        "token:   {}",
        if cluster.bearer_token.expose_secret().is_empty() {
            "absent"
        } else {
            "present"
        }
    );
    println!("proxy:   {}", cluster.proxy.redacted_url());

    if probe {
        let client = cluster.http_client()?;
        let url = format!("{}/version", cluster.host);
        let body = client
            .get(&url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .with_context(|| format!("Probe of {url} failed"))?
            .text()
            .await?;
        println!("version: {}", body.trim());
    }

    Ok(())
}

/// Sends one GET through a freshly negotiated proxy and prints status and body.
pub async fn proxied_get(proxies: &ProxyBuilder, group: &AgentGroup, url: &str) -> Result<()> {
    let client = proxies.build_transport(group).await?;

    let response = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("Request to {url} failed"))?;
    let status = response.status();
    let body = response.text().await?;

    info!("GET {url} returned {status}");
    println!("{status}");
    print!("{body}");

    if !status.is_success() {
        anyhow::bail!("GET {url} returned {status}");
    }
    Ok(())
}
