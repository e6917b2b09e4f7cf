//! Agentproxy CLI
//!
//! Reaches services and cluster APIs inside private networks through tunnel
//! agents registered with the broker.
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;

use agentproxy_client::{
    BrokerClient, ClientCredentialsSupplier, ClientError, ProxyBuilder, StaticTokenSupplier,
    TokenSupplier,
};
use agentproxy_common::AgentGroup;

use crate::config::CliConfig;

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    /// Defaults to $XDG_CONFIG_HOME/agentproxy/config.toml
    #[arg(long, global = true, env = "AGENTPROXY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List agents registered for an organization and environment
    Agents {
        /// Organization identifier
        #[arg(long)]
        org: String,

        /// Environment identifier
        #[arg(long)]
        env: String,

        /// Print the raw agent records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Negotiate a SOCKS5 proxy session and print its endpoint
    Session(Target),

    /// Assemble a cluster API configuration for an agent
    Cluster {
        #[command(flatten)]
        target: Target,

        /// Call the API server's /version endpoint through the proxy
        #[arg(long)]
        probe: bool,
    },

    /// Send one GET request through a freshly negotiated proxy
    Get {
        #[command(flatten)]
        target: Target,

        /// URL to fetch from inside the agent's network
        url: String,
    },
}

/// Addressing flags shared by agent-scoped commands.
#[derive(Args, Debug)]
struct Target {
    /// Agent identifier
    #[arg(long)]
    agent: String,

    /// Organization identifier
    #[arg(long)]
    org: String,

    /// Environment identifier
    #[arg(long)]
    env: String,
}

impl Target {
    fn group(&self) -> AgentGroup {
        AgentGroup::new(&self.agent, &self.org, &self.env)
    }
}

/// Initializes structured logging with tracing.
///
/// Supports two output formats via `AGENTPROXY_LOG_FORMAT` environment variable:
/// - `json`: Machine-readable JSON logs
/// - `pretty`: Human-readable formatted logs (default)
///
/// Log level is controlled via `RUST_LOG` environment variable. Logs go to
/// stderr so command output stays pipeable.
fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let format = std::env::var("AGENTPROXY_LOG_FORMAT")
        .unwrap_or_else(|_| "pretty".to_string())
        .to_lowercase();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agentproxy=info,agentproxy_client=info"));

    match format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .init();
        }
        _ => {
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .init();
        }
    }
}

/// Picks the broker token source from configuration.
fn token_supplier(config: &CliConfig) -> Result<Arc<dyn TokenSupplier>> {
    if let Some(issuer) = config.issuer_config()? {
        debug!("Minting broker tokens from {}", issuer.url);
        return Ok(Arc::new(ClientCredentialsSupplier::new(issuer)?));
    }

    let var = config
        .broker
        .token_env
        .as_deref()
        .context("No broker token source configured")?;
    let token = std::env::var(var).with_context(|| format!("Token variable {var} is not set"))?;
    Ok(Arc::new(StaticTokenSupplier::new(token)))
}

async fn run(cli: Cli) -> Result<()> {
    let config = CliConfig::load(cli.config.as_deref()).with_context(|| {
        format!(
            "Failed to load configuration (expected at {})",
            cli.config.as_ref().map_or_else(
                || {
                    CliConfig::config_path()
                        .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string())
                },
                |p| p.display().to_string()
            )
        )
    })?;

    let broker_config = config.broker_config();
    let broker = Arc::new(BrokerClient::new(&broker_config, token_supplier(&config)?)?);
    let proxies = ProxyBuilder::new(broker.clone()).with_overrides(broker_config.overrides);

    match cli.command {
        Command::Agents { org, env, json } => {
            commands::list_agents(&broker, &org, &env, json).await
        }
        Command::Session(target) => commands::show_session(&proxies, &target.group()).await,
        Command::Cluster { target, probe } => {
            commands::show_cluster(broker, proxies, &target.group(), probe).await
        }
        Command::Get { target, url } => {
            commands::proxied_get(&proxies, &target.group(), &url).await
        }
    }
}

/// Renders an error for the terminal, shortening the common broker failures.
fn describe(err: &anyhow::Error) -> String {
    match err.downcast_ref::<ClientError>() {
        Some(ClientError::AgentNotFound { agent_identifier }) => {
            format!("agent '{agent_identifier}' was not found in that organization and environment")
        }
        Some(ClientError::CapabilityNotSupported { agent_identifier }) => {
            format!("agent '{agent_identifier}' does not support this operation")
        }
        Some(ClientError::AuthenticationError { status, .. }) => {
            format!("the broker rejected our credentials ({status})")
        }
        _ => format!("{err:#}"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("{e:?}");
            eprintln!("Error: {}", describe(&e));
            ExitCode::FAILURE
        }
    }
}
