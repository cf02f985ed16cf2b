//! Agent 365 host - serves an Azure OpenAI agent on a bot-framework endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use agent365_host::agent::{Agent365Agent, AgentInterface};
use agent365_host::config::{AgentConfig, AuthConfig, HostConfig};
use agent365_host::host::{AgentFactory, AgentHost};

/// Agent 365 host - conversational agent behind /api/messages.
#[derive(Parser, Debug)]
#[command(name = "agent365-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Tooling manifest location.
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // A missing .env is fine; real deployments set variables directly.
    dotenvy::dotenv().ok();

    agent365_host::telemetry::init_logging(&args.log_level, args.json_logs);

    info!("Agent host starting");

    let mut host_config = HostConfig::from_env()?;
    host_config.manifest_path = args.manifest;
    let auth = AuthConfig::from_env();

    // Configuration errors surface here, before the server binds.
    let agent_config = AgentConfig::from_lookup(
        |key: &str| std::env::var(key).ok(),
        host_config.manifest_path.as_deref(),
    )?;

    let factory_auth = auth.clone();
    let factory: AgentFactory = Arc::new(move || {
        Ok(Arc::new(Agent365Agent::new(agent_config.clone(), factory_auth.clone()))
            as Arc<dyn AgentInterface>)
    });

    let host = Arc::new(AgentHost::new("Agent365Agent", factory, host_config, &auth));
    host.run(args.port).await?;

    Ok(())
}
