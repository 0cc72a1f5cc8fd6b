use anyhow::Result;
use clap::Parser;
use mcp_gateway::config::{Cli, GatewayConfig};
use mcp_gateway::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::try_from(cli)?;
    init_tracing(&config.log_filter);
    mcp_gateway::serve(config).await
}
