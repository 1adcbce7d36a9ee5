use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ccbridge::cli::{Cli, Commands};
use ccbridge::config::BridgeConfig;
use ccbridge::gateway;
use ccbridge::orchestrator::Bridge;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_filter())),
        )
        .init();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;

    match cli.command {
        Some(Commands::CheckAgent) => check_agent(&config).await,
        Some(Commands::Serve {
            host,
            port,
            token,
            safe_root,
        }) => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(token) = token {
                config.auth_token = Some(token);
            }
            if let Some(safe_root) = safe_root {
                config.safe_root = safe_root;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

async fn serve(config: BridgeConfig) -> Result<()> {
    let bind_addr = config.bind_addr();
    let bridge = Bridge::new(config);
    bridge.spawn_background_tasks();

    let app = gateway::router(bridge.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server failed")?;

    bridge.shutdown();
    Ok(())
}

async fn check_agent(config: &BridgeConfig) -> Result<()> {
    let program = match &config.agent_cli_path {
        Some(path) => path.clone(),
        None => agent_stream::locate_agent_cli(&config.agent_command).await?,
    };
    let version = agent_stream::health_check(&program).await?;
    println!("agent CLI: {}", program.display());
    println!("version:   {version}");
    Ok(())
}
