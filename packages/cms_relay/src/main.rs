use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::prelude::*;

use cms_relay::config::{DEFAULT_CONFIG_FILE, read_config};
use cms_relay::{EchoAgent, RelayConfig, RelayServer, bind_first};

#[derive(Parser)]
#[command(name = "cms-relay")]
#[command(about = "WebSocket relay between a CMS chat UI and an LLM agent")]
struct Cli {
    /// Config file (TOML); missing files are ignored
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Host to bind to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "cms_relay=debug,tower_http=debug,info"
    } else {
        "cms_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config = read_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    if let Some(host) = cli.host {
        file_config.server.host = host;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }

    if cli.print_config {
        println!("{}", toml::to_string(&file_config)?);
        return Ok(());
    }

    let addrs = file_config
        .server
        .candidate_addrs()
        .with_context(|| format!("Invalid host: {}", file_config.server.host))?;
    let listener = bind_first(&addrs).await.context("Failed to bind listener")?;

    let config = RelayConfig::from_file(&file_config);
    info!(
        heartbeat_secs = config.websocket.heartbeat_interval.as_secs(),
        session_expiry_secs = config.session.expiry.as_secs(),
        max_documents = config.selection.max_documents,
        "Starting CMS relay"
    );

    let server = RelayServer::new(config, EchoAgent::factory());

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    server
        .serve(listener, shutdown_signal)
        .await
        .context("Server error")
}
