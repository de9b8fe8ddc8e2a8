//! Callbridge - signaling relay and credential-shielding proxy.
//!
//! Usage:
//!   callbridge serve [--host 0.0.0.0] [--port 8000]   # Start HTTP/WebSocket server
//!   callbridge check-config                          # Validate environment and exit

use anyhow::Context;
use callbridge::{http_server, AppState, Config};
use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "callbridge")]
#[command(about = "Two-peer call signaling with translation and speech-token proxy")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and signaling server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, env = "PORT", default_value = "8000")]
        port: u16,
    },
    /// Load configuration from the environment and report problems
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Missing credentials are fatal before anything is served.
    let config = Config::from_env().context("invalid configuration")?;

    match args.command {
        Commands::Serve { host, port } => {
            tracing::info!(
                translator_region = %config.translator.region,
                speech_region = %config.speech.region,
                allowed_origin = %config.allowed_origin,
                "Configuration loaded"
            );
            let state = AppState::new(config).context("failed to build upstream clients")?;
            http_server::run_server(SocketAddr::new(host, port), state)
                .await
                .context("server error")?;
        }
        Commands::CheckConfig => {
            println!("translator endpoint: {}", config.translator.endpoint);
            println!("translator region:   {}", config.translator.region);
            println!("speech region:       {}", config.speech.region);
            println!("speech token url:    {}", config.speech.token_endpoint);
            println!("allowed origin:      {}", config.allowed_origin);
        }
    }

    Ok(())
}
