use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};

use shoal::proxy::ProxyServer;
use shoal::{App, Config, ConfigManager};

#[derive(Parser)]
#[command(name = "shoal")]
#[command(about = "A layer-7 HTTP load balancer with dynamic backend registration")]
struct Args {
    #[arg(short, long, default_value = "config/config.toml")]
    config: String,

    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_manager = Arc::new(ConfigManager::from_file(&args.config).await?);
    let config = config_manager.current();
    init_tracing(&config, args.verbose);

    info!("Starting shoal load balancer");

    let app = App::new(Arc::clone(&config))?;
    app.start()?;
    Arc::clone(&config_manager).watch(app.shutdown_receiver())?;
    app.seed_configured_backends().await;

    let bind = args
        .bind
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], config.server.port)));
    let server = ProxyServer::new(app.pipeline(), bind);

    let shutdown_signal = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        warn!("Received CTRL+C, shutting down gracefully...");
    };

    tokio::select! {
        result = server.run(app.shutdown_receiver(), None) => {
            if let Err(e) = result {
                tracing::error!("Proxy server error: {}", e);
            }
        }
        _ = shutdown_signal => {
            info!("Shutdown signal received");
        }
    }

    app.stop().await;

    info!("Shoal exited gracefully");
    Ok(())
}

fn init_tracing(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    let filter = format!("shoal={},hyper=warn", level);

    if config.log.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
