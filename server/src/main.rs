use clap::Parser;
use log::{error, info, warn};
use server::auth::JwtAuthenticator;
use server::config::ServerConfig;
use server::{RoomRegistry, Server, Services};
use std::sync::Arc;

/// Main-method of the server.
/// Parses the configuration, loads the space catalog and serves until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();

    let catalog = config.build_catalog()?;
    if catalog.is_empty() {
        warn!("No spaces configured; every join will fail with SPACE_NOT_FOUND");
    } else {
        info!("Serving {} space(s)", catalog.len());
    }

    let services = Services {
        registry: Arc::new(RoomRegistry::new()),
        authenticator: Arc::new(JwtAuthenticator::new(config.jwt_secret.as_bytes())),
        directory: Arc::new(catalog),
    };

    let server = Server::bind(&config.bind_address(), services, config.outbox_capacity).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
