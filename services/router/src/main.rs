//! rackgate router
//!
//! Per-host data plane in front of rack workloads.
//!
//! This service:
//! - Loads endpoints and their proxies from a JSON file
//! - Terminates TLS with certificates from a local authority
//! - Forwards HTTP, WebSocket and raw TCP traffic
//! - Resolves rack-backed targets to a random live process per connection

use std::sync::Arc;

use anyhow::{Context, Result};
use rackgate_rack::LocalRack;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use rackgate_router::config::{Config, EndpointsFile};
use rackgate_router::{LocalAuthority, Router};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to ROUTER_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting rackgate router");
    info!(
        endpoints_file = %config.endpoints_file.display(),
        rack_file = ?config.rack_file,
        max_connections = config.max_connections,
        connect_timeout_ms = config.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let rack = match &config.rack_file {
        Some(path) => LocalRack::from_file(path)
            .with_context(|| format!("Failed to load rack description {}", path.display()))?,
        None => LocalRack::new(),
    };

    let authority = LocalAuthority::generate("rackgate local authority")
        .context("Failed to create certificate authority")?;

    let router = Router::new(Arc::new(rack), Arc::new(authority), config.proxy_settings());

    let endpoints = EndpointsFile::load(&config.endpoints_file)?;
    for endpoint_config in endpoints.endpoints {
        let endpoint = router.create_endpoint(&endpoint_config.host)?;
        for proxy in endpoint_config.proxies {
            endpoint
                .create_proxy(proxy.listen, proxy.target)
                .with_context(|| format!("Invalid proxy for {}", endpoint_config.host))?;
        }
    }

    tokio::select! {
        result = router.serve() => {
            if let Err(e) = &result {
                error!(error = %e, "Router stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
