use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

use weft_bridge::{pipe, tcp, BridgeConfig, ServerOptions};
use weft_core::{Lifetime, TypeRegistry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    fmt()
        .compact()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BridgeConfig::load();
    let lifetime = Lifetime::new();

    // A pure relay never decodes payloads, so it needs no registered types.
    let registry = Arc::new(TypeRegistry::empty());

    let addr = std::env::var("WEFT_BRIDGE_ADDR").unwrap_or_else(|_| "127.0.0.1:9050".into());
    let tcp_server = tcp::server(
        &lifetime,
        Arc::clone(&registry),
        &addr,
        &config,
        ServerOptions::relay(),
    )
    .await?;
    tracing::info!("Relaying on {}", tcp_server.local_addr());

    let pipe_server = match std::env::var("WEFT_PIPE_NAME") {
        Ok(name) => {
            let server =
                pipe::server(&lifetime, registry, &name, &config, ServerOptions::relay()).await?;
            tracing::info!("Relaying on pipe {}", server.local_addr());
            Some(server)
        }
        Err(_) => None,
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!(
        "Shutting down ({} tcp peers, {} pipe peers)",
        tcp_server.peer_count(),
        pipe_server.as_ref().map_or(0, |s| s.peer_count())
    );
    lifetime.end().await;
    Ok(())
}
