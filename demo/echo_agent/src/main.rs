mod config;
use config::{EchoAgentConfig, Endpoint, Role};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use weft_bridge::{pipe, tcp};
use weft_core::{Bus, Lifetime, TypeRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping {
    seq: u32,
    text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Pong {
    seq: u32,
    text: String,
    served_by: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    weft_core::telemetry::init_tracing("info,weft_core=info,weft_bridge=info,echo_agent=info");

    let cfg = EchoAgentConfig::load();
    info!(target: "echo_agent", role = ?cfg.role, endpoint = ?cfg.endpoint, "Starting echo agent");

    // Both roles must agree on these slugs.
    let registry = Arc::new(
        TypeRegistry::builder()
            .register::<Ping>("echo.ping")
            .register::<Pong>("echo.pong")
            .build()?,
    );

    let lifetime = Lifetime::new();
    let bus = match &cfg.endpoint {
        Endpoint::Tcp(addr) => {
            let client = tcp::client(&lifetime, registry, addr, &cfg.bridge).await?;
            client.bus().clone()
        }
        Endpoint::Pipe(name) => {
            let client = pipe::client(&lifetime, registry, name, &cfg.bridge).await?;
            client.bus().clone()
        }
    };

    match cfg.role {
        Role::Serve => serve(&bus).await?,
        Role::Ask => ask(&bus, &cfg).await?,
    }

    info!(target: "echo_agent", stats = ?bus.stats(), "Shutting down");
    lifetime.end().await;
    Ok(())
}

async fn serve(bus: &Bus) -> Result<(), Box<dyn std::error::Error>> {
    let pid = std::process::id();
    let _registration = bus.register_handler_sync(move |ping: Ping| {
        info!(target: "echo_agent", seq = ping.seq, "Answering ping");
        Pong {
            seq: ping.seq,
            text: ping.text.to_uppercase(),
            served_by: pid,
        }
    })?;
    info!(target: "echo_agent", "Serving pings; Ctrl+C to stop");
    signal::ctrl_c().await?;
    Ok(())
}

async fn ask(bus: &Bus, cfg: &EchoAgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let timeout = Duration::from_millis(cfg.request_timeout_ms);
    let interval = Duration::from_millis(cfg.ping_interval_ms);
    for seq in 1..=cfg.pings {
        let ping = Ping {
            seq,
            text: format!("hello #{}", seq),
        };
        let pong: Option<Pong> = bus.request(ping, timeout, &bus.lifetime().token()).await?;
        match pong {
            Some(pong) => info!(
                target: "echo_agent",
                seq = pong.seq,
                served_by = pong.served_by,
                "Got answer: {}",
                pong.text
            ),
            None => warn!(target: "echo_agent", seq, ?timeout, "No answer"),
        }
        tokio::time::sleep(interval).await;
    }
    Ok(())
}
