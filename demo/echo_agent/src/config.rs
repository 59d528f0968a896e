use std::fs;
use std::path::Path;

use weft_bridge::BridgeConfig;

/// Which side of the exchange this process plays
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// Answers every `Ping` with a `Pong`
    Serve,
    /// Sends `Ping`s and reports the answers
    Ask,
}

impl Role {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serve" | "server" => Some(Role::Serve),
            "ask" | "client" => Some(Role::Ask),
            _ => None,
        }
    }
}

/// Where the bus server lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Pipe(String),
}

#[derive(Clone, Debug)]
pub struct EchoAgentConfig {
    pub role: Role,
    pub endpoint: Endpoint,
    /// Number of pings sent in the ask role
    pub pings: u32,
    pub ping_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub bridge: BridgeConfig,
}

impl Default for EchoAgentConfig {
    fn default() -> Self {
        let role = std::env::var("ECHO_ROLE")
            .ok()
            .and_then(|v| Role::parse(&v))
            .unwrap_or(Role::Ask);
        let endpoint = match std::env::var("WEFT_PIPE_NAME").ok().filter(|s| !s.is_empty()) {
            Some(name) => Endpoint::Pipe(name),
            None => Endpoint::Tcp(
                std::env::var("WEFT_BRIDGE_ADDR")
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "127.0.0.1:9050".to_string()),
            ),
        };
        Self {
            role,
            endpoint,
            pings: std::env::var("ECHO_PINGS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            ping_interval_ms: std::env::var("ECHO_PING_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1_000),
            request_timeout_ms: std::env::var("ECHO_REQUEST_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
            bridge: BridgeConfig::from_env(),
        }
    }
}

impl EchoAgentConfig {
    /// Load configuration from a TOML file (path via ECHO_AGENT_CONFIG or ./echo_agent.toml),
    /// overlaying values onto env-driven defaults.
    pub fn load() -> Self {
        let default = Self::default();
        let path = std::env::var("ECHO_AGENT_CONFIG").unwrap_or_else(|_| "echo_agent.toml".into());
        let p = Path::new(&path);
        if !p.exists() {
            tracing::info!(target: "echo_agent", path = %path, "No TOML config found; using defaults/env");
            return default;
        }
        match fs::read_to_string(p) {
            Ok(s) => match Self::overlay_toml(&s, default.clone()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(target: "echo_agent", error = %e, "Failed to parse TOML; using defaults");
                    default
                }
            },
            Err(e) => {
                tracing::warn!(target: "echo_agent", error = %e, "Failed to read TOML; using defaults");
                default
            }
        }
    }

    fn overlay_toml(text: &str, base: Self) -> Result<Self, toml::de::Error> {
        toml::from_str::<EchoAgentToml>(text).map(|t| t.overlay(base))
    }
}

// TOML overlay: every field optional, present values replace the defaults

#[derive(Debug, Clone, Default, serde::Deserialize)]
struct EchoAgentToml {
    role: Option<String>,
    tcp_addr: Option<String>,
    pipe_name: Option<String>,
    pings: Option<u32>,
    ping_interval_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    bridge: Option<BridgeConfig>,
}

impl EchoAgentToml {
    fn overlay(self, mut base: EchoAgentConfig) -> EchoAgentConfig {
        if let Some(role) = self.role.as_deref().and_then(Role::parse) {
            base.role = role;
        }
        if let Some(addr) = self.tcp_addr {
            base.endpoint = Endpoint::Tcp(addr);
        }
        if let Some(name) = self.pipe_name {
            base.endpoint = Endpoint::Pipe(name);
        }
        if let Some(v) = self.pings {
            base.pings = v;
        }
        if let Some(v) = self.ping_interval_ms {
            base.ping_interval_ms = v;
        }
        if let Some(v) = self.request_timeout_ms {
            base.request_timeout_ms = v;
        }
        if let Some(bridge) = self.bridge {
            base.bridge = bridge;
        }
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_replaces_only_given_fields() {
        let base = EchoAgentConfig {
            role: Role::Ask,
            endpoint: Endpoint::Tcp("127.0.0.1:9050".into()),
            pings: 5,
            ping_interval_ms: 1_000,
            request_timeout_ms: 2_000,
            bridge: BridgeConfig::default(),
        };
        let config = EchoAgentConfig::overlay_toml(
            r#"
            role = "serve"
            pipe_name = "echo"

            [bridge]
            reconnect_interval_ms = 500
            "#,
            base,
        )
        .unwrap();

        assert_eq!(config.role, Role::Serve);
        assert_eq!(config.endpoint, Endpoint::Pipe("echo".into()));
        assert_eq!(config.pings, 5);
        assert_eq!(config.bridge.reconnect_interval_ms, 500);
        assert_eq!(config.bridge.delivery_workers, 4);
    }

    #[test]
    fn unknown_role_keeps_default() {
        assert_eq!(Role::parse("Serve"), Some(Role::Serve));
        assert_eq!(Role::parse("listener"), None);
    }
}
