// TCP endpoints and convenience constructors
use crate::client::BusClient;
use crate::config::BridgeConfig;
use crate::endpoint::{Acceptor, Connector};
use crate::server::{BusServer, ServerOptions};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use weft_core::{Lifetime, TypeRegistry};

pub type TcpBusClient = BusClient<TcpConnector>;

pub struct TcpAcceptor {
    listener: TcpListener,
    local_addr: String,
}

impl TcpAcceptor {
    pub async fn bind(addr: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?.to_string();
        Ok(Self {
            listener,
            local_addr,
        })
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    type Stream = TcpStream;

    async fn accept(&mut self) -> io::Result<(TcpStream, String)> {
        let (stream, remote) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, remote.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> io::Result<TcpStream> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn remote_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Binds `addr` and starts a relay server. Use port 0 for an ephemeral port;
/// the chosen address is available from [`BusServer::local_addr`].
pub async fn server(
    lifetime: &Lifetime,
    registry: Arc<TypeRegistry>,
    addr: &str,
    config: &BridgeConfig,
    options: ServerOptions,
) -> Result<BusServer> {
    let acceptor = tokio::time::timeout(config.bind_timeout(), TcpAcceptor::bind(addr))
        .await
        .map_err(|_| BridgeError::BindTimeout(addr.to_string(), config.bind_timeout()))?
        .map_err(|e| BridgeError::Bind {
            endpoint: addr.to_string(),
            reason: e.to_string(),
        })?;
    BusServer::start(lifetime, registry, acceptor, config, options)
}

pub async fn client(
    lifetime: &Lifetime,
    registry: Arc<TypeRegistry>,
    addr: &str,
    config: &BridgeConfig,
) -> Result<TcpBusClient> {
    BusClient::connect(lifetime, registry, TcpConnector::new(addr), config).await
}
