// Connection endpoints: listeners and dialers for each transport kind
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Server side of an endpoint.
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Waits for the next connection and describes the remote end.
    async fn accept(&mut self) -> io::Result<(Self::Stream, String)>;

    fn local_addr(&self) -> String;
}

/// Client side of an endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    async fn connect(&self) -> io::Result<Self::Stream>;

    fn remote_addr(&self) -> String;
}
