//! Named local pipe endpoints.
//!
//! On Windows these are named pipes (`\\.\pipe\<name>`). On Unix the same
//! name maps to a Unix domain socket in the temp directory, unless the name
//! already looks like a path.

use crate::client::BusClient;
use crate::config::BridgeConfig;
use crate::server::{BusServer, ServerOptions};
use crate::{BridgeError, Result};
use std::sync::Arc;
use weft_core::{Lifetime, TypeRegistry};

pub use imp::{PipeAcceptor, PipeConnector};

pub type PipeBusClient = BusClient<PipeConnector>;

/// Creates the pipe and starts a relay server on it.
pub async fn server(
    lifetime: &Lifetime,
    registry: Arc<TypeRegistry>,
    name: &str,
    config: &BridgeConfig,
    options: ServerOptions,
) -> Result<BusServer> {
    // Pipe creation does not block, so the bind timeout never applies here.
    let acceptor = PipeAcceptor::bind(name).map_err(|e| BridgeError::Bind {
        endpoint: name.to_string(),
        reason: e.to_string(),
    })?;
    BusServer::start(lifetime, registry, acceptor, config, options)
}

pub async fn client(
    lifetime: &Lifetime,
    registry: Arc<TypeRegistry>,
    name: &str,
    config: &BridgeConfig,
) -> Result<PipeBusClient> {
    BusClient::connect(lifetime, registry, PipeConnector::new(name), config).await
}

#[cfg(unix)]
mod imp {
    use crate::endpoint::{Acceptor, Connector};
    use async_trait::async_trait;
    use std::io;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    fn socket_path(name: &str) -> PathBuf {
        if name.contains('/') {
            PathBuf::from(name)
        } else {
            std::env::temp_dir().join(format!("{}.sock", name))
        }
    }

    pub struct PipeAcceptor {
        listener: UnixListener,
        path: PathBuf,
    }

    impl PipeAcceptor {
        /// Must run inside a Tokio runtime context.
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = socket_path(name);
            // A file nobody answers on is left over from a previous run.
            match std::os::unix::net::UnixStream::connect(&path) {
                Ok(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{} is served by another listener", path.display()),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(_) => std::fs::remove_file(&path)?,
            }
            let listener = UnixListener::bind(&path)?;
            Ok(Self { listener, path })
        }
    }

    impl Drop for PipeAcceptor {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        type Stream = UnixStream;

        async fn accept(&mut self) -> io::Result<(UnixStream, String)> {
            let (stream, _) = self.listener.accept().await?;
            Ok((stream, self.path.display().to_string()))
        }

        fn local_addr(&self) -> String {
            self.path.display().to_string()
        }
    }

    #[derive(Debug, Clone)]
    pub struct PipeConnector {
        path: PathBuf,
    }

    impl PipeConnector {
        pub fn new(name: &str) -> Self {
            Self {
                path: socket_path(name),
            }
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Stream = UnixStream;

        async fn connect(&self) -> io::Result<UnixStream> {
            UnixStream::connect(&self.path).await
        }

        fn remote_addr(&self) -> String {
            self.path.display().to_string()
        }
    }
}

#[cfg(windows)]
mod imp {
    use crate::endpoint::{Acceptor, Connector};
    use async_trait::async_trait;
    use std::io;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{
        ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
    };

    const ERROR_PIPE_BUSY: i32 = 231;

    fn pipe_path(name: &str) -> String {
        if name.starts_with(r"\\.\pipe\") {
            name.to_string()
        } else {
            format!(r"\\.\pipe\{}", name)
        }
    }

    pub struct PipeAcceptor {
        path: String,
        next: NamedPipeServer,
    }

    impl PipeAcceptor {
        /// Must run inside a Tokio runtime context.
        pub fn bind(name: &str) -> io::Result<Self> {
            let path = pipe_path(name);
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&path)?;
            Ok(Self { path, next })
        }
    }

    #[async_trait]
    impl Acceptor for PipeAcceptor {
        type Stream = NamedPipeServer;

        async fn accept(&mut self) -> io::Result<(NamedPipeServer, String)> {
            self.next.connect().await?;
            // Each client gets its own instance; open the next one before handing this out.
            let fresh = ServerOptions::new().create(&self.path)?;
            let connected = std::mem::replace(&mut self.next, fresh);
            Ok((connected, self.path.clone()))
        }

        fn local_addr(&self) -> String {
            self.path.clone()
        }
    }

    #[derive(Debug, Clone)]
    pub struct PipeConnector {
        path: String,
    }

    impl PipeConnector {
        pub fn new(name: &str) -> Self {
            Self {
                path: pipe_path(name),
            }
        }
    }

    #[async_trait]
    impl Connector for PipeConnector {
        type Stream = NamedPipeClient;

        async fn connect(&self) -> io::Result<NamedPipeClient> {
            loop {
                match ClientOptions::new().open(&self.path) {
                    Ok(client) => return Ok(client),
                    Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        fn remote_addr(&self) -> String {
            self.path.clone()
        }
    }
}
