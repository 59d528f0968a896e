//! Weft Bridge: carries a bus across process boundaries.
//!
//! A [`BusServer`] accepts connections and relays every frame it receives to
//! all other connected peers. A [`BusClient`] keeps one connection to a
//! server alive and exposes a [`Bus`](weft_core::Bus) whose registered
//! types travel over it. Frames are length-delimited [`WireFrame`] bodies.
//!
//! [`WireFrame`]: weft_core::WireFrame

pub mod client;
pub mod config;
pub mod endpoint;
pub mod framing;
pub mod peer;
pub mod pipe;
pub mod server;
pub mod session;
pub mod tcp;

pub use client::{BusClient, ConnectionState};
pub use config::BridgeConfig;
pub use endpoint::{Acceptor, Connector};
pub use peer::{PeerId, PeerSet};
pub use server::{BusServer, ServerOptions};

use std::time::Duration;
use weft_core::WeftError;

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error("failed to bind {endpoint}: {reason}")]
    Bind { endpoint: String, reason: String },

    #[error("bind of {0} did not complete within {1:?}")]
    BindTimeout(String, Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Core(#[from] WeftError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
