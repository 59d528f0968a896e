// Weft Core Library
// Typed in-process message bus runtime

pub mod bus;
pub mod envelope;
pub mod lifetime;
pub mod registry;
pub mod telemetry;
pub mod transport;
pub mod wire;
pub mod workers;

mod panic;

// Export core types
pub use bus::{Bus, BusStats, HandlerRegistration, Subscription};
pub use envelope::{CorrelationId, Envelope, Message};
pub use lifetime::{Disposable, Lifetime, LifetimeState};
pub use registry::{Codec, JsonCodec, TypeRegistry, TypeRegistryBuilder};
pub use transport::{ChannelHub, ChannelTransport, InboundFrames, InboundSink, Transport};
pub use wire::{WireError, WireFrame};
pub use workers::{
    JobContext, JobError, JobEvent, JobFailure, JobOutcome, PenaltyInfo, RetryPolicy, TeamLayout,
    TeamState, WorkerTeam,
};

use std::time::Duration;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WeftError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("No Tokio runtime available for {0}")]
    NoRuntime(&'static str),

    #[error("Blocking call made from inside an async context: {0}")]
    BlockingInAsync(&'static str),

    #[error("Wire format error: {0}")]
    WireError(#[from] WireError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, WeftError>;
