//! Envelope: a typed payload stamped with a correlation id.
//!
//! Every message on the bus travels inside an [`Envelope`]. The payload is
//! type-erased so one bus can carry any number of message types; routing is
//! keyed by the payload's [`TypeId`]. The correlation id ties a response to
//! the request that caused it.

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Anything that can ride the bus. Subscribers receive their own clone.
pub trait Message: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Message for T {}

/// 128-bit correlation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for CorrelationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Type-erased payload plus correlation id. Cloning is cheap.
#[derive(Clone)]
pub struct Envelope {
    correlation_id: CorrelationId,
    type_id: TypeId,
    type_name: &'static str,
    payload: Arc<dyn Any + Send + Sync>,
}

impl Envelope {
    /// Wraps a payload under a fresh correlation id.
    pub fn wrap<T: Message>(payload: T) -> Self {
        Self::with_correlation(payload, CorrelationId::new())
    }

    pub fn with_correlation<T: Message>(payload: T, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            payload: Arc::new(payload),
        }
    }

    // Used by the registry, which already holds the concrete value behind an Arc.
    pub(crate) fn from_parts(
        correlation_id: CorrelationId,
        type_id: TypeId,
        type_name: &'static str,
        payload: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            correlation_id,
            type_id,
            type_name,
            payload,
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn payload(&self) -> &(dyn Any + Send + Sync) {
        self.payload.as_ref()
    }

    // Identity of the payload allocation; clones of one envelope share it.
    pub(crate) fn payload_addr(&self) -> usize {
        Arc::as_ptr(&self.payload) as *const () as usize
    }

    pub fn is<T: Message>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Clones the payload out if it is a `T`.
    pub fn downcast<T: Message>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("correlation_id", &self.correlation_id)
            .field("type", &self.type_name)
            .finish()
    }
}
