//! Type registry: stable slugs for the message types that may cross a process
//! boundary, plus the codec that turns their payloads into bytes.
//!
//! Encoding and decoding are fail-open. A type that is not registered, or a
//! frame that cannot be decoded, yields `None` and the caller drops it.

use crate::envelope::{CorrelationId, Envelope, Message};
use crate::wire::WireFrame;
use crate::{Result, WeftError};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Payload serialization used by a [`TypeRegistry`].
pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// JSON payloads via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

type EncodeFn = Box<dyn Fn(&(dyn Any + Send + Sync)) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>> + Send + Sync>;

struct Entry {
    slug: String,
    type_id: TypeId,
    type_name: &'static str,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Immutable slug <-> type table. Build once with [`TypeRegistry::builder`].
pub struct TypeRegistry {
    by_type: HashMap<TypeId, Arc<Entry>>,
    by_slug: HashMap<String, Arc<Entry>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder<JsonCodec> {
        Self::builder_with(JsonCodec)
    }

    pub fn builder_with<C: Codec>(codec: C) -> TypeRegistryBuilder<C> {
        TypeRegistryBuilder {
            codec: Arc::new(codec),
            entries: Vec::new(),
        }
    }

    /// A registry with no network types. Everything stays local.
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            by_slug: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    pub fn contains<T: Message>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    pub fn slug_of<T: Message>(&self) -> Option<&str> {
        self.slug_for(TypeId::of::<T>())
    }

    pub fn slug_for(&self, type_id: TypeId) -> Option<&str> {
        self.by_type.get(&type_id).map(|e| e.slug.as_str())
    }

    pub fn slugs(&self) -> impl Iterator<Item = &str> {
        self.by_slug.keys().map(String::as_str)
    }

    /// Frames an envelope for the wire, or `None` if its type is not registered.
    pub fn encode(&self, envelope: &Envelope) -> Option<Bytes> {
        let entry = self.by_type.get(&envelope.type_id())?;
        let payload = match (entry.encode)(envelope.payload()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(target: "registry", slug = %entry.slug, "failed to encode payload: {}", e);
                return None;
            }
        };

        let frame = WireFrame {
            correlation_id: envelope.correlation_id().to_string(),
            type_slug: entry.slug.clone(),
            payload: Bytes::from(payload),
        };
        match frame.encode() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(target: "registry", slug = %entry.slug, "failed to frame payload: {}", e);
                None
            }
        }
    }

    /// Rebuilds an envelope from a frame body. Empty, malformed or unknown
    /// frames yield `None`.
    pub fn decode(&self, data: &[u8]) -> Option<Envelope> {
        if data.is_empty() {
            trace!(target: "registry", "dropping empty frame");
            return None;
        }

        let frame = match WireFrame::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "registry", "dropping malformed frame: {}", e);
                return None;
            }
        };

        let Some(entry) = self.by_slug.get(&frame.type_slug) else {
            debug!(target: "registry", slug = %frame.type_slug, "dropping frame of unknown type");
            return None;
        };

        let correlation_id = match frame.correlation_id.parse::<CorrelationId>() {
            Ok(id) => id,
            Err(e) => {
                debug!(target: "registry", slug = %entry.slug, "dropping frame with bad correlation id: {}", e);
                return None;
            }
        };

        match (entry.decode)(&frame.payload) {
            Ok(payload) => Some(Envelope::from_parts(
                correlation_id,
                entry.type_id,
                entry.type_name,
                payload,
            )),
            Err(e) => {
                debug!(target: "registry", slug = %entry.slug, "dropping undecodable payload: {}", e);
                None
            }
        }
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut slugs: Vec<&str> = self.slugs().collect();
        slugs.sort_unstable();
        f.debug_struct("TypeRegistry").field("slugs", &slugs).finish()
    }
}

pub struct TypeRegistryBuilder<C: Codec = JsonCodec> {
    codec: Arc<C>,
    entries: Vec<Entry>,
}

impl<C: Codec> TypeRegistryBuilder<C> {
    /// Registers `T` under `slug`. Both ends of a connection must agree on the slug.
    pub fn register<T>(mut self, slug: impl Into<String>) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let encode_codec = Arc::clone(&self.codec);
        let decode_codec = Arc::clone(&self.codec);

        self.entries.push(Entry {
            slug: slug.into(),
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            encode: Box::new(move |payload: &(dyn Any + Send + Sync)| match payload.downcast_ref::<T>() {
                Some(value) => encode_codec.encode(value),
                None => Err(WeftError::CodecError(format!(
                    "payload is not a {}",
                    type_name::<T>()
                ))),
            }),
            decode: Box::new(move |bytes: &[u8]| {
                let value: T = decode_codec.decode(bytes)?;
                Ok(Arc::new(value) as Arc<dyn Any + Send + Sync>)
            }),
        });
        self
    }

    pub fn build(self) -> Result<TypeRegistry> {
        let mut by_type: HashMap<TypeId, Arc<Entry>> = HashMap::new();
        let mut by_slug: HashMap<String, Arc<Entry>> = HashMap::new();

        for entry in self.entries {
            if entry.slug.is_empty() || entry.slug.len() > u16::MAX as usize {
                return Err(WeftError::RegistryError(format!(
                    "invalid slug length {} for {}",
                    entry.slug.len(),
                    entry.type_name
                )));
            }
            if by_slug.contains_key(&entry.slug) {
                return Err(WeftError::RegistryError(format!(
                    "slug '{}' registered twice",
                    entry.slug
                )));
            }
            if let Some(existing) = by_type.get(&entry.type_id) {
                return Err(WeftError::RegistryError(format!(
                    "{} already registered as '{}'",
                    entry.type_name, existing.slug
                )));
            }

            let entry = Arc::new(entry);
            by_slug.insert(entry.slug.clone(), Arc::clone(&entry));
            by_type.insert(entry.type_id, entry);
        }

        debug!(target: "registry", types = by_type.len(), "type registry built");
        Ok(TypeRegistry { by_type, by_slug })
    }
}
