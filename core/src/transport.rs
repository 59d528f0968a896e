//! Transport seam between a [`Bus`](crate::Bus) and the outside world.
//!
//! Outbound, the bus hands every registered envelope's frame body to
//! [`Transport::send`]. Inbound, the transport pushes frame bodies into the
//! [`InboundSink`] it was given; the bus drains the matching
//! [`InboundFrames`] and dispatches whatever the registry can decode.

use crate::lifetime::Lifetime;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

pub type InboundSink = mpsc::UnboundedSender<Bytes>;
pub type InboundFrames = mpsc::UnboundedReceiver<Bytes>;

pub fn inbound_channel() -> (InboundSink, InboundFrames) {
    mpsc::unbounded_channel()
}

/// Outbound half of a bus transport.
pub trait Transport: Send + Sync + 'static {
    /// Fire-and-forget. Implementations own any retry or buffering.
    fn send(&self, frame: Bytes);

    fn is_connected(&self) -> bool {
        true
    }

    fn describe(&self) -> String;
}

/// In-process hub joining several buses. A frame sent by one member reaches
/// every other member, never the sender.
#[derive(Clone, Default)]
pub struct ChannelHub {
    members: Arc<DashMap<u64, InboundSink>>,
    next_id: Arc<AtomicU64>,
}

impl ChannelHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the hub until `lifetime` ends.
    pub fn attach(&self, lifetime: &Lifetime) -> (ChannelTransport, InboundFrames) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = inbound_channel();
        self.members.insert(id, tx);

        let members = Arc::clone(&self.members);
        lifetime.do_on_ending(move || {
            members.remove(&id);
        });

        let transport = ChannelTransport {
            id,
            members: Arc::clone(&self.members),
        };
        (transport, rx)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

pub struct ChannelTransport {
    id: u64,
    members: Arc<DashMap<u64, InboundSink>>,
}

impl Transport for ChannelTransport {
    fn send(&self, frame: Bytes) {
        for member in self.members.iter() {
            if *member.key() == self.id {
                continue;
            }
            if member.value().send(frame.clone()).is_err() {
                trace!(target: "transport", member = *member.key(), "hub member gone");
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.members.contains_key(&self.id)
    }

    fn describe(&self) -> String {
        format!("channel-hub#{}", self.id)
    }
}
