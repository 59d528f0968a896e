//! Typed publish/subscribe bus with correlated request/response.
//!
//! Messages are routed by payload type. Every published envelope is offered
//! to pending requests (matched by correlation id and expected response
//! type), remembered as the last value of its type, then fanned out to all
//! live subscribers of that type in publish order.
//!
//! A bus built with a [`Transport`] also sends every envelope whose type is
//! in its [`TypeRegistry`] to the transport, and dispatches decodable
//! inbound frames locally. Inbound envelopes are never sent back out.

use crate::envelope::{CorrelationId, Envelope, Message};
use crate::lifetime::Lifetime;
use crate::panic::catch_async;
use crate::registry::TypeRegistry;
use crate::transport::{ChannelHub, InboundFrames, Transport};
use crate::{Result, WeftError};
use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::any::{type_name, TypeId};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Bus statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BusStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub received_remote: u64,
    pub dropped_remote: u64,
    pub requests_timed_out: u64,
    pub active_subscriptions: usize,
    pub pending_requests: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    received_remote: AtomicU64,
    dropped_remote: AtomicU64,
    timed_out: AtomicU64,
}

struct PendingRequest {
    expected: TypeId,
    // Payload address of the request itself, so a request whose type equals
    // the response type is not answered by its own publication.
    origin: usize,
    reply: oneshot::Sender<Envelope>,
}

struct BusInner {
    lifetime: Lifetime,
    registry: Arc<TypeRegistry>,
    transport: Option<Arc<dyn Transport>>,

    // Payload type -> subscriber list
    subscriptions: DashMap<TypeId, Vec<mpsc::UnboundedSender<Envelope>>>,

    // Payload type -> most recent envelope
    last_values: DashMap<TypeId, Envelope>,

    pending: DashMap<CorrelationId, PendingRequest>,
    counters: Counters,
    runtime: Option<Handle>,
}

/// Bus handle. Clones share the same bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Process-local bus. Nothing leaves this process.
    pub fn new(lifetime: &Lifetime) -> Self {
        Self::build(lifetime, Arc::new(TypeRegistry::empty()), None)
    }

    /// Networked bus. Must be called from within a Tokio runtime.
    pub fn with_transport(
        lifetime: &Lifetime,
        registry: Arc<TypeRegistry>,
        transport: Arc<dyn Transport>,
        inbound: InboundFrames,
    ) -> Result<Self> {
        let bus = Self::build(lifetime, registry, Some(transport));
        bus.spawn_inbound(inbound)?;
        Ok(bus)
    }

    /// Joins an in-process [`ChannelHub`] until `lifetime` ends.
    pub fn on_hub(
        lifetime: &Lifetime,
        registry: Arc<TypeRegistry>,
        hub: &ChannelHub,
    ) -> Result<Self> {
        let (transport, inbound) = hub.attach(lifetime);
        Self::with_transport(lifetime, registry, Arc::new(transport), inbound)
    }

    fn build(
        lifetime: &Lifetime,
        registry: Arc<TypeRegistry>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Self {
        let description = transport
            .as_ref()
            .map(|t| t.describe())
            .unwrap_or_else(|| "local".to_string());

        let inner = Arc::new(BusInner {
            lifetime: lifetime.clone(),
            registry,
            transport,
            subscriptions: DashMap::new(),
            last_values: DashMap::new(),
            pending: DashMap::new(),
            counters: Counters::default(),
            runtime: Handle::try_current().ok(),
        });

        let weak = Arc::downgrade(&inner);
        lifetime.do_on_ending(move || {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        });

        info!(target: "bus", transport = %description, "Bus started");
        Self { inner }
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.inner.lifetime
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.inner.registry
    }

    /// False while a networked transport is disconnected.
    pub fn is_connected(&self) -> bool {
        self.inner
            .transport
            .as_ref()
            .map_or(true, |t| t.is_connected())
    }

    /// Publishes under a fresh correlation id and returns it.
    pub fn publish<T: Message>(&self, payload: T) -> CorrelationId {
        self.publish_correlated(payload, CorrelationId::new())
    }

    /// Publishes under a caller-chosen correlation id, e.g. to answer a request.
    pub fn publish_correlated<T: Message>(
        &self,
        payload: T,
        correlation_id: CorrelationId,
    ) -> CorrelationId {
        self.post(Envelope::with_correlation(payload, correlation_id));
        correlation_id
    }

    /// Publishes a ready-made envelope. Dropped once the bus is ending.
    pub fn post(&self, envelope: Envelope) {
        if self.inner.lifetime.is_ending() {
            trace!(target: "bus", message = envelope.type_name(), "bus ending, dropping publish");
            return;
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.dispatch(&envelope);

        if let Some(transport) = &self.inner.transport {
            if let Some(frame) = self.inner.registry.encode(&envelope) {
                transport.send(frame);
            }
        }
    }

    /// Subscribes to every future message of type `T`. With
    /// `include_last_value` the most recent `T`, if any, is delivered first.
    pub fn subscribe<T: Message>(&self, include_last_value: bool) -> Subscription<T> {
        let type_id = TypeId::of::<T>();
        let (sender, receiver) = mpsc::unbounded_channel();

        if !self.inner.lifetime.is_ending() {
            self.inner
                .subscriptions
                .entry(type_id)
                .or_default()
                .push(sender);
            // Lost a race with close(); drop the list so the receiver ends.
            if self.inner.lifetime.is_ending() {
                self.inner.subscriptions.remove(&type_id);
            }
            trace!(target: "bus", message = type_name::<T>(), "subscribed");
        }

        // Registered before the snapshot so nothing published in between is missed.
        let replay = if include_last_value {
            self.inner.last_values.get(&type_id).map(|e| e.value().clone())
        } else {
            None
        };
        Subscription::new(receiver, replay)
    }

    /// Last published value of type `T`, if any.
    pub fn last_value<T: Message>(&self) -> Option<T> {
        self.inner
            .last_values
            .get(&TypeId::of::<T>())
            .and_then(|e| e.value().downcast::<T>())
    }

    /// Publishes `request` and waits for the first `Res` carrying the same
    /// correlation id. `Ok(None)` on timeout, `Err(Cancelled)` when `cancel`
    /// fires, `Err(Closed)` when the bus ends first.
    pub async fn request<Req, Res>(
        &self,
        request: Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Res>>
    where
        Req: Message,
        Res: Message,
    {
        if self.inner.lifetime.is_ending() {
            return Err(WeftError::Closed("bus"));
        }

        let envelope = Envelope::wrap(request);
        let correlation_id = envelope.correlation_id();
        let (reply, response) = oneshot::channel();
        self.inner.pending.insert(
            correlation_id,
            PendingRequest {
                expected: TypeId::of::<Res>(),
                origin: envelope.payload_addr(),
                reply,
            },
        );
        let _pending = PendingGuard {
            inner: &self.inner,
            correlation_id,
        };
        self.post(envelope);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WeftError::Cancelled),
            response = response => match response {
                Ok(envelope) => Ok(envelope.downcast::<Res>()),
                Err(_) => Err(WeftError::Closed("bus")),
            },
            _ = tokio::time::sleep(timeout) => {
                self.inner.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "bus",
                    %correlation_id,
                    request = type_name::<Req>(),
                    ?timeout,
                    "request timed out"
                );
                Ok(None)
            }
        }
    }

    /// [`Bus::request`] that substitutes `Res::default()` for a timeout.
    pub async fn request_or_default<Req, Res>(&self, request: Req, timeout: Duration) -> Result<Res>
    where
        Req: Message,
        Res: Message + Default,
    {
        let response = self
            .request::<Req, Res>(request, timeout, &CancellationToken::new())
            .await?;
        Ok(response.unwrap_or_default())
    }

    /// [`Bus::request`] that turns a timeout into `Err(Timeout)`.
    pub async fn request_or_timeout<Req, Res>(&self, request: Req, timeout: Duration) -> Result<Res>
    where
        Req: Message,
        Res: Message,
    {
        self.request::<Req, Res>(request, timeout, &CancellationToken::new())
            .await?
            .ok_or(WeftError::Timeout(timeout))
    }

    /// Blocking [`Bus::request`] for threads outside the runtime.
    pub fn request_blocking<Req, Res>(&self, request: Req, timeout: Duration) -> Result<Option<Res>>
    where
        Req: Message,
        Res: Message,
    {
        if Handle::try_current().is_ok() {
            return Err(WeftError::BlockingInAsync("Bus::request_blocking"));
        }
        let handle = self
            .inner
            .runtime
            .clone()
            .ok_or(WeftError::NoRuntime("Bus::request_blocking"))?;
        handle.block_on(self.request::<Req, Res>(request, timeout, &CancellationToken::new()))
    }

    /// Answers every `Req` with the handler's `Res` under the request's
    /// correlation id. Requests are handled one at a time in arrival order.
    /// The handler stops when the registration is unregistered or the bus ends.
    pub fn register_handler<Req, Res, F, Fut>(&self, handler: F) -> Result<HandlerRegistration>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res> + Send + 'static,
    {
        let lifetime = self.inner.lifetime.child().ok_or(WeftError::Closed("bus"))?;
        self.serve(&lifetime, handler)?;
        Ok(HandlerRegistration { lifetime })
    }

    pub fn register_handler_sync<Req, Res, F>(&self, handler: F) -> Result<HandlerRegistration>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Res + Send + Sync + 'static,
    {
        self.register_handler(move |request: Req| futures::future::ready(handler(request)))
    }

    /// Like [`Bus::register_handler`], bound to `lifetime` instead of a registration.
    pub fn register_handler_in<Req, Res, F, Fut>(&self, lifetime: &Lifetime, handler: F) -> Result<()>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res> + Send + 'static,
    {
        if lifetime.is_ending() {
            return Err(WeftError::Closed("lifetime"));
        }
        self.serve(lifetime, handler)
    }

    pub fn register_handler_sync_in<Req, Res, F>(&self, lifetime: &Lifetime, handler: F) -> Result<()>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Res + Send + Sync + 'static,
    {
        self.register_handler_in(lifetime, move |request: Req| {
            futures::future::ready(handler(request))
        })
    }

    pub fn stats(&self) -> BusStats {
        let counters = &self.inner.counters;
        BusStats {
            total_published: counters.published.load(Ordering::Relaxed),
            total_delivered: counters.delivered.load(Ordering::Relaxed),
            received_remote: counters.received_remote.load(Ordering::Relaxed),
            dropped_remote: counters.dropped_remote.load(Ordering::Relaxed),
            requests_timed_out: counters.timed_out.load(Ordering::Relaxed),
            active_subscriptions: self
                .inner
                .subscriptions
                .iter()
                .map(|entry| entry.value().iter().filter(|s| !s.is_closed()).count())
                .sum(),
            pending_requests: self.inner.pending.len(),
        }
    }

    fn serve<Req, Res, F, Fut>(&self, lifetime: &Lifetime, handler: F) -> Result<()>
    where
        Req: Message,
        Res: Message,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Res> + Send + 'static,
    {
        let mut requests = self.subscribe::<Req>(false);
        let bus = self.clone();
        let token = lifetime.token();

        self.spawn(async move {
            loop {
                let envelope = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    next = requests.recv_envelope() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let Some(request) = envelope.downcast::<Req>() else {
                    continue;
                };
                let correlation_id = envelope.correlation_id();

                match catch_async(|| handler(request)).await {
                    Ok(response) => {
                        bus.publish_correlated(response, correlation_id);
                    }
                    Err(msg) => error!(
                        target: "bus",
                        %correlation_id,
                        request = type_name::<Req>(),
                        "request handler panicked: {}",
                        msg
                    ),
                }
            }
            debug!(target: "bus", request = type_name::<Req>(), "request handler stopped");
        })?;
        Ok(())
    }

    fn spawn_inbound(&self, mut inbound: InboundFrames) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.lifetime.token();

        self.spawn(async move {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                match weak.upgrade() {
                    Some(inner) => inner.receive(&frame),
                    None => break,
                }
            }
            trace!(target: "bus", "inbound pump stopped");
        })?;
        Ok(())
    }

    fn spawn<F>(&self, task: F) -> Result<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current()
            .ok()
            .or_else(|| self.inner.runtime.clone())
        {
            Some(handle) => Ok(handle.spawn(task)),
            None => Err(WeftError::NoRuntime("bus task")),
        }
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus")
            .field("lifetime", &self.inner.lifetime)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

impl BusInner {
    fn dispatch(&self, envelope: &Envelope) {
        let type_id = envelope.type_id();

        if let Some((_, pending)) = self.pending.remove_if(&envelope.correlation_id(), |_, p| {
            p.expected == type_id && p.origin != envelope.payload_addr()
        }) {
            let _ = pending.reply.send(envelope.clone());
        }

        self.last_values.insert(type_id, envelope.clone());

        if let Some(mut subscribers) = self.subscriptions.get_mut(&type_id) {
            subscribers.retain(|s| s.send(envelope.clone()).is_ok());
            self.counters
                .delivered
                .fetch_add(subscribers.len() as u64, Ordering::Relaxed);
        }
    }

    fn receive(&self, frame: &[u8]) {
        match self.registry.decode(frame) {
            Some(envelope) => {
                self.counters.received_remote.fetch_add(1, Ordering::Relaxed);
                self.dispatch(&envelope);
            }
            None => {
                self.counters.dropped_remote.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn close(&self) {
        self.subscriptions.clear();
        self.pending.clear();
        self.last_values.clear();
        info!(target: "bus", "Bus closed");
    }
}

struct PendingGuard<'a> {
    inner: &'a BusInner,
    correlation_id: CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.remove(&self.correlation_id);
    }
}

/// Stream of `T` values from a [`Bus`]. Dropping it unsubscribes.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<Envelope>,
    replay: Option<Envelope>,
    replayed: Option<CorrelationId>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Message> Subscription<T> {
    fn new(receiver: mpsc::UnboundedReceiver<Envelope>, replay: Option<Envelope>) -> Self {
        let replayed = replay.as_ref().map(Envelope::correlation_id);
        Self {
            receiver,
            replay,
            replayed,
            _marker: PhantomData,
        }
    }

    /// Next value, or `None` once the bus has ended.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let envelope = self.recv_envelope().await?;
            if let Some(value) = envelope.downcast::<T>() {
                return Some(value);
            }
        }
    }

    /// Next envelope, correlation id included.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        if let Some(envelope) = self.replay.take() {
            return Some(envelope);
        }
        loop {
            let envelope = self.receiver.recv().await?;
            if !self.is_replayed(&envelope) {
                return Some(envelope);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        if let Some(envelope) = self.replay.take() {
            return envelope.downcast::<T>();
        }
        while let Ok(envelope) = self.receiver.try_recv() {
            if !self.is_replayed(&envelope) {
                return envelope.downcast::<T>();
            }
        }
        None
    }

    // The replayed value can also arrive through the channel when it was
    // published between registration and the snapshot.
    fn is_replayed(&mut self, envelope: &Envelope) -> bool {
        matches!(self.replayed.take(), Some(id) if id == envelope.correlation_id())
    }
}

impl<T: Message> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(envelope) = this.replay.take() {
            if let Some(value) = envelope.downcast::<T>() {
                return Poll::Ready(Some(value));
            }
        }
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(envelope)) => {
                    if this.is_replayed(&envelope) {
                        continue;
                    }
                    if let Some(value) = envelope.downcast::<T>() {
                        return Poll::Ready(Some(value));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Keeps a request handler registered. Dropping it leaves the handler
/// running until the bus ends; call [`HandlerRegistration::unregister`] to stop it.
#[must_use]
pub struct HandlerRegistration {
    lifetime: Lifetime,
}

impl HandlerRegistration {
    pub fn is_active(&self) -> bool {
        !self.lifetime.is_ending()
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub async fn unregister(self) {
        self.lifetime.end().await;
    }
}
