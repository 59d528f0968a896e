//! Reconnecting bus client.
//!
//! A [`BusClient`] keeps at most one session to its server. While
//! disconnected a background timer retries every `reconnect_interval`. A
//! publish made while disconnected first tries to reconnect; if that fails
//! the frame goes to the delivery team, which keeps retrying under the
//! configured [`RetryPolicy`](weft_core::RetryPolicy).

use crate::config::BridgeConfig;
use crate::endpoint::Connector;
use crate::peer::PeerId;
use crate::session::{FrameHandler, Session};
use crate::{BridgeError, Result};
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};
use weft_core::transport::{inbound_channel, InboundSink};
use weft_core::{
    Bus, JobContext, JobError, JobFailure, Lifetime, TeamLayout, TeamState, Transport,
    TypeRegistry, WeftError, WorkerTeam,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

pub struct BusClient<C: Connector> {
    link: Arc<Link<C>>,
    bus: Bus,
}

impl<C: Connector> BusClient<C> {
    /// Builds the client bus under a child of `lifetime` and makes a first
    /// connection attempt. An unreachable server is not an error; the
    /// client keeps retrying in the background.
    pub async fn connect(
        lifetime: &Lifetime,
        registry: Arc<TypeRegistry>,
        connector: C,
        config: &BridgeConfig,
    ) -> Result<Self> {
        config.validate()?;
        let lifetime = lifetime
            .child()
            .ok_or(BridgeError::Core(WeftError::Closed("lifetime")))?;

        let (inbound_sink, inbound) = inbound_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let link = Arc::new_cyclic(|me| Link {
            me: me.clone(),
            connector,
            lifetime: lifetime.clone(),
            config: config.clone(),
            inbound: inbound_sink,
            session: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            state,
            delivery: OnceLock::new(),
            runtime: Handle::current(),
        });

        let delivery = start_delivery(&link, &lifetime, config)?;
        let _ = link.delivery.set(delivery);

        let transport: Arc<dyn Transport> = link.clone();
        let bus = Bus::with_transport(&lifetime, registry, transport, inbound)?;

        if let Err(e) = link.ensure_connected().await {
            warn!(target: "bridge", server = %link.connector.remote_addr(), "server not reachable yet: {}", e);
        }
        tokio::spawn(reconnect_loop(Arc::downgrade(&link), lifetime.clone(), config.reconnect_interval()));

        Ok(Self { link, bus })
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.link.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Waits up to `timeout` for a live connection.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.link.state.subscribe();
        let wait = async {
            loop {
                if *rx.borrow_and_update() == ConnectionState::Connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub fn server_addr(&self) -> String {
        self.link.connector.remote_addr()
    }

    pub fn delivery_state(&self) -> TeamState {
        self.link
            .delivery
            .get()
            .map(|team| team.state())
            .unwrap_or_default()
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.link.lifetime
    }

    /// Drops the connection and stops reconnecting.
    pub async fn close(&self) {
        self.link.lifetime.end().await;
    }
}

impl<C: Connector> std::fmt::Debug for BusClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusClient")
            .field("server", &self.link.connector.remote_addr())
            .field("state", &self.state())
            .finish()
    }
}

struct Link<C> {
    me: Weak<Link<C>>,
    connector: C,
    lifetime: Lifetime,
    config: BridgeConfig,
    inbound: InboundSink,
    session: Mutex<Option<Arc<Session>>>,
    // Serialises connection attempts so only one session is ever live.
    connect_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<ConnectionState>,
    delivery: OnceLock<WorkerTeam<Bytes>>,
    runtime: Handle,
}

impl<C: Connector> Link<C> {
    fn current(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|session| session.is_open())
            .cloned()
    }

    async fn ensure_connected(&self) -> io::Result<Arc<Session>> {
        if let Some(session) = self.current() {
            return Ok(session);
        }
        let _guard = self.connect_lock.lock().await;
        if let Some(session) = self.current() {
            return Ok(session);
        }
        if self.lifetime.is_ending() {
            return Err(io::ErrorKind::NotConnected.into());
        }

        self.state.send_replace(ConnectionState::Connecting);
        let stream = match tokio::time::timeout(self.config.connect_timeout(), self.connector.connect()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(io::ErrorKind::TimedOut.into());
            }
        };

        let inbound = self.inbound.clone();
        let on_frame: FrameHandler = Arc::new(move |_, frame| {
            let _ = inbound.send(frame);
        });
        let me = self.me.clone();
        let on_write_failed: FrameHandler = Arc::new(move |_, frame| {
            if let Some(link) = me.upgrade() {
                link.defer(frame);
            }
        });

        let id = PeerId::new();
        let session = Session::spawn(
            stream,
            id,
            self.connector.remote_addr(),
            &self.lifetime,
            self.config.max_frame_length,
            on_frame,
            on_write_failed,
        )
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;

        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&session));
        let me = self.me.clone();
        session.lifetime().do_on_ending(move || {
            if let Some(link) = me.upgrade() {
                link.session_ended(id);
            }
        });

        self.state.send_replace(ConnectionState::Connected);
        info!(target: "bridge", server = %self.connector.remote_addr(), session = %id, "connected to bus server");
        Ok(session)
    }

    fn session_ended(&self, id: PeerId) {
        let mut current = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if current.as_ref().map(|s| s.id()) == Some(id) {
            *current = None;
            self.state.send_replace(ConnectionState::Disconnected);
            info!(target: "bridge", server = %self.connector.remote_addr(), "disconnected from bus server");
        }
    }

    /// Hands a frame to the delivery team.
    fn defer(&self, frame: Bytes) {
        let posted = self
            .delivery
            .get()
            .map(|team| team.post(frame))
            .unwrap_or(false);
        if !posted {
            trace!(target: "bridge", "client closing, frame dropped");
        }
    }
}

impl<C: Connector> Transport for Link<C> {
    fn send(&self, frame: Bytes) {
        let frame = match self.current() {
            Some(session) => match session.post(frame) {
                Ok(()) => return,
                Err(frame) => frame,
            },
            None => frame,
        };

        let Some(link) = self.me.upgrade() else {
            return;
        };
        self.runtime.spawn(async move {
            match link.ensure_connected().await {
                Ok(session) => {
                    if let Err(frame) = session.post(frame) {
                        link.defer(frame);
                    }
                }
                Err(e) => {
                    debug!(target: "bridge", "reconnect on send failed: {}", e);
                    link.defer(frame);
                }
            }
        });
    }

    fn is_connected(&self) -> bool {
        self.current().is_some()
    }

    fn describe(&self) -> String {
        format!("bus-client {}", self.connector.remote_addr())
    }
}

fn start_delivery<C: Connector>(
    link: &Arc<Link<C>>,
    lifetime: &Lifetime,
    config: &BridgeConfig,
) -> Result<WorkerTeam<Bytes>> {
    let weak = Arc::downgrade(link);
    let retry = config.retry;
    let team = WorkerTeam::start(
        move |ctx: JobContext<Bytes>| {
            let weak = weak.clone();
            async move {
                let link = weak.upgrade().ok_or(JobError::Rejected)?;
                let session = link
                    .ensure_connected()
                    .await
                    .map_err(|e| JobError::Failed(e.to_string()))?;
                session
                    .send(ctx.job)
                    .await
                    .map_err(|e| JobError::Failed(e.to_string()))
            }
        },
        move |failure: &JobFailure<'_, Bytes>| retry.penalty(failure.failed_count),
        lifetime,
        TeamLayout::Workers(config.delivery_workers),
    )?;
    Ok(team)
}

async fn reconnect_loop<C: Connector>(link: Weak<Link<C>>, lifetime: Lifetime, interval: Duration) {
    let token = lifetime.token();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(link) = link.upgrade() else { break };
        if link.current().is_none() {
            if let Err(e) = link.ensure_connected().await {
                debug!(target: "bridge", server = %link.connector.remote_addr(), "reconnect failed: {}", e);
            }
        }
    }
    trace!(target: "bridge", "reconnect loop stopped");
}
