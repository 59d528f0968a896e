//! Relay server.
//!
//! Every frame read from one peer is written to every other connected peer.
//! Writes that cannot be queued on a peer's session, or that fail on the
//! wire, go to a shared delivery team which retries them under the
//! configured [`RetryPolicy`](weft_core::RetryPolicy). With
//! [`ServerOptions::local_client`] set the server also runs a [`Bus`] of its
//! own that sees every relayed frame and whose publishes reach all peers.

use crate::config::BridgeConfig;
use crate::endpoint::Acceptor;
use crate::peer::{PeerId, PeerSet};
use crate::session::{FrameHandler, Session};
use crate::{BridgeError, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, trace, warn};
use weft_core::transport::inbound_channel;
use weft_core::{
    Bus, JobContext, JobError, JobEvent, JobFailure, Lifetime, PenaltyInfo, TeamLayout, TeamState,
    Transport, TypeRegistry, WeftError, WorkerTeam,
};

const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerOptions {
    /// Run a local bus that takes part in the traffic.
    pub local_client: bool,
}

impl ServerOptions {
    pub fn relay() -> Self {
        Self {
            local_client: false,
        }
    }

    pub fn with_local_client() -> Self {
        Self { local_client: true }
    }
}

/// A frame owed to one peer.
#[derive(Debug, Clone)]
pub struct PeerFrame {
    pub peer: PeerId,
    pub frame: Bytes,
}

pub struct BusServer {
    lifetime: Lifetime,
    local_addr: String,
    peers: PeerSet<Arc<Session>>,
    delivery: WorkerTeam<PeerFrame>,
    bus: Option<Bus>,
}

impl BusServer {
    /// Starts accepting on `acceptor` under a child of `lifetime`. Fails
    /// with `NoRuntime` outside a Tokio runtime.
    pub fn start<A: Acceptor>(
        lifetime: &Lifetime,
        registry: Arc<TypeRegistry>,
        acceptor: A,
        config: &BridgeConfig,
        options: ServerOptions,
    ) -> Result<BusServer> {
        config.validate()?;
        let runtime =
            Handle::try_current().map_err(|_| BridgeError::Core(WeftError::NoRuntime("bus server")))?;
        let lifetime = lifetime
            .child()
            .ok_or(BridgeError::Core(WeftError::Closed("lifetime")))?;
        let local_addr = acceptor.local_addr();
        let peers: PeerSet<Arc<Session>> = PeerSet::new();
        let delivery = start_delivery(&runtime, &lifetime, &peers, config)?;

        let (bus, local_sink) = if options.local_client {
            let (sink, inbound) = inbound_channel();
            let transport = Arc::new(ServerTransport {
                local_addr: local_addr.clone(),
                peers: peers.clone(),
                delivery: delivery.clone(),
            });
            let bus = Bus::with_transport(&lifetime, registry, transport, inbound)?;
            (Some(bus), Some(sink))
        } else {
            (None, None)
        };

        let relay_peers = peers.clone();
        let relay_delivery = delivery.clone();
        let on_frame: FrameHandler = Arc::new(move |from, frame| {
            trace!(target: "bridge", peer = %from, len = frame.len(), "frame received");
            if let Some(sink) = &local_sink {
                let _ = sink.send(frame.clone());
            }
            fan_out(&relay_peers, &relay_delivery, Some(from), frame);
        });

        let retry_delivery = delivery.clone();
        let on_write_failed: FrameHandler = Arc::new(move |peer, frame| {
            if !retry_delivery.post(PeerFrame { peer, frame }) {
                trace!(target: "bridge", peer = %peer, "server closing, frame dropped");
            }
        });

        runtime.spawn(accept_loop(
            acceptor,
            lifetime.clone(),
            peers.clone(),
            config.max_frame_length,
            on_frame,
            on_write_failed,
        ));

        info!(target: "bridge", addr = %local_addr, local_client = options.local_client, "Bus server listening");
        Ok(BusServer {
            lifetime,
            local_addr,
            peers,
            delivery,
            bus,
        })
    }

    /// The server's own bus, when started with a local client.
    pub fn bus(&self) -> Option<&Bus> {
        self.bus.as_ref()
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.snapshot().keys().copied().collect()
    }

    pub fn delivery_state(&self) -> TeamState {
        self.delivery.state()
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    /// Stops accepting and drops every connection.
    pub async fn close(&self) {
        self.lifetime.end().await;
    }
}

impl std::fmt::Debug for BusServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusServer")
            .field("local_addr", &self.local_addr)
            .field("peers", &self.peers.len())
            .field("local_client", &self.bus.is_some())
            .finish()
    }
}

struct ServerTransport {
    local_addr: String,
    peers: PeerSet<Arc<Session>>,
    delivery: WorkerTeam<PeerFrame>,
}

impl Transport for ServerTransport {
    fn send(&self, frame: Bytes) {
        fan_out(&self.peers, &self.delivery, None, frame);
    }

    fn describe(&self) -> String {
        format!("bus-server {}", self.local_addr)
    }
}

fn fan_out(
    peers: &PeerSet<Arc<Session>>,
    delivery: &WorkerTeam<PeerFrame>,
    except: Option<PeerId>,
    frame: Bytes,
) {
    for (id, session) in peers.snapshot().iter() {
        if Some(*id) == except {
            continue;
        }
        if let Err(frame) = session.post(frame.clone()) {
            delivery.post(PeerFrame { peer: *id, frame });
        }
    }
}

fn start_delivery(
    runtime: &Handle,
    lifetime: &Lifetime,
    peers: &PeerSet<Arc<Session>>,
    config: &BridgeConfig,
) -> Result<WorkerTeam<PeerFrame>> {
    let routine_peers = peers.clone();
    let retry = config.retry;

    let team = WorkerTeam::start(
        move |ctx: JobContext<PeerFrame>| {
            let peers = routine_peers.clone();
            async move {
                // A peer that has left will not come back under the same id.
                let session = peers.get(&ctx.job.peer).ok_or(JobError::Rejected)?;
                session
                    .send(ctx.job.frame)
                    .await
                    .map_err(|e| JobError::Failed(e.to_string()))
            }
        },
        move |failure: &JobFailure<'_, PeerFrame>| match failure.error {
            JobError::Rejected => PenaltyInfo::give_up(),
            _ => retry.penalty(failure.failed_count),
        },
        lifetime,
        TeamLayout::Workers(config.delivery_workers),
    )?;

    let mut events = team.events();
    let token = lifetime.token();
    runtime.spawn(async move {
        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(JobEvent::Failed {
                    job, failed_count, ..
                }) => {
                    warn!(target: "bridge", peer = %job.peer, attempts = failed_count, "giving up on frame delivery");
                }
                Ok(JobEvent::Completed { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(target: "bridge", skipped, "delivery event watcher lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    Ok(team)
}

async fn accept_loop<A: Acceptor>(
    mut acceptor: A,
    lifetime: Lifetime,
    peers: PeerSet<Arc<Session>>,
    max_frame_length: usize,
    on_frame: FrameHandler,
    on_write_failed: FrameHandler,
) {
    let token = lifetime.token();
    let mut backoff = Duration::from_millis(50);
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = acceptor.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => {
                backoff = Duration::from_millis(50);
                accepted
            }
            Err(e) => {
                warn!(target: "bridge", "accept failed: {}", e);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                continue;
            }
        };

        let id = PeerId::new();
        let Some(session) = Session::spawn(
            stream,
            id,
            remote.clone(),
            &lifetime,
            max_frame_length,
            Arc::clone(&on_frame),
            Arc::clone(&on_write_failed),
        ) else {
            break;
        };

        peers.insert(id, Arc::clone(&session));
        let departed = peers.clone();
        session.lifetime().do_on_ending(move || {
            departed.remove(&id);
            info!(target: "bridge", peer = %id, "peer disconnected");
        });
        info!(target: "bridge", peer = %id, remote = %remote, "peer connected");
    }
    debug!(target: "bridge", addr = %acceptor.local_addr(), "accept loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::DuplexStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct IdleAcceptor;

    #[async_trait]
    impl Acceptor for IdleAcceptor {
        type Stream = DuplexStream;

        async fn accept(&mut self) -> std::io::Result<(DuplexStream, String)> {
            futures::future::pending().await
        }

        fn local_addr(&self) -> String {
            "idle".to_string()
        }
    }

    fn delivery_config(max_attempts: u32) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.delivery_workers = 1;
        config.retry.max_attempts = max_attempts;
        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 20;
        config
    }

    // A registered peer whose stream is already gone.
    async fn broken_peer(
        lifetime: &Lifetime,
        peers: &PeerSet<Arc<Session>>,
        delivery: &WorkerTeam<PeerFrame>,
    ) -> PeerId {
        let (near, far) = tokio::io::duplex(64);
        drop(far);
        let retry = delivery.clone();
        let on_write_failed: FrameHandler = Arc::new(move |peer, frame| {
            retry.post(PeerFrame { peer, frame });
        });
        let ignore: FrameHandler = Arc::new(|_, _| {});
        let id = PeerId::new();
        let session = Session::spawn(near, id, "broken".into(), lifetime, 1024, ignore, on_write_failed)
            .unwrap();
        timeout(WAIT, session.lifetime().ended()).await.expect("timeout");
        peers.insert(id, session);
        id
    }

    #[test]
    fn test_start_outside_runtime_is_an_error() {
        let lifetime = Lifetime::new();
        let result = BusServer::start(
            &lifetime,
            Arc::new(TypeRegistry::empty()),
            IdleAcceptor,
            &BridgeConfig::default(),
            ServerOptions::relay(),
        );
        assert!(matches!(
            result,
            Err(BridgeError::Core(WeftError::NoRuntime(_)))
        ));
    }

    #[tokio::test]
    async fn test_undeliverable_frame_is_retried_then_given_up() {
        let lifetime = Lifetime::new();
        let peers = PeerSet::new();
        let delivery = start_delivery(&Handle::current(), &lifetime, &peers, &delivery_config(3)).unwrap();
        let mut events = delivery.events();
        let id = broken_peer(&lifetime, &peers, &delivery).await;

        fan_out(&peers, &delivery, None, Bytes::from_static(b"frame"));

        match timeout(WAIT, events.recv()).await.expect("timeout").unwrap() {
            JobEvent::Failed { job, failed_count, .. } => {
                assert_eq!(job.peer, id);
                assert_eq!(failed_count, 3);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(delivery.state().failed, 1);
        assert_eq!(delivery.state().completed, 0);

        lifetime.end().await;
    }

    #[tokio::test]
    async fn test_frames_for_departed_peer_are_dropped() {
        let lifetime = Lifetime::new();
        let peers = PeerSet::new();
        let delivery =
            start_delivery(&Handle::current(), &lifetime, &peers, &delivery_config(100)).unwrap();
        let mut events = delivery.events();
        let id = broken_peer(&lifetime, &peers, &delivery).await;

        fan_out(&peers, &delivery, None, Bytes::from_static(b"frame"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(delivery.state().failed, 0, "still retrying while the peer is known");

        peers.remove(&id);
        match timeout(WAIT, events.recv()).await.expect("timeout").unwrap() {
            JobEvent::Failed { failed_count, .. } => assert!(failed_count < 100),
            other => panic!("unexpected event: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let state = delivery.state();
        assert_eq!(state.failed, 1);
        assert_eq!(state.queued, 0);
        assert_eq!(state.running, 0);

        lifetime.end().await;
    }

    #[tokio::test]
    async fn test_sender_is_skipped() {
        let lifetime = Lifetime::new();
        let peers = PeerSet::new();
        let delivery = start_delivery(&Handle::current(), &lifetime, &peers, &delivery_config(3)).unwrap();
        let id = broken_peer(&lifetime, &peers, &delivery).await;

        fan_out(&peers, &delivery, Some(id), Bytes::from_static(b"frame"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(delivery.state(), TeamState::default());

        lifetime.end().await;
    }
}
