//! One live connection.
//!
//! A session owns a reader task and a writer task over a framed stream. Both
//! stop when the session's lifetime ends, and either one ends that lifetime
//! when its half of the stream fails. Frames posted without an
//! acknowledgement that fail to write are handed to `on_write_failed` so a
//! delivery team can retry them.

use crate::framing;
use crate::peer::PeerId;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use weft_core::Lifetime;

pub(crate) type FrameHandler = Arc<dyn Fn(PeerId, Bytes) + Send + Sync>;

enum Outgoing {
    Post(Bytes),
    Acked(Bytes, oneshot::Sender<io::Result<()>>),
}

pub struct Session {
    id: PeerId,
    remote: String,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    lifetime: Lifetime,
}

impl Session {
    /// Starts the session's tasks under a child of `parent`. Returns `None`
    /// when `parent` is already ending.
    pub(crate) fn spawn<S>(
        stream: S,
        id: PeerId,
        remote: String,
        parent: &Lifetime,
        max_frame_length: usize,
        on_frame: FrameHandler,
        on_write_failed: FrameHandler,
    ) -> Option<Arc<Session>>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let lifetime = parent.child()?;
        let (mut reader, mut writer) = framing::split(stream, max_frame_length);
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Outgoing>();

        let token = lifetime.token();
        let reader_lifetime = lifetime.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    _ = token.cancelled() => break,
                    next = reader.next() => next,
                };
                match next {
                    Some(Ok(frame)) => on_frame(id, frame.freeze()),
                    Some(Err(e)) => {
                        debug!(target: "bridge", peer = %id, "read failed: {}", e);
                        break;
                    }
                    None => {
                        debug!(target: "bridge", peer = %id, "stream closed by remote");
                        break;
                    }
                }
            }
            reader_lifetime.end().await;
        });

        let token = lifetime.token();
        let writer_lifetime = lifetime.clone();
        tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    _ = token.cancelled() => break,
                    item = queue.recv() => item,
                };
                let Some(item) = item else { break };
                match item {
                    Outgoing::Post(frame) => {
                        if let Err(e) = writer.send(frame.clone()).await {
                            warn!(target: "bridge", peer = %id, "write failed: {}", e);
                            on_write_failed(id, frame);
                            break;
                        }
                    }
                    Outgoing::Acked(frame, ack) => {
                        let result = writer.send(frame).await;
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break;
                        }
                    }
                }
            }

            // Whatever is still queued never reached the wire.
            queue.close();
            while let Ok(item) = queue.try_recv() {
                match item {
                    Outgoing::Post(frame) => on_write_failed(id, frame),
                    Outgoing::Acked(_, ack) => {
                        let _ = ack.send(Err(io::ErrorKind::NotConnected.into()));
                    }
                }
            }
            trace!(target: "bridge", peer = %id, "writer stopped");
            writer_lifetime.end().await;
        });

        Some(Arc::new(Session {
            id,
            remote,
            outgoing,
            lifetime,
        }))
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn is_open(&self) -> bool {
        !self.lifetime.is_ending() && !self.outgoing.is_closed()
    }

    /// Queues a frame without waiting for the write. Hands the frame back if
    /// the session is already closed.
    pub fn post(&self, frame: Bytes) -> Result<(), Bytes> {
        if self.lifetime.is_ending() {
            return Err(frame);
        }
        self.outgoing
            .send(Outgoing::Post(frame))
            .map_err(|e| match e.0 {
                Outgoing::Post(frame) | Outgoing::Acked(frame, _) => frame,
            })
    }

    /// Writes a frame and waits until it is flushed to the stream.
    pub async fn send(&self, frame: Bytes) -> io::Result<()> {
        if self.lifetime.is_ending() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let (tx, rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Acked(frame, tx))
            .map_err(|_| io::Error::from(io::ErrorKind::NotConnected))?;
        rx.await
            .unwrap_or_else(|_| Err(io::ErrorKind::NotConnected.into()))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("open", &self.is_open())
            .finish()
    }
}
