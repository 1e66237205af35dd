//! One live TCP link to another overlay process.
//!
//! Each connection runs two tasks for the lifetime of its socket: a receive
//! loop that reads frames and hands them to the dispatcher, and a send loop
//! that drains a FIFO outbound queue. Producers never block; the send loop
//! sleeps until something is queued.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::SinkExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use overlay_core::frame::{self, read_frame, send_frame, FrameError, FrameReader, FrameWriter};
use overlay_core::wire::UNASSIGNED_ID;
use overlay_core::{Message, NodeId, Route};

use crate::dispatch::Dispatcher;

/// Lifecycle of a connection. Moves only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Open,
    /// Local side asked to close; queued frames are still flushed.
    Closing,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection to {0} is closed")]
    Closed(SocketAddr),

    #[error("no live connection for node {0}")]
    NoSuchPeer(NodeId),
}

/// Cheap, cloneable handle to a live link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    remote: SocketAddr,
    peer_id: AtomicI32,
    outbound: mpsc::UnboundedSender<Bytes>,
    state: watch::Sender<ConnState>,
    close_requested: AtomicBool,
    lost_reported: AtomicBool,
}

impl Connection {
    /// Take ownership of a connected socket and start its send and receive
    /// loops. Inbound frames go to `dispatcher`.
    pub fn spawn(stream: TcpStream, dispatcher: Arc<Dispatcher>) -> std::io::Result<Self> {
        let remote = stream.peer_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%remote, error = %e, "failed to set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let (outbound, queue) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Open);

        let conn = Connection {
            inner: Arc::new(Inner {
                remote,
                peer_id: AtomicI32::new(UNASSIGNED_ID),
                outbound,
                state,
                close_requested: AtomicBool::new(false),
                lost_reported: AtomicBool::new(false),
            }),
        };

        tokio::spawn(send_loop(conn.clone(), frame::writer(write_half), queue));
        tokio::spawn(receive_loop(conn.clone(), frame::reader(read_half), dispatcher));

        tracing::debug!(%remote, "connection open");
        Ok(conn)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.inner.remote
    }

    /// Id of the node at the other end, −1 until known.
    pub fn peer_id(&self) -> NodeId {
        self.inner.peer_id.load(Ordering::Acquire)
    }

    pub fn set_peer_id(&self, id: NodeId) {
        self.inner.peer_id.store(id, Ordering::Release);
    }

    /// Remote identity as a route. None for non-IPv4 remotes.
    pub fn route(&self) -> Option<Route> {
        match self.inner.remote {
            SocketAddr::V4(v4) => Some(Route::new(*v4.ip(), v4.port(), self.peer_id())),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Two handles refer to the same underlying link.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue a raw frame payload. Never blocks.
    pub fn send_data(&self, payload: Bytes) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed(self.inner.remote));
        }
        self.inner
            .outbound
            .send(payload)
            .map_err(|_| ConnectionError::Closed(self.inner.remote))
    }

    /// Encode and queue a message.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        tracing::trace!(remote = %self.inner.remote, tag = ?message.tag(), "queue message");
        self.send_data(message.encode())
    }

    /// Stop accepting sends, flush what is queued, then shut the write half.
    /// A connection closed this way is not reported as lost.
    pub fn close(&self) {
        self.inner.close_requested.store(true, Ordering::Release);
        self.inner.state.send_if_modified(|state| {
            if *state == ConnState::Open {
                *state = ConnState::Closing;
                true
            } else {
                false
            }
        });
    }

    /// Resolves once the link is closed: after a local close has flushed and
    /// shut the write half, or when the stream breaks.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnState::Closed).await;
    }

    fn mark_closed(&self) {
        self.inner.state.send_if_modified(|state| {
            if *state != ConnState::Closed {
                *state = ConnState::Closed;
                true
            } else {
                false
            }
        });
    }

    /// True exactly once, and only when nobody asked for the close.
    fn take_unexpected_loss(&self) -> bool {
        !self.inner.close_requested.load(Ordering::Acquire)
            && !self.inner.lost_reported.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.inner.remote)
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .finish()
    }
}

// ── Loops ────────────────────────────────────────────────────────────────────

async fn send_loop(
    conn: Connection,
    mut write: FrameWriter<OwnedWriteHalf>,
    mut queue: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut state = conn.inner.state.subscribe();
    let remote = conn.remote_addr();

    loop {
        tokio::select! {
            biased;

            frame = queue.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = send_frame(&mut write, frame).await {
                    tracing::warn!(%remote, error = %e, "send failed, closing connection");
                    conn.mark_closed();
                    return;
                }
            }

            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    ConnState::Open => continue,
                    ConnState::Closing => {
                        while let Ok(frame) = queue.try_recv() {
                            if send_frame(&mut write, frame).await.is_err() {
                                break;
                            }
                        }
                        // Flushes the codec buffer, then shuts the write half.
                        if let Err(e) = SinkExt::<Bytes>::close(&mut write).await {
                            tracing::debug!(%remote, error = %e, "shutdown failed");
                        }
                        conn.mark_closed();
                        break;
                    }
                    ConnState::Closed => break,
                }
            }
        }
    }

    tracing::debug!(%remote, "send loop stopped");
}

async fn receive_loop(
    conn: Connection,
    mut read: FrameReader<OwnedReadHalf>,
    dispatcher: Arc<Dispatcher>,
) {
    let remote = conn.remote_addr();

    loop {
        match read_frame(&mut read).await {
            Ok(frame) => {
                dispatcher.dispatch(&conn, &frame);
            }
            Err(FrameError::StreamClosed) => {
                tracing::debug!(%remote, peer = conn.peer_id(), "stream closed");
                break;
            }
            Err(e) => {
                // Framing is lost once a length or body read fails.
                tracing::warn!(%remote, peer = conn.peer_id(), error = %e, "receive failed");
                break;
            }
        }
    }

    conn.mark_closed();
    if conn.take_unexpected_loss() {
        dispatcher.connection_lost(&conn);
    }
}
