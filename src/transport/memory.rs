//! In-memory duplex transport pair.
//!
//! A pure in-process implementation of [`SocketTransport`]: two connected
//! endpoints where each side's `send()` surfaces as a
//! [`SocketEvent::Frame`] on the peer's event stream. It defines the
//! reference behavior for the transport seam and is what the crate's own
//! tests run against.
//!
//! Reference semantics:
//!
//! - `send()` waits for the open state before delivering, bounded by
//!   [`OPEN_WAIT`]; a transport that never opens fails sends with
//!   `NotConnected` rather than queueing forever.
//! - `close()` on either side is idempotent and delivers exactly one
//!   `Closed` to both sides' event streams.
//! - Frames are delivered in send order, without loss or duplication.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, SockError};
use crate::macros::log_debug;

use super::{EventRx, SocketEvent, SocketTransport};

/// Bound on how long `send()` waits for the transport to open.
pub const OPEN_WAIT: Duration = Duration::from_secs(10);

const INBOX_CAPACITY: usize = 64;

/// One endpoint of an in-memory pair: the transport handle plus the event
/// stream the engine consumes for this side.
pub struct MemoryEnd {
    /// Transport handle for this side.
    pub transport: Arc<MemoryTransport>,
    /// Lifecycle events for this side (`Open`, peer frames, `Closed`).
    pub events: EventRx,
}

/// In-memory transport endpoint. Construct via [`pair`] or
/// [`unopened_pair`].
pub struct MemoryTransport {
    // ---
    /// Delivers frames and lifecycle events to the peer's stream.
    peer_tx: mpsc::Sender<SocketEvent>,
    /// Delivers lifecycle events to this side's own stream.
    own_tx: mpsc::Sender<SocketEvent>,
    /// Open state for this side; `send()` waits on it.
    open_tx: watch::Sender<bool>,
    /// Shared by both sides: once set, the pair is dead.
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Mark this side open and deliver the `Open` event.
    ///
    /// [`pair`] does this for both sides; [`unopened_pair`] leaves it to
    /// the caller so the queue-until-open path can be exercised.
    pub fn open(&self) {
        // ---
        if self.open_tx.send_replace(true) {
            return; // already open
        }
        let _ = self.own_tx.try_send(SocketEvent::Open);
    }
}

#[async_trait::async_trait]
impl SocketTransport for MemoryTransport {
    // ---
    async fn send(&self, frame: Bytes) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(SockError::NotConnected("memory.send"));
        }

        // Queue until open, bounded. Collapse to a bool so no watch guard
        // is held across the send await below.
        let mut open_rx = self.open_tx.subscribe();
        let opened = tokio::time::timeout(OPEN_WAIT, open_rx.wait_for(|open| *open))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if !opened {
            return Err(SockError::NotConnected("memory.send"));
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(SockError::NotConnected("memory.send"));
        }

        self.peer_tx
            .send(SocketEvent::Frame(frame))
            .await
            .map_err(|_| SockError::Transport("peer event stream dropped".into()))
    }

    async fn close(&self) {
        // ---
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        log_debug!("memory transport pair closing");

        // Both sides observe exactly one terminal event.
        let _ = self.own_tx.send(SocketEvent::Closed).await;
        let _ = self.peer_tx.send(SocketEvent::Closed).await;
    }
}

/// Create a connected pair with both sides already open.
pub fn pair() -> (MemoryEnd, MemoryEnd) {
    // ---
    let (a, b) = unopened_pair();
    a.transport.open();
    b.transport.open();
    (a, b)
}

/// Create a connected pair with neither side open yet.
///
/// Sends queue (bounded by [`OPEN_WAIT`]) until [`MemoryTransport::open`]
/// is called on the sending side.
pub fn unopened_pair() -> (MemoryEnd, MemoryEnd) {
    // ---
    let (a_tx, a_rx) = mpsc::channel(INBOX_CAPACITY);
    let (b_tx, b_rx) = mpsc::channel(INBOX_CAPACITY);
    let closed = Arc::new(AtomicBool::new(false));

    let a = MemoryTransport {
        peer_tx: b_tx.clone(),
        own_tx: a_tx.clone(),
        open_tx: watch::channel(false).0,
        closed: closed.clone(),
    };
    let b = MemoryTransport {
        peer_tx: a_tx,
        own_tx: b_tx,
        open_tx: watch::channel(false).0,
        closed,
    };

    (
        MemoryEnd {
            transport: Arc::new(a),
            events: a_rx,
        },
        MemoryEnd {
            transport: Arc::new(b),
            events: b_rx,
        },
    )
}
