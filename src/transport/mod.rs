//! Transport adapter seam.
//!
//! The raw duplex socket (WebSocket, TCP, vsock, ...) is an external
//! collaborator. This module defines the narrow contract the engine
//! consumes: a normalized lifecycle event stream plus a `send` primitive
//! that queues until the connection is open.
//!
//! Implementations must deliver, in order, at most one [`SocketEvent::Open`],
//! any number of [`SocketEvent::Frame`]s, and exactly one terminal event
//! among [`SocketEvent::Closed`] / [`SocketEvent::Error`]. The in-memory
//! pair in [`memory`] defines the reference semantics.

pub mod memory;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;

/// Normalized lifecycle event of an underlying duplex socket.
#[derive(Debug, Clone)]
pub enum SocketEvent {
    /// The connection is open; queued sends may now flush.
    Open,
    /// One complete inbound frame.
    Frame(Bytes),
    /// The connection closed. Terminal.
    Closed,
    /// The connection failed. Terminal.
    Error(String),
}

/// Receiving half of a transport's event stream.
pub type EventRx = mpsc::Receiver<SocketEvent>;

/// Minimal duplex-socket contract consumed by the engine.
#[async_trait::async_trait]
pub trait SocketTransport: Send + Sync {
    /// Send one frame, waiting (bounded) for the open state first.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::NotConnected`](crate::SockError::NotConnected)
    /// if the socket is closed or never opens within the wait bound, and
    /// [`SockError::Transport`](crate::SockError::Transport) on a write
    /// failure.
    async fn send(&self, frame: Bytes) -> Result<()>;

    /// Close the transport. Safe to call multiple times.
    async fn close(&self);
}

/// Shared transport pointer.
///
/// An `Arc<dyn SocketTransport>`: cheap to clone, erases the concrete
/// transport behind the engine-facing contract.
pub type TransportPtr = Arc<dyn SocketTransport>;
