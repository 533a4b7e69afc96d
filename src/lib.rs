//! Symmetric RPC over a persistent duplex connection
//!
//! This library provides a binary packet protocol and a correlation engine
//! for bidirectional RPC: both endpoints register handlers and both issue
//! calls over the same connection. It handles framing with checksums, the
//! identity handshake, call/return matching with timeouts, client
//! reconnection, and server-side broadcast with bounded concurrency.
//!

// Import all sub modules once...
mod channel;
mod client;
mod handshake;
mod server;

mod config;
mod macros;

mod error;
mod ids;

pub mod protocol;
pub mod transport;

// Re-export main types
pub use client::{ClientState, Connector, RpcClient};
pub use server::{BroadcastOutcome, CredentialValidator, EmitOptions, RpcServer};

pub use config::SockConfig;

pub use error::{Result, SockError};
pub use ids::{CallId, ConnectionId};

pub use channel::{CallContext, CallOutcome, Channel, Handlers};

pub use handshake::AUTH_TOKEN_KEY;

// --- public re-exports
pub use protocol::{
    //
    Direction,
    Message,
    Metadata,
    Packet,
    Source,
    PROTOCOL_VERSION,
};

pub use transport::{
    //
    EventRx,
    SocketEvent,
    SocketTransport,
    TransportPtr,
};
