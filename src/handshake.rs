//! Three-step handshake establishing connection identity and exchanging a
//! credential.
//!
//! Exchange (client initiates after a short settle delay):
//!
//! 1. client → server: `HandshakeRequest{version, payload: {}}`
//! 2. server → client: `HandshakeResponse{id, success, payload: {}}`
//! 3. client → server: `HandshakeAck{success, payload: {authToken}}`
//!    followed by a final `HandshakeResponse`-shaped acknowledgment from
//!    the server.
//!
//! Each side runs a terminal state machine: the first failed or absent step
//! closes the underlying transport and aborts the attempt. No partial
//! identity is ever exposed, and retry is a lifecycle concern, not a
//! handshake one. The engine transports the credential verbatim;
//! validation policy belongs to the caller.

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::SockConfig;
use crate::error::{Result, SockError};
use crate::ids::ConnectionId;
use crate::macros::log_debug;
use crate::protocol::{
    // ---
    HandshakeAck,
    HandshakeRequest,
    HandshakeResponse,
    Metadata,
    Packet,
    PROTOCOL_VERSION,
};
use crate::transport::{EventRx, SocketEvent, TransportPtr};

/// Payload key under which the credential travels in the ack.
pub const AUTH_TOKEN_KEY: &str = "authToken";

/// Wait for the next inbound frame, skipping `Open`, bounded by `timeout`.
///
/// A terminal transport event or an expired bound is a handshake failure.
pub(crate) async fn next_frame(
    events: &mut EventRx,
    timeout: Duration,
    context: &'static str,
) -> Result<Bytes> {
    // ---
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| SockError::ConnectionTimeout(context))?;

        match event {
            Some(SocketEvent::Frame(frame)) => return Ok(frame),
            Some(SocketEvent::Open) => continue,
            Some(SocketEvent::Closed) | None => return Err(SockError::NotConnected(context)),
            Some(SocketEvent::Error(detail)) => return Err(SockError::Transport(detail)),
        }
    }
}

/// Run the client side of the handshake, yielding the server-assigned
/// connection identity.
///
/// On any failure the transport is closed before the error propagates.
pub(crate) async fn client_handshake(
    transport: &TransportPtr,
    events: &mut EventRx,
    config: &SockConfig,
    auth_token: &str,
) -> Result<ConnectionId> {
    // ---
    let result = client_steps(transport, events, config, auth_token).await;

    if result.is_err() {
        transport.close().await;
    }
    result
}

async fn client_steps(
    transport: &TransportPtr,
    events: &mut EventRx,
    config: &SockConfig,
    auth_token: &str,
) -> Result<ConnectionId> {
    // ---
    // Let the freshly opened transport settle before the first packet.
    tokio::time::sleep(config.settle_delay).await;

    log_debug!("handshake: client sending request");

    let request = Packet::HandshakeRequest(HandshakeRequest {
        version: PROTOCOL_VERSION,
        payload: Metadata::new(),
    });
    transport.send(request.encode()?).await?;

    // Step 2: identity assignment.
    let frame = next_frame(events, config.handshake_step_timeout, "client.await_response").await?;
    let response = expect_response(&frame, "client.await_response")?;

    log_debug!("handshake: client got identity {}", response.id);

    // Step 3: carry the credential.
    let ack = Packet::HandshakeAck(HandshakeAck {
        version: PROTOCOL_VERSION,
        success: true,
        payload: [(AUTH_TOKEN_KEY.to_string(), Value::String(auth_token.into()))]
            .into_iter()
            .collect(),
    });
    transport.send(ack.encode()?).await?;

    // Final confirmation; the identity comes from the *first* response.
    let frame = next_frame(events, config.handshake_step_timeout, "client.await_confirm").await?;
    expect_response(&frame, "client.await_confirm")?;

    Ok(ConnectionId::from(response.id))
}

fn expect_response(frame: &[u8], context: &'static str) -> Result<HandshakeResponse> {
    // ---
    match Packet::decode(frame)? {
        Packet::HandshakeResponse(response) if response.success => Ok(response),
        Packet::HandshakeResponse(_) => Err(SockError::Handshake {
            context,
            detail: "peer reported failure".into(),
        }),
        other => Err(SockError::Handshake {
            context,
            detail: format!("unexpected packet (schema {})", other.schema_id()),
        }),
    }
}

/// Run the server side of the handshake for one inbound connection,
/// assigning `id` and yielding the client's credential.
///
/// The caller decides what the credential is worth; on any failure the
/// transport is closed and no identity is registered.
pub(crate) async fn server_handshake(
    transport: &TransportPtr,
    events: &mut EventRx,
    config: &SockConfig,
    id: &ConnectionId,
) -> Result<String> {
    // ---
    let result = server_steps(transport, events, config, id).await;

    if result.is_err() {
        transport.close().await;
    }
    result
}

async fn server_steps(
    transport: &TransportPtr,
    events: &mut EventRx,
    config: &SockConfig,
    id: &ConnectionId,
) -> Result<String> {
    // ---
    // Step 1: the client opens the exchange.
    let frame = next_frame(events, config.handshake_step_timeout, "server.await_request").await?;
    match Packet::decode(&frame)? {
        Packet::HandshakeRequest(_) => {}
        other => {
            return Err(SockError::Handshake {
                context: "server.await_request",
                detail: format!("unexpected packet (schema {})", other.schema_id()),
            });
        }
    }

    log_debug!("handshake: server assigning identity {id}");

    // Step 2: assign the identity.
    transport.send(success_response(id).encode()?).await?;

    // Step 3: collect the credential.
    let frame = next_frame(events, config.handshake_step_timeout, "server.await_ack").await?;
    let ack = match Packet::decode(&frame)? {
        Packet::HandshakeAck(ack) if ack.success => ack,
        Packet::HandshakeAck(_) => {
            return Err(SockError::Handshake {
                context: "server.await_ack",
                detail: "client rejected the assigned identity".into(),
            });
        }
        other => {
            return Err(SockError::Handshake {
                context: "server.await_ack",
                detail: format!("unexpected packet (schema {})", other.schema_id()),
            });
        }
    };

    let token = ack
        .payload
        .get(AUTH_TOKEN_KEY)
        .and_then(Value::as_str)
        .ok_or(SockError::Handshake {
            context: "server.await_ack",
            detail: "credential missing from ack payload".into(),
        })?
        .to_string();

    // Final confirmation.
    transport.send(success_response(id).encode()?).await?;

    Ok(token)
}

fn success_response(id: &ConnectionId) -> Packet {
    // ---
    Packet::HandshakeResponse(HandshakeResponse {
        version: PROTOCOL_VERSION,
        id: id.to_string(),
        success: true,
        payload: Metadata::new(),
    })
}
