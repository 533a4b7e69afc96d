//! Per-connection symmetric correlation engine.
//!
//! The same [`Channel`] code runs on both endpoints. Every invocation,
//! whether locally issued or decoded off the wire, flows through a fixed
//! pipeline over an immutable [`CallContext`]:
//!
//! 1. **tagging**: the `emit*` entry points synthesize the context
//!    (inbound dispatch reuses the packet's verbatim fields instead);
//! 2. **routing decision**: the pure [`route`] table picks execute-local,
//!    forward-remote, or reflect-return;
//! 3. **local execution**: the registered handler runs (an unregistered
//!    name yields an empty result);
//! 4. **result routing**: a reflected invocation's values are encoded into
//!    a RETURN packet for the peer instead of staying in-process.
//!
//! Forwarded calls are correlated by id: a pending entry lives in the
//! channel's table from send until exactly one terminator wins the race
//! (RETURN, timeout, or disconnect). The losing watchers are always torn
//! down.

mod handlers;
mod pending;

pub use handlers::{CallContext, Handlers};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SockConfig;
use crate::error::SockError;
use crate::ids::{CallId, ConnectionId};
use crate::macros::{log_debug, log_warn};
use crate::protocol::{
    // ---
    route,
    Direction,
    Message,
    Metadata,
    Packet,
    RouteAction,
    Source,
    PROTOCOL_VERSION,
};
use crate::transport::{EventRx, SocketEvent, TransportPtr};

use pending::PendingCalls;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// The protected state is the best-effort correlation table
/// (call id → oneshot sender). There are no invariants spanning multiple
/// fields, and the worst outcome of ignoring poison is a dropped or
/// unmatched return; connection-level failures are handled by the receive
/// loop. This also avoids propagating non-`Send` poison errors across
/// async boundaries.
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Terminal result of one correlated call.
///
/// Timeouts and disconnects are ordinary outcomes, not faults, so bulk
/// operations can still complete for the surviving recipients. The enum is
/// distinguishable from any legitimate application payload.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The call completed; for a remote call these are the values echoed by
    /// the peer's RETURN, for a local one the handler's own results.
    Returned(Vec<Value>),
    /// No RETURN arrived within the per-call timeout.
    TimedOut,
    /// The connection went away before a RETURN arrived.
    Disconnected,
}

impl CallOutcome {
    /// The returned values, if the call completed.
    pub fn values(self) -> Option<Vec<Value>> {
        // ---
        match self {
            CallOutcome::Returned(values) => Some(values),
            _ => None,
        }
    }

    /// Whether this call hit its return timeout.
    pub fn is_timed_out(&self) -> bool {
        matches!(self, CallOutcome::TimedOut)
    }

    /// Whether this call was cut off by a disconnect.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, CallOutcome::Disconnected)
    }
}

/// Per-connection RPC channel.
///
/// Cheap to clone (internally `Arc`-backed). Constructed by the client
/// lifecycle or the server registry once the handshake has produced a
/// connection identity.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    id: ConnectionId,
    is_server: bool,
    config: SockConfig,
    transport: TransportPtr,
    handlers: Arc<Handlers>,
    pending: Mutex<PendingCalls>,
    disconnect_tx: broadcast::Sender<()>,
    disconnected: AtomicBool,

    /// Receive loop handle; kept so the task isn't detached invisibly.
    /// Set once right after construction.
    rx_task: Mutex<Option<JoinHandle<()>>>,
}

/// Removes its correlation entry when dropped.
///
/// `send_call` futures can be cancelled at any await point (a
/// `first_result` broadcast drops the stragglers as soon as one recipient
/// answers); without this guard the registered entry would outlive the
/// call and the table would grow unboundedly. Removal after the RETURN
/// already completed the entry is a no-op.
struct PendingGuard<'a> {
    // ---
    inner: &'a Inner,
    id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        // ---
        lock_ignore_poison(&self.inner.pending).remove(&self.id);
    }
}

impl Channel {
    // ---
    /// Create a channel over an established, handshaken transport.
    ///
    /// Spawns the receive loop that turns inbound frames into local
    /// dispatches and the transport's terminal event into the disconnect
    /// path.
    pub fn new(
        transport: TransportPtr,
        events: EventRx,
        id: ConnectionId,
        is_server: bool,
        handlers: Arc<Handlers>,
        config: SockConfig,
    ) -> Self {
        // ---
        let inner = Arc::new(Inner {
            id,
            is_server,
            config,
            transport,
            handlers,
            pending: Mutex::new(PendingCalls::new()),
            disconnect_tx: broadcast::channel(16).0,
            disconnected: AtomicBool::new(false),
            rx_task: Mutex::new(None),
        });

        // The loop holds only a weak reference, so dropping the last
        // channel handle also ends the task.
        let weak = Arc::downgrade(&inner);
        let mut events = events;

        let rx_task = tokio::spawn(async move {
            // ---
            loop {
                match events.recv().await {
                    Some(SocketEvent::Frame(frame)) => {
                        let Some(inner) = weak.upgrade() else { break };
                        let channel = Channel { inner };
                        channel.handle_frame(frame).await;
                    }
                    Some(SocketEvent::Open) => continue,
                    Some(SocketEvent::Closed) | Some(SocketEvent::Error(_)) | None => {
                        if let Some(inner) = weak.upgrade() {
                            Channel { inner }.handle_disconnect().await;
                        }
                        break;
                    }
                }
            }
        });

        *lock_ignore_poison(&inner.rx_task) = Some(rx_task);

        Self { inner }
    }

    /// Connection identity this channel is bound to.
    pub fn id(&self) -> &ConnectionId {
        &self.inner.id
    }

    /// Whether this channel runs on the server endpoint.
    pub fn is_server(&self) -> bool {
        self.inner.is_server
    }

    /// Whether the underlying connection has gone away.
    pub fn is_disconnected(&self) -> bool {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    /// Subscribe to the channel's single DISCONNECTED notification.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.inner.disconnect_tx.subscribe()
    }

    /// Number of calls currently awaiting a RETURN.
    pub fn pending_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    fn role_source(&self) -> Source {
        // ---
        if self.inner.is_server {
            Source::Server
        } else {
            Source::Client
        }
    }

    /// Invoke a named operation, local or remote per the routing table.
    ///
    /// On the endpoint whose role matches the call's source this replaces
    /// local execution with a network round-trip; the outcome is whatever
    /// the peer returns, or the timeout/disconnect sentinel.
    pub async fn emit(&self, name: &str, args: Vec<Value>) -> CallOutcome {
        // ---
        let ctx = CallContext::tag(self.role_source(), Metadata::new());
        self.dispatch(name, args, ctx, None).await
    }

    /// Like [`emit`](Self::emit), with application metadata attached.
    pub async fn emit_with_meta(
        &self,
        name: &str,
        metadata: Metadata,
        args: Vec<Value>,
    ) -> CallOutcome {
        // ---
        let ctx = CallContext::tag(self.role_source(), metadata);
        self.dispatch(name, args, ctx, None).await
    }

    /// Like [`emit`](Self::emit), with a per-call return-timeout override.
    /// Used by the server's broadcast `timeout` option.
    pub async fn emit_with_timeout(
        &self,
        name: &str,
        metadata: Metadata,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        // ---
        let ctx = CallContext::tag(self.role_source(), metadata);
        self.dispatch(name, args, ctx, timeout).await
    }

    /// Invoke a named operation strictly in-process.
    ///
    /// The `Local` tag short-circuits the routing stage, so this never
    /// produces a wire frame, whatever the endpoint's role.
    pub async fn emit_local(&self, name: &str, args: Vec<Value>) -> Vec<Value> {
        // ---
        self.emit_local_with_meta(name, Metadata::new(), args).await
    }

    /// Like [`emit_local`](Self::emit_local), with application metadata.
    pub async fn emit_local_with_meta(
        &self,
        name: &str,
        metadata: Metadata,
        args: Vec<Value>,
    ) -> Vec<Value> {
        // ---
        let ctx = CallContext::tag(Source::Local, metadata);
        match self.dispatch(name, args, ctx, None).await {
            CallOutcome::Returned(values) => values,
            // Local dispatch never races a network terminator.
            CallOutcome::TimedOut | CallOutcome::Disconnected => Vec::new(),
        }
    }

    /// Close the underlying transport.
    ///
    /// The resulting terminal event drives the disconnect path: pending
    /// calls drain to [`CallOutcome::Disconnected`] and the DISCONNECTED
    /// notification fires exactly once.
    pub async fn disconnect(&self) {
        // ---
        self.inner.transport.close().await;
    }

    /// Dispatch pipeline over an already-tagged context: routing decision,
    /// local execution, result routing.
    async fn dispatch(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: CallContext,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        // ---
        // Routing decision: a forwarded call replaces local execution
        // entirely.
        let action = route(ctx.direction, ctx.source, self.inner.is_server);
        if action == RouteAction::ForwardRemote {
            return self.send_call(name, args, &ctx, timeout).await;
        }

        // Local execution.
        let values = self.run_local(name, args, ctx.clone()).await;

        // Result routing: answer a wire-originated call with a RETURN.
        if action == RouteAction::ReflectReturn {
            self.send_return(&ctx, name, values.clone()).await;
        }

        CallOutcome::Returned(values)
    }

    async fn run_local(&self, name: &str, args: Vec<Value>, ctx: CallContext) -> Vec<Value> {
        // ---
        match self.inner.handlers.get(name) {
            Some(handler) => handler(args, ctx).await,
            None => Vec::new(),
        }
    }

    /// Send a CALL and await its RETURN, racing timeout and disconnect.
    async fn send_call(
        &self,
        name: &str,
        args: Vec<Value>,
        ctx: &CallContext,
        timeout: Option<Duration>,
    ) -> CallOutcome {
        // ---
        if self.is_disconnected() {
            return CallOutcome::Disconnected;
        }

        let rx = {
            let mut pending = lock_ignore_poison(&self.inner.pending);
            pending.register(ctx.id.clone(), name.to_string())
        };

        // The entry dies with this future, however it ends.
        let _guard = PendingGuard {
            inner: &self.inner,
            id: ctx.id.clone(),
        };

        let packet = Packet::Message(Message {
            version: PROTOCOL_VERSION,
            source: ctx.source,
            direction: Direction::Call,
            id: ctx.id.to_string(),
            name: name.to_string(),
            args,
            metadata: ctx.metadata.clone(),
        });

        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(_err) => {
                log_warn!("call {} failed to encode: {_err}", ctx.id);
                return CallOutcome::TimedOut;
            }
        };

        if self.inner.transport.send(frame).await.is_err() {
            self.handle_disconnect().await;
            return CallOutcome::Disconnected;
        }

        let timeout = timeout.unwrap_or(self.inner.config.return_timeout);
        let mut disconnect_rx = self.inner.disconnect_tx.subscribe();

        // Exactly one terminator wins; select drops the losing watchers,
        // and the guard clears the entry for the non-RETURN endings.
        tokio::select! {
            result = rx => match result {
                Ok(values) => CallOutcome::Returned(values),
                // Sender dropped by the disconnect drain.
                Err(_) => CallOutcome::Disconnected,
            },
            _ = disconnect_rx.recv() => CallOutcome::Disconnected,
            _ = tokio::time::sleep(timeout) => CallOutcome::TimedOut,
        }
    }

    /// Encode locally produced values into a RETURN for the peer.
    async fn send_return(&self, ctx: &CallContext, name: &str, values: Vec<Value>) {
        // ---
        let packet = Packet::Message(Message {
            version: PROTOCOL_VERSION,
            source: self.role_source(),
            direction: Direction::Return,
            id: ctx.id.to_string(),
            name: name.to_string(),
            args: values,
            metadata: ctx.metadata.clone(),
        });

        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(_err) => {
                log_warn!("return {} failed to encode: {_err}", ctx.id);
                return;
            }
        };

        if self.inner.transport.send(frame).await.is_err() {
            self.handle_disconnect().await;
        }
    }

    /// Translate one inbound frame into a local dispatch or a correlation
    /// completion.
    async fn handle_frame(&self, frame: Bytes) {
        // ---
        let message = match Packet::decode(&frame) {
            Ok(Packet::Message(message)) => message,
            Ok(_other) => {
                log_warn!("channel {}: handshake packet after handshake, dropped", self.inner.id);
                return;
            }
            Err(SockError::UnknownDirection(_direction)) => {
                // The frame itself was well-formed (length and checksum
                // verified), only its direction is unroutable; drop it and
                // keep the connection.
                log_warn!(
                    "channel {}: dropped frame with unknown direction {_direction}",
                    self.inner.id
                );
                return;
            }
            Err(_err) => {
                // Desynchronized stream; the connection cannot be trusted.
                log_warn!("channel {}: inbound frame rejected: {_err}", self.inner.id);
                self.handle_disconnect().await;
                return;
            }
        };

        match message.direction {
            Direction::Call => {
                // ---
                let ctx = CallContext {
                    id: CallId::from(message.id),
                    source: message.source,
                    direction: message.direction,
                    metadata: message.metadata,
                };

                // Spawn so a slow handler never stalls the receive loop.
                let channel = self.clone();
                tokio::spawn(async move {
                    channel
                        .dispatch(&message.name, message.args, ctx, None)
                        .await;
                });
            }
            Direction::Return => {
                // ---
                let id = CallId::from(message.id);
                let delivered = lock_ignore_poison(&self.inner.pending).complete(
                    &id,
                    &message.name,
                    message.args,
                );

                if !delivered {
                    log_debug!(
                        "channel {}: return for unknown or expired call {id}",
                        self.inner.id
                    );
                }
            }
        }
    }

    /// Disconnect path: runs exactly once per channel lifetime.
    ///
    /// Drains every pending entry (their waiters resolve to
    /// [`CallOutcome::Disconnected`] in the same pass) and fires the single
    /// DISCONNECTED notification.
    async fn handle_disconnect(&self) {
        // ---
        if self.inner.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }

        let _drained = lock_ignore_poison(&self.inner.pending).drain();
        log_debug!(
            "channel {} disconnected, {_drained} pending calls resolved",
            self.inner.id
        );

        let _ = self.inner.disconnect_tx.send(());
        self.inner.transport.close().await;
    }
}
