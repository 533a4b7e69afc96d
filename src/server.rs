//! Server-side connection registry and broadcast.
//!
//! [`RpcServer`] owns the set of live client connections. The listener (or
//! whatever accepts sockets) is an external collaborator: it hands each
//! fresh transport to [`accept`](RpcServer::accept), which runs the
//! server-side handshake, registers the resulting [`Channel`] under its
//! assigned identity, and removes it again on disconnect.
//!
//! Outbound work fans out through [`emit`](RpcServer::emit) with bounded
//! concurrency. Per-recipient failures are data, not faults: a recipient
//! that times out or disconnects shows up as its own [`CallOutcome`]
//! without disturbing the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use crate::channel::{CallContext, CallOutcome, Channel, Handlers};
use crate::config::SockConfig;
use crate::error::{Result, SockError};
use crate::handshake;
use crate::ids::ConnectionId;
use crate::macros::{log_debug, log_info, log_warn};
use crate::protocol::{Metadata, Source};
use crate::transport::{EventRx, TransportPtr};

/// Credential check applied to the token each client presents during its
/// handshake. Returning `false` rejects the connection before it is
/// registered.
pub type CredentialValidator = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Addressing and delivery options for one [`emit`](RpcServer::emit).
#[derive(Clone, Default)]
pub struct EmitOptions {
    // ---
    /// Restrict delivery to these connections; `None` means every
    /// registered client. Unknown ids are silently skipped.
    pub to: Option<Vec<ConnectionId>>,
    /// Run the server's own handlers instead of touching the wire.
    pub local: bool,
    /// Per-call override of the configured return timeout.
    pub timeout: Option<Duration>,
    /// Resolve with the first completed outcome instead of the full map.
    pub first_result: bool,
    /// Application metadata attached to every delivered call.
    pub metadata: Metadata,
}

impl EmitOptions {
    // ---
    /// Options with all defaults: every client, remote, configured timeout,
    /// full result map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict delivery to the given connections.
    pub fn to(mut self, ids: impl IntoIterator<Item = ConnectionId>) -> Self {
        self.to = Some(ids.into_iter().collect());
        self
    }

    /// Run the server's own handlers, producing no wire traffic.
    pub fn local(mut self) -> Self {
        self.local = true;
        self
    }

    /// Override the per-call return timeout for this emit.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve with the first completed outcome.
    pub fn first_result(mut self) -> Self {
        self.first_result = true;
        self
    }

    /// Attach application metadata to the delivered calls.
    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of one [`emit`](RpcServer::emit), shaped by the options used.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastOutcome {
    /// `local` delivery: the server's own handler results.
    Local(Vec<Value>),
    /// Full fan-out: one outcome per targeted live connection, keyed by
    /// identity, accumulated in completion order.
    All(HashMap<ConnectionId, CallOutcome>),
    /// `first_result` delivery: the first completed outcome, or `None` when
    /// the target set was empty.
    First(Option<(ConnectionId, CallOutcome)>),
}

struct ClientRow {
    // ---
    channel: Channel,
    auth_token: String,
}

/// RPC server over a set of persistent client connections.
///
/// Cheap to clone; all clones share the registry, handlers, and
/// notifications.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    config: SockConfig,
    handlers: Arc<Handlers>,
    validator: Option<CredentialValidator>,
    clients: RwLock<HashMap<ConnectionId, ClientRow>>,
    connected_tx: broadcast::Sender<ConnectionId>,
    disconnected_tx: broadcast::Sender<ConnectionId>,
}

impl RpcServer {
    // ---
    /// Create a server that accepts any credential.
    pub fn new(config: SockConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a server that rejects connections whose handshake credential
    /// fails `validator`.
    pub fn with_validator(config: SockConfig, validator: CredentialValidator) -> Self {
        Self::build(config, Some(validator))
    }

    fn build(config: SockConfig, validator: Option<CredentialValidator>) -> Self {
        // ---
        Self {
            inner: Arc::new(ServerInner {
                config,
                handlers: Handlers::new(),
                validator,
                clients: RwLock::new(HashMap::new()),
                connected_tx: broadcast::channel(64).0,
                disconnected_tx: broadcast::channel(64).0,
            }),
        }
    }

    /// Register an async handler for a named operation.
    ///
    /// The registry is shared by every accepted channel, present and
    /// future.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<Value>> + Send + 'static,
    {
        self.inner.handlers.on(name, handler);
    }

    /// Take one inbound connection through handshake and registration.
    ///
    /// Runs the server handshake (assigning a fresh identity), applies the
    /// credential validator, registers the channel, and fires the CONNECTED
    /// notification. On any failure the transport is closed and nothing is
    /// registered.
    pub async fn accept(&self, transport: TransportPtr, mut events: EventRx) -> Result<ConnectionId> {
        // ---
        tokio::time::sleep(self.inner.config.settle_delay).await;

        let id = ConnectionId::generate();
        let token =
            handshake::server_handshake(&transport, &mut events, &self.inner.config, &id).await?;

        if let Some(validator) = &self.inner.validator {
            if !validator(&token) {
                log_warn!("connection {id} rejected: credential failed validation");
                transport.close().await;
                return Err(SockError::Handshake {
                    context: "server.accept",
                    detail: "credential rejected".into(),
                });
            }
        }

        let channel = Channel::new(
            transport,
            events,
            id.clone(),
            true,
            self.inner.handlers.clone(),
            self.inner.config.clone(),
        );

        self.spawn_disconnect_watcher(&channel);

        self.inner.clients.write().await.insert(
            id.clone(),
            ClientRow {
                channel,
                auth_token: token,
            },
        );

        log_info!("connection {id} registered");
        let _ = self.inner.connected_tx.send(id.clone());

        Ok(id)
    }

    /// Remove the row and fire DISCONNECTED once the channel dies.
    fn spawn_disconnect_watcher(&self, channel: &Channel) {
        // ---
        let server = self.clone();
        let id = channel.id().clone();
        let mut disconnected = channel.subscribe_disconnect();

        tokio::spawn(async move {
            let _ = disconnected.recv().await;

            if server.inner.clients.write().await.remove(&id).is_some() {
                log_debug!("connection {id} removed from registry");
                let _ = server.inner.disconnected_tx.send(id);
            }
        });
    }

    /// Channel of a registered client.
    pub async fn client(&self, id: &ConnectionId) -> Option<Channel> {
        // ---
        self.inner
            .clients
            .read()
            .await
            .get(id)
            .map(|row| row.channel.clone())
    }

    /// Credential presented by a registered client.
    pub async fn auth_token(&self, id: &ConnectionId) -> Option<String> {
        // ---
        self.inner
            .clients
            .read()
            .await
            .get(id)
            .map(|row| row.auth_token.clone())
    }

    /// Identities of every registered client.
    pub async fn client_ids(&self) -> Vec<ConnectionId> {
        self.inner.clients.read().await.keys().cloned().collect()
    }

    /// Number of registered clients.
    pub async fn client_count(&self) -> usize {
        self.inner.clients.read().await.len()
    }

    /// Tear down one client connection. Returns whether it was registered.
    ///
    /// Row removal and the DISCONNECTED notification follow through the
    /// channel's own disconnect path.
    pub async fn disconnect_client(&self, id: &ConnectionId) -> bool {
        // ---
        let channel = self.client(id).await;
        match channel {
            Some(channel) => {
                channel.disconnect().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every client connection.
    pub async fn disconnect_all(&self) {
        // ---
        let channels: Vec<Channel> = {
            let clients = self.inner.clients.read().await;
            clients.values().map(|row| row.channel.clone()).collect()
        };
        for channel in channels {
            channel.disconnect().await;
        }
    }

    /// Observe registrations.
    pub fn subscribe_connected(&self) -> broadcast::Receiver<ConnectionId> {
        self.inner.connected_tx.subscribe()
    }

    /// Observe removals.
    pub fn subscribe_disconnected(&self) -> broadcast::Receiver<ConnectionId> {
        self.inner.disconnected_tx.subscribe()
    }

    /// Invoke a named operation across clients, shaped by `opts`.
    ///
    /// Remote delivery fans out with at most `fanout_limit` calls in flight
    /// at once; outcomes accumulate in completion order.
    pub async fn emit(&self, name: &str, args: Vec<Value>, opts: EmitOptions) -> BroadcastOutcome {
        // ---
        if opts.local {
            return BroadcastOutcome::Local(self.run_local(name, args, opts.metadata).await);
        }

        let targets: Vec<(ConnectionId, Channel)> = {
            let clients = self.inner.clients.read().await;
            match &opts.to {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| {
                        clients
                            .get(id)
                            .map(|row| (id.clone(), row.channel.clone()))
                    })
                    .collect(),
                None => clients
                    .iter()
                    .map(|(id, row)| (id.clone(), row.channel.clone()))
                    .collect(),
            }
        };

        let calls = targets.into_iter().map(|(id, channel)| {
            let name = name.to_string();
            let args = args.clone();
            let metadata = opts.metadata.clone();
            let timeout = opts.timeout;
            async move {
                let outcome = channel
                    .emit_with_timeout(&name, metadata, args, timeout)
                    .await;
                (id, outcome)
            }
        });

        let mut results = stream::iter(calls).buffer_unordered(self.inner.config.fanout_limit);

        if opts.first_result {
            return BroadcastOutcome::First(results.next().await);
        }

        let mut map = HashMap::new();
        while let Some((id, outcome)) = results.next().await {
            map.insert(id, outcome);
        }
        BroadcastOutcome::All(map)
    }

    async fn run_local(&self, name: &str, args: Vec<Value>, metadata: Metadata) -> Vec<Value> {
        // ---
        let ctx = CallContext::tag(Source::Local, metadata);
        match self.inner.handlers.get(name) {
            Some(handler) => handler(args, ctx).await,
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory;
    use serde_json::json;

    fn fast_config() -> SockConfig {
        // ---
        SockConfig::new()
            .with_settle_delay(Duration::from_millis(1))
            .with_handshake_step_timeout(Duration::from_millis(300))
            .with_return_timeout(Duration::from_millis(400))
    }

    /// Connect one in-memory client to the server: run the client handshake
    /// in a task, bring up a client-role channel with the given handlers,
    /// and return its server-assigned identity.
    async fn attach_client(server: &RpcServer, handlers: Arc<Handlers>) -> ConnectionId {
        // ---
        let (client_end, server_end) = memory::pair();
        let config = server.inner.config.clone();

        tokio::spawn(async move {
            let transport: TransportPtr = client_end.transport.clone();
            let mut events = client_end.events;

            let id = handshake::client_handshake(&transport, &mut events, &config, "jwt")
                .await
                .unwrap();

            let channel = Channel::new(transport, events, id, false, handlers, config);
            let mut gone = channel.subscribe_disconnect();
            let _ = gone.recv().await;
        });

        server
            .accept(server_end.transport, server_end.events)
            .await
            .unwrap()
    }

    fn echo_handlers(tag: &str) -> Arc<Handlers> {
        // ---
        let handlers = Handlers::new();
        let tag = tag.to_string();
        handlers.on("whoami", move |_args, _ctx| {
            let tag = tag.clone();
            async move { vec![json!(tag)] }
        });
        handlers
    }

    #[tokio::test]
    async fn test_accept_registers_and_notifies() {
        // ---
        let server = RpcServer::new(fast_config());
        let mut connected = server.subscribe_connected();

        let id = attach_client(&server, Handlers::new()).await;

        assert_eq!(server.client_count().await, 1);
        assert_eq!(server.auth_token(&id).await.as_deref(), Some("jwt"));
        assert_eq!(connected.recv().await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_validator_rejects_bad_credential() {
        // ---
        let validator: CredentialValidator = Arc::new(|token| token == "expected");
        let server = RpcServer::with_validator(fast_config(), validator);

        let (client_end, server_end) = memory::pair();
        let config = server.inner.config.clone();

        tokio::spawn(async move {
            let transport: TransportPtr = client_end.transport.clone();
            let mut events = client_end.events;
            let _ = handshake::client_handshake(&transport, &mut events, &config, "wrong").await;
        });

        let err = server
            .accept(server_end.transport, server_end.events)
            .await
            .unwrap_err();
        assert!(matches!(err, SockError::Handshake { .. }));
        assert_eq!(server.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_targeted_broadcast_hits_exactly_the_named_clients() {
        // ---
        let server = RpcServer::new(fast_config());

        let a = attach_client(&server, echo_handlers("a")).await;
        let b = attach_client(&server, echo_handlers("b")).await;
        let _c = attach_client(&server, echo_handlers("c")).await;

        let opts = EmitOptions::new().to([a.clone(), b.clone(), ConnectionId::from("WS-ghost")]);
        let outcome = server.emit("whoami", vec![], opts).await;

        let BroadcastOutcome::All(map) = outcome else {
            panic!("expected full map");
        };
        assert_eq!(map.len(), 2);
        assert_eq!(map[&a], CallOutcome::Returned(vec![json!("a")]));
        assert_eq!(map[&b], CallOutcome::Returned(vec![json!("b")]));
    }

    #[tokio::test]
    async fn test_first_result_on_empty_registry_is_none() {
        // ---
        let server = RpcServer::new(fast_config());

        let outcome = server
            .emit("whoami", vec![], EmitOptions::new().first_result())
            .await;
        assert_eq!(outcome, BroadcastOutcome::First(None));
    }

    #[tokio::test]
    async fn test_local_emit_runs_server_handlers() {
        // ---
        let server = RpcServer::new(fast_config());
        server.on("status", |_args, _ctx| async { vec![json!("ok")] });

        let outcome = server.emit("status", vec![], EmitOptions::new().local()).await;
        assert_eq!(outcome, BroadcastOutcome::Local(vec![json!("ok")]));
    }

    #[tokio::test]
    async fn test_disconnect_client_removes_row_and_notifies() {
        // ---
        let server = RpcServer::new(fast_config());
        let mut disconnected = server.subscribe_disconnected();

        let id = attach_client(&server, Handlers::new()).await;
        assert!(server.disconnect_client(&id).await);

        assert_eq!(disconnected.recv().await.unwrap(), id);
        assert_eq!(server.client_count().await, 0);
        assert!(!server.disconnect_client(&id).await);
    }

    #[tokio::test]
    async fn test_unresponsive_recipient_does_not_disturb_the_rest() {
        // ---
        let server = RpcServer::new(fast_config());

        let a = attach_client(&server, echo_handlers("a")).await;

        // This client's handler never completes, so its RETURN never comes.
        let stuck = Handlers::new();
        stuck.on("whoami", |_args, _ctx| async {
            futures::future::pending::<()>().await;
            Vec::new()
        });
        let b = attach_client(&server, stuck).await;

        let opts = EmitOptions::new().timeout(Duration::from_millis(150));
        let outcome = server.emit("whoami", vec![], opts).await;
        let BroadcastOutcome::All(map) = outcome else {
            panic!("expected full map");
        };

        assert_eq!(map[&a], CallOutcome::Returned(vec![json!("a")]));
        assert_eq!(map[&b], CallOutcome::TimedOut);
    }
}
