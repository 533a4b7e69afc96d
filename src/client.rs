//! Client-side connection lifecycle.
//!
//! [`RpcClient`] owns the connect / handshake / reconnect state machine and
//! hands every live connection to a [`Channel`]. Handlers are registered on
//! the client and survive reconnects; each new connection gets a fresh
//! channel over the same registry.
//!
//! The actual socket is behind the [`Connector`] seam: the client asks it
//! for a fresh transport whenever it (re)connects and never touches socket
//! concerns itself.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};

use crate::channel::{CallOutcome, Channel, Handlers};
use crate::config::SockConfig;
use crate::error::{Result, SockError};
use crate::handshake;
use crate::ids::ConnectionId;
use crate::macros::{log_debug, log_error, log_info};
use crate::protocol::Metadata;
use crate::transport::{EventRx, TransportPtr};

/// Factory for fresh transport connections.
///
/// Each [`connect`](Connector::connect) call must yield a brand-new
/// transport and its event stream; the client never reuses a dead one.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new transport to the server.
    async fn connect(&self) -> Result<(TransportPtr, EventRx)>;
}

/// Observable client lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No live connection.
    Disconnected,
    /// A connect attempt (transport open + handshake) is in flight.
    Connecting,
    /// Handshake completed; calls flow.
    Connected,
}

/// RPC client over a persistent duplex connection.
///
/// Cheap to clone; all clones share the same lifecycle, handlers, and
/// channel.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    // ---
    connector: Arc<dyn Connector>,
    auth_token: String,
    config: SockConfig,
    handlers: Arc<Handlers>,
    state_tx: watch::Sender<ClientState>,

    /// Current channel, if any. The mutex also serializes connect attempts.
    channel: Mutex<Option<Channel>>,
}

impl RpcClient {
    // ---
    /// Create a client. No connection is attempted until
    /// [`connect`](Self::connect).
    pub fn new(
        connector: Arc<dyn Connector>,
        auth_token: impl Into<String>,
        config: SockConfig,
    ) -> Self {
        // ---
        Self {
            inner: Arc::new(ClientInner {
                connector,
                auth_token: auth_token.into(),
                config,
                handlers: Handlers::new(),
                state_tx: watch::channel(ClientState::Disconnected).0,
                channel: Mutex::new(None),
            }),
        }
    }

    /// Register an async handler for a named operation.
    ///
    /// Registrations live on the client, not the connection, so they apply
    /// to every channel across reconnects.
    pub fn on<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<Value>, crate::channel::CallContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Vec<Value>> + Send + 'static,
    {
        self.inner.handlers.on(name, handler);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state_tx.borrow()
    }

    /// Watch lifecycle state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state_tx.subscribe()
    }

    /// Whether a live, handshaken connection exists right now.
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// The server-assigned identity of the current connection, if any.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        // ---
        let slot = self.inner.channel.lock().await;
        slot.as_ref()
            .filter(|channel| !channel.is_disconnected())
            .map(|channel| channel.id().clone())
    }

    /// Establish a connection: open a transport via the connector, run the
    /// handshake, and bring up a channel.
    ///
    /// Returns `Ok(true)` when a new connection was established and
    /// `Ok(false)` when one already exists. On failure the error
    /// propagates and the reconnect policy applies: with `auto_reconnect`
    /// the attempt is retried in the background, otherwise the client
    /// stays DISCONNECTED.
    pub async fn connect(&self) -> Result<bool> {
        // ---
        let mut slot = self.inner.channel.lock().await;
        if matches!(&*slot, Some(channel) if !channel.is_disconnected()) {
            return Ok(false);
        }

        self.inner.state_tx.send_replace(ClientState::Connecting);

        let channel = match self.establish().await {
            Ok(channel) => channel,
            Err(err) => {
                self.inner.state_tx.send_replace(ClientState::Disconnected);

                // A failed attempt feeds the same policy as a lost
                // connection: retry immediately while auto_reconnect is on.
                // The caller still sees this attempt's failure.
                if self.inner.config.auto_reconnect {
                    self.spawn_retry();
                }

                return Err(err);
            }
        };

        log_info!("client connected as {}", channel.id());

        self.spawn_disconnect_watcher(&channel);
        *slot = Some(channel);
        self.inner.state_tx.send_replace(ClientState::Connected);

        Ok(true)
    }

    /// Retry a failed connect attempt in the background.
    ///
    /// Lives in its own (non-async) fn so `connect`'s future type does not
    /// contain a task that awaits itself.
    fn spawn_retry(&self) {
        // ---
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(_err) = client.connect().await {
                log_error!("reconnect attempt failed: {_err}");
            }
        });
    }

    async fn establish(&self) -> Result<Channel> {
        // ---
        let (transport, mut events) = self.inner.connector.connect().await?;

        let id = handshake::client_handshake(
            &transport,
            &mut events,
            &self.inner.config,
            &self.inner.auth_token,
        )
        .await?;

        Ok(Channel::new(
            transport,
            events,
            id,
            false,
            self.inner.handlers.clone(),
            self.inner.config.clone(),
        ))
    }

    /// Tear down the current connection, if any. Idempotent.
    pub async fn disconnect(&self) {
        // ---
        let taken = self.inner.channel.lock().await.take();
        if let Some(channel) = taken {
            channel.disconnect().await;
        }
        self.inner.state_tx.send_replace(ClientState::Disconnected);
    }

    /// Tear down the current connection and establish a new one.
    pub async fn reconnect(&self) -> Result<bool> {
        // ---
        self.disconnect().await;
        self.connect().await
    }

    /// Invoke a named operation on the server.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<CallOutcome> {
        // ---
        let channel = self.guard().await?;
        Ok(channel.emit(name, args).await)
    }

    /// Like [`call`](Self::call), with application metadata attached.
    pub async fn call_with_meta(
        &self,
        name: &str,
        metadata: Metadata,
        args: Vec<Value>,
    ) -> Result<CallOutcome> {
        // ---
        let channel = self.guard().await?;
        Ok(channel.emit_with_meta(name, metadata, args).await)
    }

    /// Invoke a named operation strictly in-process, never crossing the
    /// wire.
    pub async fn call_local(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        // ---
        let channel = self.guard().await?;
        Ok(channel.emit_local(name, args).await)
    }

    /// Pre-call connected guard.
    ///
    /// A call issued while disconnected waits up to the guard window for
    /// the state to become CONNECTED. On expiry the policy is a single
    /// reconnect attempt when `auto_reconnect` is on, otherwise a
    /// connection-timeout error.
    async fn guard(&self) -> Result<Channel> {
        // ---
        if let Some(channel) = self.live_channel().await {
            return Ok(channel);
        }

        // Collapse to a bool so no watch guard is held across the awaits
        // below.
        let mut state_rx = self.inner.state_tx.subscribe();
        let connected = tokio::time::timeout(
            self.inner.config.connect_guard_timeout,
            state_rx.wait_for(|state| *state == ClientState::Connected),
        )
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);

        if connected {
            if let Some(channel) = self.live_channel().await {
                return Ok(channel);
            }
        }

        if !self.inner.config.auto_reconnect {
            return Err(SockError::ConnectionTimeout("client.call_guard"));
        }

        log_debug!("call guard expired, attempting reconnect");
        self.reconnect().await?;
        self.live_channel()
            .await
            .ok_or(SockError::NotConnected("client.call_guard"))
    }

    async fn live_channel(&self) -> Option<Channel> {
        // ---
        let slot = self.inner.channel.lock().await;
        slot.clone().filter(|channel| !channel.is_disconnected())
    }

    /// Watch the channel's DISCONNECTED notification and apply the
    /// reconnect policy.
    fn spawn_disconnect_watcher(&self, channel: &Channel) {
        // ---
        let client = self.clone();
        let watched_id = channel.id().clone();
        let mut disconnected = channel.subscribe_disconnect();

        tokio::spawn(async move {
            // Resolves on the notification or when the channel is dropped.
            let _ = disconnected.recv().await;

            {
                let mut slot = client.inner.channel.lock().await;
                // A reconnect may already have installed a newer channel.
                match &*slot {
                    Some(current) if *current.id() == watched_id => {
                        *slot = None;
                    }
                    _ => return,
                }
            }
            client
                .inner
                .state_tx
                .send_replace(ClientState::Disconnected);

            log_info!("connection {watched_id} lost");

            if client.inner.config.auto_reconnect {
                if let Err(_err) = client.connect().await {
                    log_error!("reconnect after disconnect failed: {_err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::memory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> SockConfig {
        // ---
        SockConfig::new()
            .with_settle_delay(Duration::from_millis(1))
            .with_handshake_step_timeout(Duration::from_millis(300))
            .with_connect_guard_timeout(Duration::from_millis(100))
            .with_return_timeout(Duration::from_millis(500))
    }

    /// Connector backed by in-memory pairs. Each connect spawns a
    /// server-side task that handshakes and then answers calls with an
    /// echoing channel.
    struct MemoryConnector {
        config: SockConfig,
    }

    #[async_trait::async_trait]
    impl Connector for MemoryConnector {
        async fn connect(&self) -> Result<(TransportPtr, EventRx)> {
            // ---
            let (client_end, server_end) = memory::pair();
            let config = self.config.clone();

            tokio::spawn(async move {
                let transport: TransportPtr = server_end.transport.clone();
                let mut events = server_end.events;
                let id = ConnectionId::generate();

                if crate::handshake::server_handshake(&transport, &mut events, &config, &id)
                    .await
                    .is_err()
                {
                    return;
                }

                let handlers = Handlers::new();
                handlers.on("echo", |args, _ctx| async move { args });

                let channel = Channel::new(transport, events, id, true, handlers, config);
                let mut gone = channel.subscribe_disconnect();
                let _ = gone.recv().await;
            });

            Ok((client_end.transport, client_end.events))
        }
    }

    fn test_client(config: SockConfig) -> RpcClient {
        // ---
        let connector = Arc::new(MemoryConnector {
            config: config.clone(),
        });
        RpcClient::new(connector, "jwt-secret", config)
    }

    /// Connector whose first dial fails; later dials behave normally.
    struct FlakyConnector {
        attempts: AtomicUsize,
        inner: MemoryConnector,
    }

    #[async_trait::async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self) -> Result<(TransportPtr, EventRx)> {
            // ---
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(SockError::Transport("dial refused".into()));
            }
            self.inner.connect().await
        }
    }

    /// Connector that never produces a transport.
    struct DeadConnector;

    #[async_trait::async_trait]
    impl Connector for DeadConnector {
        async fn connect(&self) -> Result<(TransportPtr, EventRx)> {
            Err(SockError::NotConnected("test.dead_connector"))
        }
    }

    #[tokio::test]
    async fn test_connect_and_call_round_trip() {
        // ---
        let client = test_client(fast_config());

        assert!(client.connect().await.unwrap());
        assert!(client.is_connected());
        assert!(client.connection_id().await.is_some());

        // Connecting again is a no-op.
        assert!(!client.connect().await.unwrap());

        let outcome = client.call("echo", vec![json!("hi")]).await.unwrap();
        assert_eq!(outcome, CallOutcome::Returned(vec![json!("hi")]));
    }

    #[tokio::test]
    async fn test_call_local_runs_client_handlers() {
        // ---
        let client = test_client(fast_config());
        client.on("double", |args, _ctx| async move {
            args.iter()
                .filter_map(Value::as_i64)
                .map(|n| json!(n * 2))
                .collect()
        });

        client.connect().await.unwrap();
        let values = client.call_local("double", vec![json!(21)]).await.unwrap();
        assert_eq!(values, vec![json!(42)]);
    }

    #[tokio::test]
    async fn test_guard_without_auto_reconnect_times_out() {
        // ---
        let config = fast_config().with_auto_reconnect(false);
        let client = RpcClient::new(Arc::new(DeadConnector), "jwt", config);

        let err = client.call("echo", vec![]).await.unwrap_err();
        assert!(matches!(err, SockError::ConnectionTimeout(_)));
    }

    #[tokio::test]
    async fn test_guard_with_auto_reconnect_connects_on_demand() {
        // ---
        // Never explicitly connected; the first call's guard expires and
        // the reconnect policy brings the connection up.
        let client = test_client(fast_config());

        let outcome = client.call("echo", vec![json!(1)]).await.unwrap();
        assert_eq!(outcome, CallOutcome::Returned(vec![json!(1)]));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_failed_connect_feeds_reconnect_policy() {
        // ---
        let config = fast_config();
        let connector = Arc::new(FlakyConnector {
            attempts: AtomicUsize::new(0),
            inner: MemoryConnector {
                config: config.clone(),
            },
        });
        let client = RpcClient::new(connector, "jwt-secret", config);

        // The first attempt fails and is reported, but the policy keeps
        // retrying in the background.
        assert!(client.connect().await.is_err());

        let mut state_rx = client.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            state_rx.wait_for(|state| *state == ClientState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        let outcome = client.call("echo", vec![json!("back")]).await.unwrap();
        assert_eq!(outcome, CallOutcome::Returned(vec![json!("back")]));
    }

    #[tokio::test]
    async fn test_failed_connect_stays_down_without_auto_reconnect() {
        // ---
        let config = fast_config().with_auto_reconnect(false);
        let client = RpcClient::new(Arc::new(DeadConnector), "jwt", config);

        assert!(client.connect().await.is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent_and_observable() {
        // ---
        let config = fast_config().with_auto_reconnect(false);
        let connector = Arc::new(MemoryConnector {
            config: config.clone(),
        });
        let client = RpcClient::new(connector, "jwt", config);

        client.connect().await.unwrap();
        assert!(client.is_connected());

        client.disconnect().await;
        client.disconnect().await;
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(client.connection_id().await.is_none());
    }

    #[tokio::test]
    async fn test_auto_reconnect_after_peer_drop() {
        // ---
        let client = test_client(fast_config());
        client.connect().await.unwrap();

        let first_id = client.connection_id().await.unwrap();

        // Kill the live connection from underneath the client.
        let channel = client.live_channel().await.unwrap();
        channel.disconnect().await;

        // The watcher notices and reconnects with a fresh identity.
        let second_id = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match client.connection_id().await {
                    Some(id) if id != first_id => break id,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();

        assert_ne!(first_id, second_id);
        assert!(client.is_connected());
    }
}
