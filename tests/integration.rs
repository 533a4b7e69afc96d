use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use sockrpc::transport::memory;
use sockrpc::{
    //
    BroadcastOutcome,
    CallOutcome,
    Connector,
    EmitOptions,
    EventRx,
    Result,
    RpcClient,
    RpcServer,
    SockConfig,
    SockError,
    TransportPtr,
};

fn fast_config() -> SockConfig {
    // ---
    SockConfig::new()
        .with_settle_delay(Duration::from_millis(1))
        .with_handshake_step_timeout(Duration::from_millis(500))
        .with_connect_guard_timeout(Duration::from_millis(200))
        .with_return_timeout(Duration::from_millis(800))
}

/// Connector that dials the in-process server over a fresh memory pair.
struct MemoryConnector {
    // ---
    server: RpcServer,
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<(TransportPtr, EventRx)> {
        // ---
        let (client_end, server_end) = memory::pair();

        let server = self.server.clone();
        tokio::spawn(async move {
            let _ = server.accept(server_end.transport, server_end.events).await;
        });

        Ok((client_end.transport, client_end.events))
    }
}

struct Fixture {
    // ---
    server: RpcServer,
    config: SockConfig,
}

impl Fixture {
    // ---
    fn new() -> Self {
        let config = fast_config();
        let server = RpcServer::new(config.clone());

        server.on("add", |args, _ctx| async move {
            let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
            vec![json!(sum)]
        });
        server.on("ping", |_args, _ctx| async { vec![json!("pong")] });

        Self { server, config }
    }

    fn client(&self) -> RpcClient {
        // ---
        let connector = Arc::new(MemoryConnector {
            server: self.server.clone(),
        });
        RpcClient::new(connector, "jwt-secret", self.config.clone())
    }
}

#[tokio::test]
async fn test_ping_pong_round_trip() -> Result<()> {
    // ---
    let fixture = Fixture::new();
    let client = fixture.client();

    client.connect().await?;
    assert_eq!(fixture.server.client_count().await, 1);

    let outcome = client.call("ping", vec![]).await?;
    assert_eq!(outcome, CallOutcome::Returned(vec![json!("pong")]));

    Ok(())
}

#[tokio::test]
async fn test_concurrent_calls() {
    // ---
    let fixture = Fixture::new();
    let client = fixture.client();
    client.connect().await.unwrap();

    let mut handles = Vec::new();

    for i in 0..10i64 {
        // ---
        let c = client.clone();

        handles.push(tokio::spawn(async move {
            c.call("add", vec![json!(i), json!(i)]).await.unwrap()
        }));
    }

    for (i, task) in handles.into_iter().enumerate() {
        let outcome = task.await.unwrap();
        assert_eq!(outcome, CallOutcome::Returned(vec![json!((i as i64) * 2)]));
    }
}

#[tokio::test]
async fn test_server_push_to_client() -> Result<()> {
    // ---
    let fixture = Fixture::new();
    let client = fixture.client();

    client.on("greet", |args, _ctx| async move {
        let name = args.first().and_then(Value::as_str).unwrap_or("nobody");
        vec![json!(format!("hello {name}"))]
    });

    client.connect().await?;
    let id = client.connection_id().await.unwrap();

    let opts = EmitOptions::new().to([id.clone()]);
    let outcome = fixture.server.emit("greet", vec![json!("world")], opts).await;

    let BroadcastOutcome::All(map) = outcome else {
        panic!("expected full map");
    };
    assert_eq!(map.len(), 1);
    assert_eq!(
        map[&id],
        CallOutcome::Returned(vec![json!("hello world")])
    );

    Ok(())
}

#[tokio::test]
async fn test_targeted_broadcast_skips_unnamed_clients() -> Result<()> {
    // ---
    let fixture = Fixture::new();

    let hits = Arc::new(AtomicUsize::new(0));

    let mut ids = Vec::new();
    let mut clients = Vec::new();
    for _ in 0..3 {
        let client = fixture.client();
        let hits = hits.clone();
        client.on("mark", move |_args, _ctx| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                vec![json!(true)]
            }
        });
        client.connect().await?;
        ids.push(client.connection_id().await.unwrap());
        clients.push(client);
    }

    let opts = EmitOptions::new().to([ids[0].clone(), ids[1].clone()]);
    let outcome = fixture.server.emit("mark", vec![], opts).await;

    let BroadcastOutcome::All(map) = outcome else {
        panic!("expected full map");
    };
    assert_eq!(map.len(), 2);
    assert!(map.contains_key(&ids[0]));
    assert!(map.contains_key(&ids[1]));
    assert!(!map.contains_key(&ids[2]));
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    Ok(())
}

#[tokio::test]
async fn test_first_result_on_empty_registry() {
    // ---
    let fixture = Fixture::new();

    let outcome = fixture
        .server
        .emit("ping", vec![], EmitOptions::new().first_result())
        .await;
    assert_eq!(outcome, BroadcastOutcome::First(None));
}

#[tokio::test]
async fn test_guard_timeout_without_auto_reconnect() {
    // ---
    let fixture = Fixture::new();
    let config = fixture.config.clone().with_auto_reconnect(false);

    let connector = Arc::new(MemoryConnector {
        server: fixture.server.clone(),
    });
    let client = RpcClient::new(connector, "jwt-secret", config);

    // Never connected, never asked to connect: the guard expires.
    let err = client.call("ping", vec![]).await.unwrap_err();
    assert!(matches!(err, SockError::ConnectionTimeout(_)));
}

#[tokio::test]
async fn test_local_call_stays_off_the_wire() -> Result<()> {
    // ---
    let fixture = Fixture::new();

    // Same name on the server; it must never run for a local call.
    let server_hits = Arc::new(AtomicUsize::new(0));
    {
        let server_hits = server_hits.clone();
        fixture.server.on("report", move |_args, _ctx| {
            let server_hits = server_hits.clone();
            async move {
                server_hits.fetch_add(1, Ordering::SeqCst);
                vec![json!("server")]
            }
        });
    }

    let client = fixture.client();
    client.on("report", |_args, _ctx| async { vec![json!("client")] });
    client.connect().await?;

    let values = client.call_local("report", vec![]).await?;
    assert_eq!(values, vec![json!("client")]);
    assert_eq!(server_hits.load(Ordering::SeqCst), 0);

    // The same name over the wire does reach the server.
    let outcome = client.call("report", vec![]).await?;
    assert_eq!(outcome, CallOutcome::Returned(vec![json!("server")]));
    assert_eq!(server_hits.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_reconnect_restores_service() -> Result<()> {
    // ---
    let fixture = Fixture::new();
    let client = fixture.client();

    client.connect().await?;
    let first_id = client.connection_id().await.unwrap();

    client.disconnect().await;
    assert!(!client.is_connected());

    // The pre-call guard reconnects on demand.
    let outcome = client.call("ping", vec![]).await?;
    assert_eq!(outcome, CallOutcome::Returned(vec![json!("pong")]));

    let second_id = client.connection_id().await.unwrap();
    assert_ne!(first_id, second_id);

    Ok(())
}
