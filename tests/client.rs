//! End-to-end client behaviour over the in-memory broker.
//!
//! Run with: cargo test --test client

use std::sync::Arc;
use std::time::{Duration, Instant};

use amqp_courier::transport::MemoryBroker;
use amqp_courier::{
    error_handler, middleware, Client, ClientConfig, ClientError, ClientEvent, Flow,
    HandlerContext, HandlerError, Layer, MessageProperties, ReconnectPolicy, UsageParams,
};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

const EXCHANGE: &str = "amq.topic";

fn client(broker: &MemoryBroker, app_id: &str) -> Client {
    let mut config = ClientConfig::new("amqp://memory").with_app_id(app_id);
    config.request_timeout_ms = 1000;
    Client::with_reconnect(
        Arc::new(broker.transport()),
        &config,
        ReconnectPolicy::fixed(Duration::from_millis(10)),
    )
    .expect("Failed to build client")
}

async fn wait_for(events: &mut broadcast::Receiver<ClientEvent>, name: &str) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.expect("Event bus closed");
            if event.name() == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {name}"))
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timed out")
        .expect("Sender dropped")
}

/// Responds with `reply(payload)`.
fn responder(reply: fn(Value) -> Value) -> Layer {
    middleware(move |payload: Value, ctx: HandlerContext| async move {
        ctx.respond(reply(payload)).await?;
        Ok::<_, HandlerError>(Flow::Done)
    })
}

/// Listen on `client` and wait until every usage is bound.
async fn listening(client: &Client) {
    let mut events = client.events();
    client.listen();
    wait_for(&mut events, "resubscribed").await;
}

#[tokio::test]
async fn test_published_event_reaches_subscriber() {
    let broker = MemoryBroker::new();
    let consumer = client(&broker, "consumer");
    let producer = client(&broker, "producer");

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .register(
            UsageParams::new(EXCHANGE, "orders.created"),
            vec![middleware(move |payload: Value, ctx: HandlerContext| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((payload, ctx.message().app_id().map(str::to_string)));
                    ctx.ack().await?;
                    Ok::<_, HandlerError>(Flow::Done)
                }
            })],
        )
        .unwrap();
    listening(&consumer).await;

    producer
        .publish(EXCHANGE, "orders.created", json!({ "id": 7 }), MessageProperties::default())
        .await
        .unwrap();

    let (payload, app_id) = recv(&mut rx).await;
    assert_eq!(payload, json!({ "id": 7 }));
    assert_eq!(app_id.as_deref(), Some("producer"));
}

#[tokio::test]
async fn test_request_resolves_with_responded_data() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "server");
    let caller = client(&broker, "caller");

    server
        .register(
            UsageParams::new(EXCHANGE, "math.square"),
            vec![responder(|payload| json!(payload["n"].as_i64().unwrap_or_default().pow(2)))],
        )
        .unwrap();
    listening(&server).await;

    let reply = caller
        .request(EXCHANGE, "math.square", json!({ "n": 9 }), MessageProperties::default())
        .await
        .unwrap();

    assert_eq!(reply, json!({ "data": 81, "status": 200 }));
}

#[tokio::test]
async fn test_reject_and_respond_fails_the_request() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "server");
    let caller = client(&broker, "caller");

    server
        .register(
            UsageParams::new(EXCHANGE, "accounts.open"),
            vec![middleware(|_payload: Value, ctx: HandlerContext| async move {
                ctx.reject_and_respond(json!("account exists")).await?;
                Ok::<_, HandlerError>(Flow::Done)
            })],
        )
        .unwrap();
    listening(&server).await;

    let error = caller
        .request(EXCHANGE, "accounts.open", json!({}), MessageProperties::default())
        .await
        .unwrap_err();

    assert_eq!(
        error.rejection(),
        Some(&json!({ "error": "account exists", "status": 500 }))
    );
}

#[tokio::test]
async fn test_request_without_reply_times_out_after_deadline() {
    let broker = MemoryBroker::new();
    let mut config = ClientConfig::new("amqp://memory").with_app_id("caller");
    config.request_timeout_ms = 200;
    let caller = Client::with_transport(Arc::new(broker.transport()), &config).unwrap();

    let started = Instant::now();
    let error = caller
        .request(EXCHANGE, "nobody.home", json!({}), MessageProperties::default())
        .await
        .unwrap_err();

    assert!(error.is_timeout());
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(caller.requester().pending(), 0);
}

#[tokio::test]
async fn test_next_hands_over_to_following_middleware() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "server");
    let caller = client(&broker, "caller");

    server
        .register(
            UsageParams::new(EXCHANGE, "chain.ok"),
            vec![
                middleware(|_payload: Value, _ctx: HandlerContext| async move {
                    Ok::<_, HandlerError>(Flow::Next)
                }),
                responder(|_| json!("from second")),
            ],
        )
        .unwrap();
    listening(&server).await;

    let reply = caller
        .request(EXCHANGE, "chain.ok", json!(null), MessageProperties::default())
        .await
        .unwrap();
    assert_eq!(reply["data"], json!("from second"));
}

#[tokio::test]
async fn test_error_skips_middleware_and_reaches_error_handler() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "server");
    let caller = client(&broker, "caller");
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let skipped = tx.clone();
    server
        .register(
            UsageParams::new(EXCHANGE, "chain.err"),
            vec![
                middleware(|_payload: Value, _ctx: HandlerContext| async move {
                    Err::<Flow, HandlerError>("invalid order".into())
                }),
                middleware(move |_payload: Value, ctx: HandlerContext| {
                    let skipped = skipped.clone();
                    async move {
                        let _ = skipped.send("second middleware ran".to_string());
                        ctx.respond(json!("unexpected")).await?;
                        Ok::<_, HandlerError>(Flow::Done)
                    }
                }),
            ],
        )
        .unwrap();
    server.register_global([error_handler(
        move |error: HandlerError, _payload: Value, ctx: HandlerContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(error.to_string());
                ctx.reject_and_respond_with_status(json!(error.to_string()), 400)
                    .await?;
                Ok::<_, HandlerError>(Flow::Done)
            }
        },
    )]);
    listening(&server).await;

    let error = caller
        .request(EXCHANGE, "chain.err", json!({}), MessageProperties::default())
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::Rejected(_)));
    assert_eq!(recv(&mut rx).await, "invalid order");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_multi_binding_delivers_to_both_queues() {
    let broker = MemoryBroker::new();
    let billing = client(&broker, "billing");
    let shipping = client(&broker, "shipping");
    let producer = client(&broker, "producer");
    let (tx, mut rx) = mpsc::unbounded_channel();

    for subscriber in [&billing, &shipping] {
        let tx = tx.clone();
        let app_id = subscriber.app_id().to_string();
        subscriber
            .register(
                UsageParams::new(EXCHANGE, "orders.paid"),
                vec![middleware(move |_payload: Value, ctx: HandlerContext| {
                    let tx = tx.clone();
                    let app_id = app_id.clone();
                    async move {
                        let _ = tx.send(app_id);
                        ctx.ack().await?;
                        Ok::<_, HandlerError>(Flow::Done)
                    }
                })],
            )
            .unwrap();
        listening(subscriber).await;
    }

    producer
        .publish(EXCHANGE, "orders.paid", json!({}), MessageProperties::default())
        .await
        .unwrap();

    let mut receivers = vec![recv(&mut rx).await, recv(&mut rx).await];
    receivers.sort();
    assert_eq!(receivers, vec!["billing", "shipping"]);
}

#[tokio::test]
async fn test_requests_work_again_after_connection_loss() {
    let broker = MemoryBroker::new();
    let server = client(&broker, "server");
    let caller = client(&broker, "caller");

    server
        .register(UsageParams::new(EXCHANGE, "ping"), vec![responder(|_| json!("pong"))])
        .unwrap();
    listening(&server).await;

    let first = caller
        .request(EXCHANGE, "ping", json!({}), MessageProperties::default())
        .await
        .unwrap();
    assert_eq!(first["data"], json!("pong"));

    let mut server_events = server.events();
    broker.disconnect_all();
    wait_for(&mut server_events, "resubscribed").await;

    let again = caller
        .request(EXCHANGE, "ping", json!({}), MessageProperties::default())
        .await
        .unwrap();
    assert_eq!(again["data"], json!("pong"));
}

#[tokio::test]
async fn test_shutdown_drains_and_disconnects() {
    let broker = MemoryBroker::new();
    let producer = client(&broker, "producer");

    producer
        .send_to_queue("audit", json!({ "entry": 1 }), MessageProperties::default())
        .await
        .unwrap();
    assert_eq!(producer.publisher().pending(), 0);

    producer.shutdown().await.unwrap();
    assert_eq!(broker.open_connections(), 0);
}
