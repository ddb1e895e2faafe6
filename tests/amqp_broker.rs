//! RabbitMQ integration tests using testcontainers.
//!
//! Run with: cargo test --test amqp_broker -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required, but Docker must be available.

use std::sync::Arc;
use std::time::Duration;

use amqp_courier::transport::AmqpTransport;
use amqp_courier::{
    middleware, Client, ClientConfig, ClientEvent, Flow, HandlerContext, HandlerError,
    MessageProperties, ReconnectPolicy, UsageParams,
};
use serde_json::{json, Value};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::{broadcast, mpsc};

const EXCHANGE: &str = "amq.topic";

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn client(url: &str, app_id: &str) -> Client {
    let config = ClientConfig::new(url).with_app_id(app_id);
    Client::with_reconnect(
        Arc::new(AmqpTransport::new()),
        &config,
        ReconnectPolicy::fixed(Duration::from_millis(200)),
    )
    .expect("Failed to build client")
}

async fn wait_for(events: &mut broadcast::Receiver<ClientEvent>, name: &str) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if events.recv().await.expect("Event bus closed").name() == name {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {name}"));
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_publish_and_consume() {
    let (_container, url) = start_rabbitmq().await;
    let consumer = client(&url, "consumer");
    let producer = client(&url, "producer");
    let routing_key = format!("test.{}", uuid::Uuid::new_v4().simple());

    let (tx, mut rx) = mpsc::unbounded_channel();
    consumer
        .register(
            UsageParams::new(EXCHANGE, &routing_key),
            vec![middleware(move |payload: Value, ctx: HandlerContext| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(payload);
                    ctx.ack().await?;
                    Ok::<_, HandlerError>(Flow::Done)
                }
            })],
        )
        .unwrap();
    let mut events = consumer.events();
    consumer.listen();
    wait_for(&mut events, "resubscribed").await;

    producer
        .publish(EXCHANGE, &routing_key, json!({ "hello": "rabbit" }), MessageProperties::default())
        .await
        .expect("Failed to publish");

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for message")
        .expect("Channel closed");
    assert_eq!(received, json!({ "hello": "rabbit" }));

    producer.shutdown().await.unwrap();
    consumer.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_request_reply_round_trip() {
    let (_container, url) = start_rabbitmq().await;
    let server = client(&url, "server");
    let caller = client(&url, "caller");

    server
        .register(
            UsageParams::new(EXCHANGE, "echo"),
            vec![middleware(|payload: Value, ctx: HandlerContext| async move {
                ctx.respond(payload).await?;
                Ok::<_, HandlerError>(Flow::Done)
            })],
        )
        .unwrap();
    let mut events = server.events();
    server.listen();
    wait_for(&mut events, "resubscribed").await;

    let reply = caller
        .request(EXCHANGE, "echo", json!([1, 2, 3]), MessageProperties::default())
        .await
        .expect("Request failed");
    assert_eq!(reply, json!({ "data": [1, 2, 3], "status": 200 }));

    server.shutdown().await.unwrap();
    caller.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_deleting_missing_queue_succeeds() {
    let (_container, url) = start_rabbitmq().await;
    let caller = client(&url, "caller");

    let result = caller
        .delete_queue(&UsageParams::for_queue("does-not-exist"))
        .await;
    assert!(result.is_ok());

    caller.shutdown().await.unwrap();
}
