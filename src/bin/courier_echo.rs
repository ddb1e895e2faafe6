//! courier-echo: echo responder
//!
//! Answers every request on the configured routing key with its own payload
//! and acknowledges plain events. Handy for smoke-testing a broker setup.
//!
//! ## Configuration
//! - `amqp-courier.yaml` / `AMQP_COURIER_CONFIG` / `AMQP_COURIER__*`: client settings
//! - ECHO_EXCHANGE: exchange to bind to (default: amq.topic)
//! - ECHO_ROUTING_KEY: routing key to answer (default: echo)

use serde_json::Value;
use tracing::info;

use amqp_courier::utils::bootstrap::init_tracing;
use amqp_courier::{middleware, Client, ClientConfig, Flow, HandlerContext, HandlerError, UsageParams};

const DEFAULT_EXCHANGE: &str = "amq.topic";
const DEFAULT_ROUTING_KEY: &str = "echo";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClientConfig::load(None)?;
    let exchange = std::env::var("ECHO_EXCHANGE").unwrap_or_else(|_| DEFAULT_EXCHANGE.to_string());
    let routing_key =
        std::env::var("ECHO_ROUTING_KEY").unwrap_or_else(|_| DEFAULT_ROUTING_KEY.to_string());

    let client = Client::connect(&config)?;
    let queue = client.register(
        UsageParams::new(&exchange, &routing_key).with_handler_id("echo"),
        vec![middleware(|payload: Value, ctx: HandlerContext| async move {
            if ctx.is_request() {
                ctx.respond(payload).await?;
            } else {
                ctx.ack().await?;
            }
            Ok::<_, HandlerError>(Flow::Done)
        })],
    )?;
    client.listen();

    info!(
        queue = %queue,
        exchange = %exchange,
        routing_key = %routing_key,
        "courier-echo started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    client.shutdown().await?;

    Ok(())
}
