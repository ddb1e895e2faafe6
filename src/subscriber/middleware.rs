//! Middleware chain.
//!
//! A chain is an ordered list of [`Layer`]s. Ordinary handlers run while no
//! error is pending; once a handler fails, remaining ordinary handlers are
//! skipped and the next error handler receives the error. An error handler
//! returning [`Flow::Next`] clears the error and resumes ordinary handlers;
//! returning an error passes it on; [`Flow::Done`] stops the chain.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use super::HandlerContext;
use crate::error::HandlerError;

/// What a handler asks the chain to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Continue with the following layer.
    Next,
    /// Stop; the message is handled.
    Done,
}

pub type HandlerResult = std::result::Result<Flow, HandlerError>;

/// Ordinary middleware: `(payload, ctx) -> Flow`.
pub trait Middleware: Send + Sync {
    fn handle(&self, payload: Value, ctx: HandlerContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F> Middleware for F
where
    F: Fn(Value, HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync,
{
    fn handle(&self, payload: Value, ctx: HandlerContext) -> BoxFuture<'static, HandlerResult> {
        self(payload, ctx)
    }
}

/// Error handler: `(error, payload, ctx) -> Flow`.
pub trait ErrorHandler: Send + Sync {
    fn handle(
        &self,
        error: HandlerError,
        payload: Value,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, HandlerResult>;
}

impl<F> ErrorHandler for F
where
    F: Fn(HandlerError, Value, HandlerContext) -> BoxFuture<'static, HandlerResult> + Send + Sync,
{
    fn handle(
        &self,
        error: HandlerError,
        payload: Value,
        ctx: HandlerContext,
    ) -> BoxFuture<'static, HandlerResult> {
        self(error, payload, ctx)
    }
}

/// One step of a chain, tagged with its role.
#[derive(Clone)]
pub enum Layer {
    Handler(Arc<dyn Middleware>),
    ErrorHandler(Arc<dyn ErrorHandler>),
}

impl Layer {
    pub fn handler(middleware: impl Middleware + 'static) -> Self {
        Self::Handler(Arc::new(middleware))
    }

    pub fn error_handler(handler: impl ErrorHandler + 'static) -> Self {
        Self::ErrorHandler(Arc::new(handler))
    }

    pub fn is_error_handler(&self) -> bool {
        matches!(self, Self::ErrorHandler(_))
    }
}

/// Ordinary middleware from an async closure.
pub fn middleware<F, Fut>(f: F) -> Layer
where
    F: Fn(Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Layer::handler(move |payload: Value, ctx: HandlerContext| -> BoxFuture<'static, HandlerResult> {
        f(payload, ctx).boxed()
    })
}

/// Error handler from an async closure.
pub fn error_handler<F, Fut>(f: F) -> Layer
where
    F: Fn(HandlerError, Value, HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Layer::error_handler(
        move |error: HandlerError,
              payload: Value,
              ctx: HandlerContext|
              -> BoxFuture<'static, HandlerResult> { f(error, payload, ctx).boxed() },
    )
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "middleware panicked".to_string()
    }
}

/// Await a layer, turning a panic into an error.
async fn invoke(step: impl FnOnce() -> BoxFuture<'static, HandlerResult>) -> HandlerResult {
    let guarded = AssertUnwindSafe(async move { step().await }).catch_unwind();
    match guarded.await {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic).into()),
    }
}

/// Run `layers` in order for one message.
///
/// Returns the error still pending when the chain ran out of layers.
pub(crate) async fn run_chain(
    layers: &[Layer],
    payload: &Value,
    ctx: &HandlerContext,
) -> Option<HandlerError> {
    let mut pending: Option<HandlerError> = None;

    for layer in layers {
        let outcome = match (layer, pending.take()) {
            (Layer::Handler(handler), None) => {
                invoke(|| handler.handle(payload.clone(), ctx.clone())).await
            }
            (Layer::ErrorHandler(handler), Some(error)) => {
                invoke(|| handler.handle(error, payload.clone(), ctx.clone())).await
            }
            (Layer::Handler(_), Some(error)) => {
                pending = Some(error);
                continue;
            }
            (Layer::ErrorHandler(_), None) => continue,
        };

        match outcome {
            Ok(Flow::Next) => {}
            Ok(Flow::Done) => return None,
            Err(error) => pending = Some(error),
        }
    }

    pending
}
