//! Middleware pipeline: an ordered list of interceptors executed
//! before route dispatch.
//!
//! Each middleware returns an explicit [`Action`] instead of calling a
//! continuation: `Continue` passes control to the next entry,
//! `ShortCircuit` terminates the chain with a response. Forgetting to
//! continue is unrepresentable.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::error::ApiError;
use crate::request::{HttpResponse, RequestContext, WsRequest};

/// The action a middleware returns from `handle`.
pub enum Action {
    /// Pass the (possibly modified) request to the next middleware.
    Continue,
    /// Stop the chain and return this response immediately.
    ShortCircuit(HttpResponse),
}

/// A pipeline stage with the power to inspect/mutate the request,
/// short-circuit the response, or continue to the next stage.
pub trait Middleware: Send + Sync {
    /// Name for log events.
    fn name(&self) -> &'static str;

    fn handle<'a>(&'a self, ctx: &'a mut RequestContext)
        -> BoxFuture<'a, Result<Action, ApiError>>;
}

/// Type-erased route handler.
pub type Handler =
    Arc<dyn Fn(RequestContext) -> BoxFuture<'static, Result<HttpResponse, ApiError>> + Send + Sync>;

/// The upgraded WebSocket stream handed to WS handlers.
pub type WsStream = tokio_tungstenite::WebSocketStream<TokioIo<Upgraded>>;

/// Type-erased WebSocket handler, invoked with the completed socket
/// and a snapshot of the upgrade request.
pub type WsHandler = Arc<dyn Fn(WsStream, WsRequest) -> BoxFuture<'static, ()> + Send + Sync>;

/// Box an async closure into a [`Handler`].
pub fn into_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HttpResponse, ApiError>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Box an async closure into a [`WsHandler`].
pub fn into_ws_handler<F, Fut>(f: F) -> WsHandler
where
    F: Fn(WsStream, WsRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ws, req| Box::pin(f(ws, req)))
}

/// Run the pipeline in registration order.
///
/// Stops at the first middleware that short-circuits or fails; errors
/// are mapped to responses by the dispatcher.
pub async fn run(
    stack: &[Arc<dyn Middleware>],
    ctx: &mut RequestContext,
) -> Result<Action, ApiError> {
    for mw in stack {
        match mw.handle(ctx).await? {
            Action::Continue => {}
            Action::ShortCircuit(response) => {
                debug!(
                    event = memgate_telemetry::events::MIDDLEWARE_SHORT_CIRCUIT,
                    middleware = mw.name(),
                    path = %ctx.path,
                    status = response.status().as_u16(),
                );
                return Ok(Action::ShortCircuit(response));
            }
        }
    }
    Ok(Action::Continue)
}
