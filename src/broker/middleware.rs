//! Handler type and subscriber middleware.
//!
//! A middleware wraps a [`Handler`] and returns a new one. The chain is
//! composed once per subscription; each delivery runs the pre-built handler.
//! Layers are applied in order, so the last layer applied runs outermost.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::broker::event::Event;
use crate::metadata::{new_request_id, REQUEST_ID_HEADER, REQUEST_ID_KEY};

/// Error returned by a handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one event.
pub type HandlerResult = Result<(), HandlerError>;

/// A message handler.
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A middleware layer.
pub type Layer = fn(Handler) -> Handler;

/// The standard subscriber chain: logging, then metadata injection.
pub const DEFAULT_CHAIN: [Layer; 2] = [logging, metadata];

/// Turn an async closure into a [`Handler`].
pub fn handler_fn<F, Fut>(f: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

/// Wrap `handler` with each layer in order.
pub fn compose(handler: Handler, layers: &[Layer]) -> Handler {
    layers.iter().fold(handler, |inner, layer| layer(inner))
}

/// Logs every handled event with its duration and outcome.
pub fn logging(next: Handler) -> Handler {
    Arc::new(move |event: Event| {
        let next = Arc::clone(&next);
        async move {
            let routing_key = event.routing_key.clone();
            let request_id = event.context.request_id().map(str::to_string);
            let started = Instant::now();
            tracing::info!(
                routing_key = %routing_key,
                request_id = request_id.as_deref().unwrap_or("-"),
                "incoming event"
            );

            let result = next(event).await;

            match &result {
                Ok(()) => tracing::info!(
                    routing_key = %routing_key,
                    took = ?started.elapsed(),
                    "handled event"
                ),
                Err(e) => tracing::warn!(
                    routing_key = %routing_key,
                    took = ?started.elapsed(),
                    error = %e,
                    "event handler failed"
                ),
            }
            result
        }
        .boxed()
    })
}

/// Copies the correlation header into the event context, generating a
/// request ID when the publisher did not send one.
pub fn metadata(next: Handler) -> Handler {
    Arc::new(move |mut event: Event| {
        let id = event
            .headers
            .get(REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_request_id);
        for (key, value) in event.headers.iter() {
            if key != REQUEST_ID_HEADER {
                event.context.insert(key, value);
            }
        }
        event.context.insert(REQUEST_ID_KEY, id);
        next(event)
    })
}
