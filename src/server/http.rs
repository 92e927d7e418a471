//! HTTP listener.
//!
//! # Responsibilities
//! - Serve an Axum router on one bind address
//! - Wire up middleware (request logging, request ID / metadata)
//! - Graceful shutdown bounded by the listener's grace period; connections
//!   still open when it runs out are dropped
//!
//! # Design Decisions
//! - The request ID is resolved before logging so both log lines carry it
//! - Handlers read the request's [`Metadata`] from extensions

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::Router;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;

use crate::config::HttpListenerConfig;
use crate::metadata::{new_request_id, Metadata, REQUEST_ID_HEADER, REQUEST_ID_KEY};
use crate::server::connections::Connections;
use crate::server::listener::{Listener, ListenerError, ServeContext};

/// HTTP endpoint serving an Axum router.
pub struct HttpListener {
    name: String,
    bind_address: String,
    grace_period: Duration,
    router: Router,
}

impl HttpListener {
    pub fn new(
        name: impl Into<String>,
        bind_address: impl Into<String>,
        grace_period: Duration,
        router: Router,
    ) -> Self {
        Self {
            name: name.into(),
            bind_address: bind_address.into(),
            grace_period,
            router,
        }
    }

    pub fn from_config(config: &HttpListenerConfig, router: Router) -> Self {
        Self::new(
            config.name.as_str(),
            config.bind_address.as_str(),
            config.grace_period(),
            router,
        )
    }

    /// The router with the standard middleware applied.
    fn app(&self) -> Router {
        // Layers run outermost-last: metadata resolves the ID, then logging sees it.
        self.router
            .clone()
            .layer(middleware::from_fn(log_requests))
            .layer(middleware::from_fn(request_metadata))
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(self: Box<Self>, ctx: ServeContext) {
        let listener = match TcpListener::bind(&self.bind_address).await {
            Ok(listener) => listener,
            Err(source) => {
                ctx.reporter.fatal(ListenerError::Bind {
                    listener: self.name.clone(),
                    address: self.bind_address.clone(),
                    source,
                });
                return;
            }
        };
        let local_addr = listener.local_addr().ok();
        tracing::info!(
            listener = %self.name,
            address = ?local_addr,
            "HTTP listener bound"
        );

        let connections = Connections::new();
        let service = TowerToHyperService::new(self.app());
        let mut accept = connections.accept(self.name.clone(), listener, service);

        if let Some(health) = &ctx.health {
            health.set_serving(&self.name).await;
        }
        ctx.reporter.ready(&self.name);

        tokio::select! {
            _ = ctx.shutdown.cancelled() => {}
            result = &mut accept => {
                let reason = match result {
                    Ok(()) => "accept loop exited".to_string(),
                    Err(e) => e.to_string(),
                };
                ctx.reporter.fatal(ListenerError::Serve {
                    listener: self.name.clone(),
                    reason,
                });
                connections.abort().await;
                return;
            }
        }

        if let Some(health) = &ctx.health {
            health.set_not_serving(&self.name).await;
        }
        tracing::info!(listener = %self.name, "Shutting down HTTP listener");
        connections.stop(&self.name, self.grace_period, accept).await;
    }
}

/// Attach request [`Metadata`] and echo the request ID on the response.
pub async fn request_metadata(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id);

    let mut metadata = Metadata::with_request_id(id.as_str());
    for (name, value) in request.headers() {
        if name.as_str() == REQUEST_ID_HEADER || name.as_str() == REQUEST_ID_KEY {
            continue;
        }
        if let Ok(value) = value.to_str() {
            metadata.insert(name.as_str(), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&id) {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        request.extensions_mut().insert(metadata);

        let mut response = next.run(request).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        return response;
    }

    request.extensions_mut().insert(metadata);
    next.run(request).await
}

/// Log every request and its latency.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .extensions()
        .get::<Metadata>()
        .and_then(|md| md.request_id())
        .unwrap_or("-")
        .to_string();
    let started = Instant::now();

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        "incoming request"
    );

    let response = next.run(request).await;

    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        took = ?started.elapsed(),
        "served request"
    );
    response
}
