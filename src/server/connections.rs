//! Connection serving shared by the HTTP and gRPC listeners.
//!
//! # Responsibilities
//! - Accept connections and serve each one in its own task
//! - Drain: stop accepting, let in-flight requests finish, close idle connections
//! - Kill: drop every remaining connection once the grace period is spent
//!
//! # Design Decisions
//! - Connection tasks live on a [`TaskTracker`], so the listener can wait for
//!   the last one before its unit is released
//! - HTTP/1 and HTTP/2 are detected per connection

use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::server::listener::{stop_within, StopOutcome};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Pause after a failed accept, e.g. when out of file descriptors.
const ACCEPT_ERROR_DELAY: Duration = Duration::from_millis(50);

/// The connections of one listener.
#[derive(Debug, Clone)]
pub struct Connections {
    tasks: TaskTracker,
    drain: CancellationToken,
    kill: CancellationToken,
}

impl Default for Connections {
    fn default() -> Self {
        Self::new()
    }
}

impl Connections {
    pub fn new() -> Self {
        Self {
            tasks: TaskTracker::new(),
            drain: CancellationToken::new(),
            kill: CancellationToken::new(),
        }
    }

    /// Number of connections currently being served.
    pub fn active(&self) -> usize {
        self.tasks.len()
    }

    /// Spawn the accept loop. It runs until [`Connections::stop`] starts draining.
    pub fn accept<S, B>(&self, name: String, listener: TcpListener, service: S) -> JoinHandle<()>
    where
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = this.drain.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::trace!(listener = %name, peer = %peer, "Connection accepted");
                        this.tasks.spawn(serve_connection(
                            stream,
                            service.clone(),
                            this.drain.clone(),
                            this.kill.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(listener = %name, error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_ERROR_DELAY).await;
                    }
                }
            }
            tracing::debug!(listener = %name, "Stopped accepting connections");
        })
    }

    /// Drain within `grace`, then kill whatever is left.
    ///
    /// Returns only after every connection task has ended.
    pub async fn stop(&self, name: &str, grace: Duration, accept: JoinHandle<()>) -> StopOutcome {
        self.drain.cancel();
        let tasks = self.tasks.clone();
        let drained = tokio::spawn(async move {
            let _ = accept.await;
            tasks.close();
            tasks.wait().await;
        });

        let outcome = stop_within(name, grace, drained).await;
        if outcome == StopOutcome::Forced {
            self.kill.cancel();
            self.tasks.close();
            self.tasks.wait().await;
            tracing::debug!(listener = name, "Remaining connections dropped");
        }
        outcome
    }

    /// Drop every connection at once, without draining.
    pub async fn abort(&self) {
        self.drain.cancel();
        self.kill.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }
}

async fn serve_connection<S, B>(
    stream: TcpStream,
    service: S,
    drain: CancellationToken,
    kill: CancellationToken,
) where
    S: Service<Request<Incoming>, Response = Response<B>> + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let builder = Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "Connection ended with error");
                }
                return;
            }
            _ = drain.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = kill.cancelled() => {
                tracing::debug!("Connection terminated");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::service_fn;
    use std::convert::Infallible;

    async fn slow_service(_req: Request<Incoming>) -> Result<Response<String>, Infallible> {
        tokio::time::sleep(Duration::from_millis(500)).await;
        Ok(Response::new("done".to_string()))
    }

    #[tokio::test]
    async fn idle_listener_stops_gracefully() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let connections = Connections::new();
        let accept = connections.accept("idle".into(), listener, service_fn(slow_service));

        let outcome = connections.stop("idle", Duration::from_millis(100), accept).await;
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(connections.active(), 0);
    }

    #[tokio::test]
    async fn forced_stop_ends_open_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Connections::new();
        let accept = connections.accept("slow".into(), listener, service_fn(slow_service));

        let request = tokio::spawn(reqwest::get(format!("http://{}/", addr)));
        tokio::time::timeout(Duration::from_secs(1), async {
            while connections.active() == 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("connection should be accepted");
        // Let the request reach the service.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = connections.stop("slow", Duration::from_millis(50), accept).await;
        assert_eq!(outcome, StopOutcome::Forced);
        assert_eq!(connections.active(), 0);
        assert!(request.await.unwrap().is_err());
    }
}
