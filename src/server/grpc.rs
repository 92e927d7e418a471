//! gRPC listener.
//!
//! Serves a set of tonic services over HTTP/2 with the same drain and kill
//! behavior as the HTTP listener.

use std::time::Duration;

use async_trait::async_trait;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tonic::service::Routes;

use crate::config::GrpcListenerConfig;
use crate::server::connections::Connections;
use crate::server::listener::{Listener, ListenerError, ServeContext};

/// gRPC endpoint serving a set of tonic services.
pub struct GrpcListener {
    name: String,
    bind_address: String,
    grace_period: Duration,
    routes: Routes,
}

impl GrpcListener {
    pub fn new(
        name: impl Into<String>,
        bind_address: impl Into<String>,
        grace_period: Duration,
        routes: Routes,
    ) -> Self {
        Self {
            name: name.into(),
            bind_address: bind_address.into(),
            grace_period,
            routes,
        }
    }

    pub fn from_config(config: &GrpcListenerConfig, routes: Routes) -> Self {
        Self::new(
            config.name.as_str(),
            config.bind_address.as_str(),
            config.grace_period(),
            routes,
        )
    }
}

#[async_trait]
impl Listener for GrpcListener {
    fn name(&self) -> &str {
        &self.name
    }

    async fn serve(self: Box<Self>, ctx: ServeContext) {
        let GrpcListener {
            name,
            bind_address,
            grace_period,
            routes,
        } = *self;

        let listener = match TcpListener::bind(&bind_address).await {
            Ok(listener) => listener,
            Err(source) => {
                ctx.reporter.fatal(ListenerError::Bind {
                    listener: name,
                    address: bind_address,
                    source,
                });
                return;
            }
        };
        tracing::info!(
            listener = %name,
            address = ?listener.local_addr().ok(),
            "gRPC listener bound"
        );

        let connections = Connections::new();
        let service = TowerToHyperService::new(routes);
        let mut accept = connections.accept(name.clone(), listener, service);

        if let Some(health) = &ctx.health {
            health.set_serving(&name).await;
        }
        ctx.reporter.ready(&name);

        tokio::select! {
            _ = ctx.shutdown.cancelled() => {}
            result = &mut accept => {
                let reason = match result {
                    Ok(()) => "accept loop exited".to_string(),
                    Err(e) => e.to_string(),
                };
                ctx.reporter.fatal(ListenerError::Serve { listener: name, reason });
                connections.abort().await;
                return;
            }
        }

        if let Some(health) = &ctx.health {
            health.set_not_serving(&name).await;
        }
        tracing::info!(listener = %name, "Shutting down gRPC listener");
        connections.stop(&name, grace_period, accept).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::UnitTracker;
    use crate::server::listener::{ListenerReport, Reporter};
    use tokio_util::sync::CancellationToken;
    use tonic_health::pb::health_check_response::ServingStatus;
    use tonic_health::pb::health_client::HealthClient;
    use tonic_health::pb::HealthCheckRequest;

    #[tokio::test]
    async fn serves_health_checks_until_stopped() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let (_reporter, health_service) = tonic_health::server::health_reporter();
        let listener = GrpcListener::new(
            "rpc",
            addr.to_string(),
            Duration::from_millis(500),
            Routes::new(health_service),
        );

        let tracker = UnitTracker::new();
        let shutdown = CancellationToken::new();
        let (reporter, mut reports) = Reporter::channel();
        let ctx = ServeContext {
            shutdown: shutdown.clone(),
            unit: tracker.register("rpc"),
            health: None,
            reporter,
        };
        let task = tokio::spawn(Box::new(listener).serve(ctx));
        assert!(matches!(reports.recv().await, Some(ListenerReport::Ready(name)) if name == "rpc"));

        let channel = tonic::transport::Endpoint::new(format!("http://{}", addr))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let mut client = HealthClient::new(channel);
        let response = client
            .check(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap();
        assert_eq!(response.into_inner().status, ServingStatus::Serving as i32);
        drop(client);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("listener should stop")
            .unwrap();
        assert_eq!(tracker.outstanding(), 0);
    }
}
