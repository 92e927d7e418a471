//! multiserve
//!
//! Runs HTTP listeners, gRPC listeners and a message broker engine as one
//! process with coordinated startup and graceful shutdown.
//!
//! # Architecture Overview
//!
//! ```text
//!                     ┌──────────────────────────────────────────────┐
//!                     │                 ORCHESTRATOR                 │
//!   SIGINT/SIGTERM ──▶│  signals ──▶ run() ──▶ shutdown ──▶ tracker   │
//!                     │                 │                            │
//!                     │     ┌───────────┼──────────────┐             │
//!                     │     ▼           ▼              ▼             │
//!                     │  ┌──────┐   ┌──────┐   ┌──────────────┐      │
//!     HTTP clients ──▶│  │ http │   │ grpc │   │    broker    │◀─────┼──── AMQP
//!     gRPC clients ──▶│  └──────┘   └──────┘   │ engine+loop  │      │
//!                     │                        └──────────────┘      │
//!                     │  ┌────────────────────────────────────────┐  │
//!                     │  │ config · logging · metrics · backoff   │  │
//!                     │  └────────────────────────────────────────┘  │
//!                     └──────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use tonic::service::Routes;

use multiserve::broker::{dialer_for, Broker};
use multiserve::config::{load_config, ServiceConfig};
use multiserve::lifecycle::{Orchestrator, SignalSource};
use multiserve::observability::{logging, metrics};
use multiserve::server::{GrpcListener, HealthSink, HttpListener};

#[derive(Debug, Parser)]
#[command(name = "multiserve", version, about = "Multi-transport service runtime")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "MULTISERVE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    };

    logging::init(&config.logging)?;
    tracing::info!(
        service = %config.name,
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        "Configuration loaded"
    );

    if config.debug.enabled && config.debug.metrics_enabled {
        metrics::install_recorder()?;
    }

    let signals = SignalSource::from_os()?;
    let mut orchestrator = Orchestrator::new(config.name.as_str(), signals);
    orchestrator.with_debug(config.debug.clone());

    for http in &config.http {
        orchestrator.add_server(HttpListener::from_config(http, default_router()));
    }

    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    for grpc in &config.grpc {
        orchestrator.add_server(GrpcListener::from_config(
            grpc,
            Routes::new(health_service.clone()),
        ));
    }

    if let Some(broker_config) = &config.broker {
        let dialer = dialer_for(&broker_config.address)?;
        orchestrator.add_broker(Broker::new(broker_config.clone(), dialer));
    }

    let health: Arc<dyn HealthSink> = Arc::new(health_reporter);
    if let Err(e) = orchestrator.run(Some(health)).await {
        tracing::error!(error = %e, "Service terminated with error");
        std::process::exit(1);
    }
    Ok(())
}

fn default_router() -> Router {
    Router::new().route("/healthz", get(|| async { "ok" }))
}
