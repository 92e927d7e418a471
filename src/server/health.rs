//! Health reporting sink.

use async_trait::async_trait;
use tonic_health::server::HealthReporter;
use tonic_health::ServingStatus;

/// Receives serving-status changes from listeners.
#[async_trait]
pub trait HealthSink: Send + Sync {
    async fn set_serving(&self, service: &str);

    async fn set_not_serving(&self, service: &str);
}

#[async_trait]
impl HealthSink for HealthReporter {
    async fn set_serving(&self, service: &str) {
        let mut reporter = self.clone();
        reporter
            .set_service_status(service, ServingStatus::Serving)
            .await;
    }

    async fn set_not_serving(&self, service: &str) {
        let mut reporter = self.clone();
        reporter
            .set_service_status(service, ServingStatus::NotServing)
            .await;
    }
}
