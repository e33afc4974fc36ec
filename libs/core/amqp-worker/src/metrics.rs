//! Prometheus metrics for AMQP workers

use crate::worker::Disposition;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder.
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok::<_, BuildError>(handle)
    })?;
    Ok(())
}

/// Render metrics in Prometheus text format (empty before `init_metrics`)
pub fn render_metrics() -> String {
    PROMETHEUS_HANDLE
        .get()
        .map(|h| h.render())
        .unwrap_or_default()
}

/// Per-queue metrics helper
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    queue: String,
}

impl WorkerMetrics {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
        }
    }

    /// Record a delivery being received
    pub fn message_received(&self) {
        counter!(
            "amqp_worker_messages_received_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record how a delivery was settled
    pub fn message_settled(&self, disposition: Disposition) {
        counter!(
            "amqp_worker_messages_settled_total",
            "queue" => self.queue.clone(),
            "disposition" => disposition.as_ref().to_string()
        )
        .increment(1);
    }

    /// Record a published reply
    pub fn response_published(&self) {
        counter!(
            "amqp_worker_responses_published_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record handler wall time
    pub fn handler_duration(&self, duration: Duration) {
        histogram!(
            "amqp_worker_handler_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = WorkerMetrics::new("svc:orders");
        assert_eq!(metrics.queue, "svc:orders");
    }

    #[test]
    fn test_recorded_metrics_are_rendered() {
        init_metrics().unwrap();
        // second call is a no-op
        init_metrics().unwrap();

        let metrics = WorkerMetrics::new("svc:render");
        metrics.message_received();
        metrics.message_settled(Disposition::Requeued);

        let rendered = render_metrics();
        assert!(rendered.contains("amqp_worker_messages_received_total"));
        assert!(rendered.contains("disposition=\"requeued\""));
    }
}
