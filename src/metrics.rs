//! Prometheus metrics

use crate::jobs::JobStatus;
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a download job start
pub fn record_job_started(model_id: &str, source: &str) {
    metrics::counter!("model_depot_downloads_started_total",
        "model" => model_id.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a job reaching a terminal state
pub fn record_job_finished(status: JobStatus) {
    metrics::counter!("model_depot_downloads_finished_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a classified transfer failure
pub fn record_failure(kind: &str) {
    metrics::counter!("model_depot_download_failures_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record an installed model removal
pub fn record_model_removed(model_id: &str) {
    metrics::counter!("model_depot_models_removed_total",
        "model" => model_id.to_string()
    )
    .increment(1);
}

/// Update the number of jobs held in memory
pub fn update_tracked_jobs(count: usize) {
    metrics::gauge!("model_depot_jobs_tracked").set(count as f64);
}
