//! Prometheus metrics exposition for the metering sidecar.
//!
//! Registers `metering_records_total` and `metering_batch_flush_seconds`,
//! matching the relay's histogram-bucket setup so both services render
//! compatibly for the same scrape config.
//! `metering_aggregate_failures_total` is incremented directly from
//! `crates/metering::batch` via the global `metrics` recorder rather than
//! through a function here — this module only installs the recorder, it
//! doesn't own every counter routed through it.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("metering_batch_flush_seconds".to_string()),
            &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

pub fn record_ingested(status: &str) {
    metrics::counter!("metering_records_total", "status" => status.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_exporter_prometheus::PrometheusRecorder;

    fn isolated_recorder() -> (PrometheusRecorder, PrometheusHandle) {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        (recorder, handle)
    }

    #[test]
    fn record_ingested_increments_counter_with_status_label() {
        let (recorder, handle) = isolated_recorder();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_ingested("success");
        record_ingested("rejected");

        let output = handle.render();
        assert!(output.contains("metering_records_total"));
        assert!(output.contains("status=\"success\""));
        assert!(output.contains("status=\"rejected\""));
    }

    #[test]
    fn record_ingested_does_not_panic_without_recorder() {
        record_ingested("success");
    }
}
