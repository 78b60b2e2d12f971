use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

pub fn describe() {
    describe_counter!(
        "trusttrade_performance_scores_total",
        "Performance score calculations, by outcome."
    );
    describe_counter!(
        "trusttrade_verification_changes_total",
        "Verification status transitions recorded by the scheduled re-check."
    );
    describe_counter!(
        "trusttrade_verification_recheck_failures_total",
        "Users skipped by the re-check because their holdings could not be read."
    );
    describe_histogram!(
        "trusttrade_db_query_latency_ms",
        "SQLite call latency in milliseconds, including queueing."
    );
    describe_counter!(
        "trusttrade_db_query_errors_total",
        "SQLite calls that returned an error."
    );
    describe_counter!("tracing_error_events", "ERROR-level log events.");
    describe_counter!(
        "trusttrade_wal_checkpoint_total",
        "WAL checkpoints, by status."
    );
    describe_gauge!(
        "trusttrade_wal_checkpoint_pages",
        "Pages written back by the last WAL checkpoint."
    );
    describe_gauge!("trusttrade_db_file_size_bytes", "Main database file size.");
    describe_gauge!("trusttrade_db_wal_size_bytes", "WAL file size.");
    describe_gauge!("trusttrade_db_page_count", "SQLite page count.");
    describe_gauge!("trusttrade_db_page_size_bytes", "SQLite page size.");
    describe_gauge!("trusttrade_db_freelist_count", "SQLite free pages.");
}

pub fn install_prometheus(port: u16) -> Result<PrometheusHandle> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    Ok(PrometheusBuilder::new()
        .with_http_listener(addr)
        .install_recorder()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_handle_renders_metric_names() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            describe();
            metrics::counter!("trusttrade_verification_changes_total", "status" => "verified")
                .increment(1);
        });

        let rendered = handle.render();
        assert!(rendered.contains("trusttrade_verification_changes_total{status=\"verified\"} 1"));
        assert!(rendered.contains("# HELP trusttrade_verification_changes_total"));
    }
}
