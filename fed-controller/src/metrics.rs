use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use metrics::{Unit, describe_counter, describe_histogram, set_global_recorder};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};

// Labels
pub const LABEL_CONTROLLER: &str = "controller";
pub const LABEL_OUTCOME: &str = "outcome";
pub const LABEL_RECORD_TYPE: &str = "record_type";
pub const LABEL_TARGET_KIND: &str = "target_kind";

/// Metrics
pub const RECONCILE_DURATION_SECONDS: &str = "reconcile_duration_seconds";
pub const RECONCILE_TOTAL: &str = "reconcile_total";
pub const VERSION_WRITE_ATTEMPT_TOTAL: &str = "version_write_attempt_total";
pub const VERSION_WRITE_FAILURE_TOTAL: &str = "version_write_failure_total";

/// Installs the global Prometheus recorder and serves it on `address`.
/// Has to be called from within the tokio runtime.
pub fn setup_metrics_exporter(address: SocketAddr) -> Result<AbortOnDropHandle<()>> {
    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(address)
        .build()?;

    let maybe_success = set_global_recorder(recorder);
    if let Err(e) = &maybe_success {
        let msg = format!("{}", e);
        if msg.contains(
            "attempted to set a recorder after the metrics system was already initialized",
        ) {
            warn!("global recorder is possibly reused.")
        } else {
            maybe_success.map_err(|e| anyhow!("{e}"))?;
        }
    }
    describe_metrics();
    info!("Serving metrics on {address}");

    Ok(AbortOnDropHandle::new(tokio::spawn(async move {
        if let Err(err) = exporter.await {
            error!("Metrics exporter stopped: {err:?}");
        }
    })))
}

fn describe_metrics() {
    describe_histogram!(
        RECONCILE_DURATION_SECONDS,
        Unit::Seconds,
        "Time spent reconciling one key"
    );
    describe_counter!(RECONCILE_TOTAL, "Reconciles by outcome");
    describe_counter!(
        VERSION_WRITE_ATTEMPT_TOTAL,
        "API calls made to persist propagated versions"
    );
    describe_counter!(
        VERSION_WRITE_FAILURE_TOTAL,
        "Propagated version writes given up on"
    );
}
