//! Prometheus exposition of the crate's `metrics` counters.
//!
//! Counters are recorded with the `metrics` macros wherever the event happens
//! (`creditflow_ledger_entries_total`, `creditflow_jobs_transitions_total`, ...). Without an
//! installed recorder they are no-ops, so the exporter is only installed when `enable_metrics` is set.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::{Mutex, const_mutex};

/// The global recorder can only be installed once per process; later callers share the handle.
static PROMETHEUS_HANDLE: Mutex<Option<PrometheusHandle>> = const_mutex(None);

/// Install the Prometheus recorder if it is not installed yet and return its handle.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let mut installed = PROMETHEUS_HANDLE.lock();
    if let Some(handle) = installed.as_ref() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    *installed = Some(handle.clone());
    Ok(handle)
}

/// `GET /internal/metrics`
pub async fn render(handle: PrometheusHandle) -> String {
    handle.render()
}
