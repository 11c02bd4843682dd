use std::sync::OnceLock;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::core::config::Settings;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub(crate) fn init(settings: &Settings) -> anyhow::Result<()> {
    if !settings.telemetry().prometheus_enabled || PROM_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = PROM_HANDLE.set(handle);
    Ok(())
}

pub(crate) fn render() -> Option<String> {
    PROM_HANDLE.get().map(|handle| handle.render())
}

pub(crate) fn record_run(outcome: &'static str, elapsed: Duration) {
    metrics::counter!("print_runs_total", "outcome" => outcome).increment(1);
    metrics::histogram!("print_run_duration_seconds", "outcome" => outcome)
        .record(elapsed.as_secs_f64());
}

pub(crate) fn record_reconciled(kind: &'static str, count: usize) {
    if count > 0 {
        metrics::counter!("print_reconciled_total", "kind" => kind).increment(count as u64);
    }
}
