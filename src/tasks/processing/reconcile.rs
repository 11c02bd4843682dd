//! Catches uploads whose dispatch signal was lost or whose run died mid-flight.

use time::PrimitiveDateTime;

use crate::core::metrics;
use crate::core::state::AppState;
use crate::core::time::primitive_now_utc;
use crate::db::types::PrintUploadStatus;
use crate::services::dispatch::{dispatch_or_fail, DispatchRequest};

pub(crate) const PROCESSING_TIMED_OUT: &str = "processing timed out";

const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SweepReport {
    pub(crate) redispatched: usize,
    pub(crate) timed_out: usize,
}

/// `None` when the cutoff lies before the representable range, meaning nothing is stale yet.
fn stale_cutoff(now: PrimitiveDateTime, seconds: u64) -> Option<PrimitiveDateTime> {
    let seconds = i64::try_from(seconds).ok()?;
    now.checked_sub(time::Duration::seconds(seconds))
}

pub(crate) async fn sweep(state: &AppState) -> anyhow::Result<SweepReport> {
    let pipeline = state.settings().pipeline();
    let store = state.store();
    let now = primitive_now_utc();
    let mut report = SweepReport::default();

    if let Some(cutoff) = stale_cutoff(now, pipeline.received_timeout_seconds) {
        for stale in store.list_stale(PrintUploadStatus::Received, cutoff, SWEEP_BATCH).await? {
            tracing::info!(upload_id = %stale.id, "Re-dispatching upload stuck in received");
            if dispatch_or_fail(state, DispatchRequest::normal(&stale.id), stale.generation).await
            {
                report.redispatched += 1;
            }
        }
    }

    if let Some(cutoff) = stale_cutoff(now, pipeline.processing_timeout_seconds) {
        for stale in store.list_stale(PrintUploadStatus::Processing, cutoff, SWEEP_BATCH).await? {
            if store.fail_run(&stale.id, stale.generation, PROCESSING_TIMED_OUT, now).await? {
                tracing::warn!(
                    upload_id = %stale.id,
                    generation = stale.generation,
                    "Print run exceeded processing timeout"
                );
                report.timed_out += 1;
            }
        }
    }

    metrics::record_reconciled("redispatched", report.redispatched);
    metrics::record_reconciled("timed_out", report.timed_out);
    Ok(report)
}
