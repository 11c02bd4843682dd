use anyhow::Result;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::core::shutdown::{shutdown_signal, ShutdownHandle};
use crate::core::state::AppState;
use crate::tasks::processing::reconcile;

pub(crate) async fn run(state: AppState) -> Result<()> {
    let shutdown = ShutdownHandle::new();
    let handle = tokio::spawn(reconcile_loop(state, shutdown.subscribe()));

    shutdown_signal().await;
    shutdown.trigger();

    if let Err(err) = handle.await {
        tracing::error!(error = %err, "Background task join failed");
    }

    Ok(())
}

pub(crate) async fn reconcile_loop(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(state.settings().pipeline().reconcile_interval_seconds);
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                match reconcile::sweep(&state).await {
                    Ok(report) if report.redispatched + report.timed_out > 0 => tracing::info!(
                        redispatched = report.redispatched,
                        timed_out = report.timed_out,
                        "Reconciliation sweep finished"
                    ),
                    Ok(_) => {}
                    Err(err) => tracing::error!(error = %err, "Reconciliation sweep failed"),
                }
            }
        }
    }
}
