use std::{future::Future, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Run `task` every `period` until `cancel` fires. A pass that overruns the
/// period causes the missed ticks to be skipped, never queued. The first pass
/// runs immediately.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(
            task = name,
            period_ms = period.as_millis() as u64,
            "periodic task started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // A pass in flight finishes before cancellation is observed.
            task().await;
        }
        tracing::info!(task = name, "periodic task stopped");
    })
}
