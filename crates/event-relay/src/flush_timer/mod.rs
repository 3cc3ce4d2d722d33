use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::buffers::{EventBuffer, FlushOutcome};
use crate::transport::Transport;

/// Flush one batch every `period` until `cancel` fires.
///
/// The first tick lands one full period after start. A tick that falls due
/// while a slow flush is still running is delayed rather than bunched up.
/// Failures go through the buffer's error hook like any background flush.
pub async fn run<T: Transport + 'static>(
    buffer: EventBuffer<T>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("periodic flush stopped");
                return;
            }
            _ = interval.tick() => {
                if let Some(FlushOutcome::Delivered { count }) = buffer.flush_and_report().await {
                    debug!(count, "periodic flush delivered events");
                }
            }
        }
    }
}
