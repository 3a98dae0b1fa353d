//! Auto-clock driver
//!
//! Drives `step` batches on a background tokio task while the executive's
//! clock mode is `active` or `rate`. Rate mode spreads the configured
//! instructions-per-second across ticks; active mode runs a large batch
//! per tick (effectively unlimited). The executive lock is held only for
//! the duration of one batch.

use crate::state::Daemon;
use hsx_runtime::exec::ClockMode;
use std::sync::Arc;
use std::time::Duration;

/// Tick interval for the driver loop.
const TICK_MS: u64 = 10;

/// Instructions per tick when the rate is unlimited.
const UNLIMITED_BATCH: u64 = 50_000;

pub async fn run(daemon: Arc<Daemon>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = daemon.shutdown.notified() => return,
        }
        let executed = {
            let mut exec = daemon.exec.lock().await;
            let batch = match exec.clock.mode {
                ClockMode::Active => UNLIMITED_BATCH,
                ClockMode::Rate => {
                    let per_tick = exec.clock.rate_hz * TICK_MS as f64 / 1000.0;
                    per_tick.max(1.0) as u64
                }
                _ => 0,
            };
            if batch == 0 {
                0
            } else {
                exec.step_n(batch, None, "auto").executed
            }
        };
        if executed > 0 {
            daemon.events_notify.notify_waiters();
        }
    }
}
