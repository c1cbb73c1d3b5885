//! Background housekeeping for record sinks

use crate::machine::Machine;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Long-running task: run the machine's sink housekeeping every `interval`.
/// Start it after the sink is configured; it returns once the machine no
/// longer has a sink.
pub async fn skulk_loop(machine: Arc<Machine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Skulk loop started, interval {interval:?}");

    loop {
        ticker.tick().await;

        let Some(sink) = machine.sink() else {
            debug!("Skulk loop stopping: machine has no sink");
            return;
        };
        sink.skulk();
    }
}
