use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};

use netfleet_core::StatusReaper;

use crate::tasks::{spawn_supervised, TaskHandle};

pub(crate) fn start(reaper: Arc<StatusReaper>, every: Duration) -> TaskHandle {
    spawn_supervised("upgrade.reaper", move || {
        let reaper = reaper.clone();
        async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // first tick fires immediately; recovery already ran
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match reaper.sweep_once().await {
                    Ok(cleared) if !cleared.is_empty() => {
                        tracing::info!(count = cleared.len(), devices = ?cleared, "reaped stale upgrade statuses")
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "upgrade status sweep failed"),
                }
            }
        }
    })
}
