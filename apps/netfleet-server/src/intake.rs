//! Admits tasks written by other processes and applies their cancel requests.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, MissedTickBehavior};

use netfleet_core::TaskManager;
use netfleet_kernel::Kernel;

use crate::tasks::{spawn_supervised, TaskHandle};

const CANCEL_BATCH: i64 = 64;

pub(crate) fn start(kernel: Kernel, manager: Arc<TaskManager>, every: Duration) -> TaskHandle {
    spawn_supervised("tasks.intake", move || {
        let kernel = kernel.clone();
        let manager = manager.clone();
        async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(err) = intake_once(&kernel, &manager).await {
                    tracing::warn!(error = %err, "task intake failed");
                }
            }
        }
    })
}

/// Cancels first, so a task canceled before admission never reaches a worker.
pub(crate) async fn intake_once(kernel: &Kernel, manager: &TaskManager) -> Result<()> {
    for req in kernel.pending_cancels_async(CANCEL_BATCH).await? {
        match kernel.get_task_async(&req.task_id).await? {
            Some(task) => match manager.cancel_task(&task, req.user_id.as_deref()).await {
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(task_id = %req.task_id, error = %err, "cancel request rejected")
                }
            },
            None => tracing::warn!(task_id = %req.task_id, "cancel requested for unknown task"),
        }
        kernel.mark_cancel_handled_async(req.id).await?;
    }

    let admitted = manager.enqueue_pending().await?;
    if !admitted.is_empty() {
        tracing::info!(count = admitted.len(), "admitted pending tasks");
    }
    Ok(())
}
