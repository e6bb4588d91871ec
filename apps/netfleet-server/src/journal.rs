use netfleet_events::Bus;
use netfleet_kernel::Kernel;
use tokio::sync::broadcast::error::RecvError;

use crate::tasks::{spawn_supervised, TaskHandle};

/// Persist every bus envelope into the kernel's event journal.
pub(crate) fn start(bus: Bus, kernel: Kernel) -> TaskHandle {
    spawn_supervised("events.journal", move || {
        let mut rx = bus.subscribe();
        let kernel = kernel.clone();
        async move {
            loop {
                match rx.recv().await {
                    Ok(env) => {
                        if let Err(err) = kernel.append_event_async(&env).await {
                            tracing::warn!(kind = %env.kind, error = %err, "failed to journal event");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event journal lagged; events dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}
