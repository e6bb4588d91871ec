use std::time::Duration;

use serde_json::json;
use tracing::{info, warn};

mod bootstrap;
mod intake;
mod inventory;
mod journal;
mod reaper;
mod ssh;
mod tasks;

use netfleet_topics as topics;

#[tokio::main]
async fn main() {
    netfleet_otel::init();

    let cfg = match bootstrap::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let bootstrap::BootstrapOutput {
        bus,
        manager,
        queue,
        background_tasks,
    } = match bootstrap::build(cfg).await {
        Ok(out) => out,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    };
    info!(
        workers = queue.concurrency(),
        background = background_tasks.len(),
        "netfleet daemon running"
    );

    shutdown_signal().await;

    // Running upgrades are left to finish; startup recovery cancels whatever
    // the process does not outlive.
    manager.pause_queues();
    if queue.in_flight() > 0 {
        warn!(in_flight = queue.in_flight(), "shutting down with upgrades in flight");
    }
    bus.publish(
        topics::TOPIC_SERVICE_STOP,
        &json!({ "in_flight": queue.in_flight(), "queued": queue.queued_len() }),
    );

    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "SIGTERM handler unavailable; waiting for Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
