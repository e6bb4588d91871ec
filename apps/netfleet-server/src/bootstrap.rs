use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use netfleet_core::config::Config;
use netfleet_core::model::UpgradePayload;
use netfleet_core::upgrade::{upgrade_queue, UpgradeDeps, WorkerRegistry};
use netfleet_core::{
    load_config, BusEventLog, StaticSettings, StatusReaper, TaskLifecycle, TaskManager, TaskQueue,
};
use netfleet_events::Bus;
use netfleet_kernel::Kernel;
use netfleet_topics as topics;

use crate::ssh::SshRuntime;
use crate::tasks::BackgroundTasks;
use crate::{intake, inventory, journal, reaper};

pub(crate) struct BootstrapOutput {
    pub bus: Bus,
    pub manager: Arc<TaskManager>,
    pub queue: TaskQueue<UpgradePayload>,
    pub background_tasks: BackgroundTasks,
}

/// `NETFLEET_CONFIG`, else `./netfleet.toml` when present, else defaults.
pub(crate) fn load() -> Result<Config> {
    let path = std::env::var("NETFLEET_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            let local = PathBuf::from("netfleet.toml");
            local.exists().then_some(local)
        });
    match path {
        Some(path) => load_config(&path),
        None => {
            tracing::info!("no config file; using defaults");
            Ok(Config::default())
        }
    }
}

pub(crate) async fn build(cfg: Config) -> Result<BootstrapOutput> {
    let state_dir = cfg.runtime.state_dir();
    let kernel = Kernel::open(&state_dir)
        .with_context(|| format!("open kernel in {}", state_dir.display()))?;
    let bus = Bus::new(cfg.runtime.bus_capacity());

    let mut background_tasks = BackgroundTasks::new();
    background_tasks.push(journal::start(bus.clone(), kernel.clone()));

    let store = Arc::new(kernel.clone());
    let runtime = Arc::new(SshRuntime::new(cfg.ssh.clone(), store.clone(), bus.clone()));
    let settings = StaticSettings::from_config(&cfg.settings).context("[settings]")?;
    let deps = UpgradeDeps {
        devices: store.clone(),
        runtime: runtime.clone(),
        settings: Arc::new(settings),
        timings: cfg.upgrade.timings(),
    };
    let registry = Arc::new(WorkerRegistry::standard(deps, |family| {
        cfg.upgrade.profile_override(family)
    }));
    let lifecycle = Arc::new(TaskLifecycle::new(
        store.clone(),
        store.clone(),
        Arc::new(BusEventLog::new(bus.clone())),
    ));
    let queue = upgrade_queue(registry, lifecycle.clone(), cfg.queue.upgrade_concurrency());
    let manager = Arc::new(TaskManager::new(lifecycle).with_queue(Arc::new(queue.clone())));

    bus.publish(
        topics::TOPIC_SERVICE_START,
        &json!({ "state_dir": state_dir.display().to_string() }),
    );

    // Hold workers until every surviving record is back on its queue.
    manager.pause_queues();
    bus.publish(topics::TOPIC_QUEUE_PAUSED, &json!({ "reason": "startup" }));
    let report = manager.start_queue().await.context("startup recovery")?;
    bus.publish(topics::TOPIC_QUEUE_RECOVERED, &report_json(&report));
    let grace = cfg.queue.startup_grace();
    if !grace.is_zero() {
        tokio::time::sleep(grace).await;
    }
    manager.resume_queues();
    bus.publish(topics::TOPIC_QUEUE_RESUMED, &json!({ "reason": "startup" }));

    background_tasks.push(intake::start(
        kernel.clone(),
        manager.clone(),
        cfg.queue.intake_interval(),
    ));
    let status_reaper = Arc::new(StatusReaper::new(store.clone(), store, runtime.clone()));
    background_tasks.push(reaper::start(status_reaper, cfg.reaper.interval()));
    background_tasks.push(inventory::start(kernel, runtime));

    Ok(BootstrapOutput {
        bus,
        manager,
        queue,
        background_tasks,
    })
}

fn report_json(report: &netfleet_core::orchestrator::RecoveryReport) -> serde_json::Value {
    json!({
        "canceled": report.canceled,
        "requeued": report.requeued,
    })
}
