//! Per-family firmware upgrade workers and the queue processor driving them.

mod airfiber;
mod airmax;
mod edgeos;
mod error;
mod markers;
mod onu;
mod retry;
mod script;
mod switch;
mod verify;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::model::{
    DeviceFamily, DeviceSnapshot, DeviceUpgradeStatus, FirmwareDescriptor, Task, TaskPayload,
    TaskStatus, UpgradePayload,
};
use crate::orchestrator::{TaskError, TaskProcessor, TaskQueue, TaskReporter};
use crate::ports::{DeviceRepository, DeviceRuntime, SettingsProvider};

pub use airfiber::AirFiber;
pub use airmax::AirMax;
pub use edgeos::EdgeOs;
pub use error::UpgradeError;
pub use markers::{classify_log, DOWNLOAD_FAILED, UPGRADE_FAILED, UPGRADE_IN_PROGRESS};
pub use onu::OnuWorker;
pub use script::{ScriptFamily, ScriptWorker};
pub use switch::Switch;
pub use verify::{derive_version, verify_version};

pub const UPGRADE_QUEUE: &str = "firmware-upgrade";

/// Polling cadence shared by all workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeTimings {
    pub poll_interval: Duration,
    /// Extra attempts for commands failing on a transient channel error.
    pub command_retries: u32,
    pub command_retry_delay: Duration,
    pub reconnect_poll_interval: Duration,
}

impl Default for UpgradeTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            command_retries: 3,
            command_retry_delay: Duration::from_secs(2),
            reconnect_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Per-model timing envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeProfile {
    /// Drives the progress estimate; never a deadline.
    pub expected_duration: Duration,
    /// Ceiling for pushing the upgrade and polling its log.
    pub timeout: Duration,
    /// Ceiling for the device to come back after the flash.
    pub reconnect_timeout: Duration,
}

impl UpgradeProfile {
    pub const fn from_secs(expected: u64, timeout: u64, reconnect: u64) -> Self {
        Self {
            expected_duration: Duration::from_secs(expected),
            timeout: Duration::from_secs(timeout),
            reconnect_timeout: Duration::from_secs(reconnect),
        }
    }

    pub fn expected_ms(&self) -> u64 {
        u64::try_from(self.expected_duration.as_millis()).unwrap_or(u64::MAX)
    }

    /// Elapsed-time estimate kept strictly below 1.0 until the worker succeeds.
    pub fn estimate(&self, elapsed: Duration) -> f64 {
        let expected = self.expected_duration.as_secs_f64();
        if expected <= 0.0 {
            return 0.99;
        }
        (elapsed.as_secs_f64() / expected).clamp(0.0, 0.99)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileOverride {
    pub expected_duration: Option<Duration>,
    pub timeout: Option<Duration>,
    pub reconnect_timeout: Option<Duration>,
}

impl ProfileOverride {
    pub fn apply(&self, base: UpgradeProfile) -> UpgradeProfile {
        UpgradeProfile {
            expected_duration: self.expected_duration.unwrap_or(base.expected_duration),
            timeout: self.timeout.unwrap_or(base.timeout),
            reconnect_timeout: self.reconnect_timeout.unwrap_or(base.reconnect_timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Success,
    Failed(String),
    /// Cancellation was observed; the caller persists the canceled state.
    Canceled,
}

/// Everything a worker needs for one task.
pub struct UpgradeContext {
    pub task_id: String,
    pub device: DeviceSnapshot,
    pub firmware: FirmwareDescriptor,
    pub cancel: CancellationToken,
    pub reporter: Arc<dyn TaskReporter>,
}

impl UpgradeContext {
    /// Best-effort progress report.
    pub(crate) async fn report_progress(&self, progress: f64) {
        if let Err(err) = self.reporter.update_progress(&self.task_id, progress).await {
            tracing::debug!(task_id = %self.task_id, error = %err, "progress update dropped");
        }
    }
}

/// Collaborators shared by every worker.
#[derive(Clone)]
pub struct UpgradeDeps {
    pub devices: Arc<dyn DeviceRepository>,
    pub runtime: Arc<dyn DeviceRuntime>,
    pub settings: Arc<dyn SettingsProvider>,
    pub timings: UpgradeTimings,
}

/// Drives a firmware upgrade for one device family.
#[async_trait]
pub trait UpgradeWorker: Send + Sync {
    fn family(&self) -> DeviceFamily;

    /// Timing envelope used for `model`.
    fn profile(&self, model: &str) -> UpgradeProfile;

    /// Marks the device as queued for an upgrade.
    async fn on_enqueue(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor);

    /// Runs the upgrade; device status is final before this returns.
    async fn upgrade(&self, ctx: UpgradeContext) -> UpgradeOutcome;

    /// Canceler hook; marks the device status canceled.
    async fn cancel(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor);
}

/// Write a device upgrade status, attaching ONU statuses to their parent too.
pub(crate) fn write_status(
    runtime: &dyn DeviceRuntime,
    device: &DeviceSnapshot,
    status: DeviceUpgradeStatus,
) {
    match (&device.family, &device.parent_id) {
        (DeviceFamily::Onu, Some(parent)) => {
            runtime.update_onu_upgrade_status(parent, &device.id, status)
        }
        _ => runtime.update_upgrade_status(&device.id, status),
    }
}

/// Map the result of a worker run to its final device status and outcome.
pub(crate) fn finalize(
    runtime: &dyn DeviceRuntime,
    ctx: &UpgradeContext,
    profile: &UpgradeProfile,
    result: Option<Result<(), UpgradeError>>,
) -> UpgradeOutcome {
    let expected = profile.expected_ms();
    match result {
        None => {
            tracing::info!(task_id = %ctx.task_id, device_id = %ctx.device.id, "firmware upgrade canceled");
            write_status(
                runtime,
                &ctx.device,
                DeviceUpgradeStatus::canceled(&ctx.firmware, expected),
            );
            UpgradeOutcome::Canceled
        }
        Some(Ok(())) => {
            tracing::info!(
                task_id = %ctx.task_id,
                device_id = %ctx.device.id,
                version = %ctx.firmware.version(),
                "firmware upgrade finished"
            );
            write_status(
                runtime,
                &ctx.device,
                DeviceUpgradeStatus::success(&ctx.firmware, expected),
            );
            UpgradeOutcome::Success
        }
        Some(Err(err)) => {
            let message = err.to_string();
            tracing::warn!(task_id = %ctx.task_id, device_id = %ctx.device.id, error = %message, "firmware upgrade failed");
            write_status(
                runtime,
                &ctx.device,
                DeviceUpgradeStatus::failed(&ctx.firmware, expected, message.clone()),
            );
            UpgradeOutcome::Failed(message)
        }
    }
}

/// Workers keyed by the family they serve.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<DeviceFamily, Arc<dyn UpgradeWorker>>,
}

impl WorkerRegistry {
    /// One worker per built-in family.
    pub fn standard(deps: UpgradeDeps, overrides: impl Fn(DeviceFamily) -> ProfileOverride) -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(
            ScriptWorker::new(EdgeOs, deps.clone()).with_override(overrides(DeviceFamily::EdgeOs)),
        ));
        registry.register(Arc::new(
            ScriptWorker::new(Switch, deps.clone()).with_override(overrides(DeviceFamily::Switch)),
        ));
        registry.register(Arc::new(
            ScriptWorker::new(AirMax, deps.clone()).with_override(overrides(DeviceFamily::AirMax)),
        ));
        registry.register(Arc::new(
            ScriptWorker::new(AirFiber, deps.clone())
                .with_override(overrides(DeviceFamily::AirFiber)),
        ));
        registry.register(Arc::new(
            OnuWorker::new(deps).with_override(overrides(DeviceFamily::Onu)),
        ));
        registry
    }

    /// Registers `worker`, replacing any worker for the same family.
    pub fn register(&mut self, worker: Arc<dyn UpgradeWorker>) {
        self.workers.insert(worker.family(), worker);
    }

    pub fn get(&self, family: DeviceFamily) -> Option<&Arc<dyn UpgradeWorker>> {
        self.workers.get(&family)
    }

    pub fn families(&self) -> Vec<DeviceFamily> {
        let mut families: Vec<DeviceFamily> = self.workers.keys().copied().collect();
        families.sort_by_key(|f| f.as_str());
        families
    }

    /// Projects upgrade tasks this registry can serve.
    pub fn claims(&self, task: &Task) -> Option<UpgradePayload> {
        match &task.payload {
            TaskPayload::FirmwareUpgrade(payload) if self.workers.contains_key(&payload.device.family) => {
                Some(payload.clone())
            }
            _ => None,
        }
    }
}

/// Queue processor dispatching upgrade payloads to family workers.
pub struct UpgradeDispatcher {
    registry: Arc<WorkerRegistry>,
    reporter: Arc<dyn TaskReporter>,
}

impl UpgradeDispatcher {
    pub fn new(registry: Arc<WorkerRegistry>, reporter: Arc<dyn TaskReporter>) -> Self {
        Self { registry, reporter }
    }

    fn worker(&self, family: DeviceFamily) -> anyhow::Result<&Arc<dyn UpgradeWorker>> {
        self.registry
            .get(family)
            .ok_or_else(|| anyhow::anyhow!("no upgrade worker for {family} devices"))
    }
}

#[async_trait]
impl TaskProcessor<UpgradePayload> for UpgradeDispatcher {
    async fn on_enqueue(&self, _task_id: &str, payload: &UpgradePayload) {
        if let Ok(worker) = self.worker(payload.device.family) {
            worker.on_enqueue(&payload.device, &payload.firmware).await;
        }
    }

    async fn process(
        &self,
        task_id: &str,
        payload: UpgradePayload,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let worker = self.worker(payload.device.family)?;
        let ctx = UpgradeContext {
            task_id: task_id.to_string(),
            device: payload.device.clone(),
            firmware: payload.firmware.clone(),
            cancel,
            reporter: self.reporter.clone(),
        };
        let recorded = match worker.upgrade(ctx).await {
            UpgradeOutcome::Success => self.reporter.complete_task(task_id).await.map(drop),
            UpgradeOutcome::Failed(message) => {
                self.reporter.fail_task(task_id, &message).await.map(drop)
            }
            UpgradeOutcome::Canceled => Ok(()),
        };
        match recorded {
            // a cancel won the race against the worker's final write
            Err(TaskError::InvalidTransition {
                from: TaskStatus::Canceled,
                ..
            }) => {
                tracing::info!(%task_id, "task canceled as the upgrade finished; device status follows the task");
                worker.cancel(&payload.device, &payload.firmware).await;
                Ok(())
            }
            other => Ok(other?),
        }
    }

    async fn on_cancel(&self, _task_id: &str, payload: &UpgradePayload) {
        if let Ok(worker) = self.worker(payload.device.family) {
            worker.cancel(&payload.device, &payload.firmware).await;
        }
    }
}

/// Build the firmware upgrade queue over `registry`.
pub fn upgrade_queue(
    registry: Arc<WorkerRegistry>,
    reporter: Arc<dyn TaskReporter>,
    concurrency: usize,
) -> TaskQueue<UpgradePayload> {
    let claims = registry.clone();
    TaskQueue::new(
        UPGRADE_QUEUE,
        concurrency,
        Arc::new(move |task: &Task| claims.claims(task)),
        Arc::new(UpgradeDispatcher::new(registry, reporter)),
    )
}
