use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::retry::with_channel_retry;
use super::verify::verify_version;
use super::{
    finalize, write_status, ProfileOverride, UpgradeContext, UpgradeDeps, UpgradeError,
    UpgradeOutcome, UpgradeProfile, UpgradeWorker,
};
use crate::firmware::download_url;
use crate::model::{
    ChildUpgradeReport, ChildUpgradeState, Device, DeviceFamily, DeviceSnapshot,
    DeviceUpgradeStatus, FirmwareDescriptor,
};

const ONU_PROFILE: UpgradeProfile = UpgradeProfile::from_secs(10 * 60, 15 * 60, 30);

/// ONUs are flashed by their parent OLT; progress comes from the parent's
/// per-child upgrade report.
pub struct OnuWorker {
    deps: UpgradeDeps,
    overrides: ProfileOverride,
}

impl OnuWorker {
    pub fn new(deps: UpgradeDeps) -> Self {
        Self {
            deps,
            overrides: ProfileOverride::default(),
        }
    }

    pub fn with_override(mut self, overrides: ProfileOverride) -> Self {
        self.overrides = overrides;
        self
    }

    async fn run(&self, ctx: &UpgradeContext, profile: &UpgradeProfile) -> Result<(), UpgradeError> {
        write_status(
            &*self.deps.runtime,
            &ctx.device,
            DeviceUpgradeStatus::in_progress(&ctx.firmware, profile.expected_ms()),
        );
        let task = ctx.reporter.start_task(&ctx.task_id).await?;
        let since = task.start_time.unwrap_or_else(Utc::now);
        let parent_id = ctx
            .device
            .parent_id
            .clone()
            .ok_or_else(|| UpgradeError::MissingParent(ctx.device.id.clone()))?;
        tracing::info!(
            task_id = %ctx.task_id,
            device_id = %ctx.device.id,
            %parent_id,
            version = %ctx.firmware.version(),
            "onu upgrade started"
        );

        let url = download_url(&*self.deps.settings, &ctx.device, &ctx.firmware)?;
        let started = Instant::now();
        match tokio::time::timeout(
            profile.timeout,
            self.trigger_and_poll(ctx, profile, &parent_id, url.as_str(), since, started),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(UpgradeError::Timeout),
        }

        let device = self.wait_for_firmware(ctx, profile.reconnect_timeout).await?;
        verify_version(&ctx.firmware, &device)
    }

    /// Wait for the ONU record to come back on the target firmware.
    ///
    /// The record is refreshed from the parent's reports, which may lag the
    /// `Finished` entry; at the ceiling the last connected record is returned
    /// for verification.
    async fn wait_for_firmware(
        &self,
        ctx: &UpgradeContext,
        ceiling: Duration,
    ) -> Result<Device, UpgradeError> {
        let poll = self.deps.timings.reconnect_poll_interval;
        let deadline = Instant::now() + ceiling;
        loop {
            let seen = match self.deps.devices.find_by_id(&ctx.device.id).await {
                Ok(Some(device)) if !device.is_disconnected() => {
                    if verify_version(&ctx.firmware, &device).is_ok() {
                        return Ok(device);
                    }
                    Some(device)
                }
                Ok(_) => None,
                Err(err) => {
                    tracing::debug!(device_id = %ctx.device.id, error = %err, "onu lookup failed");
                    None
                }
            };
            let now = Instant::now();
            if now >= deadline {
                return seen.ok_or(UpgradeError::ReconnectTimeout);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn trigger_and_poll(
        &self,
        ctx: &UpgradeContext,
        profile: &UpgradeProfile,
        parent_id: &str,
        url: &str,
        since: DateTime<Utc>,
        started: Instant,
    ) -> Result<(), UpgradeError> {
        let runtime = self.deps.runtime.as_ref();
        let onu_id = ctx.device.id.as_str();
        with_channel_retry(&self.deps.timings, "trigger onu upgrade", move || {
            runtime.upgrade_onu(parent_id, onu_id, url)
        })
        .await
        .map_err(UpgradeError::Launch)?;

        let mut ticker = interval(self.deps.timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = self.current_report(parent_id, onu_id, since).await;
            let estimate = profile.estimate(started.elapsed());
            match report {
                Some(r) if r.status == ChildUpgradeState::Failed => {
                    return Err(match r.error {
                        Some(message) if !message.trim().is_empty() => {
                            UpgradeError::OnuReported(message)
                        }
                        _ => UpgradeError::OnuFailed,
                    });
                }
                Some(r) if r.status == ChildUpgradeState::Finished => return Ok(()),
                Some(r) => {
                    let reported = r.progress.map(|p| p.clamp(0.0, 0.99)).unwrap_or(estimate);
                    ctx.report_progress(reported).await;
                }
                None => ctx.report_progress(estimate).await,
            }
        }
    }

    /// The parent's report for this ONU, ignoring entries older than the task.
    async fn current_report(
        &self,
        parent_id: &str,
        onu_id: &str,
        since: DateTime<Utc>,
    ) -> Option<ChildUpgradeReport> {
        let parent = match self.deps.devices.find_by_id(parent_id).await {
            Ok(parent) => parent?,
            Err(err) => {
                tracing::debug!(%parent_id, error = %err, "parent lookup failed");
                return None;
            }
        };
        parent
            .child_upgrade(onu_id)
            .filter(|r| r.changed_at >= since)
            .cloned()
    }
}

#[async_trait]
impl UpgradeWorker for OnuWorker {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Onu
    }

    fn profile(&self, _model: &str) -> UpgradeProfile {
        self.overrides.apply(ONU_PROFILE)
    }

    async fn on_enqueue(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor) {
        write_status(&*self.deps.runtime, device, DeviceUpgradeStatus::queued(firmware));
    }

    async fn upgrade(&self, ctx: UpgradeContext) -> UpgradeOutcome {
        let profile = self.profile(&ctx.device.model);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            result = self.run(&ctx, &profile) => Some(result),
        };
        finalize(&*self.deps.runtime, &ctx, &profile, result)
    }

    async fn cancel(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor) {
        write_status(
            &*self.deps.runtime,
            device,
            DeviceUpgradeStatus::canceled(firmware, self.profile(&device.model).expected_ms()),
        );
    }
}
