use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, Instant, MissedTickBehavior};
use url::Url;

use super::markers::classify_log;
use super::retry::with_channel_retry;
use super::verify::verify_version;
use super::{
    finalize, write_status, ProfileOverride, UpgradeContext, UpgradeDeps, UpgradeError,
    UpgradeOutcome, UpgradeProfile, UpgradeWorker,
};
use crate::firmware::download_url;
use crate::model::{Device, DeviceFamily, DeviceSnapshot, DeviceUpgradeStatus, FirmwareDescriptor};
use crate::ports::{CommandError, DeviceRepository};

/// Family-specific pieces of a script-driven upgrade.
pub trait ScriptFamily: Send + Sync + 'static {
    fn family(&self) -> DeviceFamily;

    fn profile(&self, model: &str) -> UpgradeProfile;

    fn shell(&self) -> &'static str {
        "/bin/sh"
    }

    /// Where the image is staged on the device.
    fn image_path(&self) -> &'static str {
        "/tmp/netfleet-firmware.bin"
    }

    /// Shell command fetching `url` (already quoted) into `image`.
    fn download_command(&self, url: &str, image: &str) -> String {
        format!("curl -fsSL --retry 2 -o {image} {url}")
    }

    /// Shell command flashing `image`; must exit non-zero on failure.
    fn install_command(&self, image: &str) -> String;

    /// Command rebooting into the new image; `None` when install reboots itself.
    fn reboot_command(&self) -> Option<&'static str> {
        Some("reboot")
    }
}

/// Single-quote `raw` for a POSIX shell.
pub(crate) fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

/// Render the on-device upgrade script.
///
/// The script takes a lock, downloads, installs and reboots, printing one of
/// the failure markers when a step fails. It removes itself on exit.
pub fn render_script<F: ScriptFamily + ?Sized>(family: &F, url: &Url) -> String {
    let image = family.image_path();
    let mut script = format!(
        "#!{shell}\n\
         LOCK=/tmp/netfleet-upgrade.lock\n\
         if [ -e \"$LOCK\" ]; then echo '{in_progress}'; exit 1; fi\n\
         touch \"$LOCK\"\n\
         trap 'rm -f \"$LOCK\" \"$0\"' EXIT\n\
         if ! {download}; then echo '{download_failed}'; rm -f {image}; exit 1; fi\n\
         if ! {install}; then echo '{upgrade_failed}'; rm -f {image}; exit 1; fi\n",
        shell = family.shell(),
        in_progress = super::UPGRADE_IN_PROGRESS,
        download = family.download_command(&shell_quote(url.as_str()), image),
        download_failed = super::DOWNLOAD_FAILED,
        install = family.install_command(image),
        upgrade_failed = super::UPGRADE_FAILED,
    );
    if let Some(reboot) = family.reboot_command() {
        script.push_str("rm -f \"$LOCK\"\n");
        script.push_str(reboot);
        script.push('\n');
    }
    script
}

/// Paths used by one upgrade run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScriptPaths {
    pub script: String,
    pub log: String,
}

impl ScriptPaths {
    pub fn for_task(task_id: &str) -> Self {
        let tag: String = task_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        Self {
            script: format!("/tmp/netfleet-upgrade-{tag}.sh"),
            log: format!("/tmp/netfleet-upgrade-{tag}.log"),
        }
    }

    /// Write the script and start it detached with output captured in the log.
    pub fn launch_command(&self, shell: &str, script: &str) -> String {
        format!(
            "cat > {path} <<'NETFLEET_EOF'\n{script}NETFLEET_EOF\n\
             chmod +x {path} && nohup {shell} {path} > {log} 2>&1 < /dev/null &",
            path = self.script,
            log = self.log,
        )
    }

    pub fn read_command(&self) -> String {
        format!("cat {} 2>/dev/null || true", self.log)
    }
}

/// Worker pushing a shell script over the command channel and polling its log.
pub struct ScriptWorker<F> {
    family: F,
    deps: UpgradeDeps,
    overrides: ProfileOverride,
}

impl<F: ScriptFamily> ScriptWorker<F> {
    pub fn new(family: F, deps: UpgradeDeps) -> Self {
        Self {
            family,
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
        ctx.reporter.start_task(&ctx.task_id).await?;
        tracing::info!(
            task_id = %ctx.task_id,
            device_id = %ctx.device.id,
            family = %self.family.family(),
            version = %ctx.firmware.version(),
            "firmware upgrade started"
        );

        let url = download_url(&*self.deps.settings, &ctx.device, &ctx.firmware)?;
        let started = Instant::now();
        let reboot = async {
            if self.push_and_poll(ctx, profile, &url, started).await? == PollEnd::ChannelLost {
                self.wait_for_drop(ctx, profile, started).await;
            }
            Ok::<(), UpgradeError>(())
        };
        match tokio::time::timeout(profile.timeout, reboot).await {
            Ok(result) => result?,
            Err(_) => return Err(UpgradeError::Timeout),
        }

        let device = wait_for_reconnect(
            &*self.deps.devices,
            &ctx.device.id,
            profile.reconnect_timeout,
            self.deps.timings.reconnect_poll_interval,
        )
        .await?;
        verify_version(&ctx.firmware, &device)
    }

    async fn push_and_poll(
        &self,
        ctx: &UpgradeContext,
        profile: &UpgradeProfile,
        url: &Url,
        started: Instant,
    ) -> Result<PollEnd, UpgradeError> {
        let timings = &self.deps.timings;
        let runtime = self.deps.runtime.as_ref();
        let device_id = ctx.device.id.as_str();
        let paths = ScriptPaths::for_task(&ctx.task_id);
        let launch = paths.launch_command(self.family.shell(), &render_script(&self.family, url));
        let launch = launch.as_str();

        with_channel_retry(timings, "launch upgrade", move || runtime.run_command(device_id, launch))
            .await
            .map_err(UpgradeError::Launch)?;
        tracing::debug!(task_id = %ctx.task_id, script = %paths.script, "upgrade script launched");

        let read = paths.read_command();
        let mut ticker = interval(timings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut channel_failures = 0u32;
        let mut read_failures = 0u32;
        loop {
            ticker.tick().await;
            ctx.report_progress(profile.estimate(started.elapsed())).await;

            match runtime.run_command(device_id, &read).await {
                Ok(log) => {
                    channel_failures = 0;
                    if let Some(err) = classify_log(&log) {
                        return Err(err);
                    }
                }
                Err(CommandError::Channel(_) | CommandError::Unavailable(_)) => {
                    channel_failures += 1;
                    if channel_failures > timings.command_retries {
                        tracing::debug!(task_id = %ctx.task_id, "device dropped off while rebooting");
                        return Ok(PollEnd::ChannelLost);
                    }
                }
                Err(err) => {
                    read_failures += 1;
                    if read_failures > timings.command_retries {
                        return Err(UpgradeError::LogUnreadable(err));
                    }
                }
            }

            match self.deps.devices.find_by_id(device_id).await {
                Ok(Some(device)) if device.is_disconnected() => {
                    tracing::debug!(task_id = %ctx.task_id, "device disconnected; waiting for reconnect");
                    return Ok(PollEnd::Disconnected);
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(task_id = %ctx.task_id, error = %err, "device lookup failed during poll")
                }
            }
        }
    }

    /// Hold until the repository sees the reboot, or already reports the target firmware.
    ///
    /// A lost channel is noticed well before the inventory marks the device offline;
    /// the record still carries the pre-upgrade version until then.
    async fn wait_for_drop(&self, ctx: &UpgradeContext, profile: &UpgradeProfile, started: Instant) {
        let mut ticker = interval(self.deps.timings.reconnect_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match self.deps.devices.find_by_id(&ctx.device.id).await {
                Ok(Some(device)) if device.is_disconnected() => return,
                Ok(Some(device)) if verify_version(&ctx.firmware, &device).is_ok() => return,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(task_id = %ctx.task_id, error = %err, "device lookup failed while waiting for reboot")
                }
            }
            ctx.report_progress(profile.estimate(started.elapsed())).await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollEnd {
    Disconnected,
    ChannelLost,
}

/// Wait until the device repository no longer reports the device as disconnected.
async fn wait_for_reconnect(
    devices: &dyn DeviceRepository,
    device_id: &str,
    ceiling: Duration,
    poll: Duration,
) -> Result<Device, UpgradeError> {
    let deadline = Instant::now() + ceiling;
    loop {
        match devices.find_by_id(device_id).await {
            Ok(Some(device)) if !device.is_disconnected() => return Ok(device),
            Ok(_) => {}
            Err(err) => tracing::debug!(%device_id, error = %err, "device lookup failed during reconnect wait"),
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(UpgradeError::ReconnectTimeout);
        }
        tokio::time::sleep(poll.min(deadline - now)).await;
    }
}

#[async_trait]
impl<F: ScriptFamily> UpgradeWorker for ScriptWorker<F> {
    fn family(&self) -> DeviceFamily {
        self.family.family()
    }

    fn profile(&self, model: &str) -> UpgradeProfile {
        self.overrides.apply(self.family.profile(model))
    }

    async fn on_enqueue(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor) {
        write_status(&*self.deps.runtime, device, DeviceUpgradeStatus::queued(firmware));
    }

    async fn upgrade(&self, ctx: UpgradeContext) -> UpgradeOutcome {
        let profile = UpgradeWorker::profile(self, &ctx.device.model);
        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => None,
            result = self.run(&ctx, &profile) => Some(result),
        };
        finalize(&*self.deps.runtime, &ctx, &profile, result)
    }

    async fn cancel(&self, device: &DeviceSnapshot, firmware: &FirmwareDescriptor) {
        let profile = UpgradeWorker::profile(self, &device.model);
        write_status(
            &*self.deps.runtime,
            device,
            DeviceUpgradeStatus::canceled(firmware, profile.expected_ms()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    impl ScriptFamily for Plain {
        fn family(&self) -> DeviceFamily {
            DeviceFamily::Switch
        }

        fn profile(&self, _model: &str) -> UpgradeProfile {
            UpgradeProfile::from_secs(60, 120, 30)
        }

        fn install_command(&self, image: &str) -> String {
            format!("flash {image}")
        }
    }

    #[test]
    fn script_prints_markers_and_reboots() {
        let url = Url::parse("https://fw.example.net/a b/it's.bin").unwrap();
        let script = render_script(&Plain, &url);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("*ALREADY IN PROGRESS*"));
        assert!(script.contains("*DOWNLOAD FAILED*"));
        assert!(script.contains("*UPGRADE FAILED*"));
        assert!(script.contains("flash /tmp/netfleet-firmware.bin"));
        assert!(script.trim_end().ends_with("reboot"));
        assert!(script.contains(&shell_quote(url.as_str())));
    }

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn paths_are_derived_from_the_task() {
        let paths = ScriptPaths::for_task("6f1c2a9e-77aa-4b3e-9d15-0a9f2e1c7b44");
        assert_eq!(paths.script, "/tmp/netfleet-upgrade-6f1c2a9e77aa.sh");
        assert_eq!(paths.log, "/tmp/netfleet-upgrade-6f1c2a9e77aa.log");
        let launch = paths.launch_command("/bin/sh", "echo hi\n");
        assert!(launch.contains("nohup /bin/sh /tmp/netfleet-upgrade-6f1c2a9e77aa.sh"));
        assert!(launch.ends_with("&"));
    }
}
