use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use netfleet_core::config::SshConfig;
use netfleet_core::memory::UpgradeStatusBoard;
use netfleet_core::model::{ChildUpgradeReport, DeviceUpgradeStatus};
use netfleet_core::ports::{CommandError, DeviceRepository, DeviceRuntime};
use netfleet_events::Bus;
use netfleet_topics as topics;

// ssh reserves 255 for its own failures
const SSH_TRANSPORT_EXIT: i32 = 255;

/// Device runtime shelling out to the system `ssh` client.
///
/// Addresses come from the device repository; the upgrade status projection is
/// kept in memory and mirrored onto the event bus.
pub struct SshRuntime {
    cfg: SshConfig,
    program: String,
    devices: Arc<dyn DeviceRepository>,
    board: UpgradeStatusBoard,
    bus: Bus,
}

impl SshRuntime {
    pub fn new(cfg: SshConfig, devices: Arc<dyn DeviceRepository>, bus: Bus) -> Self {
        Self {
            cfg,
            program: "ssh".to_string(),
            devices,
            board: UpgradeStatusBoard::default(),
            bus,
        }
    }

    pub fn config(&self) -> &SshConfig {
        &self.cfg
    }

    pub fn board(&self) -> &UpgradeStatusBoard {
        &self.board
    }

    fn command_timeout(&self) -> Duration {
        self.cfg.connect_timeout() + Duration::from_secs(30)
    }

    async fn address_of(&self, device_id: &str) -> Result<String, CommandError> {
        let device = self
            .devices
            .find_by_id(device_id)
            .await
            .map_err(|e| CommandError::Channel(format!("device lookup failed: {e}")))?
            .ok_or_else(|| CommandError::Unavailable(device_id.to_string()))?;
        device
            .address
            .ok_or_else(|| CommandError::Unavailable(device_id.to_string()))
    }

    async fn exec(&self, device_id: &str, command: &str) -> Result<String, CommandError> {
        let address = self.address_of(device_id).await?;
        let mut cmd = Command::new(&self.program);
        cmd.args(ssh_args(&self.cfg, &address, command))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        tracing::trace!(%device_id, %address, "ssh exec");
        let output = tokio::time::timeout(self.command_timeout(), cmd.output())
            .await
            .map_err(|_| CommandError::Channel(format!("ssh to {device_id} timed out")))?
            .map_err(|e| CommandError::Channel(format!("failed to spawn ssh: {e}")))?;
        classify_exit(
            output.status.code(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        )
    }

    /// Per-ONU upgrade reports published by an OLT.
    pub async fn onu_reports(&self, parent_id: &str) -> anyhow::Result<Vec<ChildUpgradeReport>> {
        let raw = self
            .exec(parent_id, self.cfg.onu_status_command())
            .await?;
        parse_reports(&raw).with_context(|| format!("onu reports from {parent_id}"))
    }

    fn publish_status(&self, device_id: &str, status: &DeviceUpgradeStatus) {
        self.bus.publish(
            topics::TOPIC_DEVICE_UPGRADE_STATUS,
            &json!({ "device_id": device_id, "upgrade": status }),
        );
    }
}

#[async_trait]
impl DeviceRuntime for SshRuntime {
    async fn run_command(&self, device_id: &str, command: &str) -> Result<String, CommandError> {
        self.exec(device_id, command).await
    }

    async fn upgrade_onu(
        &self,
        parent_id: &str,
        onu_id: &str,
        firmware_url: &str,
    ) -> Result<(), CommandError> {
        let command = render_onu_command(self.cfg.onu_upgrade_command(), onu_id, firmware_url);
        self.exec(parent_id, &command).await.map(|_| ())
    }

    fn upgrade_status(&self, device_id: &str) -> Option<DeviceUpgradeStatus> {
        self.board.get(device_id)
    }

    fn update_upgrade_status(&self, device_id: &str, status: DeviceUpgradeStatus) {
        self.publish_status(device_id, &status);
        self.board.set(device_id, status);
    }

    fn update_onu_upgrade_status(&self, parent_id: &str, onu_id: &str, status: DeviceUpgradeStatus) {
        self.publish_status(onu_id, &status);
        self.board.set_child(parent_id, onu_id, status);
    }

    fn clear_upgrade_status(&self, device_id: &str) {
        self.board.clear(device_id);
        self.bus.publish(
            topics::TOPIC_DEVICE_UPGRADE_CLEARED,
            &json!({ "device_id": device_id }),
        );
    }
}

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

pub(crate) fn ssh_args(cfg: &SshConfig, address: &str, command: &str) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "BatchMode=yes".to_string(),
        "-o".to_string(),
        format!("ConnectTimeout={}", cfg.connect_timeout().as_secs()),
    ];
    if let Some(port) = cfg.port {
        args.push("-p".into());
        args.push(port.to_string());
    }
    if let Some(identity) = &cfg.identity_file {
        args.push("-i".into());
        args.push(identity.clone());
    }
    for opt in &cfg.options {
        args.push("-o".into());
        args.push(opt.clone());
    }
    args.push(format!("{}@{}", cfg.user(), address));
    args.push("--".into());
    args.push(command.to_string());
    args
}

pub(crate) fn classify_exit(
    code: Option<i32>,
    stdout: String,
    stderr: String,
) -> Result<String, CommandError> {
    match code {
        Some(0) => Ok(stdout),
        Some(SSH_TRANSPORT_EXIT) | None => Err(CommandError::Channel(stderr.trim().to_string())),
        Some(status) => Err(CommandError::Remote {
            status,
            output: if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            },
        }),
    }
}

pub(crate) fn render_onu_command(template: &str, onu_id: &str, url: &str) -> String {
    template
        .replace("{onu}", &quote(onu_id))
        .replace("{url}", &quote(url))
}

pub(crate) fn parse_reports(raw: &str) -> anyhow::Result<Vec<ChildUpgradeReport>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}
