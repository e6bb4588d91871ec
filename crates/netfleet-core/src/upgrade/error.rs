use crate::firmware::DownloadUrlError;
use crate::orchestrator::TaskError;
use crate::ports::CommandError;

/// Reasons an upgrade fails; `Display` is the message stored on the task.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Firmware download has failed")]
    DownloadFailed,
    #[error("Device upgrade has failed")]
    UpgradeFailed,
    #[error("Device upgrade is already in progress")]
    AlreadyInProgress,
    #[error("Device upgrade timeout")]
    Timeout,
    #[error("Waiting for device to connect timeout")]
    ReconnectTimeout,
    #[error("Firmware version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: String, actual: String },
    #[error("ONU upgrade has failed")]
    OnuFailed,
    #[error("{0}")]
    OnuReported(String),
    #[error("ONU {0} has no parent device")]
    MissingParent(String),
    #[error("Failed to start device upgrade: {0}")]
    Launch(CommandError),
    #[error("Failed to read upgrade log: {0}")]
    LogUnreadable(CommandError),
    #[error(transparent)]
    DownloadUrl(#[from] DownloadUrlError),
    #[error("Failed to record task start: {0}")]
    Task(#[from] TaskError),
}
