use super::UpgradeError;

pub const DOWNLOAD_FAILED: &str = "*DOWNLOAD FAILED*";
pub const UPGRADE_FAILED: &str = "*UPGRADE FAILED*";
pub const UPGRADE_IN_PROGRESS: &str = "*ALREADY IN PROGRESS*";

/// Scan the upgrade log for a failure marker.
///
/// A log without markers means the upgrade is still running or has handed
/// off to the reboot.
pub fn classify_log(output: &str) -> Option<UpgradeError> {
    if output.contains(UPGRADE_IN_PROGRESS) {
        Some(UpgradeError::AlreadyInProgress)
    } else if output.contains(DOWNLOAD_FAILED) {
        Some(UpgradeError::DownloadFailed)
    } else if output.contains(UPGRADE_FAILED) {
        Some(UpgradeError::UpgradeFailed)
    } else {
        None
    }
}
