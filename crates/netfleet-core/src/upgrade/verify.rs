use once_cell::sync::Lazy;
use regex::Regex;
use semver::Version;

use super::UpgradeError;
use crate::model::{Device, FirmwareDescriptor};

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+)\.(\d+)\.(\d+)(?:[-.](alpha|beta|rc|hotfix)[.-]?(\d+))?")
        .expect("firmware version regex")
});

/// Normalise a raw firmware string into a semantic version.
///
/// Device reports embed the version in build strings such as
/// `EdgeRouter.ER-e50.v2.0.9-hotfix.6.5574651.221230.1015` or `XW.ar934x.v6.3.6.33330`.
pub fn derive_version(raw: &str) -> Option<Version> {
    let caps = VERSION_RE.captures(raw)?;
    let mut text = format!("{}.{}.{}", &caps[1], &caps[2], &caps[3]);
    if let (Some(label), Some(num)) = (caps.get(4), caps.get(5)) {
        text.push('-');
        text.push_str(label.as_str());
        text.push('.');
        text.push_str(num.as_str());
    }
    Version::parse(&text).ok()
}

/// Compare the version the device now reports with the target firmware.
pub fn verify_version(firmware: &FirmwareDescriptor, device: &Device) -> Result<(), UpgradeError> {
    let expected_raw = firmware.version();
    let reported = device.firmware_version.as_deref().unwrap_or_default();
    let matches = match (derive_version(expected_raw), derive_version(reported)) {
        (Some(expected), Some(actual)) => expected == actual,
        _ => !reported.is_empty() && reported.trim() == expected_raw.trim(),
    };
    if matches {
        return Ok(());
    }
    let actual = match derive_version(reported) {
        Some(v) => v.to_string(),
        None if reported.is_empty() => "unknown".to_string(),
        None => reported.to_string(),
    };
    Err(UpgradeError::VersionMismatch {
        expected: expected_raw.to_string(),
        actual,
    })
}
