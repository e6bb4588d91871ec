use super::{ScriptFamily, UpgradeProfile};
use crate::model::DeviceFamily;

// e50-based routers flash noticeably faster than the larger models.
const FAST_MODELS: &[&str] = &["ER-X", "ER-X-SFP", "ER-10X", "EP-R6"];

/// EdgeOS routers and OLTs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EdgeOs;

impl ScriptFamily for EdgeOs {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::EdgeOs
    }

    fn profile(&self, model: &str) -> UpgradeProfile {
        if FAST_MODELS.iter().any(|m| m.eq_ignore_ascii_case(model)) {
            UpgradeProfile::from_secs(5 * 60, 15 * 60, 30)
        } else {
            UpgradeProfile::from_secs(8 * 60, 15 * 60, 30)
        }
    }

    fn image_path(&self) -> &'static str {
        "/tmp/netfleet-firmware.tar"
    }

    fn install_command(&self, image: &str) -> String {
        format!("/usr/sbin/ubnt-add-system-image {image}")
    }

    fn reboot_command(&self) -> Option<&'static str> {
        Some("/sbin/reboot")
    }
}
