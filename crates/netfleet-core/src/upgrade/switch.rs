use super::{ScriptFamily, UpgradeProfile};
use crate::model::DeviceFamily;

/// Managed L2 switches.
#[derive(Debug, Clone, Copy, Default)]
pub struct Switch;

impl ScriptFamily for Switch {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::Switch
    }

    fn profile(&self, _model: &str) -> UpgradeProfile {
        UpgradeProfile::from_secs(6 * 60, 10 * 60, 30)
    }

    fn install_command(&self, image: &str) -> String {
        format!("/usr/bin/fwupdate -m {image}")
    }
}
