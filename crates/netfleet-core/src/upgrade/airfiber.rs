use super::{ScriptFamily, UpgradeProfile};
use crate::model::DeviceFamily;

/// airFiber backhauls.
#[derive(Debug, Clone, Copy, Default)]
pub struct AirFiber;

impl ScriptFamily for AirFiber {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::AirFiber
    }

    fn profile(&self, model: &str) -> UpgradeProfile {
        let upper = model.to_ascii_uppercase();
        if upper.starts_with("AF60") || upper.starts_with("AF-60") {
            UpgradeProfile::from_secs(5 * 60, 12 * 60, 20)
        } else {
            UpgradeProfile::from_secs(7 * 60, 12 * 60, 20)
        }
    }

    fn image_path(&self) -> &'static str {
        "/tmp/fwupdate.bin"
    }

    fn download_command(&self, url: &str, image: &str) -> String {
        format!("wget -q -O {image} {url}")
    }

    fn install_command(&self, image: &str) -> String {
        format!("/usr/bin/af_fwupdate {image}")
    }
}
