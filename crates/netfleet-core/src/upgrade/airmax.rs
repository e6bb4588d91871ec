use super::{ScriptFamily, UpgradeProfile};
use crate::model::DeviceFamily;

/// airMAX radios. The stock image ships wget only, and `fwupdate` reboots on
/// its own once the flash succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AirMax;

impl ScriptFamily for AirMax {
    fn family(&self) -> DeviceFamily {
        DeviceFamily::AirMax
    }

    fn profile(&self, _model: &str) -> UpgradeProfile {
        UpgradeProfile::from_secs(5 * 60, 10 * 60, 15)
    }

    fn image_path(&self) -> &'static str {
        "/tmp/fwupdate.bin"
    }

    fn download_command(&self, url: &str, image: &str) -> String {
        format!("wget -q -O {image} {url}")
    }

    fn install_command(&self, _image: &str) -> String {
        "/sbin/fwupdate -m".to_string()
    }

    fn reboot_command(&self) -> Option<&'static str> {
        None
    }
}
