use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareIdentification {
    pub version: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

/// Target firmware image; immutable once an upgrade starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareDescriptor {
    pub identification: FirmwareIdentification,
    /// Signed download location; absolute, or relative to the firmware base URL.
    pub secure_url: String,
}

impl FirmwareDescriptor {
    pub fn new(version: impl Into<String>, secure_url: impl Into<String>) -> Self {
        Self {
            identification: FirmwareIdentification {
                version: version.into(),
                model: None,
                platform: None,
            },
            secure_url: secure_url.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.identification.version
    }
}
