use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::firmware::FirmwareDescriptor;
use super::task::{TaskStatus, UnknownVariant};

/// Device families with distinct upgrade mechanics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceFamily {
    /// Passive-optical terminal; upgraded through its parent OLT.
    Onu,
    /// EdgeOS-class routers and OLTs.
    EdgeOs,
    /// L2 switches.
    Switch,
    AirMax,
    AirFiber,
}

impl DeviceFamily {
    pub const ALL: [DeviceFamily; 5] = [
        DeviceFamily::Onu,
        DeviceFamily::EdgeOs,
        DeviceFamily::Switch,
        DeviceFamily::AirMax,
        DeviceFamily::AirFiber,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DeviceFamily::Onu => "onu",
            DeviceFamily::EdgeOs => "edgeOs",
            DeviceFamily::Switch => "switch",
            DeviceFamily::AirMax => "airMax",
            DeviceFamily::AirFiber => "airFiber",
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceFamily {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceFamily::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("device family", s))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Connectivity {
    Connected,
    Disconnected,
    #[default]
    Unknown,
}

impl Connectivity {
    pub fn as_str(self) -> &'static str {
        match self {
            Connectivity::Connected => "connected",
            Connectivity::Disconnected => "disconnected",
            Connectivity::Unknown => "unknown",
        }
    }
}

impl FromStr for Connectivity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Connectivity::Connected),
            "disconnected" => Ok(Connectivity::Disconnected),
            "unknown" => Ok(Connectivity::Unknown),
            other => Err(UnknownVariant::new("connectivity", other)),
        }
    }
}

/// Upgrade state an aggregation device reports for one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChildUpgradeState {
    Queued,
    Downloading,
    Upgrading,
    Finished,
    Failed,
}

/// Child status entry published by an OLT for one ONU.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildUpgradeReport {
    pub child_id: String,
    pub status: ChildUpgradeState,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    pub changed_at: DateTime<Utc>,
    /// Firmware the ONU is running, when the parent knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<Connectivity>,
}

/// Device record as read from the device repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub name: String,
    pub model: String,
    pub family: DeviceFamily,
    #[serde(default)]
    pub connectivity: Connectivity,
    /// Raw firmware string as reported by the device.
    #[serde(default)]
    pub firmware_version: Option<String>,
    /// Aggregation device for ONUs.
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    /// Management address used by the command channel.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub child_upgrades: Vec<ChildUpgradeReport>,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        model: impl Into<String>,
        family: DeviceFamily,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            model: model.into(),
            family,
            connectivity: Connectivity::Unknown,
            firmware_version: None,
            parent_id: None,
            site_id: None,
            address: None,
            child_upgrades: Vec::new(),
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.connectivity == Connectivity::Disconnected
    }

    pub fn child_upgrade(&self, child_id: &str) -> Option<&ChildUpgradeReport> {
        self.child_upgrades.iter().find(|r| r.child_id == child_id)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot::from(self)
    }
}

/// Identity of a device frozen into a task payload at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub id: String,
    pub name: String,
    pub model: String,
    pub family: DeviceFamily,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
}

impl From<&Device> for DeviceSnapshot {
    fn from(device: &Device) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            model: device.model.clone(),
            family: device.family,
            parent_id: device.parent_id.clone(),
            site_id: device.site_id.clone(),
        }
    }
}

/// Ephemeral, device-attached projection of an upgrade in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpgradeStatus {
    pub status: TaskStatus,
    /// Milliseconds; fixed per device model at dispatch time.
    pub expected_duration: u64,
    pub firmware: FirmwareDescriptor,
    pub error: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl DeviceUpgradeStatus {
    fn with(status: TaskStatus, firmware: &FirmwareDescriptor, expected_duration: u64) -> Self {
        Self {
            status,
            expected_duration,
            firmware: firmware.clone(),
            error: None,
            changed_at: Utc::now(),
        }
    }

    pub fn queued(firmware: &FirmwareDescriptor) -> Self {
        Self::with(TaskStatus::Queued, firmware, 0)
    }

    pub fn in_progress(firmware: &FirmwareDescriptor, expected_duration: u64) -> Self {
        Self::with(TaskStatus::InProgress, firmware, expected_duration)
    }

    pub fn success(firmware: &FirmwareDescriptor, expected_duration: u64) -> Self {
        Self::with(TaskStatus::Success, firmware, expected_duration)
    }

    pub fn failed(
        firmware: &FirmwareDescriptor,
        expected_duration: u64,
        error: impl Into<String>,
    ) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with(TaskStatus::Failed, firmware, expected_duration)
        }
    }

    pub fn canceled(firmware: &FirmwareDescriptor, expected_duration: u64) -> Self {
        Self::with(TaskStatus::Canceled, firmware, expected_duration)
    }

    pub fn is_live(&self) -> bool {
        self.status.is_live()
    }
}
