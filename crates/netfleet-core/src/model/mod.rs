mod device;
mod firmware;
mod task;

pub use device::{
    ChildUpgradeReport, ChildUpgradeState, Connectivity, Device, DeviceFamily, DeviceSnapshot,
    DeviceUpgradeStatus,
};
pub use firmware::{FirmwareDescriptor, FirmwareIdentification};
pub use task::{
    Task, TaskFilter, TaskKind, TaskPatch, TaskPayload, TaskStatus, UnknownVariant, UpgradePayload,
};
