//! Firmware upgrade orchestration for a managed device fleet.
//!
//! Tasks are persisted through [`ports::TaskRepository`], routed by
//! [`orchestrator::TaskManager`] onto bounded [`orchestrator::TaskQueue`]s and
//! executed by the per-family workers in [`upgrade`].

pub mod audit;
pub mod config;
pub mod firmware;
pub mod memory;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod reaper;
pub mod upgrade;

pub use audit::BusEventLog;
pub use config::{load_config, parse_config, Config};
pub use firmware::{download_url, FirmwareCatalog, StaticSettings};
pub use orchestrator::{TaskError, TaskLifecycle, TaskManager, TaskQueue, TaskReporter};
pub use reaper::StatusReaper;
