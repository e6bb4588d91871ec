#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use netfleet_core::memory::{
    MemoryDeviceStore, MemoryTaskStore, RecordingEventLog, UpgradeStatusBoard,
};
use netfleet_core::model::{
    Connectivity, Device, DeviceFamily, DeviceUpgradeStatus, FirmwareDescriptor, Task, TaskStatus,
    UpgradePayload,
};
use netfleet_core::orchestrator::{TaskLifecycle, TaskManager, TaskQueue};
use netfleet_core::ports::{CommandError, DeviceRuntime, TaskRepository};
use netfleet_core::upgrade::{
    upgrade_queue, ProfileOverride, UpgradeDeps, UpgradeTimings, WorkerRegistry,
};
use netfleet_core::StaticSettings;

type Handler = Box<dyn FnMut(&str, &str) -> Result<String, CommandError> + Send>;

/// Device runtime whose command channel answers from a test-provided handler.
pub struct ScriptedRuntime {
    pub board: UpgradeStatusBoard,
    handler: Mutex<Handler>,
    pub commands: Mutex<Vec<(String, String)>>,
    pub onu_triggers: Mutex<Vec<(String, String, String)>>,
}

impl ScriptedRuntime {
    pub fn new(
        handler: impl FnMut(&str, &str) -> Result<String, CommandError> + Send + 'static,
    ) -> Self {
        Self {
            board: UpgradeStatusBoard::default(),
            handler: Mutex::new(Box::new(handler)),
            commands: Mutex::new(Vec::new()),
            onu_triggers: Mutex::new(Vec::new()),
        }
    }

    pub fn status(&self, device_id: &str) -> Option<TaskStatus> {
        self.board.get(device_id).map(|s| s.status)
    }

    pub fn log_reads(&self) -> usize {
        self.commands
            .lock()
            .iter()
            .filter(|(_, cmd)| is_log_read(cmd))
            .count()
    }
}

pub fn is_launch(command: &str) -> bool {
    command.contains("nohup")
}

pub fn is_log_read(command: &str) -> bool {
    command.starts_with("cat /tmp/netfleet-upgrade-")
}

#[async_trait]
impl DeviceRuntime for ScriptedRuntime {
    async fn run_command(&self, device_id: &str, command: &str) -> Result<String, CommandError> {
        self.commands
            .lock()
            .push((device_id.to_string(), command.to_string()));
        let mut handler = self.handler.lock();
        (*handler)(device_id, command)
    }

    async fn upgrade_onu(
        &self,
        parent_id: &str,
        onu_id: &str,
        firmware_url: &str,
    ) -> Result<(), CommandError> {
        self.onu_triggers.lock().push((
            parent_id.to_string(),
            onu_id.to_string(),
            firmware_url.to_string(),
        ));
        Ok(())
    }

    fn upgrade_status(&self, device_id: &str) -> Option<DeviceUpgradeStatus> {
        self.board.get(device_id)
    }

    fn update_upgrade_status(&self, device_id: &str, status: DeviceUpgradeStatus) {
        self.board.set(device_id, status);
    }

    fn update_onu_upgrade_status(&self, parent_id: &str, onu_id: &str, status: DeviceUpgradeStatus) {
        self.board.set_child(parent_id, onu_id, status);
    }

    fn clear_upgrade_status(&self, device_id: &str) {
        self.board.clear(device_id);
    }
}

pub fn fast_timings() -> UpgradeTimings {
    UpgradeTimings {
        poll_interval: Duration::from_millis(20),
        command_retries: 3,
        command_retry_delay: Duration::from_millis(5),
        reconnect_poll_interval: Duration::from_millis(10),
    }
}

pub fn fast_profile() -> ProfileOverride {
    ProfileOverride {
        expected_duration: Some(Duration::from_millis(500)),
        timeout: Some(Duration::from_secs(3)),
        reconnect_timeout: Some(Duration::from_millis(300)),
    }
}

pub fn store(devices: impl IntoIterator<Item = Device>) -> Arc<MemoryDeviceStore> {
    Arc::new(MemoryDeviceStore::with_devices(devices))
}

pub fn router(version: &str) -> Device {
    let mut device = Device::new("dev-1", "ER-X", DeviceFamily::EdgeOs);
    device.connectivity = Connectivity::Connected;
    device.firmware_version = Some(version.to_string());
    device
}

pub fn target() -> FirmwareDescriptor {
    FirmwareDescriptor::new("2.1.0", "er-x/2.1.0.tar")
}

pub struct Harness {
    pub tasks: Arc<MemoryTaskStore>,
    pub devices: Arc<MemoryDeviceStore>,
    pub runtime: Arc<ScriptedRuntime>,
    pub events: Arc<RecordingEventLog>,
    pub manager: Arc<TaskManager>,
    pub queue: TaskQueue<UpgradePayload>,
}

impl Harness {
    pub fn new(
        devices: Arc<MemoryDeviceStore>,
        runtime: ScriptedRuntime,
        profile: ProfileOverride,
    ) -> Self {
        Self::with_concurrency(devices, runtime, profile, 1)
    }

    pub fn with_concurrency(
        devices: Arc<MemoryDeviceStore>,
        runtime: ScriptedRuntime,
        profile: ProfileOverride,
        concurrency: usize,
    ) -> Self {
        let tasks = Arc::new(MemoryTaskStore::default());
        let runtime = Arc::new(runtime);
        let events = Arc::new(RecordingEventLog::default());
        let lifecycle = Arc::new(TaskLifecycle::new(
            tasks.clone(),
            devices.clone(),
            events.clone(),
        ));
        let deps = UpgradeDeps {
            devices: devices.clone(),
            runtime: runtime.clone(),
            settings: Arc::new(StaticSettings::with_base_url(
                Url::parse("https://fw.example.net/firmwares/").unwrap(),
            )),
            timings: fast_timings(),
        };
        let registry = Arc::new(WorkerRegistry::standard(deps, move |_| profile));
        let queue = upgrade_queue(registry, lifecycle.clone(), concurrency);
        let manager = Arc::new(TaskManager::new(lifecycle).with_queue(Arc::new(queue.clone())));
        Self {
            tasks,
            devices,
            runtime,
            events,
            manager,
            queue,
        }
    }

    /// Persist a new upgrade task for `device_id` without admitting it.
    pub async fn persist(&self, device_id: &str, firmware: FirmwareDescriptor, user: Option<&str>) -> Task {
        let device = self.devices.get(device_id).unwrap();
        let task = Task::firmware_upgrade(device.snapshot(), firmware, user.map(str::to_string));
        self.tasks.insert(&task).await.unwrap()
    }

    pub async fn submit(&self, device_id: &str, firmware: FirmwareDescriptor, user: Option<&str>) -> Task {
        let task = self.persist(device_id, firmware, user).await;
        self.manager.enqueue_task(&task).await.unwrap();
        task
    }

    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.queue.wait_idle())
            .await
            .expect("queue did not drain");
    }

    pub fn task(&self, id: &str) -> Task {
        self.tasks.get(id).unwrap()
    }

    pub async fn wait_for_status(&self, id: &str, status: TaskStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.task(id).status != status {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("task never reached the expected status");
    }
}

/// Bring the device back with `version` shortly after it drops off.
pub fn simulate_reboot(devices: Arc<MemoryDeviceStore>, device_id: &str, version: &str, delay: Duration) {
    let device_id = device_id.to_string();
    let version = version.to_string();
    tokio::spawn(async move {
        loop {
            match devices.get(&device_id) {
                Some(d) if d.is_disconnected() => break,
                Some(_) => tokio::time::sleep(Duration::from_millis(5)).await,
                None => return,
            }
        }
        tokio::time::sleep(delay).await;
        devices.modify(&device_id, |d| {
            d.connectivity = Connectivity::Connected;
            d.firmware_version = Some(version);
        });
    });
}

/// Channel that reports "no signal" and takes the device offline on read `reads`.
pub fn reboot_after_reads(devices: Arc<MemoryDeviceStore>, reads: usize) -> ScriptedRuntime {
    let mut seen = 0;
    ScriptedRuntime::new(move |device_id, command| {
        if is_log_read(command) {
            seen += 1;
            if seen == reads {
                devices.set_connectivity(device_id, Connectivity::Disconnected);
            }
            return Ok("Downloading firmware...\n".to_string());
        }
        Ok(String::new())
    })
}
