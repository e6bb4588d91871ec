use serde_json::{json, Value};

use netfleet_events::Bus;
use netfleet_topics as topics;

use crate::model::{Device, Task};
use crate::ports::EventLog;

/// Audit log that publishes lifecycle envelopes on the event bus and mirrors
/// them to the `netfleet.audit` tracing target.
#[derive(Clone)]
pub struct BusEventLog {
    bus: Bus,
}

impl BusEventLog {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }

    fn emit(&self, kind: &str, task: &Task, device: Option<&Device>, extra: Value) {
        let mut payload = json!({
            "task_id": task.id,
            "kind": task.kind,
            "status": task.status,
            "device_id": task.device_id(),
            "user_id": task.user_id,
            "progress": task.progress,
        });
        if let Some(device) = device {
            payload["device"] = json!({
                "id": device.id,
                "name": device.name,
                "model": device.model,
                "family": device.family,
            });
        }
        if let (Some(obj), Value::Object(extra)) = (payload.as_object_mut(), extra) {
            obj.extend(extra);
        }
        tracing::info!(
            target: "netfleet.audit",
            event = kind,
            task_id = %task.id,
            device_id = %task.device_id(),
            status = %task.status,
            "{}",
            payload
        );
        self.bus.publish(kind, &payload);
    }
}

impl EventLog for BusEventLog {
    fn log_task_enqueued(&self, task: &Task) {
        self.emit(topics::TOPIC_TASK_ENQUEUED, task, None, Value::Null);
    }

    fn log_task_start(&self, task: &Task, device: Option<&Device>) {
        self.emit(topics::TOPIC_TASK_STARTED, task, device, Value::Null);
    }

    fn log_task_complete(&self, task: &Task, device: Option<&Device>) {
        self.emit(topics::TOPIC_TASK_COMPLETED, task, device, Value::Null);
    }

    fn log_task_fail(&self, task: &Task, device: Option<&Device>) {
        self.emit(
            topics::TOPIC_TASK_FAILED,
            task,
            device,
            json!({ "error": task.error }),
        );
    }

    fn log_task_cancel(&self, task: &Task, device: Option<&Device>, user_id: Option<&str>) {
        self.emit(
            topics::TOPIC_TASK_CANCELED,
            task,
            device,
            json!({
                "canceled_by": user_id,
                "initiator": if user_id.is_some() { "user" } else { "system" },
            }),
        );
    }
}
