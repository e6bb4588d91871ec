//! Canonical event topic constants shared across the engine, daemon and CLI.
//!
//! Audit consumers and the SQLite journal key off these strings, so treat them
//! as a stable contract. Keep this list grouped by subsystem and favor dot.case names.

// Task lifecycle (audit)
pub const TOPIC_TASK_ENQUEUED: &str = "task.enqueued";
pub const TOPIC_TASK_STARTED: &str = "task.started";
pub const TOPIC_TASK_PROGRESS: &str = "task.progress";
pub const TOPIC_TASK_COMPLETED: &str = "task.completed";
pub const TOPIC_TASK_FAILED: &str = "task.failed";
pub const TOPIC_TASK_CANCELED: &str = "task.canceled";

// Device upgrade projection
pub const TOPIC_DEVICE_UPGRADE_STATUS: &str = "device.upgrade.status";
pub const TOPIC_DEVICE_UPGRADE_CLEARED: &str = "device.upgrade.cleared";

// Queue / orchestrator
pub const TOPIC_QUEUE_PAUSED: &str = "queue.paused";
pub const TOPIC_QUEUE_RESUMED: &str = "queue.resumed";
pub const TOPIC_QUEUE_RECOVERED: &str = "queue.recovered";

// Service lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";

/// Topics that make up the task audit trail, in lifecycle order.
pub const AUDIT_TOPICS: &[&str] = &[
    TOPIC_TASK_ENQUEUED,
    TOPIC_TASK_STARTED,
    TOPIC_TASK_COMPLETED,
    TOPIC_TASK_FAILED,
    TOPIC_TASK_CANCELED,
];

/// Returns true when a topic belongs to the task audit trail.
pub fn is_audit_topic(kind: &str) -> bool {
    AUDIT_TOPICS.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_not_part_of_the_audit_trail() {
        assert!(is_audit_topic(TOPIC_TASK_FAILED));
        assert!(!is_audit_topic(TOPIC_TASK_PROGRESS));
        assert!(!is_audit_topic(TOPIC_DEVICE_UPGRADE_STATUS));
    }
}
