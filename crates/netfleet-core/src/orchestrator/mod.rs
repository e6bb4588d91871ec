//! Task orchestration: bounded queues, durable transitions and routing.

mod lifecycle;
mod manager;
mod queue;

pub use lifecycle::{TaskError, TaskLifecycle, TaskReporter};
pub use manager::{RecoveryReport, TaskManager};
pub use queue::{CancelOutcome, Discriminator, QueueError, QueueRoute, TaskProcessor, TaskQueue};
