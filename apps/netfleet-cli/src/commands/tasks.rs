use anyhow::{anyhow, bail, ensure, Result};
use clap::{Args, Subcommand};
use serde_json::json;

use netfleet_core::model::{FirmwareDescriptor, Task, TaskFilter, TaskPayload, TaskStatus};
use netfleet_core::FirmwareCatalog;
use netfleet_kernel::{EventRow, Kernel};

use super::{print_json, Env};

#[derive(Subcommand)]
pub enum TasksCmd {
    /// Queue a firmware upgrade for one device
    Submit(SubmitArgs),
    /// Ask the daemon to cancel a queued or running task
    Cancel(CancelArgs),
    /// List tasks, oldest first
    List(ListArgs),
    /// Show one task with its journaled events
    Show(ShowArgs),
}

#[derive(Args)]
pub struct SubmitArgs {
    /// Device id
    #[arg(long)]
    device: String,
    /// Target firmware version (resolved through the [[firmware]] catalog)
    #[arg(long)]
    version: String,
    /// Image URL, absolute or relative to the firmware base URL; skips the catalog
    #[arg(long)]
    url: Option<String>,
    /// Initiating user recorded on the task
    #[arg(long)]
    user: Option<String>,
    /// Emit the created task as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct CancelArgs {
    /// Task id
    id: String,
    /// User recorded as the canceler
    #[arg(long)]
    user: Option<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Filter by status (queued|inProgress|success|failed|canceled); repeatable
    #[arg(long = "status")]
    statuses: Vec<String>,
    /// Filter by device id
    #[arg(long)]
    device: Option<String>,
    /// Only show the newest N matches
    #[arg(long)]
    limit: Option<usize>,
    /// Emit raw JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Task id
    id: String,
    /// Emit raw JSON instead of formatted text
    #[arg(long)]
    json: bool,
}

pub fn run(cmd: TasksCmd, env: &Env) -> Result<()> {
    match cmd {
        TasksCmd::Submit(args) => {
            let catalog = FirmwareCatalog::new(env.config.firmware.clone());
            let task = submit(&env.kernel, &catalog, &args)?;
            if args.json {
                print_json(&serde_json::to_value(&task)?, true);
            } else {
                println!("{}", task.id);
            }
        }
        TasksCmd::Cancel(args) => {
            cancel(&env.kernel, &args)?;
            println!("cancel requested for {}", args.id);
        }
        TasksCmd::List(args) => {
            let tasks = list(&env.kernel, &args)?;
            if args.json {
                print_json(&serde_json::to_value(&tasks)?, false);
            } else if tasks.is_empty() {
                println!("no tasks");
            } else {
                for task in &tasks {
                    println!("{}", summary_line(task));
                }
            }
        }
        TasksCmd::Show(args) => {
            let (task, events) = show(&env.kernel, &args.id)?;
            if args.json {
                print_json(&json!({ "task": task, "events": events }), true);
            } else {
                println!("{}", summary_line(&task));
                if let Some(error) = &task.error {
                    println!("  error: {error}");
                }
                for ev in &events {
                    println!("  {}  {}", ev.time, ev.kind);
                }
            }
        }
    }
    Ok(())
}

/// Persist a queued upgrade task; the daemon's intake admits it.
pub fn submit(kernel: &Kernel, catalog: &FirmwareCatalog, args: &SubmitArgs) -> Result<Task> {
    let device = kernel
        .get_device(&args.device)?
        .ok_or_else(|| anyhow!("unknown device {}", args.device))?;
    let mut live = TaskFilter::live();
    live.device_id = Some(device.id.clone());
    if let Some(existing) = kernel.list_tasks(&live)?.first() {
        bail!(
            "device {} already has a {} task {}",
            device.id,
            existing.status,
            existing.id
        );
    }
    let firmware = match &args.url {
        Some(url) => FirmwareDescriptor::new(args.version.as_str(), url.as_str()),
        None => catalog.find(&device.model, &args.version).ok_or_else(|| {
            anyhow!(
                "no firmware {} for model {} in the catalog",
                args.version,
                device.model
            )
        })?,
    };
    let task = Task::firmware_upgrade(device.snapshot(), firmware, args.user.clone());
    kernel.insert_task(&task)?;
    tracing::debug!(task_id = %task.id, device_id = %device.id, "task submitted");
    Ok(task)
}

pub fn cancel(kernel: &Kernel, args: &CancelArgs) -> Result<i64> {
    let task = kernel
        .get_task(&args.id)?
        .ok_or_else(|| anyhow!("unknown task {}", args.id))?;
    ensure!(
        task.status.is_live(),
        "task {} is already {}",
        task.id,
        task.status
    );
    kernel.request_cancel(&task.id, args.user.as_deref())
}

pub fn list(kernel: &Kernel, args: &ListArgs) -> Result<Vec<Task>> {
    let mut filter = TaskFilter::default();
    if !args.statuses.is_empty() {
        let statuses = args
            .statuses
            .iter()
            .map(|s| s.parse::<TaskStatus>())
            .collect::<Result<Vec<_>, _>>()?;
        filter.statuses = Some(statuses);
    }
    filter.device_id = args.device.clone();
    let mut tasks = kernel.list_tasks(&filter)?;
    if let Some(limit) = args.limit {
        let skip = tasks.len().saturating_sub(limit);
        tasks.drain(..skip);
    }
    Ok(tasks)
}

pub fn show(kernel: &Kernel, id: &str) -> Result<(Task, Vec<EventRow>)> {
    let task = kernel
        .get_task(id)?
        .ok_or_else(|| anyhow!("unknown task {id}"))?;
    let events = kernel.task_events(id)?;
    Ok((task, events))
}

fn summary_line(task: &Task) -> String {
    let TaskPayload::FirmwareUpgrade(payload) = &task.payload;
    format!(
        "{}  {:<10}  {:>5.1}%  {:<16}  {:<10}  {}",
        task.id,
        task.status.as_str(),
        task.progress * 100.0,
        payload.device.id,
        payload.firmware.version(),
        task.user_id.as_deref().unwrap_or("-"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use netfleet_core::config::FirmwareEntry;
    use netfleet_core::model::{Device, DeviceFamily, TaskPatch};

    fn kernel_with_router() -> (tempfile::TempDir, Kernel) {
        let dir = tempfile::tempdir().unwrap();
        let kernel = Kernel::open(dir.path()).unwrap();
        kernel
            .upsert_device(&Device::new("dev-1", "ER-X", DeviceFamily::EdgeOs))
            .unwrap();
        (dir, kernel)
    }

    fn catalog() -> FirmwareCatalog {
        FirmwareCatalog::new(vec![FirmwareEntry {
            model: "ER-X".into(),
            version: "2.1.0".into(),
            url: "er-x/2.1.0.tar".into(),
            platform: None,
        }])
    }

    fn submit_args(version: &str) -> SubmitArgs {
        SubmitArgs {
            device: "dev-1".into(),
            version: version.into(),
            url: None,
            user: Some("alice".into()),
            json: false,
        }
    }

    #[test]
    fn submit_resolves_firmware_and_blocks_a_second_live_task() {
        let (_dir, kernel) = kernel_with_router();
        let task = submit(&kernel, &catalog(), &submit_args("2.1.0")).unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.user_id.as_deref(), Some("alice"));
        let TaskPayload::FirmwareUpgrade(payload) = &task.payload;
        assert_eq!(payload.firmware.secure_url, "er-x/2.1.0.tar");

        let err = submit(&kernel, &catalog(), &submit_args("2.1.0")).unwrap_err();
        assert!(err.to_string().contains(&task.id), "{err}");

        kernel
            .update_task(&TaskPatch::new(&task.id).status(TaskStatus::Canceled))
            .unwrap();
        assert!(submit(&kernel, &catalog(), &submit_args("2.1.0")).is_ok());
    }

    #[test]
    fn submit_rejects_unknown_devices_and_versions() {
        let (_dir, kernel) = kernel_with_router();
        let err = submit(&kernel, &catalog(), &submit_args("9.9.9")).unwrap_err();
        assert!(err.to_string().contains("9.9.9"), "{err}");

        let mut args = submit_args("2.1.0");
        args.device = "nope".into();
        assert!(submit(&kernel, &catalog(), &args).is_err());

        let mut explicit = submit_args("9.9.9");
        explicit.url = Some("https://fw.example.net/custom.tar".into());
        assert!(submit(&kernel, &catalog(), &explicit).is_ok());
    }

    #[test]
    fn cancel_requires_a_live_task() {
        let (_dir, kernel) = kernel_with_router();
        let task = submit(&kernel, &catalog(), &submit_args("2.1.0")).unwrap();
        let args = CancelArgs {
            id: task.id.clone(),
            user: Some("bob".into()),
        };
        cancel(&kernel, &args).unwrap();
        let pending = kernel.pending_cancels(10).unwrap();
        assert_eq!(pending[0].user_id.as_deref(), Some("bob"));

        kernel
            .update_task(&TaskPatch::new(&task.id).status(TaskStatus::Canceled))
            .unwrap();
        assert!(cancel(&kernel, &args).is_err());
    }

    #[test]
    fn list_filters_and_limits() {
        let (_dir, kernel) = kernel_with_router();
        kernel
            .upsert_device(&Device::new("dev-2", "ER-X", DeviceFamily::EdgeOs))
            .unwrap();
        let first = submit(&kernel, &catalog(), &submit_args("2.1.0")).unwrap();
        let mut other = submit_args("2.1.0");
        other.device = "dev-2".into();
        let second = submit(&kernel, &catalog(), &other).unwrap();

        let mut args = ListArgs {
            statuses: vec!["queued".into()],
            device: None,
            limit: None,
            json: false,
        };
        assert_eq!(list(&kernel, &args).unwrap().len(), 2);
        args.limit = Some(1);
        assert_eq!(list(&kernel, &args).unwrap()[0].id, second.id);
        args.limit = None;
        args.device = Some("dev-1".into());
        assert_eq!(list(&kernel, &args).unwrap()[0].id, first.id);
        args.statuses = vec!["running".into()];
        assert!(list(&kernel, &args).is_err());
    }
}
