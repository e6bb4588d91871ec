use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::model::Task;

/// Claims a task for a queue and projects the payload that queue runs.
pub type Discriminator<P> = Arc<dyn Fn(&Task) -> Option<P> + Send + Sync>;

/// Work executed by a [`TaskQueue`].
#[async_trait]
pub trait TaskProcessor<P>: Send + Sync {
    /// Runs before the task becomes visible to the dispatcher.
    async fn on_enqueue(&self, task_id: &str, payload: &P);

    /// Execute the task. Must return promptly once `cancel` fires.
    async fn process(&self, task_id: &str, payload: P, cancel: CancellationToken)
        -> anyhow::Result<()>;

    /// Canceler hook; runs for running, queued and unknown tasks alike.
    async fn on_cancel(&self, task_id: &str, payload: &P);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue {queue} is saturated ({in_flight}/{concurrency} in flight)")]
    Saturated {
        queue: String,
        in_flight: usize,
        concurrency: usize,
    },
    #[error("queue {queue} does not accept task {task_id}")]
    Rejected { queue: String, task_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task was running; its cancellation token has been tripped.
    Running,
    /// The task was waiting and has been removed before it started.
    Dequeued,
    /// The queue did not hold the task.
    Unknown,
}

/// Generic FIFO dispatcher running at most `concurrency` tasks at a time.
pub struct TaskQueue<P> {
    inner: Arc<QueueInner<P>>,
}

impl<P> Clone for TaskQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueueInner<P> {
    name: String,
    concurrency: usize,
    discriminator: Discriminator<P>,
    processor: Arc<dyn TaskProcessor<P>>,
    state: Mutex<QueueState<P>>,
    idle: Notify,
}

struct QueueState<P> {
    // ids in enqueue order; ids missing from `pending` were canceled before start
    order: VecDeque<String>,
    pending: HashMap<String, P>,
    running: HashMap<String, Running<P>>,
    paused: usize,
}

struct Running<P> {
    cancel: CancellationToken,
    payload: P,
}

impl<P> TaskQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        concurrency: usize,
        discriminator: Discriminator<P>,
        processor: Arc<dyn TaskProcessor<P>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                concurrency: concurrency.max(1),
                discriminator,
                processor,
                state: Mutex::new(QueueState {
                    order: VecDeque::new(),
                    pending: HashMap::new(),
                    running: HashMap::new(),
                    paused: 0,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    pub fn can_process(&self, task: &Task) -> bool {
        (self.inner.discriminator)(task).is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().running.len()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        let st = self.inner.state.lock();
        st.pending.contains_key(task_id) || st.running.contains_key(task_id)
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused > 0
    }

    /// Append a task; starts it right away when capacity allows.
    pub async fn enqueue(&self, task_id: impl Into<String>, payload: P) {
        let task_id = task_id.into();
        if self.contains(&task_id) {
            tracing::debug!(queue = %self.inner.name, %task_id, "task already queued");
            return;
        }
        self.inner.processor.on_enqueue(&task_id, &payload).await;
        {
            let mut st = self.inner.state.lock();
            if st.pending.contains_key(&task_id) || st.running.contains_key(&task_id) {
                return;
            }
            st.order.push_back(task_id.clone());
            st.pending.insert(task_id.clone(), payload);
        }
        tracing::debug!(queue = %self.inner.name, %task_id, "task enqueued");
        self.pump();
    }

    /// Start the next live task.
    ///
    /// Returns `Ok(false)` when the queue is paused or empty. Calling this at the
    /// concurrency limit is a caller bug and yields [`QueueError::Saturated`].
    pub fn process(&self) -> Result<bool, QueueError> {
        let (task_id, payload, cancel) = {
            let mut st = self.inner.state.lock();
            if st.running.len() >= self.inner.concurrency {
                return Err(QueueError::Saturated {
                    queue: self.inner.name.clone(),
                    in_flight: st.running.len(),
                    concurrency: self.inner.concurrency,
                });
            }
            if st.paused > 0 {
                return Ok(false);
            }
            let (task_id, payload) = loop {
                let Some(id) = st.order.pop_front() else {
                    return Ok(false);
                };
                if let Some(payload) = st.pending.remove(&id) {
                    break (id, payload);
                }
            };
            let cancel = CancellationToken::new();
            st.running.insert(
                task_id.clone(),
                Running {
                    cancel: cancel.clone(),
                    payload: payload.clone(),
                },
            );
            (task_id, payload, cancel)
        };

        let queue = self.clone();
        tokio::spawn(async move {
            tracing::debug!(queue = %queue.inner.name, %task_id, "task started");
            let run = queue.inner.processor.process(&task_id, payload, cancel);
            match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::warn!(queue = %queue.inner.name, %task_id, error = %err, "task processor failed");
                }
                Err(_) => {
                    tracing::error!(queue = %queue.inner.name, %task_id, "task processor panicked");
                }
            }
            queue.finish(&task_id);
            queue.pump();
        });
        Ok(true)
    }

    /// Cancel a running or waiting task, then run the canceler hook.
    pub async fn cancel(&self, task_id: &str, payload: &P) -> CancelOutcome {
        let outcome = {
            let mut st = self.inner.state.lock();
            if let Some(running) = st.running.get(task_id) {
                running.cancel.cancel();
                CancelOutcome::Running
            } else if st.pending.remove(task_id).is_some() {
                st.order.retain(|id| id != task_id);
                CancelOutcome::Dequeued
            } else {
                CancelOutcome::Unknown
            }
        };
        tracing::debug!(queue = %self.inner.name, %task_id, ?outcome, "task cancel requested");
        self.inner.processor.on_cancel(task_id, payload).await;
        if outcome == CancelOutcome::Dequeued {
            self.notify_if_idle();
        }
        outcome
    }

    /// Suspend dispatch of new tasks; calls nest.
    pub fn pause(&self) {
        let mut st = self.inner.state.lock();
        st.paused += 1;
        tracing::debug!(queue = %self.inner.name, depth = st.paused, "queue paused");
    }

    pub fn resume(&self) {
        let resumed = {
            let mut st = self.inner.state.lock();
            st.paused = st.paused.saturating_sub(1);
            st.paused == 0
        };
        if resumed {
            tracing::debug!(queue = %self.inner.name, "queue resumed");
            self.pump();
        }
    }

    /// Wait until nothing is running or waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    fn is_idle(&self) -> bool {
        let st = self.inner.state.lock();
        st.running.is_empty() && st.pending.is_empty()
    }

    fn has_capacity(&self) -> bool {
        self.inner.state.lock().running.len() < self.inner.concurrency
    }

    fn pump(&self) {
        while self.has_capacity() {
            match self.process() {
                Ok(true) => continue,
                Ok(false) | Err(QueueError::Saturated { .. }) => break,
                Err(err) => {
                    tracing::warn!(queue = %self.inner.name, error = %err, "queue pump stopped");
                    break;
                }
            }
        }
    }

    fn finish(&self, task_id: &str) {
        self.inner.state.lock().running.remove(task_id);
        self.notify_if_idle();
    }

    fn notify_if_idle(&self) {
        if self.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Object-safe view of a queue used by the task manager for routing.
#[async_trait]
pub trait QueueRoute: Send + Sync {
    fn name(&self) -> &str;
    fn can_process(&self, task: &Task) -> bool;
    fn contains(&self, task_id: &str) -> bool;
    async fn enqueue_task(&self, task: &Task) -> Result<(), QueueError>;
    async fn cancel_task(&self, task: &Task) -> Result<CancelOutcome, QueueError>;
    fn pause(&self);
    fn resume(&self);
}

#[async_trait]
impl<P> QueueRoute for TaskQueue<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        TaskQueue::name(self)
    }

    fn can_process(&self, task: &Task) -> bool {
        TaskQueue::can_process(self, task)
    }

    fn contains(&self, task_id: &str) -> bool {
        TaskQueue::contains(self, task_id)
    }

    async fn enqueue_task(&self, task: &Task) -> Result<(), QueueError> {
        let payload = (self.inner.discriminator)(task).ok_or_else(|| QueueError::Rejected {
            queue: self.inner.name.clone(),
            task_id: task.id.clone(),
        })?;
        self.enqueue(task.id.clone(), payload).await;
        Ok(())
    }

    async fn cancel_task(&self, task: &Task) -> Result<CancelOutcome, QueueError> {
        let payload = (self.inner.discriminator)(task).ok_or_else(|| QueueError::Rejected {
            queue: self.inner.name.clone(),
            task_id: task.id.clone(),
        })?;
        Ok(self.cancel(&task.id, &payload).await)
    }

    fn pause(&self) {
        TaskQueue::pause(self)
    }

    fn resume(&self) {
        TaskQueue::resume(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, timeout, Duration};

    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        enqueued: Mutex<Vec<String>>,
        canceled: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskProcessor<u64> for Probe {
        async fn on_enqueue(&self, task_id: &str, _payload: &u64) {
            self.enqueued.lock().push(task_id.to_string());
        }

        async fn process(
            &self,
            task_id: &str,
            delay_ms: u64,
            cancel: CancellationToken,
        ) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.started.lock().push(task_id.to_string());
            tokio::select! {
                _ = sleep(Duration::from_millis(delay_ms)) => {}
                _ = cancel.cancelled() => {}
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            if task_id == "boom" {
                anyhow::bail!("processor error");
            }
            Ok(())
        }

        async fn on_cancel(&self, task_id: &str, _payload: &u64) {
            self.canceled.lock().push(task_id.to_string());
        }
    }

    fn queue(concurrency: usize, probe: Arc<Probe>) -> TaskQueue<u64> {
        TaskQueue::new("test", concurrency, Arc::new(|_t: &Task| Some(0u64)), probe)
    }

    #[tokio::test]
    async fn runs_one_at_a_time_in_fifo_order() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        for id in ["a", "b", "c", "d"] {
            q.enqueue(id, 20).await;
            assert!(q.in_flight() <= 1);
        }
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(probe.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*probe.started.lock(), vec!["a", "b", "c", "d"]);
        assert_eq!(*probe.enqueued.lock(), vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn respects_higher_concurrency() {
        let probe = Arc::new(Probe::default());
        let q = queue(2, probe.clone());
        for id in ["a", "b", "c", "d", "e"] {
            q.enqueue(id, 30).await;
        }
        assert_eq!(q.in_flight(), 2);
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(probe.peak.load(Ordering::SeqCst), 2);
        assert_eq!(probe.started.lock().len(), 5);
    }

    #[tokio::test]
    async fn process_at_limit_is_rejected() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.enqueue("a", 200).await;
        q.enqueue("b", 0).await;
        let err = q.process().unwrap_err();
        assert!(matches!(err, QueueError::Saturated { in_flight: 1, .. }));
        q.cancel("a", &0).await;
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
    }

    #[tokio::test]
    async fn canceled_waiting_tasks_never_start() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.enqueue("a", 50).await;
        q.enqueue("b", 0).await;
        q.enqueue("c", 0).await;
        assert_eq!(q.cancel("b", &0).await, CancelOutcome::Dequeued);
        assert!(!q.contains("b"));
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(*probe.started.lock(), vec!["a", "c"]);
        assert_eq!(*probe.canceled.lock(), vec!["b"]);
    }

    #[tokio::test]
    async fn canceling_a_running_task_trips_its_token() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.enqueue("long", 60_000).await;
        assert_eq!(q.cancel("long", &0).await, CancelOutcome::Running);
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(*probe.canceled.lock(), vec!["long"]);
        assert_eq!(q.cancel("missing", &0).await, CancelOutcome::Unknown);
        assert_eq!(probe.canceled.lock().len(), 2, "hook runs for unknown tasks too");
    }

    #[tokio::test]
    async fn pause_is_reference_counted() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.pause();
        q.pause();
        q.enqueue("a", 0).await;
        assert_eq!(q.in_flight(), 0);
        q.resume();
        assert!(q.is_paused());
        assert_eq!(q.in_flight(), 0);
        q.resume();
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(*probe.started.lock(), vec!["a"]);
    }

    #[tokio::test]
    async fn processor_errors_free_the_slot() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.enqueue("boom", 0).await;
        q.enqueue("after", 0).await;
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(*probe.started.lock(), vec!["boom", "after"]);
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_ignored() {
        let probe = Arc::new(Probe::default());
        let q = queue(1, probe.clone());
        q.pause();
        q.enqueue("a", 0).await;
        q.enqueue("a", 0).await;
        assert_eq!(q.queued_len(), 1);
        q.resume();
        timeout(Duration::from_secs(5), q.wait_idle()).await.unwrap();
        assert_eq!(probe.started.lock().len(), 1);
    }
}
