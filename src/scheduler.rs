//! Priority task scheduler with load balancing and bounded retry
//!
//! Tasks queue in a bounded, priority-ordered queue and are drained by a
//! fixed set of logical worker slots under a `max_concurrent` admission
//! semaphore. Execution goes through an injected [`TaskExecutor`] — the
//! worker process pool in production, anything test-shaped otherwise.
//!
//! The dispatch loop sleeps on a [`Notify`] and is woken by enqueue,
//! settlement, and resume events; there is no tick polling. Ordering is
//! priority-descending with submission sequence as the tie-break, which
//! also gives retried tasks their "front of the queue" position: a retry
//! keeps its original sequence and outranks everything submitted later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{ForemanError, Result};

/// How long `shutdown` waits for running tasks to settle.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Retained timing samples for the running averages.
const TIMING_SAMPLES: usize = 256;

/// Execution substrate the scheduler dispatches into.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn run(&self, skill: &str, params: &Value, timeout: Duration) -> Result<Value>;
}

/// Configuration for scheduler behavior
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of logical worker slots.
    pub max_workers: usize,
    /// Admission semaphore: tasks in flight at once.
    pub max_concurrent: usize,
    /// Hard bound on the task queue.
    pub queue_size: usize,
    /// Default per-task deadline.
    pub task_timeout: Duration,
    /// Default retry budget for transient failures.
    pub retry_attempts: u32,
    /// Delay before a retried task is requeued.
    pub retry_delay: Duration,
    /// Select slots by load score instead of first-idle.
    pub load_balancing: bool,
    /// Order the queue by priority; plain FIFO otherwise.
    pub priority_scheduling: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            max_concurrent: 3,
            queue_size: 100,
            task_timeout: Duration::from_secs(30),
            retry_attempts: 2,
            retry_delay: Duration::from_secs(1),
            load_balancing: true,
            priority_scheduling: true,
        }
    }
}

/// One unit of work to schedule.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub skill: String,
    pub params: Value,
    /// 1-10, higher runs first. Defaults to 5.
    pub priority: u8,
    /// Overrides the scheduler's `task_timeout`.
    pub timeout: Option<Duration>,
    /// Overrides the scheduler's `retry_attempts`.
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn new(skill: impl Into<String>, params: Value) -> Self {
        Self {
            skill: skill.into(),
            params,
            priority: 5,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Successful settlement of a task.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub value: Value,
    pub execution_time: Duration,
    /// Retries that were needed before this attempt succeeded.
    pub retry_count: u32,
}

/// Per-task outcome of [`TaskScheduler::execute_batch`].
#[derive(Debug)]
pub struct BatchTaskOutcome {
    pub index: usize,
    pub skill: String,
    pub result: Result<TaskResult>,
}

struct Task {
    id: u64,
    skill: String,
    params: Value,
    priority: u8,
    seq: u64,
    created_at: Instant,
    retry_count: u32,
    max_retries: u32,
    timeout: Duration,
    tx: oneshot::Sender<Result<TaskResult>>,
}

#[derive(Debug, Clone)]
struct Slot {
    id: usize,
    busy: bool,
    completed: u64,
    failed: u64,
    /// 0.0 (idle) to 1.0 (overloaded); success nudges down, failure up.
    load_score: f64,
}

struct SchedInner {
    queue: std::collections::VecDeque<Task>,
    slots: Vec<Slot>,
    running: usize,
    next_task_id: u64,
    next_seq: u64,
    completed: u64,
    failed: u64,
    wait_times: std::collections::VecDeque<Duration>,
    exec_times: std::collections::VecDeque<Duration>,
    started_at: Instant,
}

impl SchedInner {
    fn record_wait(&mut self, waited: Duration) {
        if self.wait_times.len() == TIMING_SAMPLES {
            self.wait_times.pop_front();
        }
        self.wait_times.push_back(waited);
    }

    fn record_exec(&mut self, elapsed: Duration) {
        if self.exec_times.len() == TIMING_SAMPLES {
            self.exec_times.pop_front();
        }
        self.exec_times.push_back(elapsed);
    }
}

/// Per-slot detail for [`SchedulerStats`].
#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub id: usize,
    pub busy: bool,
    pub completed: u64,
    pub failed: u64,
    pub load_score: f64,
}

/// Snapshot of scheduler counters and occupancy.
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub queued_tasks: usize,
    pub running_tasks: usize,
    pub average_wait_time: Duration,
    pub average_execution_time: Duration,
    /// Settled tasks per second since construction.
    pub throughput: f64,
    pub queue_utilization: f64,
    pub paused: bool,
    pub slots: Vec<SlotInfo>,
}

/// Priority/FIFO task queue drained into a [`TaskExecutor`].
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use serde_json::{json, Value};
/// use foreman::error::Result;
/// use foreman::scheduler::{SchedulerConfig, TaskExecutor, TaskRequest, TaskScheduler};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl TaskExecutor for Echo {
///     async fn run(&self, _skill: &str, params: &Value, _timeout: Duration) -> Result<Value> {
///         Ok(params.clone())
///     }
/// }
///
/// # async fn example() -> Result<()> {
/// let scheduler = TaskScheduler::new(Arc::new(Echo), SchedulerConfig::default());
/// let result = scheduler
///     .execute_task(TaskRequest::new("echo", json!({"n": 1})).with_priority(8))
///     .await?;
/// assert_eq!(result.value["n"], 1);
/// scheduler.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct TaskScheduler {
    config: Arc<SchedulerConfig>,
    inner: Arc<Mutex<SchedInner>>,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    loop_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Create a scheduler and start its dispatch loop.
    pub fn new(executor: Arc<dyn TaskExecutor>, config: SchedulerConfig) -> Self {
        let config = Arc::new(config);
        let slots = (0..config.max_workers.max(1))
            .map(|id| Slot {
                id,
                busy: false,
                completed: 0,
                failed: 0,
                load_score: 0.0,
            })
            .collect();
        let inner = Arc::new(Mutex::new(SchedInner {
            queue: std::collections::VecDeque::new(),
            slots,
            running: 0,
            next_task_id: 0,
            next_seq: 0,
            completed: 0,
            failed: 0,
            wait_times: std::collections::VecDeque::with_capacity(TIMING_SAMPLES),
            exec_times: std::collections::VecDeque::with_capacity(TIMING_SAMPLES),
            started_at: Instant::now(),
        }));
        let notify = Arc::new(Notify::new());
        let paused = Arc::new(AtomicBool::new(false));
        let shutting_down = Arc::new(AtomicBool::new(false));
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        let loop_task = tokio::spawn(Self::dispatch_loop(
            config.clone(),
            executor,
            inner.clone(),
            notify.clone(),
            semaphore,
            paused.clone(),
            shutting_down.clone(),
        ));

        Self {
            config,
            inner,
            notify,
            paused,
            shutting_down,
            loop_task: std::sync::Mutex::new(Some(loop_task)),
        }
    }

    /// Submit one task. Rejects immediately with
    /// [`ForemanError::QueueFull`] when the queue is at capacity.
    pub async fn execute_task(&self, request: TaskRequest) -> Result<TaskResult> {
        let rx = {
            let mut inner = self.inner.lock().await;
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ForemanError::ShuttingDown);
            }
            if inner.queue.len() >= self.config.queue_size {
                return Err(ForemanError::QueueFull {
                    capacity: self.config.queue_size,
                });
            }
            let (tx, rx) = oneshot::channel();
            let id = inner.next_task_id;
            inner.next_task_id += 1;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.queue.push_back(Task {
                id,
                skill: request.skill,
                params: request.params,
                priority: request.priority,
                seq,
                created_at: Instant::now(),
                retry_count: 0,
                max_retries: request.max_retries.unwrap_or(self.config.retry_attempts),
                timeout: request.timeout.unwrap_or(self.config.task_timeout),
                tx,
            });
            debug!(task = id, queued = inner.queue.len(), "task queued");
            rx
        };
        self.notify.notify_one();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ForemanError::ShuttingDown),
        }
    }

    /// Submit many tasks and join all settlements. One task's failure
    /// never aborts the rest; every outcome is reported.
    pub async fn execute_batch(&self, requests: Vec<TaskRequest>) -> Vec<BatchTaskOutcome> {
        let futures: Vec<_> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let skill = request.skill.clone();
                async move {
                    let result = self.execute_task(request).await;
                    BatchTaskOutcome { index, skill, result }
                }
            })
            .collect();
        futures::future::join_all(futures).await
    }

    /// Stop dispatching without discarding queued work.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    /// Resume dispatching.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_one();
        info!("scheduler resumed");
    }

    /// Stop the loop, wait briefly for running tasks, reject queued ones.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.notify.notify_one();

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let running = self.inner.lock().await.running;
            if running == 0 || Instant::now() >= deadline {
                if running > 0 {
                    warn!(running, "shutting down with tasks still running");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let drained: Vec<Task> = {
            let mut inner = self.inner.lock().await;
            inner.queue.drain(..).collect()
        };
        for task in drained {
            let _ = task.tx.send(Err(ForemanError::ShuttingDown));
        }
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
        info!("scheduler shut down");
    }

    /// Snapshot of counters, occupancy and per-slot detail.
    pub async fn stats(&self) -> SchedulerStats {
        let inner = self.inner.lock().await;
        let settled = inner.completed + inner.failed;
        let elapsed = inner.started_at.elapsed().as_secs_f64();
        let average = |samples: &std::collections::VecDeque<Duration>| {
            if samples.is_empty() {
                Duration::ZERO
            } else {
                samples.iter().sum::<Duration>() / samples.len() as u32
            }
        };
        SchedulerStats {
            total_tasks: settled,
            completed_tasks: inner.completed,
            failed_tasks: inner.failed,
            queued_tasks: inner.queue.len(),
            running_tasks: inner.running,
            average_wait_time: average(&inner.wait_times),
            average_execution_time: average(&inner.exec_times),
            throughput: if elapsed > 0.0 {
                settled as f64 / elapsed
            } else {
                0.0
            },
            queue_utilization: inner.queue.len() as f64 / self.config.queue_size as f64,
            paused: self.paused.load(Ordering::SeqCst),
            slots: inner
                .slots
                .iter()
                .map(|s| SlotInfo {
                    id: s.id,
                    busy: s.busy,
                    completed: s.completed,
                    failed: s.failed,
                    load_score: s.load_score,
                })
                .collect(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_loop(
        config: Arc<SchedulerConfig>,
        executor: Arc<dyn TaskExecutor>,
        inner: Arc<Mutex<SchedInner>>,
        notify: Arc<Notify>,
        semaphore: Arc<Semaphore>,
        paused: Arc<AtomicBool>,
        shutting_down: Arc<AtomicBool>,
    ) {
        loop {
            notify.notified().await;
            if shutting_down.load(Ordering::SeqCst) {
                break;
            }
            // Drain while there is capacity and work.
            loop {
                if paused.load(Ordering::SeqCst) || shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let dispatched = Self::dispatch_one(
                    &config,
                    &executor,
                    &inner,
                    &notify,
                    permit,
                )
                .await;
                if !dispatched {
                    break;
                }
            }
        }
    }

    /// Pop the head task and send it to the best slot. Returns false when
    /// the queue is empty or no slot is free (the task stays at the head).
    async fn dispatch_one(
        config: &Arc<SchedulerConfig>,
        executor: &Arc<dyn TaskExecutor>,
        inner: &Arc<Mutex<SchedInner>>,
        notify: &Arc<Notify>,
        permit: tokio::sync::OwnedSemaphorePermit,
    ) -> bool {
        let (task, slot_id) = {
            let mut guard = inner.lock().await;
            if guard.queue.is_empty() {
                return false;
            }
            if config.priority_scheduling {
                guard
                    .queue
                    .make_contiguous()
                    .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
            }

            let slot_id = if config.load_balancing {
                guard
                    .slots
                    .iter()
                    .filter(|s| !s.busy)
                    .min_by(|a, b| {
                        a.load_score
                            .partial_cmp(&b.load_score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                            .then(a.completed.cmp(&b.completed))
                    })
                    .map(|s| s.id)
            } else {
                guard.slots.iter().find(|s| !s.busy).map(|s| s.id)
            };
            let Some(slot_id) = slot_id else {
                // Every slot is busy; leave the task at the head.
                return false;
            };

            let task = guard.queue.pop_front().expect("checked non-empty");
            guard.slots[slot_id].busy = true;
            guard.running += 1;
            let waited = task.created_at.elapsed();
            guard.record_wait(waited);
            (task, slot_id)
        };

        debug!(task = task.id, slot = slot_id, priority = task.priority, "dispatching task");
        let config = config.clone();
        let executor = executor.clone();
        let inner = inner.clone();
        let notify = notify.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            // The run is spawned so a scheduler-level timeout abandons the
            // wait without cancelling the execution: the orphaned run
            // settles later and its result is discarded.
            let run = {
                let executor = executor.clone();
                let skill = task.skill.clone();
                let params = task.params.clone();
                let timeout = task.timeout;
                tokio::spawn(async move { executor.run(&skill, &params, timeout).await })
            };
            let result = match tokio::time::timeout(task.timeout, run).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ForemanError::Skill("task execution panicked".into())),
                Err(_) => Err(ForemanError::Timeout(task.timeout)),
            };
            let elapsed = started.elapsed();

            match result {
                Ok(value) => {
                    {
                        let mut guard = inner.lock().await;
                        guard.running -= 1;
                        guard.completed += 1;
                        guard.record_exec(elapsed);
                        let slot = &mut guard.slots[slot_id];
                        slot.busy = false;
                        slot.completed += 1;
                        slot.load_score = (slot.load_score - 0.1).max(0.0);
                    }
                    let _ = task.tx.send(Ok(TaskResult {
                        value,
                        execution_time: elapsed,
                        retry_count: task.retry_count,
                    }));
                }
                Err(error) => {
                    {
                        let mut guard = inner.lock().await;
                        guard.running -= 1;
                        guard.record_exec(elapsed);
                        let slot = &mut guard.slots[slot_id];
                        slot.busy = false;
                        slot.failed += 1;
                        slot.load_score = (slot.load_score + 0.2).min(1.0);
                    }

                    if error.is_transient() && task.retry_count < task.max_retries {
                        let mut task = task;
                        task.retry_count += 1;
                        task.created_at = Instant::now();
                        info!(
                            task = task.id,
                            attempt = task.retry_count + 1,
                            error = %error,
                            "retrying task"
                        );
                        if !config.retry_delay.is_zero() {
                            tokio::time::sleep(config.retry_delay).await;
                        }
                        inner.lock().await.queue.push_front(task);
                    } else {
                        inner.lock().await.failed += 1;
                        let attempts = task.retry_count + 1;
                        let _ = task.tx.send(Err(ForemanError::RetriesExhausted {
                            attempts,
                            last_error: error.to_string(),
                        }));
                    }
                }
            }
            drop(permit);
            notify.notify_one();
        });
        true
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if let Some(task) = self.loop_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// Executor that scripts outcomes by skill name.
    struct ScriptedExecutor {
        calls: AtomicUsize,
        completions: mpsc::UnboundedSender<Value>,
    }

    impl ScriptedExecutor {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Value>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    calls: AtomicUsize::new(0),
                    completions: tx,
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn run(&self, skill: &str, params: &Value, _timeout: Duration) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match skill {
                "echo" => {
                    let _ = self.completions.send(params.clone());
                    Ok(params.clone())
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = self.completions.send(params.clone());
                    Ok(params.clone())
                }
                "flaky" => {
                    let fail_times = params["fail_times"].as_u64().unwrap_or(0) as usize;
                    if call < fail_times {
                        Err(ForemanError::Transient("worker busy".into()))
                    } else {
                        Ok(json!({"succeeded_on_call": call}))
                    }
                }
                "fatal" => Err(ForemanError::Skill("bad params".into())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::Null)
                }
                other => Err(ForemanError::Skill(format!("unknown skill {}", other))),
            }
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            retry_delay: Duration::from_millis(10),
            ..SchedulerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_execute_task_roundtrip() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(executor, fast_config());

        let result = scheduler
            .execute_task(TaskRequest::new("echo", json!({"n": 7})))
            .await
            .unwrap();
        assert_eq!(result.value["n"], 7);
        assert_eq!(result.retry_count, 0);

        let stats = scheduler.stats().await;
        assert_eq!(stats.completed_tasks, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_priority_order_under_single_concurrency() {
        let (executor, mut completions) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(
            executor,
            SchedulerConfig {
                max_concurrent: 1,
                max_workers: 1,
                ..fast_config()
            },
        ));

        // Hold the loop so all three tasks queue before any dispatch.
        scheduler.pause();
        let mut handles = Vec::new();
        for priority in [1u8, 9, 5] {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .execute_task(
                        TaskRequest::new("echo", json!({"p": priority})).with_priority(priority),
                    )
                    .await
            }));
            // Deterministic submission order.
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.resume();

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        let mut order = Vec::new();
        while let Ok(value) = completions.try_recv() {
            order.push(value["p"].as_u64().unwrap());
        }
        assert_eq!(order, vec![9, 5, 1]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_fifo_within_priority_band() {
        let (executor, mut completions) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(
            executor,
            SchedulerConfig {
                max_concurrent: 1,
                max_workers: 1,
                ..fast_config()
            },
        ));

        scheduler.pause();
        let mut handles = Vec::new();
        for n in 0..4u64 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler
                    .execute_task(TaskRequest::new("echo", json!({"n": n})))
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        scheduler.resume();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let mut order = Vec::new();
        while let Ok(value) = completions.try_recv() {
            order.push(value["n"].as_u64().unwrap());
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failures_retried_then_succeed() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(executor, fast_config());

        let result = scheduler
            .execute_task(TaskRequest::new("flaky", json!({"fail_times": 2})))
            .await
            .unwrap();
        assert_eq!(result.retry_count, 2);
        assert_eq!(result.value["succeeded_on_call"], 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_retries_exhausted_reports_attempts() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(executor, fast_config());

        let result = scheduler
            .execute_task(TaskRequest::new("flaky", json!({"fail_times": 100})))
            .await;
        match result {
            Err(ForemanError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(scheduler.stats().await.failed_tasks, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_transient_failure_not_retried() {
        let (executor, _rx) = ScriptedExecutor::new();
        let executor_ref = executor.clone();
        let scheduler = TaskScheduler::new(executor, fast_config());

        let result = scheduler
            .execute_task(TaskRequest::new("fatal", json!({})))
            .await;
        match result {
            Err(ForemanError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 1),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(executor_ref.calls.load(Ordering::SeqCst), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_queue_full_rejection() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(
            executor,
            SchedulerConfig {
                queue_size: 2,
                ..fast_config()
            },
        ));

        scheduler.pause();
        let mut handles = Vec::new();
        for _ in 0..2 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.execute_task(TaskRequest::new("echo", json!({}))).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = scheduler.execute_task(TaskRequest::new("echo", json!({}))).await;
        assert!(matches!(result, Err(ForemanError::QueueFull { capacity: 2 })));

        scheduler.resume();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_execute_batch_is_all_settled() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(executor, fast_config());

        let outcomes = scheduler
            .execute_batch(vec![
                TaskRequest::new("echo", json!({"n": 0})),
                TaskRequest::new("fatal", json!({})),
                TaskRequest::new("echo", json!({"n": 2})),
            ])
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(outcomes[1].result.is_err());
        assert!(outcomes[2].result.is_ok());
        assert_eq!(outcomes[2].index, 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_pause_holds_work_without_discarding() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(executor, fast_config()));

        scheduler.pause();
        let pending = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.execute_task(TaskRequest::new("echo", json!({"n": 1}))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(scheduler.stats().await.queued_tasks, 1);
        assert!(scheduler.stats().await.paused);

        scheduler.resume();
        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.value["n"], 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrency_respects_semaphore() {
        let (executor, mut completions) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(
            executor,
            SchedulerConfig {
                max_workers: 4,
                max_concurrent: 2,
                ..fast_config()
            },
        ));

        let started = Instant::now();
        let mut handles = Vec::new();
        for n in 0..4u64 {
            let scheduler = scheduler.clone();
            handles.push(tokio::spawn(async move {
                scheduler.execute_task(TaskRequest::new("slow", json!({"n": n}))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        // 4 tasks of ~100ms at concurrency 2 needs at least 2 waves.
        assert!(started.elapsed() >= Duration::from_millis(200));
        let mut seen = 0;
        while completions.try_recv().is_ok() {
            seen += 1;
        }
        assert_eq!(seen, 4);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_balancing_updates_slot_scores() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(
            executor,
            SchedulerConfig {
                max_workers: 2,
                ..fast_config()
            },
        );

        scheduler
            .execute_task(TaskRequest::new("echo", json!({})))
            .await
            .unwrap();
        let _ = scheduler.execute_task(TaskRequest::new("fatal", json!({}))).await;

        let stats = scheduler.stats().await;
        let completed: u64 = stats.slots.iter().map(|s| s.completed).sum();
        let failed: u64 = stats.slots.iter().map(|s| s.failed).sum();
        assert_eq!(completed, 1);
        assert_eq!(failed, 1);
        assert!(stats.slots.iter().any(|s| s.load_score > 0.0));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_queued_tasks() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = Arc::new(TaskScheduler::new(
            executor,
            SchedulerConfig {
                max_concurrent: 1,
                max_workers: 1,
                ..fast_config()
            },
        ));

        // Occupy the only slot, then queue another task.
        let running = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.execute_task(TaskRequest::new("slow", json!({}))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let queued = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                scheduler.execute_task(TaskRequest::new("echo", json!({}))).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        scheduler.shutdown().await;
        assert!(running.await.unwrap().is_ok());
        assert!(matches!(
            queued.await.unwrap(),
            Err(ForemanError::ShuttingDown)
        ));

        // New submissions are refused outright.
        assert!(matches!(
            scheduler.execute_task(TaskRequest::new("echo", json!({}))).await,
            Err(ForemanError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_task_timeout_enforced() {
        let (executor, _rx) = ScriptedExecutor::new();
        let scheduler = TaskScheduler::new(
            executor,
            SchedulerConfig {
                task_timeout: Duration::from_millis(50),
                retry_attempts: 0,
                ..fast_config()
            },
        );

        let started = Instant::now();
        let result = scheduler
            .execute_task(TaskRequest::new("hang", json!({})))
            .await;
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        scheduler.shutdown().await;
    }
}
