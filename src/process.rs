//! Worker process pool
//!
//! Supervises real OS worker subprocesses speaking the line-delimited
//! JSON protocol from [`crate::protocol`]. Each worker is spawned with
//! piped stdio and must emit `{"type":"ready"}` within the startup
//! timeout; failing that, the spawn is fatal. A per-worker reader task
//! routes replies to awaiting callers by `requestId` and drops anything
//! unmatched or malformed — noise on the channel is expected.
//!
//! On unexpected exit the worker is removed from the pool and, while the
//! pool is initialized and the worker's restart budget remains, respawned
//! after a jittered delay. Callers whose requests were in flight on the
//! dead worker are rejected, never silently re-dispatched. Periodic
//! ping/pong probes cover idle workers only; a failed probe kills the
//! worker to force it through the restart path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::batcher::{BatchPayload, BatchTransport};
use crate::error::{ForemanError, Result};
use crate::protocol::{self, BatchCallResult, BatchCommand, WorkerCommand, WorkerReply};
use crate::scheduler::TaskExecutor;

/// Deadline for a ping/pong round trip.
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Upper bound on the random restart jitter.
const RESTART_JITTER_MS: u64 = 250;

/// Configuration for process pool behavior
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Number of worker processes.
    pub pool_size: usize,
    pub health_check_interval: Duration,
    /// Restarts allowed per worker slot before the slot is lost.
    pub max_restarts: u32,
    /// Base delay before a crashed worker is respawned.
    pub restart_delay: Duration,
    /// How long a spawned worker may take to emit `ready`.
    pub startup_timeout: Duration,
    /// Hard bound on requests queued while every worker is busy.
    pub max_queued: usize,
    /// Worker executable.
    pub worker_command: String,
    pub worker_args: Vec<String>,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 3,
            health_check_interval: Duration::from_secs(30),
            max_restarts: 3,
            restart_delay: Duration::from_secs(1),
            startup_timeout: Duration::from_secs(10),
            max_queued: 100,
            worker_command: "echo-worker".into(),
            worker_args: Vec::new(),
        }
    }
}

enum WorkerEvent {
    Exited { id: usize, generation: u32 },
    /// A checked-out worker whose caller dropped the future mid-flight;
    /// put it back into circulation.
    Reclaim { worker: Arc<Worker> },
}

/// Guarantees a checked-out worker returns to the pool even when the
/// caller's future is dropped between checkout and checkin.
struct CheckinGuard {
    tx: mpsc::UnboundedSender<WorkerEvent>,
    worker: Option<Arc<Worker>>,
}

impl CheckinGuard {
    fn new(tx: mpsc::UnboundedSender<WorkerEvent>, worker: Arc<Worker>) -> Self {
        Self {
            tx,
            worker: Some(worker),
        }
    }

    fn disarm(&mut self) -> Arc<Worker> {
        self.worker.take().expect("disarmed once")
    }
}

impl Drop for CheckinGuard {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(WorkerEvent::Reclaim { worker });
        }
    }
}

/// One live worker subprocess.
struct Worker {
    id: usize,
    /// Restart count for this slot; generation 0 is the original spawn.
    generation: u32,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Mutex<HashMap<String, oneshot::Sender<WorkerReply>>>,
    executions: AtomicU64,
}

impl Worker {
    /// Register a pending request, write the line, await the correlated
    /// reply under `timeout`.
    async fn round_trip(
        &self,
        request_id: String,
        line: String,
        timeout: Duration,
    ) -> Result<WorkerReply> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id.clone(), tx);

        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                self.pending.lock().await.remove(&request_id);
                return Err(ForemanError::WorkerCrash(format!(
                    "worker {}: write failed: {}",
                    self.id, e
                )));
            }
            let _ = stdin.flush().await;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ForemanError::WorkerCrash(format!(
                "worker {} exited mid-request",
                self.id
            ))),
            Err(_) => {
                // The operation is not cancelled; a late reply for this id
                // is dropped by the reader.
                self.pending.lock().await.remove(&request_id);
                Err(ForemanError::Timeout(timeout))
            }
        }
    }
}

struct PoolState {
    workers: HashMap<usize, Arc<Worker>>,
    available: VecDeque<usize>,
    busy: HashSet<usize>,
    waiters: VecDeque<oneshot::Sender<Arc<Worker>>>,
    lost_slots: usize,
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: u64,
    queued_requests: u64,
    reuse_count: u64,
    spawn_count: u64,
    restart_count: u64,
    health_check_failures: u64,
    avg_wait_ms: f64,
    avg_exec_ms: f64,
}

impl StatsInner {
    fn record_wait(&mut self, waited: Duration) {
        let ms = waited.as_secs_f64() * 1000.0;
        if self.avg_wait_ms == 0.0 {
            self.avg_wait_ms = ms;
        } else {
            self.avg_wait_ms = self.avg_wait_ms * 0.9 + ms * 0.1;
        }
    }

    fn record_exec(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        if self.avg_exec_ms == 0.0 {
            self.avg_exec_ms = ms;
        } else {
            self.avg_exec_ms = self.avg_exec_ms * 0.9 + ms * 0.1;
        }
    }
}

/// Snapshot of process-pool counters and occupancy.
#[derive(Debug, Clone)]
pub struct ProcessPoolStats {
    pub pool_size: usize,
    pub available: usize,
    pub busy: usize,
    pub queued: usize,
    /// Slots permanently lost to exhausted restart budgets.
    pub lost_slots: usize,
    pub total_requests: u64,
    pub queued_requests: u64,
    pub reuse_count: u64,
    pub spawn_count: u64,
    pub restart_count: u64,
    pub health_check_failures: u64,
    pub average_wait_time: Duration,
    pub average_execution_time: Duration,
    /// busy / pool_size, in [0, 1].
    pub utilization: f64,
    /// reuse_count / total_requests, in [0, 1].
    pub reuse_rate: f64,
}

/// Pool of supervised worker subprocesses.
///
/// # Example
/// ```no_run
/// use std::time::Duration;
/// use serde_json::json;
/// use foreman::process::{ProcessPoolConfig, WorkerProcessPool};
/// use foreman::error::Result;
///
/// # async fn example() -> Result<()> {
/// let pool = WorkerProcessPool::new(ProcessPoolConfig {
///     pool_size: 2,
///     worker_command: "echo-worker".into(),
///     ..ProcessPoolConfig::default()
/// });
/// pool.initialize().await?;
/// let result = pool
///     .execute("echo", json!({"n": 1}), Duration::from_secs(30))
///     .await?;
/// pool.cleanup().await;
/// # Ok(())
/// # }
/// ```
pub struct WorkerProcessPool {
    config: Arc<ProcessPoolConfig>,
    inner: Arc<Mutex<PoolState>>,
    stats: Arc<std::sync::Mutex<StatsInner>>,
    initialized: Arc<AtomicBool>,
    request_seq: Arc<AtomicU64>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<WorkerEvent>>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerProcessPool {
    pub fn new(config: ProcessPoolConfig) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(PoolState {
                workers: HashMap::new(),
                available: VecDeque::new(),
                busy: HashSet::new(),
                waiters: VecDeque::new(),
                lost_slots: 0,
            })),
            stats: Arc::new(std::sync::Mutex::new(StatsInner::default())),
            initialized: Arc::new(AtomicBool::new(false)),
            request_seq: Arc::new(AtomicU64::new(0)),
            event_tx,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawn the whole pool and start supervision. Any worker failing to
    /// become ready is fatal; already-spawned workers are torn down.
    pub async fn initialize(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }
        info!(pool_size = self.config.pool_size, "initializing worker process pool");

        for id in 0..self.config.pool_size {
            match Self::spawn_worker(id, 0, &self.config, &self.event_tx).await {
                Ok(worker) => {
                    self.stats.lock().unwrap().spawn_count += 1;
                    let mut state = self.inner.lock().await;
                    state.workers.insert(id, worker);
                    state.available.push_back(id);
                }
                Err(e) => {
                    error!(worker = id, error = %e, "spawn failed, aborting initialization");
                    self.kill_all().await;
                    return Err(e);
                }
            }
        }

        let supervisor_rx = self
            .event_rx
            .lock()
            .unwrap()
            .take()
            .expect("initialize called once");
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Self::supervise(
            supervisor_rx,
            self.config.clone(),
            self.inner.clone(),
            self.stats.clone(),
            self.initialized.clone(),
            self.event_tx.clone(),
        )));
        tasks.push(tokio::spawn(Self::health_loop(
            self.config.clone(),
            self.inner.clone(),
            self.stats.clone(),
            self.initialized.clone(),
            self.request_seq.clone(),
        )));
        drop(tasks);

        self.initialized.store(true, Ordering::SeqCst);
        info!("worker process pool initialized");
        Ok(())
    }

    /// Execute one skill call on any available worker, queueing (bounded)
    /// when all are busy.
    pub async fn execute(&self, skill: &str, params: Value, timeout: Duration) -> Result<Value> {
        let started = Instant::now();
        self.stats.lock().unwrap().total_requests += 1;

        let worker = self.checkout(timeout).await?;
        let mut guard = CheckinGuard::new(self.event_tx.clone(), worker.clone());
        let waited = started.elapsed();
        self.stats.lock().unwrap().record_wait(waited);

        let request_id = format!("req-{}", self.request_seq.fetch_add(1, Ordering::SeqCst));
        let command = WorkerCommand::Execute {
            skill: skill.to_owned(),
            params,
            timeout: timeout.as_secs().max(1),
            request_id: request_id.clone(),
        };
        let result = match protocol::encode_line(&command) {
            Ok(line) => worker.round_trip(request_id, line, timeout).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(WorkerReply::Result { result, .. }) => {
                worker.executions.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Ok(WorkerReply::Error { error, .. }) => Err(ForemanError::Skill(error)),
            Ok(_) => Err(ForemanError::Skill(
                "worker sent an unexpected reply kind".into(),
            )),
            Err(e) => Err(e),
        };

        let worker = guard.disarm();
        self.checkin(&worker).await;
        {
            let mut stats = self.stats.lock().unwrap();
            stats.reuse_count += 1;
            stats.record_exec(started.elapsed().saturating_sub(waited));
        }
        result
    }

    /// Stop supervision, kill every worker, reject queued callers.
    pub async fn cleanup(&self) {
        self.initialized.store(false, Ordering::SeqCst);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.kill_all().await;
        info!("worker process pool cleaned up");
    }

    /// Snapshot of counters and occupancy.
    pub async fn stats(&self) -> ProcessPoolStats {
        let state = self.inner.lock().await;
        let stats = self.stats.lock().unwrap();
        let pool_size = self.config.pool_size;
        ProcessPoolStats {
            pool_size,
            available: state.available.len(),
            busy: state.busy.len(),
            queued: state.waiters.len(),
            lost_slots: state.lost_slots,
            total_requests: stats.total_requests,
            queued_requests: stats.queued_requests,
            reuse_count: stats.reuse_count,
            spawn_count: stats.spawn_count,
            restart_count: stats.restart_count,
            health_check_failures: stats.health_check_failures,
            average_wait_time: Duration::from_secs_f64(stats.avg_wait_ms / 1000.0),
            average_execution_time: Duration::from_secs_f64(stats.avg_exec_ms / 1000.0),
            utilization: if pool_size > 0 {
                state.busy.len() as f64 / pool_size as f64
            } else {
                0.0
            },
            reuse_rate: if stats.total_requests > 0 {
                stats.reuse_count as f64 / stats.total_requests as f64
            } else {
                0.0
            },
        }
    }

    async fn checkout(&self, timeout: Duration) -> Result<Arc<Worker>> {
        let rx = {
            let mut state = self.inner.lock().await;
            if !self.initialized.load(Ordering::SeqCst) {
                return Err(ForemanError::ShuttingDown);
            }
            while let Some(id) = state.available.pop_front() {
                if let Some(worker) = state.workers.get(&id) {
                    let worker = worker.clone();
                    state.busy.insert(id);
                    return Ok(worker);
                }
                // Stale id from a crashed worker; skip it.
            }
            if state.waiters.len() >= self.config.max_queued {
                return Err(ForemanError::QueueFull {
                    capacity: self.config.max_queued,
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            self.stats.lock().unwrap().queued_requests += 1;
            debug!(queued = state.waiters.len(), "all workers busy, queueing request");
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(worker)) => Ok(worker),
            Ok(Err(_)) => Err(ForemanError::ShuttingDown),
            Err(_) => Err(ForemanError::Timeout(timeout)),
        }
    }

    async fn checkin(&self, worker: &Arc<Worker>) {
        let mut state = self.inner.lock().await;
        let alive = state
            .workers
            .get(&worker.id)
            .map(|w| w.generation == worker.generation)
            .unwrap_or(false);
        if alive {
            Self::offer_worker(&mut state, worker.clone());
        } else {
            // The worker crashed mid-flight; the supervisor already
            // removed it from the busy set.
        }
    }

    /// Hand a worker to the first still-listening waiter, else mark it
    /// available.
    fn offer_worker(state: &mut PoolState, worker: Arc<Worker>) {
        let id = worker.id;
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(worker.clone()) {
                Ok(()) => {
                    state.busy.insert(id);
                    return;
                }
                // That waiter timed out; try the next.
                Err(_) => continue,
            }
        }
        state.busy.remove(&id);
        state.available.push_back(id);
    }

    async fn kill_all(&self) {
        let (workers, waiters) = {
            let mut state = self.inner.lock().await;
            state.available.clear();
            state.busy.clear();
            let workers: Vec<Arc<Worker>> = state.workers.drain().map(|(_, w)| w).collect();
            let waiters = std::mem::take(&mut state.waiters);
            (workers, waiters)
        };
        drop(waiters);
        for worker in workers {
            let mut child = worker.child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// Spawn one worker: pipe stdio, wait for `ready`, start the reader.
    async fn spawn_worker(
        id: usize,
        generation: u32,
        config: &ProcessPoolConfig,
        event_tx: &mpsc::UnboundedSender<WorkerEvent>,
    ) -> Result<Arc<Worker>> {
        debug!(worker = id, generation, command = %config.worker_command, "spawning worker");
        let mut child = Command::new(&config.worker_command)
            .args(&config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ForemanError::Spawn(format!("worker {}: {}: {}", id, config.worker_command, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForemanError::Spawn(format!("worker {}: stdin unavailable", id)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForemanError::Spawn(format!("worker {}: stdout unavailable", id)))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(worker = id, "worker stderr: {}", line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();
        match tokio::time::timeout(config.startup_timeout, Self::await_ready(&mut lines)).await {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(ForemanError::Spawn(format!(
                    "worker {} exited before becoming ready",
                    id
                )))
            }
            Ok(Err(e)) => {
                return Err(ForemanError::Spawn(format!(
                    "worker {}: read failed before ready: {}",
                    id, e
                )))
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(ForemanError::Spawn(format!(
                    "worker {} not ready within {:?}",
                    id, config.startup_timeout
                )));
            }
        }

        let worker = Arc::new(Worker {
            id,
            generation,
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending: Mutex::new(HashMap::new()),
            executions: AtomicU64::new(0),
        });

        let reader_worker = worker.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            Self::read_replies(&reader_worker, &mut lines).await;
            // EOF: the process is gone. Dropping the pending senders
            // rejects every in-flight caller with WorkerCrash.
            reader_worker.pending.lock().await.clear();
            let _ = event_tx.send(WorkerEvent::Exited {
                id: reader_worker.id,
                generation: reader_worker.generation,
            });
        });

        info!(worker = id, generation, "worker ready");
        Ok(worker)
    }

    async fn await_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> std::io::Result<bool> {
        while let Some(line) = lines.next_line().await? {
            if matches!(protocol::parse_reply(&line), Some(WorkerReply::Ready)) {
                return Ok(true);
            }
            // Anything before ready is startup noise.
        }
        Ok(false)
    }

    async fn read_replies(worker: &Arc<Worker>, lines: &mut Lines<BufReader<ChildStdout>>) {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some(reply) = protocol::parse_reply(&line) else {
                        continue;
                    };
                    let Some(request_id) = reply.request_id().map(str::to_owned) else {
                        continue;
                    };
                    match worker.pending.lock().await.remove(&request_id) {
                        Some(tx) => {
                            let _ = tx.send(reply);
                        }
                        None => {
                            // Stale reply for a timed-out request.
                            debug!(worker = worker.id, request_id, "dropping unmatched reply");
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }

    /// Consume exit events: unregister the worker and restart it while
    /// the pool is live and the slot's budget remains.
    async fn supervise(
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
        config: Arc<ProcessPoolConfig>,
        inner: Arc<Mutex<PoolState>>,
        stats: Arc<std::sync::Mutex<StatsInner>>,
        initialized: Arc<AtomicBool>,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let (id, generation) = match event {
                WorkerEvent::Exited { id, generation } => (id, generation),
                WorkerEvent::Reclaim { worker } => {
                    let mut state = inner.lock().await;
                    let alive = state
                        .workers
                        .get(&worker.id)
                        .map(|w| w.generation == worker.generation)
                        .unwrap_or(false);
                    if alive {
                        warn!(worker = worker.id, "caller abandoned a checked-out worker, reclaiming");
                        Self::offer_worker(&mut state, worker);
                    }
                    continue;
                }
            };
            let executions = {
                let mut state = inner.lock().await;
                let registered = state
                    .workers
                    .get(&id)
                    .map(|w| w.generation == generation)
                    .unwrap_or(false);
                if !registered {
                    // A newer generation already took this slot.
                    continue;
                }
                let worker = state.workers.remove(&id).expect("checked above");
                state.available.retain(|&w| w != id);
                state.busy.remove(&id);
                worker.executions.load(Ordering::Relaxed)
            };
            warn!(worker = id, generation, executions, "worker exited unexpectedly");

            if !initialized.load(Ordering::SeqCst) {
                continue;
            }
            if generation >= config.max_restarts {
                inner.lock().await.lost_slots += 1;
                error!(worker = id, "restart budget exhausted, slot lost");
                continue;
            }

            let jitter = Duration::from_millis(rand::random::<u64>() % RESTART_JITTER_MS);
            tokio::time::sleep(config.restart_delay + jitter).await;
            if !initialized.load(Ordering::SeqCst) {
                continue;
            }

            match Self::spawn_worker(id, generation + 1, &config, &event_tx).await {
                Ok(worker) => {
                    {
                        let mut stats = stats.lock().unwrap();
                        stats.spawn_count += 1;
                        stats.restart_count += 1;
                    }
                    let mut state = inner.lock().await;
                    state.workers.insert(id, worker.clone());
                    Self::offer_worker(&mut state, worker);
                    info!(worker = id, generation = generation + 1, "worker restarted");
                }
                Err(e) => {
                    inner.lock().await.lost_slots += 1;
                    error!(worker = id, error = %e, "restart failed, slot lost");
                }
            }
        }
    }

    /// Ping idle workers; kill any that fail to pong so the exit watcher
    /// restarts them.
    async fn health_loop(
        config: Arc<ProcessPoolConfig>,
        inner: Arc<Mutex<PoolState>>,
        stats: Arc<std::sync::Mutex<StatsInner>>,
        initialized: Arc<AtomicBool>,
        request_seq: Arc<AtomicU64>,
    ) {
        let mut ticker = tokio::time::interval(config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // discard the immediate first tick
        loop {
            ticker.tick().await;
            if !initialized.load(Ordering::SeqCst) {
                continue;
            }
            let idle: Vec<Arc<Worker>> = {
                let state = inner.lock().await;
                state
                    .available
                    .iter()
                    .filter_map(|id| state.workers.get(id))
                    .cloned()
                    .collect()
            };
            for worker in idle {
                let request_id =
                    format!("health-{}", request_seq.fetch_add(1, Ordering::SeqCst));
                let ponged = match protocol::encode_line(&WorkerCommand::Ping {
                    request_id: request_id.clone(),
                }) {
                    Ok(line) => matches!(
                        worker.round_trip(request_id, line, PING_TIMEOUT).await,
                        Ok(WorkerReply::Pong { .. })
                    ),
                    Err(_) => false,
                };
                if ponged {
                    continue;
                }
                stats.lock().unwrap().health_check_failures += 1;
                // Only kill if it is still idle; a slow probe on a worker
                // that got checked out meanwhile is not a death sentence.
                let still_idle = inner.lock().await.available.contains(&worker.id);
                if still_idle {
                    warn!(worker = worker.id, "health probe failed, killing worker");
                    let _ = worker.child.lock().await.start_kill();
                }
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for WorkerProcessPool {
    async fn run(&self, skill: &str, params: &Value, timeout: Duration) -> Result<Value> {
        self.execute(skill, params.clone(), timeout).await
    }
}

#[async_trait]
impl BatchTransport for WorkerProcessPool {
    async fn send_batch(
        &self,
        payload: BatchPayload,
        timeout: Duration,
    ) -> Result<Vec<BatchCallResult>> {
        let worker = self.checkout(timeout).await?;
        let mut guard = CheckinGuard::new(self.event_tx.clone(), worker.clone());

        let request_id = format!("batch-{}", self.request_seq.fetch_add(1, Ordering::SeqCst));
        let command = match payload {
            BatchPayload::Plain(requests) => BatchCommand::Batch {
                request_id: request_id.clone(),
                requests,
            },
            BatchPayload::Compressed { data, codec } => BatchCommand::BatchCompressed {
                request_id: request_id.clone(),
                data,
                compression: codec,
            },
        };
        let result = match protocol::encode_line(&command) {
            Ok(line) => worker.round_trip(request_id, line, timeout).await,
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(WorkerReply::BatchResponse { results, .. }) => {
                worker.executions.fetch_add(1, Ordering::Relaxed);
                Ok(results)
            }
            Ok(_) => Err(ForemanError::BatchMismatch(
                "worker sent a non-batch reply to a batch request".into(),
            )),
            Err(e) => Err(e),
        };

        let worker = guard.disarm();
        self.checkin(&worker).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Process-spawning behavior is covered by the integration tests in
    // tests/process_pool_test.rs against the real echo-worker binary.
    // These tests cover the pure bookkeeping.

    #[tokio::test]
    async fn test_execute_before_initialize_is_rejected() {
        let pool = WorkerProcessPool::new(ProcessPoolConfig::default());
        let result = pool
            .execute("echo", Value::Null, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ForemanError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_fatal() {
        let pool = WorkerProcessPool::new(ProcessPoolConfig {
            pool_size: 1,
            worker_command: "/nonexistent/worker-binary".into(),
            ..ProcessPoolConfig::default()
        });
        let result = pool.initialize().await;
        assert!(matches!(result, Err(ForemanError::Spawn(_))));
        assert!(!pool.initialized.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stats_start_empty() {
        let pool = WorkerProcessPool::new(ProcessPoolConfig::default());
        let stats = pool.stats().await;
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.available, 0);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.utilization, 0.0);
    }

    #[tokio::test]
    async fn test_ewma_seeding_and_smoothing() {
        let mut stats = StatsInner::default();
        stats.record_wait(Duration::from_millis(100));
        assert!((stats.avg_wait_ms - 100.0).abs() < 1e-6);
        stats.record_wait(Duration::from_millis(200));
        assert!((stats.avg_wait_ms - 110.0).abs() < 1e-6);
    }
}
