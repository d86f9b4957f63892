//! Generic resource pool with reuse strategies and health checking
//!
//! Pools reusable handles produced by a [`ResourceFactory`]. Every handle
//! owns its own [`CircuitBreaker`]; acquisition only considers handles
//! that are idle, healthy and whose breaker is Closed, selected by the
//! configured [`ReuseStrategy`]. When nothing is available the pool grows
//! up to `max_connections`, after which callers queue on a bounded,
//! strictly-FIFO wait queue that is served on every release.
//!
//! A handle's `in_use` flag is the single source of truth for exclusive
//! ownership and is flipped only inside the acquire/release critical
//! sections; the periodic health check only ever touches idle handles.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::error::{ForemanError, Result};

pub type HandleId = u64;

/// How long `shutdown` waits for in-use handles to come back.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Retained wait-time samples for the running average.
const WAIT_SAMPLES: usize = 256;

/// Policy for selecting among available handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseStrategy {
    /// Prefer the handle whose affinity key matches, else first available.
    Affinity,
    /// Rotate over the available set.
    RoundRobin,
    /// Pick the handle with the lowest use count.
    LeastUsed,
}

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Handles created at startup and maintained by the health loop.
    pub min_connections: usize,
    /// Hard ceiling on pool size.
    pub max_connections: usize,
    pub reuse_strategy: ReuseStrategy,
    pub health_check_interval: Duration,
    /// Default acquire deadline used by `execute_with`.
    pub connection_timeout: Duration,
    /// Idle handles older than this are recycled by the health loop.
    pub idle_timeout: Duration,
    /// Handles older than this are recycled regardless of use.
    pub max_lifetime: Duration,
    /// Hard bound on the wait queue.
    pub max_waiters: usize,
    /// Breaker settings applied to every handle.
    pub breaker: BreakerConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            reuse_strategy: ReuseStrategy::Affinity,
            health_check_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(300),
            max_waiters: 64,
            breaker: BreakerConfig {
                failure_threshold: 3,
                cooldown: Duration::from_secs(10),
                ..BreakerConfig::default()
            },
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_connections > self.max_connections {
            return Err(ForemanError::Config(
                "min_connections cannot exceed max_connections".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ForemanError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }
}

/// Factory for creating and validating pooled resources.
#[async_trait]
pub trait ResourceFactory<T: Send + Sync + 'static>: Send + Sync {
    /// Create a new resource for the given handle id.
    async fn create(&self, id: HandleId) -> Result<T>;

    /// Check whether a resource is still usable.
    async fn validate(&self, resource: &T) -> bool;

    /// Release a resource (optional cleanup).
    async fn close(&self, _resource: &T) {}
}

/// Flags a dropped-but-unreleased lease back to the pool.
#[derive(Debug)]
struct Reclaim {
    tx: tokio::sync::mpsc::UnboundedSender<HandleId>,
}

/// An acquired handle. Exclusively owned by the caller until passed back
/// to [`ResourcePool::release`]. A lease dropped without `release` is
/// reclaimed by the pool so the handle cannot stay in-use forever.
#[derive(Debug)]
pub struct Lease<T> {
    id: HandleId,
    resource: Arc<T>,
    breaker: CircuitBreaker,
    reclaim: Option<Reclaim>,
}

impl<T> Lease<T> {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn resource(&self) -> &Arc<T> {
        &self.resource
    }

    /// The breaker owned by this handle.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn disarm(&mut self) {
        self.reclaim = None;
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(reclaim) = self.reclaim.take() {
            let _ = reclaim.tx.send(self.id);
        }
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

#[derive(Debug)]
struct HandleEntry<T> {
    id: HandleId,
    resource: Arc<T>,
    breaker: CircuitBreaker,
    in_use: bool,
    healthy: bool,
    created_at: Instant,
    last_used: Instant,
    use_count: u64,
    affinity_key: Option<String>,
}

impl<T> HandleEntry<T> {
    fn lease(&self, reclaim_tx: &tokio::sync::mpsc::UnboundedSender<HandleId>) -> Lease<T> {
        Lease {
            id: self.id,
            resource: self.resource.clone(),
            breaker: self.breaker.clone(),
            reclaim: Some(Reclaim {
                tx: reclaim_tx.clone(),
            }),
        }
    }

    fn is_expired(&self, config: &PoolConfig) -> bool {
        self.last_used.elapsed() > config.idle_timeout
            || self.created_at.elapsed() > config.max_lifetime
    }
}

struct Waiter<T> {
    id: u64,
    affinity_key: Option<String>,
    tx: oneshot::Sender<Lease<T>>,
}

struct PoolInner<T> {
    handles: HashMap<HandleId, HandleEntry<T>>,
    waiters: VecDeque<Waiter<T>>,
    next_handle_id: HandleId,
    next_waiter_id: u64,
    rr_cursor: usize,
    /// Handles reserved but still being created outside the lock.
    creating: usize,
    shutting_down: bool,
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    wait_times: VecDeque<Duration>,
}

impl<T> PoolInner<T> {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            waiters: VecDeque::new(),
            next_handle_id: 0,
            next_waiter_id: 0,
            rr_cursor: 0,
            creating: 0,
            shutting_down: false,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            wait_times: VecDeque::with_capacity(WAIT_SAMPLES),
        }
    }

    fn occupancy(&self) -> usize {
        self.handles.len() + self.creating
    }

    fn record_wait(&mut self, waited: Duration) {
        if self.wait_times.len() == WAIT_SAMPLES {
            self.wait_times.pop_front();
        }
        self.wait_times.push_back(waited);
    }
}

/// Per-handle detail for [`PoolStats`].
#[derive(Debug, Clone)]
pub struct HandleInfo {
    pub id: HandleId,
    pub in_use: bool,
    pub healthy: bool,
    pub use_count: u64,
    pub affinity_key: Option<String>,
    pub age: Duration,
    pub idle_for: Duration,
    pub breaker_state: &'static str,
}

/// Aggregate breaker posture across the pool.
#[derive(Debug, Clone, Default)]
pub struct BreakerStateCounts {
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
}

/// Snapshot of pool occupancy and counters.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub waiting: usize,
    pub max_connections: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_wait_time: Duration,
    pub handles: Vec<HandleInfo>,
    pub breakers: BreakerStateCounts,
}

enum AcquirePlan<T> {
    Ready(Lease<T>),
    Create,
    Wait(u64, oneshot::Receiver<Lease<T>>),
}

/// Generic pool of breaker-guarded reusable handles.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use foreman::pool::{PoolConfig, ResourceFactory, ResourcePool, HandleId};
/// use foreman::error::{ForemanError, Result};
///
/// struct Conn;
/// struct ConnFactory;
///
/// #[async_trait::async_trait]
/// impl ResourceFactory<Conn> for ConnFactory {
///     async fn create(&self, _id: HandleId) -> Result<Conn> {
///         Ok(Conn)
///     }
///     async fn validate(&self, _conn: &Conn) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<()> {
/// let pool = ResourcePool::new(Arc::new(ConnFactory), PoolConfig::default()).await?;
/// let lease = pool.acquire(Some("tenant-a"), std::time::Duration::from_secs(5)).await?;
/// // use *lease ...
/// pool.release(lease, true).await;
/// # Ok(())
/// # }
/// ```
pub struct ResourcePool<T: Send + Sync + 'static> {
    config: Arc<PoolConfig>,
    factory: Arc<dyn ResourceFactory<T>>,
    inner: Arc<Mutex<PoolInner<T>>>,
    reclaim_tx: tokio::sync::mpsc::UnboundedSender<HandleId>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> ResourcePool<T> {
    /// Create a pool, warm it up to `min_connections`, and start the
    /// health-check loop. Warm-up failure is fatal.
    pub async fn new(factory: Arc<dyn ResourceFactory<T>>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let (reclaim_tx, reclaim_rx) = tokio::sync::mpsc::unbounded_channel();
        let pool = Self {
            config: Arc::new(config),
            factory,
            inner: Arc::new(Mutex::new(PoolInner::new())),
            reclaim_tx,
            tasks: std::sync::Mutex::new(Vec::new()),
        };

        for _ in 0..pool.config.min_connections {
            pool.spawn_idle_handle(None).await?;
        }
        info!(
            strategy = ?pool.config.reuse_strategy,
            warm = pool.config.min_connections,
            "resource pool initialized"
        );

        let mut tasks = pool.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Self::health_loop(
            pool.inner.clone(),
            pool.factory.clone(),
            pool.config.clone(),
            pool.reclaim_tx.clone(),
        )));
        tasks.push(tokio::spawn(Self::reclaim_loop(
            reclaim_rx,
            pool.inner.clone(),
            pool.config.clone(),
            pool.reclaim_tx.clone(),
        )));
        drop(tasks);

        Ok(pool)
    }

    /// Put handles whose leases were dropped without `release` back into
    /// circulation.
    async fn reclaim_loop(
        mut reclaim_rx: tokio::sync::mpsc::UnboundedReceiver<HandleId>,
        inner: Arc<Mutex<PoolInner<T>>>,
        config: Arc<PoolConfig>,
        reclaim_tx: tokio::sync::mpsc::UnboundedSender<HandleId>,
    ) {
        while let Some(id) = reclaim_rx.recv().await {
            let mut guard = inner.lock().await;
            if let Some(entry) = guard.handles.get_mut(&id) {
                if entry.in_use {
                    warn!(handle = id, "lease dropped without release, reclaiming");
                    entry.in_use = false;
                    entry.last_used = Instant::now();
                }
            }
            if !guard.shutting_down {
                Self::serve_waiters(&mut guard, config.reuse_strategy, &reclaim_tx);
            }
        }
    }

    /// Acquire a handle, preferring `affinity_key` under the affinity
    /// strategy. Queues (FIFO) when the pool is saturated; the wait is
    /// abandoned with [`ForemanError::Timeout`] after `timeout`.
    pub async fn acquire(&self, affinity_key: Option<&str>, timeout: Duration) -> Result<Lease<T>> {
        let started = Instant::now();

        let plan = {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return Err(ForemanError::ShuttingDown);
            }
            inner.total_requests += 1;

            if let Some(id) = Self::select_available(&mut inner, self.config.reuse_strategy, affinity_key)
            {
                AcquirePlan::Ready(Self::checkout(&mut inner, id, affinity_key, &self.reclaim_tx))
            } else if inner.occupancy() < self.config.max_connections {
                inner.creating += 1;
                AcquirePlan::Create
            } else if inner.waiters.len() >= self.config.max_waiters {
                inner.failed_requests += 1;
                return Err(ForemanError::PoolExhausted);
            } else {
                let id = inner.next_waiter_id;
                inner.next_waiter_id += 1;
                let (tx, rx) = oneshot::channel();
                inner.waiters.push_back(Waiter {
                    id,
                    affinity_key: affinity_key.map(str::to_owned),
                    tx,
                });
                debug!(waiter = id, queued = inner.waiters.len(), "pool saturated, queueing");
                AcquirePlan::Wait(id, rx)
            }
        };

        match plan {
            AcquirePlan::Ready(lease) => {
                self.finish_acquire(started).await;
                Ok(lease)
            }
            AcquirePlan::Create => match self.create_reserved(affinity_key, true).await {
                Ok(lease) => {
                    self.finish_acquire(started).await;
                    Ok(lease)
                }
                Err(e) => {
                    self.inner.lock().await.failed_requests += 1;
                    Err(e)
                }
            },
            AcquirePlan::Wait(waiter_id, rx) => {
                match tokio::time::timeout(timeout, rx).await {
                    Ok(Ok(lease)) => {
                        self.finish_acquire(started).await;
                        Ok(lease)
                    }
                    Ok(Err(_)) => {
                        self.inner.lock().await.failed_requests += 1;
                        Err(ForemanError::ShuttingDown)
                    }
                    Err(_) => {
                        let mut inner = self.inner.lock().await;
                        inner.waiters.retain(|w| w.id != waiter_id);
                        inner.failed_requests += 1;
                        Err(ForemanError::Timeout(timeout))
                    }
                }
            }
        }
    }

    /// Return a handle to the pool, recording the caller's health verdict,
    /// then serve the head of the wait queue.
    pub async fn release(&self, lease: Lease<T>, healthy: bool) {
        let mut lease = lease;
        lease.disarm();
        let mut inner = self.inner.lock().await;
        match inner.handles.get_mut(&lease.id) {
            Some(entry) => {
                entry.in_use = false;
                entry.healthy = healthy;
                entry.last_used = Instant::now();
            }
            None => {
                warn!(handle = lease.id, "released a handle the pool no longer tracks");
                return;
            }
        }
        // During shutdown the queue is about to be rejected wholesale;
        // handing out handles that are being closed would be worse.
        if !inner.shutting_down {
            Self::serve_waiters(&mut inner, self.config.reuse_strategy, &self.reclaim_tx);
        }
    }

    /// Acquire, run `op` through the handle's breaker, release on every
    /// outcome. The handle is released healthy — health is the health
    /// checker's verdict, not the operation's.
    pub async fn execute_with<F, Fut, R>(&self, affinity_key: Option<&str>, op: F) -> Result<R>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let lease = self
            .acquire(affinity_key, self.config.connection_timeout)
            .await?;
        let breaker = lease.breaker.clone();
        let resource = lease.resource.clone();

        let result = breaker.execute(|| op(resource.clone())).await;

        self.release(lease, true).await;
        result
    }

    /// Stop health checks, wait briefly for in-use handles, close
    /// everything, and reject any still-queued waiters.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.inner.lock().await;
            if inner.shutting_down {
                return;
            }
            inner.shutting_down = true;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        loop {
            let active = {
                let inner = self.inner.lock().await;
                inner.handles.values().filter(|h| h.in_use).count()
            };
            if active == 0 || Instant::now() >= deadline {
                if active > 0 {
                    warn!(active, "closing pool with handles still in use");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let (resources, waiters) = {
            let mut inner = self.inner.lock().await;
            let resources: Vec<Arc<T>> = inner
                .handles
                .drain()
                .map(|(_, entry)| entry.resource)
                .collect();
            let waiters = std::mem::take(&mut inner.waiters);
            (resources, waiters)
        };
        for resource in &resources {
            self.factory.close(resource).await;
        }
        // Dropping the senders settles every queued acquire with an error.
        drop(waiters);
        info!("resource pool shut down");
    }

    /// Snapshot of occupancy, counters and per-handle detail.
    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        let mut stats = PoolStats {
            total: inner.handles.len(),
            active: 0,
            idle: 0,
            healthy: 0,
            unhealthy: 0,
            waiting: inner.waiters.len(),
            max_connections: self.config.max_connections,
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            average_wait_time: Duration::ZERO,
            handles: Vec::with_capacity(inner.handles.len()),
            breakers: BreakerStateCounts::default(),
        };

        for entry in inner.handles.values() {
            if entry.in_use {
                stats.active += 1;
            } else {
                stats.idle += 1;
            }
            if entry.healthy {
                stats.healthy += 1;
            } else {
                stats.unhealthy += 1;
            }
            if entry.breaker.is_closed() {
                stats.breakers.closed += 1;
            } else if entry.breaker.is_open() {
                stats.breakers.open += 1;
            } else {
                stats.breakers.half_open += 1;
            }
            stats.handles.push(HandleInfo {
                id: entry.id,
                in_use: entry.in_use,
                healthy: entry.healthy,
                use_count: entry.use_count,
                affinity_key: entry.affinity_key.clone(),
                age: entry.created_at.elapsed(),
                idle_for: entry.last_used.elapsed(),
                breaker_state: entry.breaker.state().name(),
            });
        }
        if !inner.wait_times.is_empty() {
            stats.average_wait_time =
                inner.wait_times.iter().sum::<Duration>() / inner.wait_times.len() as u32;
        }
        stats
    }

    async fn finish_acquire(&self, started: Instant) {
        let mut inner = self.inner.lock().await;
        inner.successful_requests += 1;
        inner.record_wait(started.elapsed());
    }

    /// Pick an idle, healthy, breaker-Closed handle under the strategy.
    fn select_available(
        inner: &mut PoolInner<T>,
        strategy: ReuseStrategy,
        affinity_key: Option<&str>,
    ) -> Option<HandleId> {
        let mut ids: Vec<HandleId> = inner
            .handles
            .values()
            .filter(|h| !h.in_use && h.healthy && h.breaker.is_closed())
            .map(|h| h.id)
            .collect();
        if ids.is_empty() {
            return None;
        }
        ids.sort_unstable();

        match strategy {
            ReuseStrategy::Affinity => affinity_key
                .and_then(|key| {
                    ids.iter()
                        .copied()
                        .find(|id| inner.handles[id].affinity_key.as_deref() == Some(key))
                })
                .or(Some(ids[0])),
            ReuseStrategy::RoundRobin => {
                let picked = ids[inner.rr_cursor % ids.len()];
                inner.rr_cursor = inner.rr_cursor.wrapping_add(1);
                Some(picked)
            }
            ReuseStrategy::LeastUsed => ids
                .into_iter()
                .min_by_key(|id| inner.handles[id].use_count),
        }
    }

    fn checkout(
        inner: &mut PoolInner<T>,
        id: HandleId,
        affinity_key: Option<&str>,
        reclaim_tx: &tokio::sync::mpsc::UnboundedSender<HandleId>,
    ) -> Lease<T> {
        let entry = inner.handles.get_mut(&id).expect("selected handle exists");
        entry.in_use = true;
        entry.last_used = Instant::now();
        entry.use_count += 1;
        entry.affinity_key = affinity_key.map(str::to_owned);
        entry.lease(reclaim_tx)
    }

    /// Serve queued waiters head-first while idle handles remain. Every
    /// selection strategy falls back to "first available", so the head
    /// waiter is served whenever any handle is idle — strict FIFO.
    fn serve_waiters(
        inner: &mut PoolInner<T>,
        strategy: ReuseStrategy,
        reclaim_tx: &tokio::sync::mpsc::UnboundedSender<HandleId>,
    ) {
        while !inner.waiters.is_empty() {
            let affinity = inner.waiters.front().and_then(|w| w.affinity_key.clone());
            let id = match Self::select_available(inner, strategy, affinity.as_deref()) {
                Some(id) => id,
                None => break,
            };
            let waiter = inner.waiters.pop_front().expect("checked non-empty");
            let lease = Self::checkout(inner, id, waiter.affinity_key.as_deref(), reclaim_tx);
            if let Err(lease) = waiter.tx.send(lease) {
                // Waiter gave up (timed out); undo the checkout.
                let mut lease = lease;
                lease.disarm();
                let entry = inner.handles.get_mut(&lease.id).expect("checked out above");
                entry.in_use = false;
                entry.use_count -= 1;
            }
        }
    }

    /// Create a handle whose slot was already reserved via `creating`.
    async fn create_reserved(&self, affinity_key: Option<&str>, in_use: bool) -> Result<Lease<T>> {
        let id = {
            let mut inner = self.inner.lock().await;
            let id = inner.next_handle_id;
            inner.next_handle_id += 1;
            id
        };

        match self.factory.create(id).await {
            Ok(resource) => {
                let now = Instant::now();
                let entry = HandleEntry {
                    id,
                    resource: Arc::new(resource),
                    breaker: CircuitBreaker::new(
                        format!("handle-{}", id),
                        self.config.breaker.clone(),
                    ),
                    in_use,
                    healthy: true,
                    created_at: now,
                    last_used: now,
                    use_count: u64::from(in_use),
                    affinity_key: affinity_key.map(str::to_owned),
                };
                let lease = entry.lease(&self.reclaim_tx);
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                inner.handles.insert(id, entry);
                debug!(handle = id, total = inner.handles.len(), "handle created");
                Ok(lease)
            }
            Err(e) => {
                let mut inner = self.inner.lock().await;
                inner.creating -= 1;
                warn!(handle = id, error = %e, "handle creation failed");
                Err(e)
            }
        }
    }

    /// Warm-up path: create an idle handle.
    async fn spawn_idle_handle(&self, affinity_key: Option<&str>) -> Result<()> {
        {
            let mut inner = self.inner.lock().await;
            if inner.occupancy() >= self.config.max_connections {
                return Ok(());
            }
            inner.creating += 1;
        }
        self.create_reserved(affinity_key, false).await.map(|_| ())
    }

    async fn health_loop(
        inner: Arc<Mutex<PoolInner<T>>>,
        factory: Arc<dyn ResourceFactory<T>>,
        config: Arc<PoolConfig>,
        reclaim_tx: tokio::sync::mpsc::UnboundedSender<HandleId>,
    ) {
        let mut ticker = tokio::time::interval(config.health_check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // immediate first tick
        loop {
            ticker.tick().await;
            Self::health_pass(&inner, &factory, &config, &reclaim_tx).await;
        }
    }

    /// One health pass: validate idle handles, evict the unhealthy, then
    /// replenish toward `min_connections` (and toward queued waiters).
    async fn health_pass(
        inner: &Mutex<PoolInner<T>>,
        factory: &Arc<dyn ResourceFactory<T>>,
        config: &Arc<PoolConfig>,
        reclaim_tx: &tokio::sync::mpsc::UnboundedSender<HandleId>,
    ) {
        let candidates: Vec<(HandleId, Arc<T>, bool)> = {
            let guard = inner.lock().await;
            if guard.shutting_down {
                return;
            }
            guard
                .handles
                .values()
                .filter(|h| !h.in_use)
                .map(|h| (h.id, h.resource.clone(), h.is_expired(config)))
                .collect()
        };

        let mut verdicts = Vec::with_capacity(candidates.len());
        for (id, resource, expired) in candidates {
            let valid = !expired && factory.validate(&resource).await;
            verdicts.push((id, valid));
        }

        let evicted: Vec<Arc<T>> = {
            let mut guard = inner.lock().await;
            if guard.shutting_down {
                return;
            }
            for (id, valid) in verdicts {
                if let Some(entry) = guard.handles.get_mut(&id) {
                    // Skip handles acquired since the snapshot.
                    if !entry.in_use {
                        entry.healthy = valid && entry.breaker.is_closed();
                    }
                }
            }
            let dead: Vec<HandleId> = guard
                .handles
                .values()
                .filter(|h| !h.healthy && !h.in_use)
                .map(|h| h.id)
                .collect();
            dead.iter()
                .filter_map(|id| guard.handles.remove(id))
                .map(|entry| {
                    debug!(handle = entry.id, "evicting unhealthy handle");
                    entry.resource
                })
                .collect()
        };
        for resource in &evicted {
            factory.close(resource).await;
        }

        // Replenish: keep min_connections warm and unblock waiters while
        // capacity remains.
        loop {
            {
                let mut guard = inner.lock().await;
                if guard.shutting_down {
                    return;
                }
                let occupancy = guard.occupancy();
                let below_min = occupancy < config.min_connections;
                let waiter_needs = !guard.waiters.is_empty() && occupancy < config.max_connections;
                if !below_min && !waiter_needs {
                    Self::serve_waiters(&mut guard, config.reuse_strategy, reclaim_tx);
                    return;
                }
                guard.creating += 1;
            }

            let id = {
                let mut guard = inner.lock().await;
                let id = guard.next_handle_id;
                guard.next_handle_id += 1;
                id
            };
            match factory.create(id).await {
                Ok(resource) => {
                    let now = Instant::now();
                    let mut guard = inner.lock().await;
                    guard.creating -= 1;
                    guard.handles.insert(
                        id,
                        HandleEntry {
                            id,
                            resource: Arc::new(resource),
                            breaker: CircuitBreaker::new(
                                format!("handle-{}", id),
                                config.breaker.clone(),
                            ),
                            in_use: false,
                            healthy: true,
                            created_at: now,
                            last_used: now,
                            use_count: 0,
                            affinity_key: None,
                        },
                    );
                    Self::serve_waiters(&mut guard, config.reuse_strategy, reclaim_tx);
                }
                Err(e) => {
                    inner.lock().await.creating -= 1;
                    warn!(error = %e, "replenish failed");
                    return;
                }
            }
        }
    }
}

impl<T: Send + Sync + 'static> Drop for ResourcePool<T> {
    fn drop(&mut self) {
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[derive(Debug)]
    struct TestConn {
        id: HandleId,
    }

    struct TestFactory {
        created: AtomicU64,
        valid: AtomicBool,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                created: AtomicU64::new(0),
                valid: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl ResourceFactory<TestConn> for TestFactory {
        async fn create(&self, id: HandleId) -> Result<TestConn> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(TestConn { id })
        }

        async fn validate(&self, _conn: &TestConn) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    fn quiet_config() -> PoolConfig {
        PoolConfig {
            min_connections: 0,
            max_connections: 4,
            health_check_interval: Duration::from_secs(3600),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_acquire_release_stats() {
        let pool = ResourcePool::new(TestFactory::new(), quiet_config())
            .await
            .unwrap();

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats.active, 1);
        assert_eq!(stats.idle, 0);

        pool.release(lease, true).await;
        let stats = pool.stats().await;
        assert_eq!(stats.active, 0);
        assert_eq!(stats.idle, 1);
    }

    #[tokio::test]
    async fn test_affinity_reuses_same_handle() {
        let pool = ResourcePool::new(TestFactory::new(), quiet_config())
            .await
            .unwrap();

        let lease = pool
            .acquire(Some("skill-a"), Duration::from_secs(1))
            .await
            .unwrap();
        let first_id = lease.id();
        pool.release(lease, true).await;

        let lease = pool
            .acquire(Some("skill-a"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lease.id(), first_id);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_exhaustion_times_out() {
        let pool = ResourcePool::new(
            TestFactory::new(),
            PoolConfig {
                max_connections: 1,
                ..quiet_config()
            },
        )
        .await
        .unwrap();

        let held = pool.acquire(None, Duration::from_secs(1)).await.unwrap();

        let started = Instant::now();
        let result = pool.acquire(None, Duration::from_millis(100)).await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(ForemanError::Timeout(_))));
        assert!(waited >= Duration::from_millis(100), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(200), "waited {:?}", waited);

        pool.release(held, true).await;
    }

    #[tokio::test]
    async fn test_waiters_served_fifo_on_release() {
        let pool = Arc::new(
            ResourcePool::new(
                TestFactory::new(),
                PoolConfig {
                    max_connections: 1,
                    ..quiet_config()
                },
            )
            .await
            .unwrap(),
        );

        let held = pool.acquire(None, Duration::from_secs(1)).await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for tag in ["first", "second"] {
            let pool = pool.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let lease = pool.acquire(None, Duration::from_secs(5)).await.unwrap();
                order_tx.send(tag).unwrap();
                pool.release(lease, true).await;
            });
            // Deterministic enqueue order.
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        pool.release(held, true).await;
        assert_eq!(order_rx.recv().await, Some("first"));
        assert_eq!(order_rx.recv().await, Some("second"));
    }

    #[tokio::test]
    async fn test_wait_queue_bound() {
        let pool = Arc::new(
            ResourcePool::new(
                TestFactory::new(),
                PoolConfig {
                    max_connections: 1,
                    max_waiters: 1,
                    ..quiet_config()
                },
            )
            .await
            .unwrap(),
        );

        let _held = pool.acquire(None, Duration::from_secs(1)).await.unwrap();

        let queued = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(None, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Queue is full now; the next acquire is rejected immediately.
        let result = pool.acquire(None, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(ForemanError::PoolExhausted)));
        queued.abort();
    }

    #[tokio::test]
    async fn test_round_robin_rotates() {
        let factory = TestFactory::new();
        let pool = ResourcePool::new(
            factory,
            PoolConfig {
                min_connections: 3,
                max_connections: 3,
                reuse_strategy: ReuseStrategy::RoundRobin,
                ..quiet_config()
            },
        )
        .await
        .unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
            seen.push(lease.id());
            pool.release(lease, true).await;
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 3, "round robin must rotate over all handles");
    }

    #[tokio::test]
    async fn test_least_used_picks_minimum() {
        let pool = ResourcePool::new(
            TestFactory::new(),
            PoolConfig {
                min_connections: 2,
                max_connections: 2,
                reuse_strategy: ReuseStrategy::LeastUsed,
                ..quiet_config()
            },
        )
        .await
        .unwrap();

        // Put one use on the first handle.
        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let busy_id = lease.id();
        pool.release(lease, true).await;
        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.id(), busy_id, "least-used must avoid the hot handle");
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_failed_validation_evicts_and_replenishes() {
        let factory = TestFactory::new();
        let pool = ResourcePool::new(
            factory.clone(),
            PoolConfig {
                min_connections: 1,
                max_connections: 2,
                health_check_interval: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let sick_id = lease.id();
        pool.release(lease, false).await;
        factory.valid.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(80)).await;
        factory.valid.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = pool.stats().await;
        assert!(
            stats.handles.iter().all(|h| h.id != sick_id),
            "handle failing validation must be evicted"
        );
        // The health loop re-warms to min_connections.
        assert!(stats.total >= 1);
    }

    #[tokio::test]
    async fn test_passing_validation_rehabilitates_released_unhealthy() {
        crate::logging::init_test_logging();
        let pool = ResourcePool::new(
            TestFactory::new(),
            PoolConfig {
                min_connections: 0,
                max_connections: 2,
                health_check_interval: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        )
        .await
        .unwrap();

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let id = lease.id();
        // Caller flags it unhealthy, but the validator disagrees: the
        // next health pass restores it.
        pool.release(lease, false).await;
        tokio::time::sleep(Duration::from_millis(80)).await;

        let stats = pool.stats().await;
        assert!(stats.handles.iter().any(|h| h.id == id && h.healthy));
    }

    #[tokio::test]
    async fn test_open_breaker_handle_not_selected() {
        let pool = ResourcePool::new(TestFactory::new(), quiet_config())
            .await
            .unwrap();

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let tripped_id = lease.id();
        lease.breaker().force_open();
        pool.release(lease, true).await;

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        assert_ne!(lease.id(), tripped_id);
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_execute_with_releases_on_failure() {
        let pool = ResourcePool::new(TestFactory::new(), quiet_config())
            .await
            .unwrap();

        let result: Result<()> = pool
            .execute_with(None, |_conn| async {
                Err(ForemanError::Skill("boom".into()))
            })
            .await;
        assert!(result.is_err());

        let stats = pool.stats().await;
        assert_eq!(stats.active, 0, "handle must be released on failure");
    }

    #[tokio::test]
    async fn test_execute_with_runs_through_breaker() {
        let pool = ResourcePool::new(TestFactory::new(), quiet_config())
            .await
            .unwrap();

        let value = pool
            .execute_with(Some("k"), |conn| async move { Ok(conn.id) })
            .await
            .unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_waiters_and_new_acquires() {
        let pool = Arc::new(
            ResourcePool::new(
                TestFactory::new(),
                PoolConfig {
                    max_connections: 1,
                    ..quiet_config()
                },
            )
            .await
            .unwrap(),
        );

        let held = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(None, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.release(held, true).await;
        // The waiter grabbed the released handle; queue a second waiter
        // that shutdown must reject.
        let lease = waiter.await.unwrap().unwrap();
        let rejected = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(None, Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let shutdown = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(lease, true).await;
        shutdown.await.unwrap();

        assert!(matches!(
            rejected.await.unwrap(),
            Err(ForemanError::ShuttingDown)
        ));
        assert!(matches!(
            pool.acquire(None, Duration::from_secs(1)).await,
            Err(ForemanError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_dropped_lease_is_reclaimed() {
        let pool = ResourcePool::new(
            TestFactory::new(),
            PoolConfig {
                max_connections: 1,
                ..quiet_config()
            },
        )
        .await
        .unwrap();

        let lease = pool.acquire(None, Duration::from_secs(1)).await.unwrap();
        drop(lease);
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The handle is back in circulation without an explicit release.
        let lease = pool.acquire(None, Duration::from_millis(200)).await.unwrap();
        pool.release(lease, true).await;
    }

    #[tokio::test]
    async fn test_config_validation() {
        let config = PoolConfig {
            min_connections: 5,
            max_connections: 2,
            ..PoolConfig::default()
        };
        let result = ResourcePool::new(TestFactory::new(), config).await;
        assert!(matches!(result, Err(ForemanError::Config(_))));
    }
}
