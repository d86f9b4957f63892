//! Request batcher: coalesces calls into windowed batches
//!
//! Individual `execute` calls accumulate into a window that flushes when
//! `max_batch_size` is reached (immediately) or `max_wait` has elapsed
//! since the window's first item — whichever comes first. One outbound
//! batch carries every item's id, skill and params; the response is
//! validated strictly: a count mismatch rejects the whole batch, a
//! positional id mismatch rejects only that position.
//!
//! Oversized payloads are zstd-compressed and base64-wrapped before
//! dispatch, falling back to the plain envelope when compression does not
//! pay for itself. A failed dispatch settles only that window's items;
//! the next window is untouched.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ForemanError, Result};
use crate::protocol::{BatchCallResult, BatchCallSpec};

/// zstd level for batch payloads; fast with a reasonable ratio.
const COMPRESSION_LEVEL: i32 = 3;

/// What a flush hands to the transport.
#[derive(Debug, Clone)]
pub enum BatchPayload {
    Plain(Vec<BatchCallSpec>),
    /// base64 of the zstd-compressed JSON array of call specs.
    Compressed { data: String, codec: String },
}

/// Downstream capable of one batched round trip.
#[async_trait]
pub trait BatchTransport: Send + Sync {
    async fn send_batch(
        &self,
        payload: BatchPayload,
        timeout: Duration,
    ) -> Result<Vec<BatchCallResult>>;
}

/// Configuration for batcher behavior
#[derive(Debug, Clone)]
pub struct BatcherConfig {
    /// Items that trigger an immediate flush.
    pub max_batch_size: usize,
    /// Window length measured from the first item.
    pub max_wait: Duration,
    /// Compress payloads above the threshold.
    pub compression: bool,
    /// Serialized-size threshold in bytes.
    pub compression_threshold: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 10,
            max_wait: Duration::from_millis(50),
            compression: true,
            compression_threshold: 10 * 1024,
        }
    }
}

struct PendingItem {
    id: String,
    skill: String,
    params: Value,
    timeout: Duration,
    queued_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
}

struct Window {
    items: Vec<PendingItem>,
    /// Bumped on every flush so a stale timer can tell its window is gone.
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Counters {
    batches_sent: u64,
    total_requests: u64,
    batched_requests: u64,
    avg_batch_size: f64,
    avg_latency_ms: f64,
    bytes_saved: u64,
    compressed_batches: u64,
}

impl Counters {
    fn record_batch(&mut self, size: usize) {
        self.batches_sent += 1;
        self.batched_requests += size as u64;
        if self.batches_sent == 1 {
            self.avg_batch_size = size as f64;
        } else {
            self.avg_batch_size = self.avg_batch_size * 0.9 + size as f64 * 0.1;
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        let ms = latency.as_secs_f64() * 1000.0;
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = ms;
        } else {
            self.avg_latency_ms = self.avg_latency_ms * 0.9 + ms * 0.1;
        }
    }
}

/// Snapshot of batcher counters and window occupancy.
#[derive(Debug, Clone)]
pub struct BatcherStats {
    pub batches_sent: u64,
    pub total_requests: u64,
    pub batched_requests: u64,
    /// batched / total, in [0, 1].
    pub batching_efficiency: f64,
    pub average_batch_size: f64,
    pub average_latency: Duration,
    pub bytes_saved: u64,
    pub compressed_batches: u64,
    pub pending: usize,
    pub timer_armed: bool,
}

/// Coalesces individual calls into batched round trips.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use serde_json::json;
/// use foreman::batcher::{BatcherConfig, BatchTransport, RequestBatcher};
/// # use foreman::batcher::BatchPayload;
/// # use foreman::protocol::BatchCallResult;
/// # use foreman::error::Result;
/// # struct Downstream;
/// # #[async_trait::async_trait]
/// # impl BatchTransport for Downstream {
/// #     async fn send_batch(&self, _p: BatchPayload, _t: Duration) -> Result<Vec<BatchCallResult>> {
/// #         Ok(vec![])
/// #     }
/// # }
///
/// # async fn example() -> Result<()> {
/// let batcher = RequestBatcher::new(Arc::new(Downstream), BatcherConfig::default());
/// let result = batcher
///     .execute("echo", json!({"n": 1}), Duration::from_secs(30))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RequestBatcher {
    config: Arc<BatcherConfig>,
    transport: Arc<dyn BatchTransport>,
    window: Arc<Mutex<Window>>,
    counters: Arc<std::sync::Mutex<Counters>>,
    next_id: AtomicU64,
}

impl RequestBatcher {
    pub fn new(transport: Arc<dyn BatchTransport>, config: BatcherConfig) -> Self {
        Self {
            config: Arc::new(config),
            transport,
            window: Arc::new(Mutex::new(Window {
                items: Vec::new(),
                generation: 0,
                timer: None,
            })),
            counters: Arc::new(std::sync::Mutex::new(Counters::default())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Enqueue one call into the current window and await its settlement.
    pub async fn execute(&self, skill: &str, params: Value, timeout: Duration) -> Result<Value> {
        let rx = {
            let mut window = self.window.lock().await;
            let id = format!("req-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let (tx, rx) = oneshot::channel();
            window.items.push(PendingItem {
                id,
                skill: skill.to_owned(),
                params,
                timeout,
                queued_at: Instant::now(),
                tx,
            });
            self.counters.lock().unwrap().total_requests += 1;

            if window.items.len() == 1 {
                // First item of the window arms the flush timer.
                window.timer = Some(tokio::spawn(Self::timer_flush(
                    window.generation,
                    self.config.clone(),
                    self.transport.clone(),
                    self.window.clone(),
                    self.counters.clone(),
                )));
            }
            if window.items.len() >= self.config.max_batch_size {
                let items = Self::take_window(&mut window);
                tokio::spawn(Self::dispatch(
                    items,
                    self.config.clone(),
                    self.transport.clone(),
                    self.counters.clone(),
                ));
            }
            rx
        };

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ForemanError::ShuttingDown),
        }
    }

    /// Drain the current window immediately and await its dispatch. Used
    /// before shutdown so nothing is left parked on the timer.
    pub async fn flush(&self) {
        let items = {
            let mut window = self.window.lock().await;
            Self::take_window(&mut window)
        };
        if !items.is_empty() {
            Self::dispatch(
                items,
                self.config.clone(),
                self.transport.clone(),
                self.counters.clone(),
            )
            .await;
        }
    }

    /// Flush pending items and disarm the timer.
    pub async fn cleanup(&self) {
        self.flush().await;
        let mut window = self.window.lock().await;
        if let Some(timer) = window.timer.take() {
            timer.abort();
        }
        debug!("batcher cleaned up");
    }

    /// Snapshot of counters and the current window.
    pub async fn stats(&self) -> BatcherStats {
        let window = self.window.lock().await;
        let counters = self.counters.lock().unwrap();
        BatcherStats {
            batches_sent: counters.batches_sent,
            total_requests: counters.total_requests,
            batched_requests: counters.batched_requests,
            batching_efficiency: if counters.total_requests > 0 {
                counters.batched_requests as f64 / counters.total_requests as f64
            } else {
                0.0
            },
            average_batch_size: counters.avg_batch_size,
            average_latency: Duration::from_secs_f64(counters.avg_latency_ms / 1000.0),
            bytes_saved: counters.bytes_saved,
            compressed_batches: counters.compressed_batches,
            pending: window.items.len(),
            timer_armed: window.timer.is_some(),
        }
    }

    /// Detach the current window: bump the generation (so a sleeping
    /// timer knows it lost the race), disarm the timer, take the items.
    fn take_window(window: &mut Window) -> Vec<PendingItem> {
        window.generation += 1;
        if let Some(timer) = window.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut window.items)
    }

    async fn timer_flush(
        generation: u64,
        config: Arc<BatcherConfig>,
        transport: Arc<dyn BatchTransport>,
        window: Arc<Mutex<Window>>,
        counters: Arc<std::sync::Mutex<Counters>>,
    ) {
        tokio::time::sleep(config.max_wait).await;
        let items = {
            let mut window = window.lock().await;
            if window.generation != generation {
                // A size-triggered or manual flush already took this window.
                return;
            }
            window.generation += 1;
            window.timer = None;
            std::mem::take(&mut window.items)
        };
        if !items.is_empty() {
            Self::dispatch(items, config, transport, counters).await;
        }
    }

    /// Send one detached window downstream and settle every item.
    async fn dispatch(
        items: Vec<PendingItem>,
        config: Arc<BatcherConfig>,
        transport: Arc<dyn BatchTransport>,
        counters: Arc<std::sync::Mutex<Counters>>,
    ) {
        let window_started = items
            .first()
            .map(|item| item.queued_at)
            .unwrap_or_else(Instant::now);
        let specs: Vec<BatchCallSpec> = items
            .iter()
            .map(|item| BatchCallSpec {
                id: item.id.clone(),
                skill: item.skill.clone(),
                params: item.params.clone(),
                timeout: item.timeout.as_secs().max(1),
            })
            .collect();
        counters.lock().unwrap().record_batch(specs.len());
        debug!(size = specs.len(), "flushing batch");

        let timeout = items
            .iter()
            .map(|item| item.timeout)
            .max()
            .unwrap_or(Duration::from_secs(30));
        let payload = Self::encode_payload(&config, specs, &counters);

        match transport.send_batch(payload, timeout).await {
            Err(error) => {
                warn!(error = %error, "batch dispatch failed");
                let message = error.to_string();
                for item in items {
                    let _ = item.tx.send(Err(ForemanError::BatchFailed(message.clone())));
                }
            }
            Ok(results) => {
                counters
                    .lock()
                    .unwrap()
                    .record_latency(window_started.elapsed());

                if results.len() != items.len() {
                    let message =
                        format!("expected {} results, got {}", items.len(), results.len());
                    warn!(%message, "rejecting whole batch");
                    for item in items {
                        let _ = item
                            .tx
                            .send(Err(ForemanError::BatchMismatch(message.clone())));
                    }
                    return;
                }

                for (item, result) in items.into_iter().zip(results) {
                    if result.id != item.id {
                        let _ = item.tx.send(Err(ForemanError::BatchMismatch(format!(
                            "expected id {}, got {}",
                            item.id, result.id
                        ))));
                        continue;
                    }
                    if result.success {
                        let _ = item.tx.send(Ok(result.result.unwrap_or(Value::Null)));
                    } else {
                        let _ = item.tx.send(Err(ForemanError::Skill(
                            result.error.unwrap_or_else(|| "execution failed".into()),
                        )));
                    }
                }
            }
        }
    }

    /// Compress the spec array when it crosses the threshold and the
    /// compressed form is actually smaller; otherwise send it plain.
    fn encode_payload(
        config: &BatcherConfig,
        specs: Vec<BatchCallSpec>,
        counters: &std::sync::Mutex<Counters>,
    ) -> BatchPayload {
        if !config.compression {
            return BatchPayload::Plain(specs);
        }
        let serialized = match serde_json::to_vec(&specs) {
            Ok(bytes) => bytes,
            Err(_) => return BatchPayload::Plain(specs),
        };
        if serialized.len() <= config.compression_threshold {
            return BatchPayload::Plain(specs);
        }
        match zstd::stream::encode_all(serialized.as_slice(), COMPRESSION_LEVEL) {
            Ok(compressed) => {
                let data = BASE64.encode(&compressed);
                if data.len() < serialized.len() {
                    let mut counters = counters.lock().unwrap();
                    counters.bytes_saved += (serialized.len() - data.len()) as u64;
                    counters.compressed_batches += 1;
                    BatchPayload::Compressed {
                        data,
                        codec: "zstd".into(),
                    }
                } else {
                    BatchPayload::Plain(specs)
                }
            }
            Err(error) => {
                warn!(%error, "compression failed, sending plain payload");
                BatchPayload::Plain(specs)
            }
        }
    }
}
