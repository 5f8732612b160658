use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{AccountStore, UsageRecord};
use crate::models::account::{RateLimitOverride, Tier};
use crate::models::config::CounterReset;

// A single database mutation. Everything the request path wants persisted
// goes through one of these; the request path itself never touches the
// database connection.
#[derive(Debug, Clone)]
pub enum ResolvedOp {
    IncrementUsage {
        account_id: String,
        count: i64,
        now: i64,
        session_ttl_secs: u64,
    },
    MarkRateLimited {
        account_id: String,
        reset_at: i64,
    },
    ClearRateLimit {
        account_id: String,
        reset_request_count: bool,
    },
    UpdateRateLimitMeta {
        account_id: String,
        status: Option<String>,
        reset_at: Option<i64>,
        remaining: Option<i64>,
    },
    UpdateTokens {
        account_id: String,
        access_token: String,
        expires_at: i64,
        refresh_token: Option<String>,
    },
    SetTier {
        account_id: String,
        tier: Tier,
    },
    SetPaused {
        account_id: String,
        paused: bool,
    },
    Rename {
        account_id: String,
        name: String,
    },
    UpdateRateLimitOverride {
        account_id: String,
        override_config: Option<RateLimitOverride>,
    },
    ResetRequestCounts,
    InsertUsageRecord {
        record: UsageRecord,
    },
}

impl ResolvedOp {
    // Token rotations must never be lost; everything else is best-effort.
    fn is_critical(&self) -> bool {
        matches!(self, ResolvedOp::UpdateTokens { .. })
    }

    fn is_coalescable(&self) -> bool {
        matches!(self, ResolvedOp::IncrementUsage { .. })
    }
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub flush_interval: Duration,
    pub batch_size: usize,
    pub queue_capacity: usize,
    pub counter_reset: CounterReset,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(100),
            batch_size: 64,
            queue_capacity: 4096,
            counter_reset: CounterReset::OnLimitClear,
        }
    }
}

const RETRY_BACKOFF_MS: [u64; 3] = [10, 40, 160];
const CRITICAL_RETRY_BACKOFF: Duration = Duration::from_secs(1);

// Single long-lived worker draining a bounded queue of store mutations.
// Drains on a periodic tick or when the pending count reaches the batch
// size, whichever comes first; each drain commits one transaction.
pub struct StoreWriter {
    tx: mpsc::Sender<ResolvedOp>,
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl StoreWriter {
    pub fn spawn(store: Arc<AccountStore>, config: WriterConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(config.batch_size));
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            run_worker(store, config, rx, worker_cancel).await;
        });

        Arc::new(Self {
            tx,
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
        })
    }

    // Non-blocking enqueue. When the queue is saturated, coalescable usage
    // increments are shed (the surviving increments for the same account are
    // merged at drain time anyway); marks and token rotations are handed to
    // a detached sender instead of being dropped.
    pub fn enqueue(&self, op: ResolvedOp) {
        match self.tx.try_send(op) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(op)) => {
                if op.is_coalescable() {
                    debug!("Writer queue saturated, shedding usage increment");
                    return;
                }
                warn!("Writer queue saturated, deferring non-droppable op");
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    if tx.send(op).await.is_err() {
                        error!("Writer closed while deferring op, mutation lost");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Writer is shut down, dropping store mutation");
            }
        }
    }

    // Drain-and-stop. Remaining ops are flushed before the worker exits;
    // callers bound the wait with the shutdown grace window.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match tokio::time::timeout(grace, handle).await {
                Ok(_) => info!("Store writer drained and stopped"),
                Err(_) => warn!("Store writer did not drain within grace window"),
            }
        }
    }
}

async fn run_worker(
    store: Arc<AccountStore>,
    config: WriterConfig,
    mut rx: mpsc::Receiver<ResolvedOp>,
    cancel: CancellationToken,
) {
    let mut pending: Vec<ResolvedOp> = Vec::with_capacity(config.batch_size);
    let mut tick = tokio::time::interval(config.flush_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut current_day = chrono::Local::now().date_naive();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                while let Ok(op) = rx.try_recv() {
                    pending.push(op);
                }
                flush(&store, &mut pending, &cancel).await;
                info!("Store writer exiting after drain");
                return;
            }
            _ = tick.tick() => {
                if config.counter_reset == CounterReset::Daily {
                    let today = chrono::Local::now().date_naive();
                    if today != current_day {
                        current_day = today;
                        pending.push(ResolvedOp::ResetRequestCounts);
                        info!("Day boundary crossed, resetting per-account request counts");
                    }
                }
                if !pending.is_empty() {
                    flush(&store, &mut pending, &cancel).await;
                }
            }
            op = rx.recv() => {
                match op {
                    Some(op) => {
                        pending.push(op);
                        if pending.len() >= config.batch_size {
                            flush(&store, &mut pending, &cancel).await;
                        }
                    }
                    None => {
                        flush(&store, &mut pending, &cancel).await;
                        return;
                    }
                }
            }
        }
    }
}

// Usage increments for the same account within one flush window collapse to
// a single += N. Marks, token rotations and usage records never coalesce.
fn coalesce(pending: Vec<ResolvedOp>) -> Vec<ResolvedOp> {
    let mut out: Vec<ResolvedOp> = Vec::with_capacity(pending.len());
    for op in pending {
        if let ResolvedOp::IncrementUsage {
            account_id, count, now, ..
        } = &op
        {
            if let Some(ResolvedOp::IncrementUsage {
                count: prev_count,
                now: prev_now,
                ..
            }) = out.iter_mut().find(|existing| {
                matches!(&**existing, ResolvedOp::IncrementUsage { account_id: id, .. } if id == account_id)
            }) {
                *prev_count += *count;
                *prev_now = (*prev_now).max(*now);
                continue;
            }
        }
        out.push(op);
    }
    out
}

async fn flush(store: &Arc<AccountStore>, pending: &mut Vec<ResolvedOp>, cancel: &CancellationToken) {
    if pending.is_empty() {
        return;
    }
    let batch = coalesce(std::mem::take(pending));

    for (attempt, backoff_ms) in RETRY_BACKOFF_MS.iter().enumerate() {
        match apply(store, batch.clone()).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    "Writer batch commit failed (attempt {}): {}",
                    attempt + 1,
                    e
                );
                tokio::time::sleep(Duration::from_millis(*backoff_ms)).await;
            }
        }
    }

    // Final failure: shed the best-effort ops, keep retrying critical ones.
    let critical: Vec<ResolvedOp> = batch.iter().filter(|op| op.is_critical()).cloned().collect();
    let dropped = batch.len() - critical.len();
    if dropped > 0 {
        error!("Dropping {} store mutations after retry exhaustion", dropped);
    }
    if critical.is_empty() {
        return;
    }

    loop {
        match apply(store, critical.clone()).await {
            Ok(()) => {
                info!("Critical token rotations persisted after retry");
                return;
            }
            Err(e) => {
                error!("Critical op retry failed, will retry: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(CRITICAL_RETRY_BACKOFF) => {}
                    _ = cancel.cancelled() => {
                        error!("Shutdown while critical ops unpersisted");
                        return;
                    }
                }
            }
        }
    }
}

async fn apply(store: &Arc<AccountStore>, batch: Vec<ResolvedOp>) -> Result<(), String> {
    let store = store.clone();
    tokio::task::spawn_blocking(move || store.apply_batch(&batch))
        .await
        .map_err(|e| format!("Writer task join error: {}", e))?
}
