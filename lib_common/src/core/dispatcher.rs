//! # Batching, Prioritizing Update Dispatcher
//!
//! The `UpdateDispatcher` sits between the connection and everything that
//! consumes live updates. Updates are queued as they arrive and handed on in
//! batches.
//!
//! ## Core Design Principles:
//!
//! 1.  **Atomic drain**: a flush takes the whole intake queue in one swap, so
//!     anything arriving while handlers run lands in the next batch.
//!
//! 2.  **Stable priority order**: with prioritization on, a batch is sorted by
//!     [`crate::core::model::UpdateKind::priority`] descending with a stable sort. Equal-priority
//!     updates keep arrival order.
//!
//! 3.  **Shared, not copied**: updates travel as `Arc<RealTimeUpdate>`. Groups,
//!     the recent ring and the analytics batch all point at the same memory.
//!
//! 4.  **Registered handlers**: routing is a `type → handler` map with a
//!     fallback, not a growing `match`.
//!
//! 5.  **Optional intake bound**: `maxPendingUpdates` caps the queue with a
//!     drop-oldest or reject policy; unset means unbounded.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::configs::{OverflowPolicy, RealtimeConfig};
use crate::core::model::{RealTimeUpdate, Scope};
use crate::utils::misc::utils::now_millis;

/// A live update shared between the dispatcher's consumers.
pub type SharedUpdate = Arc<RealTimeUpdate>;

/// Consumes one group of same-typed updates. Must not block.
pub trait UpdateHandler: Send + Sync {
    /// Called once per flush with every update of the handler's type.
    fn handle(&self, updates: &[SharedUpdate]);
}

impl<F> UpdateHandler for F
where
    F: Fn(&[SharedUpdate]) + Send + Sync,
{
    fn handle(&self, updates: &[SharedUpdate]) {
        self(updates)
    }
}

/// What the analytics sink receives: one record per flush.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsBatch {
    /// Scope active at flush time.
    pub scope: Scope,
    /// Flush time, epoch milliseconds.
    pub timestamp: i64,
    /// The batch in flush order.
    pub updates: Vec<SharedUpdate>,
}

/// Downstream consumer of flushed batches.
pub trait AnalyticsSink: Send + Sync {
    /// Called exactly once per non-empty flush, in flush order.
    fn publish(&self, batch: AnalyticsBatch);
}

/// Forwards batches into a channel, for sinks that do async work.
pub struct ChannelSink(pub mpsc::UnboundedSender<AnalyticsBatch>);

impl AnalyticsSink for ChannelSink {
    fn publish(&self, batch: AnalyticsBatch) {
        if self.0.send(batch).is_err() {
            log::warn!("Analytics receiver dropped; batch discarded");
        }
    }
}

/// Outcome of offering an update to the intake queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intake {
    /// Queued, no flush yet.
    Queued,
    /// Queued and flushed a batch of this size.
    Flushed(usize),
    /// Discarded by the `reject` overflow policy.
    Rejected,
}

/// Logs group sizes at debug level; the default for every known type.
fn log_group(kind: &'static str) -> Arc<dyn UpdateHandler> {
    Arc::new(move |updates: &[SharedUpdate]| {
        log::debug!("Dispatched {} {} update(s)", updates.len(), kind);
    })
}

/// # Update Dispatcher
///
/// Owned by one session loop; never shared across tasks.
pub struct UpdateDispatcher {
    batch_updates: bool,
    batch_size: usize,
    prioritize: bool,
    buffer_size: usize,
    max_pending: Option<usize>,
    overflow_policy: OverflowPolicy,

    queue: VecDeque<SharedUpdate>,
    recent: VecDeque<SharedUpdate>,
    handlers: HashMap<String, Arc<dyn UpdateHandler>>,
    fallback: Arc<dyn UpdateHandler>,
    sink: Option<Arc<dyn AnalyticsSink>>,

    update_count: u64,
    dropped_updates: u64,
    flush_count: u64,
    last_update: Option<DateTime<Utc>>,
}

impl UpdateDispatcher {
    /// Creates a dispatcher with logging handlers for `score`, `stat`,
    /// `event`, `injury` and the generic fallback.
    pub fn new(config: &RealtimeConfig) -> Self {
        let mut handlers = HashMap::new();
        for kind in ["score", "stat", "event", "injury"] {
            handlers.insert(kind.to_string(), log_group(kind));
        }
        let mut dispatcher = Self {
            batch_updates: true,
            batch_size: 1,
            prioritize: true,
            buffer_size: 1,
            max_pending: None,
            overflow_policy: OverflowPolicy::default(),
            queue: VecDeque::new(),
            recent: VecDeque::new(),
            handlers,
            fallback: log_group("generic"),
            sink: None,
            update_count: 0,
            dropped_updates: 0,
            flush_count: 0,
            last_update: None,
        };
        dispatcher.apply_config(config);
        dispatcher
    }

    /// Picks up new batching/buffer settings. Shrinking the buffer trims the ring.
    pub fn apply_config(&mut self, config: &RealtimeConfig) {
        self.batch_updates = config.batch_updates;
        self.batch_size = config.batch_size.max(1);
        self.prioritize = config.prioritize_updates;
        self.buffer_size = config.buffer_size;
        self.max_pending = config.max_pending_updates;
        self.overflow_policy = config.overflow_policy;
        self.recent.truncate(self.buffer_size);
    }

    /// Routes updates of `kind` to `handler`, replacing any previous one.
    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn UpdateHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Handler for types without a registered one.
    pub fn set_fallback_handler(&mut self, handler: Arc<dyn UpdateHandler>) {
        self.fallback = handler;
    }

    /// Installs the downstream analytics sink.
    pub fn set_analytics_sink(&mut self, sink: Arc<dyn AnalyticsSink>) {
        self.sink = Some(sink);
    }

    /// Queues an update and flushes if batching is off or the batch is full.
    pub fn enqueue(&mut self, update: RealTimeUpdate, scope: &Scope) -> Intake {
        if let Some(max) = self.max_pending {
            if self.queue.len() >= max {
                self.dropped_updates += 1;
                match self.overflow_policy {
                    OverflowPolicy::Reject => {
                        log::warn!("Intake queue full ({}); rejecting update {}", max, update.id);
                        return Intake::Rejected;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(dropped) = self.queue.pop_front() {
                            log::warn!("Intake queue full ({}); dropping oldest update {}", max, dropped.id);
                        }
                    }
                }
            }
        }

        log::trace!("Queued {} update {}", update.kind, update.id);
        self.queue.push_back(Arc::new(update));

        if !self.batch_updates || self.queue.len() >= self.batch_size {
            return Intake::Flushed(self.flush(scope));
        }
        Intake::Queued
    }

    /// Drains the queue and dispatches it as one batch. Returns the batch size.
    pub fn flush(&mut self, scope: &Scope) -> usize {
        let mut batch: Vec<SharedUpdate> = std::mem::take(&mut self.queue).into();
        if batch.is_empty() {
            return 0;
        }

        if self.prioritize {
            // `sort_by_key` is stable.
            batch.sort_by_key(|u| Reverse(u.kind.priority()));
        }

        for (kind, group) in group_by_kind(&batch) {
            let handler = self.handlers.get(kind).unwrap_or(&self.fallback);
            handler.handle(&group);
        }

        for update in batch.iter().rev() {
            self.recent.push_front(Arc::clone(update));
        }
        self.recent.truncate(self.buffer_size);

        let size = batch.len();
        if let Some(sink) = &self.sink {
            sink.publish(AnalyticsBatch { scope: scope.clone(), timestamp: now_millis(), updates: batch });
        }

        self.update_count += size as u64;
        self.flush_count += 1;
        self.last_update = Some(Utc::now());
        log::debug!("Flushed batch of {} update(s); {} queued", size, self.queue.len());
        size
    }

    /// Most recent first, at most `bufferSize` entries.
    pub fn recent_updates(&self) -> Vec<SharedUpdate> {
        self.recent.iter().cloned().collect()
    }

    /// Updates waiting for the next flush.
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Total updates flushed so far.
    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    /// Updates discarded by the overflow policy.
    pub fn dropped_updates(&self) -> u64 {
        self.dropped_updates
    }

    /// Non-empty flushes so far.
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Time of the last non-empty flush.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }
}

/// Groups by type, ordered by first occurrence.
fn group_by_kind(batch: &[SharedUpdate]) -> Vec<(&str, Vec<SharedUpdate>)> {
    let mut groups: Vec<(&str, Vec<SharedUpdate>)> = Vec::new();
    for update in batch {
        let kind = update.kind.as_str();
        match groups.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, group)) => group.push(Arc::clone(update)),
            None => groups.push((kind, vec![Arc::clone(update)])),
        }
    }
    groups
}
