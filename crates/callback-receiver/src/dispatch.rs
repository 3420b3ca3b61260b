//! Event dispatch
//!
//! Routes a parsed batch either to per-type record handlers, each record in
//! its own task, or to a single batch handler. Every batch runs on a tracked
//! task so shutdown can wait for outstanding work.

use crate::events::{EventBatch, EventRecord, EventType};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Handler invoked once per record of the type it is registered for
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, record: EventRecord) -> anyhow::Result<()>;
}

/// Handler receiving every batch as a whole
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: EventBatch) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`RecordHandler`]
pub struct RecordFn<F>(pub F);

#[async_trait]
impl<F, Fut> RecordHandler for RecordFn<F>
where
    F: Fn(EventRecord) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, record: EventRecord) -> anyhow::Result<()> {
        (self.0)(record).await
    }
}

/// Adapter turning an async closure into a [`BatchHandler`]
pub struct BatchFn<F>(pub F);

#[async_trait]
impl<F, Fut> BatchHandler for BatchFn<F>
where
    F: Fn(EventBatch) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, batch: EventBatch) -> anyhow::Result<()> {
        (self.0)(batch).await
    }
}

/// One optional handler slot per event type
#[derive(Clone, Default)]
pub struct HandlerSet {
    slots: [Option<Arc<dyn RecordHandler>>; EventType::COUNT],
}

impl HandlerSet {
    pub fn insert(&mut self, event_type: EventType, handler: Arc<dyn RecordHandler>) {
        self.slots[event_type as usize] = Some(handler);
    }

    pub fn get(&self, event_type: EventType) -> Option<&Arc<dyn RecordHandler>> {
        self.slots[event_type as usize].as_ref()
    }

    pub fn registered_types(&self) -> Vec<EventType> {
        EventType::ALL
            .into_iter()
            .filter(|t| self.get(*t).is_some())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSet")
            .field("registered", &self.registered_types())
            .finish()
    }
}

/// How batches are routed. The two strategies are mutually exclusive.
#[derive(Clone)]
pub enum DispatchStrategy {
    PerType(HandlerSet),
    Unified(Arc<dyn BatchHandler>),
}

impl DispatchStrategy {
    pub fn is_unified(&self) -> bool {
        matches!(self, Self::Unified(_))
    }

    /// Registered per-type slots; empty under the unified strategy
    pub fn registered_types(&self) -> Vec<EventType> {
        match self {
            Self::PerType(handlers) => handlers.registered_types(),
            Self::Unified(_) => Vec::new(),
        }
    }

    pub fn has_handlers(&self) -> bool {
        match self {
            Self::PerType(handlers) => !handlers.is_empty(),
            Self::Unified(_) => true,
        }
    }
}

impl Default for DispatchStrategy {
    fn default() -> Self {
        Self::PerType(HandlerSet::default())
    }
}

impl fmt::Debug for DispatchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PerType(handlers) => f.debug_tuple("PerType").field(handlers).finish(),
            Self::Unified(_) => f.write_str("Unified"),
        }
    }
}

/// Outcome of dispatching one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub batch_id: String,
    pub records: usize,
    /// Handler invocations started
    pub invoked: usize,
    /// Records without a registered handler
    pub skipped: usize,
    /// Invocations that returned an error or panicked
    pub failed: usize,
}

/// Fans batches out to the configured handlers
pub struct Dispatcher {
    strategy: Arc<DispatchStrategy>,
    tracker: TaskTracker,
    unified_ack_timeout: Duration,
}

impl Dispatcher {
    pub fn new(strategy: DispatchStrategy, unified_ack_timeout: Duration) -> Self {
        Self {
            strategy: Arc::new(strategy),
            tracker: TaskTracker::new(),
            unified_ack_timeout,
        }
    }

    pub fn strategy(&self) -> &DispatchStrategy {
        &self.strategy
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Number of batches still being processed
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Start dispatching a batch.
    ///
    /// Per-type dispatch returns as soon as the batch task is spawned. Unified
    /// dispatch waits for the batch handler up to the acknowledgement timeout.
    pub async fn dispatch(&self, batch: EventBatch) {
        let batch_id = batch.id.clone();
        let task = self.spawn(batch);

        if self.strategy.is_unified() {
            if tokio::time::timeout(self.unified_ack_timeout, task).await.is_err() {
                warn!(
                    batch_id = %batch_id,
                    timeout_ms = self.unified_ack_timeout.as_millis() as u64,
                    "Unified handler still running, acknowledging batch anyway"
                );
            }
        }
    }

    /// Dispatch a batch and wait until every handler invocation finished
    pub async fn dispatch_and_wait(&self, batch: EventBatch) -> DispatchReport {
        let batch_id = batch.id.clone();
        let records = batch.len();

        match self.spawn(batch).await {
            Ok(report) => report,
            Err(e) => {
                error!(batch_id = %batch_id, error = %e, "Batch dispatch task failed");
                DispatchReport {
                    batch_id,
                    records,
                    failed: records,
                    ..Default::default()
                }
            }
        }
    }

    fn spawn(&self, batch: EventBatch) -> JoinHandle<DispatchReport> {
        let strategy = Arc::clone(&self.strategy);
        self.tracker.spawn(async move {
            let report = match strategy.as_ref() {
                DispatchStrategy::PerType(handlers) => dispatch_per_type(handlers, batch).await,
                DispatchStrategy::Unified(handler) => {
                    dispatch_unified(Arc::clone(handler), batch).await
                }
            };
            info!(
                batch_id = %report.batch_id,
                records = report.records,
                invoked = report.invoked,
                skipped = report.skipped,
                failed = report.failed,
                "Callback batch processed"
            );
            report
        })
    }
}

async fn dispatch_per_type(handlers: &HandlerSet, batch: EventBatch) -> DispatchReport {
    let mut report = DispatchReport {
        batch_id: batch.id.clone(),
        records: batch.len(),
        ..Default::default()
    };

    let mut tasks = JoinSet::new();
    for record in batch.records {
        let Some(handler) = handlers.get(record.event_type) else {
            debug!(
                batch_id = %report.batch_id,
                event_type = %record.event_type,
                msg_id = %record.msg_id,
                "No handler registered, skipping record"
            );
            report.skipped += 1;
            continue;
        };

        let handler = Arc::clone(handler);
        let event_type = record.event_type;
        let msg_id = record.msg_id.clone();
        tasks.spawn(async move { (event_type, msg_id, handler.handle(record).await) });
        report.invoked += 1;
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, _, Ok(()))) => {}
            Ok((event_type, msg_id, Err(e))) => {
                report.failed += 1;
                error!(
                    batch_id = %report.batch_id,
                    event_type = %event_type,
                    msg_id = %msg_id,
                    error = %e,
                    "Record handler failed"
                );
            }
            Err(e) => {
                report.failed += 1;
                error!(batch_id = %report.batch_id, error = %e, "Record handler panicked");
            }
        }
    }

    report
}

async fn dispatch_unified(handler: Arc<dyn BatchHandler>, batch: EventBatch) -> DispatchReport {
    let mut report = DispatchReport {
        batch_id: batch.id.clone(),
        records: batch.len(),
        invoked: 1,
        ..Default::default()
    };

    // Own task so a panicking handler is contained.
    match tokio::spawn(async move { handler.handle(batch).await }).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            report.failed = 1;
            error!(batch_id = %report.batch_id, error = %e, "Unified handler failed");
        }
        Err(e) => {
            report.failed = 1;
            error!(batch_id = %report.batch_id, error = %e, "Unified handler panicked");
        }
    }

    report
}
