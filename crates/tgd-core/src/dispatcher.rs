//! Worker pool that runs queued updates through the handler chain.
//!
//! Matching walks the registry snapshot group by group (ascending). Inside a
//! group the first record whose predicate matches runs and the rest of the
//! group is skipped. The next group is evaluated unless the callback returned
//! [`Flow::Stop`]. A failing handler is reported to the error chain; later
//! groups and other updates still run.

use std::{
    any::Any,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::task::AbortHandle;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    config::Config,
    context::{Context, SharedData},
    domain::{Update, UpdateId},
    queue::{QueueEntry, UpdateQueue},
    registry::{Flow, HandlerRecord, HandlerRegistry},
    scheduler::JobScheduler,
};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandlerErrorKind {
    #[error("{0}")]
    Failed(String),

    #[error("panicked: {0}")]
    Panicked(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// A captured handler error, as seen by error handlers.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("handler `{handler}` (group {group}) failed on update {update_id}: {kind}")]
pub struct HandlerFailure {
    pub handler: String,
    pub group: i32,
    pub update_id: UpdateId,
    pub kind: HandlerErrorKind,
}

impl HandlerFailure {
    fn new(record: &HandlerRecord, update_id: UpdateId, kind: HandlerErrorKind) -> Self {
        Self {
            handler: record.name.clone(),
            group: record.group,
            update_id,
            kind,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, HandlerErrorKind::Timeout(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    NoMatch,
    HandlerError(HandlerFailure),
    Cancelled,
}

/// Per-group outcomes of one update.
#[derive(Clone, Debug)]
pub struct DispatchReport {
    pub update_id: UpdateId,
    pub groups: Vec<(i32, DispatchOutcome)>,
}

impl DispatchReport {
    fn new(update_id: UpdateId) -> Self {
        Self {
            update_id,
            groups: Vec::new(),
        }
    }

    /// Summary: `Cancelled` beats the first `HandlerError`, which beats `Handled`.
    pub fn outcome(&self) -> DispatchOutcome {
        let outcomes = || self.groups.iter().map(|(_, o)| o);
        if outcomes().any(|o| *o == DispatchOutcome::Cancelled) {
            return DispatchOutcome::Cancelled;
        }
        if let Some(err) = outcomes().find(|o| matches!(o, DispatchOutcome::HandlerError(_))) {
            return err.clone();
        }
        if outcomes().any(|o| *o == DispatchOutcome::Handled) {
            return DispatchOutcome::Handled;
        }
        DispatchOutcome::NoMatch
    }

    pub fn outcome_for(&self, group: i32) -> Option<&DispatchOutcome> {
        self.groups.iter().find(|(g, _)| *g == group).map(|(_, o)| o)
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerFailure> {
        self.groups.iter().filter_map(|(_, o)| match o {
            DispatchOutcome::HandlerError(f) => Some(f),
            _ => None,
        })
    }
}

/// Counters since start. `errors` counts failures (including timeouts), not updates.
#[derive(Debug, Default)]
pub struct DispatchStats {
    processed: AtomicU64,
    handled: AtomicU64,
    no_match: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub handled: u64,
    pub no_match: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub cancelled: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            handled: self.handled.load(Ordering::Relaxed),
            no_match: self.no_match.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &DispatchOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            DispatchOutcome::Handled => &self.handled,
            DispatchOutcome::NoMatch => &self.no_match,
            DispatchOutcome::Cancelled => &self.cancelled,
            // Counted per failure in `record_failure`.
            DispatchOutcome::HandlerError(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_failure(&self, failure: &HandlerFailure) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if failure.is_timeout() {
            self.timeouts.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// What `shutdown` left behind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks still running at the grace deadline.
    pub abandoned: usize,
    /// Queued updates that were never dispatched.
    pub unprocessed: usize,
}

pub struct DispatcherBuilder {
    queue: UpdateQueue,
    handlers: Arc<HandlerRegistry>,
    error_handlers: Arc<HandlerRegistry>,
    worker_count: usize,
    handler_timeout: Option<Duration>,
    jobs: Option<JobScheduler>,
    shared: SharedData,
}

impl DispatcherBuilder {
    pub fn workers(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn error_handlers(mut self, registry: Arc<HandlerRegistry>) -> Self {
        self.error_handlers = registry;
        self
    }

    pub fn jobs(mut self, scheduler: JobScheduler) -> Self {
        self.jobs = Some(scheduler);
        self
    }

    pub fn shared(mut self, shared: SharedData) -> Self {
        self.shared = shared;
        self
    }

    /// Worker count and handler timeout from `cfg`.
    pub fn config(self, cfg: &Config) -> Self {
        self.workers(cfg.worker_count)
            .handler_timeout(cfg.handler_timeout)
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            inner: Arc::new(DispatcherInner {
                queue: self.queue,
                handlers: self.handlers,
                error_handlers: self.error_handlers,
                worker_count: self.worker_count,
                handler_timeout: self.handler_timeout,
                jobs: self.jobs,
                shared: self.shared,
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stats: DispatchStats::default(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue: UpdateQueue,
    handlers: Arc<HandlerRegistry>,
    error_handlers: Arc<HandlerRegistry>,
    worker_count: usize,
    handler_timeout: Option<Duration>,
    jobs: Option<JobScheduler>,
    shared: SharedData,
    cancel: CancellationToken,
    // Workers, handler tasks and detached handlers.
    tracker: TaskTracker,
    tasks: Mutex<Vec<AbortHandle>>,
    started: AtomicBool,
    stats: DispatchStats,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("workers", &self.inner.worker_count)
            .field("handler_timeout", &self.inner.handler_timeout)
            .field("stats", &self.inner.stats.snapshot())
            .finish()
    }
}

impl Dispatcher {
    pub fn builder(queue: UpdateQueue, handlers: Arc<HandlerRegistry>) -> DispatcherBuilder {
        DispatcherBuilder {
            queue,
            handlers,
            error_handlers: Arc::new(HandlerRegistry::new()),
            worker_count: 1,
            handler_timeout: None,
            jobs: None,
            shared: SharedData::new(),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn error_handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.error_handlers
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn shared(&self) -> &SharedData {
        &self.inner.shared
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Spawn the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for worker in 0..self.inner.worker_count {
            let this = self.clone();
            self.spawn_tracked(async move { this.worker_loop(worker).await });
        }
        tracing::info!(workers = self.inner.worker_count, "dispatcher started");
    }

    /// Stop dequeuing, wait up to `grace` for running handlers, abandon the rest.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.inner.cancel.cancel();
        self.inner.queue.close();
        self.inner.tracker.close();

        let mut report = ShutdownReport::default();
        if tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks.iter().filter(|t| !t.is_finished()) {
                task.abort();
                report.abandoned += 1;
            }
            tracing::warn!(
                abandoned = report.abandoned,
                grace_ms = grace.as_millis() as u64,
                "grace period expired, abandoning handlers"
            );
        }

        let dropped = self.inner.queue.drain();
        report.unprocessed = dropped.len();
        if let (Some(first), Some(last)) = (dropped.first(), dropped.last()) {
            // Already acknowledged to the server: these are lost.
            tracing::warn!(
                count = dropped.len(),
                first_update_id = %first.id(),
                last_update_id = %last.id(),
                "dropping queued updates at shutdown"
            );
        }

        tracing::info!(stats = ?self.stats(), "dispatcher stopped");
        report
    }

    /// Run one entry through the handler chain on the current task.
    pub async fn dispatch_once(&self, entry: QueueEntry) -> DispatchReport {
        self.process(&entry).await
    }

    async fn worker_loop(&self, worker: usize) {
        tracing::debug!(worker, "worker started");
        while let Some(lease) = self.inner.queue.dequeue(&self.inner.cancel).await {
            self.process(lease.entry()).await;
            drop(lease);
        }
        tracing::debug!(worker, "worker stopped");
    }

    async fn process(&self, entry: &QueueEntry) -> DispatchReport {
        let update = entry.update.clone();
        let ctx = Context::new(
            update.clone(),
            entry.context.clone(),
            self.inner.cancel.clone(),
            self.inner.jobs.clone(),
            self.inner.shared.clone(),
        );

        let snapshot = self.inner.handlers.snapshot();
        let mut report = DispatchReport::new(update.id);

        for group in snapshot.chunk_by(|a, b| a.group == b.group) {
            let group_id = group[0].group;
            if self.inner.cancel.is_cancelled() {
                report.groups.push((group_id, DispatchOutcome::Cancelled));
                break;
            }

            let record = match select_handler(group, &update) {
                Ok(Some(record)) => record,
                Ok(None) => {
                    report.groups.push((group_id, DispatchOutcome::NoMatch));
                    continue;
                }
                Err(failure) => {
                    self.report_failure(&ctx, failure.clone()).await;
                    report
                        .groups
                        .push((group_id, DispatchOutcome::HandlerError(failure)));
                    continue;
                }
            };

            if !record.blocking {
                self.spawn_detached(record.clone(), ctx.clone());
                report.groups.push((group_id, DispatchOutcome::Handled));
                continue;
            }

            match self.invoke(record, &ctx).await {
                Ok(flow) => {
                    tracing::debug!(
                        update_id = %update.id,
                        group = group_id,
                        handler = %record.name,
                        "handled"
                    );
                    report.groups.push((group_id, DispatchOutcome::Handled));
                    if flow == Flow::Stop {
                        break;
                    }
                }
                Err(kind) => {
                    let failure = HandlerFailure::new(record, update.id, kind);
                    self.report_failure(&ctx, failure.clone()).await;
                    report
                        .groups
                        .push((group_id, DispatchOutcome::HandlerError(failure)));
                }
            }
        }

        self.inner.stats.record(&report.outcome());
        report
    }

    /// Run a blocking callback as its own task, bounded by the handler timeout.
    async fn invoke(
        &self,
        record: &HandlerRecord,
        ctx: &Context,
    ) -> Result<Flow, HandlerErrorKind> {
        let callback = record.callback.clone();
        let update = ctx.update().clone();
        let task_ctx = ctx.clone();
        let mut handle = self.spawn_tracked(async move { callback.call(update, task_ctx).await });

        let joined = match self.inner.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    return Err(HandlerErrorKind::Timeout(limit));
                }
            },
            None => handle.await,
        };

        match joined {
            Ok(Ok(flow)) => Ok(flow),
            Ok(Err(e)) => Err(HandlerErrorKind::Failed(format!("{e:#}"))),
            Err(e) if e.is_panic() => {
                Err(HandlerErrorKind::Panicked(panic_message(&*e.into_panic())))
            }
            Err(_) => Err(HandlerErrorKind::Failed("handler task cancelled".to_string())),
        }
    }

    fn spawn_detached(&self, record: HandlerRecord, ctx: Context) {
        let this = self.clone();
        self.spawn_tracked(async move {
            if let Err(kind) = this.invoke(&record, &ctx).await {
                let failure = HandlerFailure::new(&record, ctx.update().id, kind);
                this.report_failure(&ctx, failure).await;
            }
        });
    }

    /// Hand a failure to the error chain, or log it when there is none.
    async fn report_failure(&self, ctx: &Context, failure: HandlerFailure) {
        self.inner.stats.record_failure(&failure);

        let chain = self.inner.error_handlers.snapshot();
        if chain.is_empty() {
            tracing::error!(
                update_id = %failure.update_id,
                group = failure.group,
                handler = %failure.handler,
                error = %failure.kind,
                "handler failed"
            );
            return;
        }

        tracing::debug!(
            update_id = %failure.update_id,
            handler = %failure.handler,
            "reporting handler failure to error handlers"
        );
        let ctx = ctx.with_error(failure);
        let update = ctx.update().clone();

        for group in chain.chunk_by(|a, b| a.group == b.group) {
            let record = match select_handler(group, &update) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(nested) => {
                    tracing::error!(error = %nested, "error handler predicate failed");
                    continue;
                }
            };
            match self.invoke(record, &ctx).await {
                Ok(Flow::Stop) => break,
                Ok(Flow::Continue) => {}
                Err(kind) => {
                    // Errors raised while reporting errors are only logged.
                    tracing::error!(
                        update_id = %update.id,
                        handler = %record.name,
                        error = %kind,
                        "error handler failed"
                    );
                }
            }
        }
    }

    fn spawn_tracked<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let handle = self.inner.tracker.spawn(fut);
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle.abort_handle());
        handle
    }
}

/// First record in `group` whose predicate matches. A panicking predicate
/// ends the group with a failure.
fn select_handler<'a>(
    group: &'a [HandlerRecord],
    update: &Update,
) -> Result<Option<&'a HandlerRecord>, HandlerFailure> {
    for record in group {
        match std::panic::catch_unwind(AssertUnwindSafe(|| record.predicate.check(update))) {
            Ok(true) => return Ok(Some(record)),
            Ok(false) => {}
            Err(payload) => {
                return Err(HandlerFailure::new(
                    record,
                    update.id,
                    HandlerErrorKind::Panicked(panic_message(&*payload)),
                ))
            }
        }
    }
    Ok(None)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
