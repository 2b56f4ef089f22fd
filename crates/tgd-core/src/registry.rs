//! Ordered handler collection with copy-on-write snapshots.

use std::{
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;

use crate::{context::Context, domain::Update};

/// Decides whether a handler wants an update.
pub trait Predicate: Send + Sync {
    fn check(&self, update: &Update) -> bool;
}

impl<F> Predicate for F
where
    F: Fn(&Update) -> bool + Send + Sync,
{
    fn check(&self, update: &Update) -> bool {
        self(update)
    }
}

/// What happens after a callback returns successfully.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Flow {
    /// Keep evaluating later groups.
    #[default]
    Continue,
    /// The update is consumed; later groups are skipped.
    Stop,
}

/// Handler body. Sync and async handlers both end up behind this trait,
/// see [`callback_fn`] and [`blocking_fn`].
#[async_trait]
pub trait Callback: Send + Sync {
    async fn call(&self, update: Arc<Update>, ctx: Context) -> anyhow::Result<Flow>;
}

struct FnCallback<F>(F);

#[async_trait]
impl<F, Fut> Callback for FnCallback<F>
where
    F: Fn(Arc<Update>, Context) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
{
    async fn call(&self, update: Arc<Update>, ctx: Context) -> anyhow::Result<Flow> {
        (self.0)(update, ctx).await
    }
}

/// Wrap an async closure as a [`Callback`].
pub fn callback_fn<F, Fut>(f: F) -> Arc<dyn Callback>
where
    F: Fn(Arc<Update>, Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Flow>> + Send + 'static,
{
    Arc::new(FnCallback(f))
}

struct BlockingCallback<F>(Arc<F>);

#[async_trait]
impl<F> Callback for BlockingCallback<F>
where
    F: Fn(&Update, &Context) -> anyhow::Result<Flow> + Send + Sync + 'static,
{
    async fn call(&self, update: Arc<Update>, ctx: Context) -> anyhow::Result<Flow> {
        let f = self.0.clone();
        match tokio::task::spawn_blocking(move || f(&update, &ctx)).await {
            Ok(res) => res,
            // Re-raise so the dispatcher reports it as a panic, not a failure.
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(anyhow::anyhow!("blocking handler cancelled: {e}")),
        }
    }
}

/// Wrap a synchronous closure as a [`Callback`]; it runs on the blocking pool.
pub fn blocking_fn<F>(f: F) -> Arc<dyn Callback>
where
    F: Fn(&Update, &Context) -> anyhow::Result<Flow> + Send + Sync + 'static,
{
    Arc::new(BlockingCallback(Arc::new(f)))
}

/// Stable identifier returned by [`HandlerRegistry::add`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub u64);

/// Registration request.
pub struct HandlerSpec {
    name: String,
    group: i32,
    predicate: Arc<dyn Predicate>,
    callback: Arc<dyn Callback>,
    blocking: bool,
}

impl HandlerSpec {
    /// A blocking handler in group 0.
    pub fn new(
        name: impl Into<String>,
        predicate: impl Predicate + 'static,
        callback: Arc<dyn Callback>,
    ) -> Self {
        Self {
            name: name.into(),
            group: 0,
            predicate: Arc::new(predicate),
            callback,
            blocking: true,
        }
    }

    pub fn group(mut self, group: i32) -> Self {
        self.group = group;
        self
    }

    /// Run the callback detached from the worker. Its [`Flow`] is ignored.
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

#[derive(Clone)]
pub struct HandlerRecord {
    pub id: HandlerId,
    pub name: String,
    pub group: i32,
    pub predicate: Arc<dyn Predicate>,
    pub callback: Arc<dyn Callback>,
    pub blocking: bool,
}

impl fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// Handlers ordered by `(group, insertion order)`.
///
/// Writers rebuild the list and swap it in; readers hold on to the `Arc` they
/// got from [`snapshot`](Self::snapshot), so a dispatch pass never observes a
/// half-updated list.
pub struct HandlerRegistry {
    records: RwLock<Arc<[HandlerRecord]>>,
    next_id: AtomicU64,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Arc::from(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add(&self, spec: HandlerSpec) -> HandlerId {
        // Ids are handed out in insertion order, so they double as the tiebreaker.
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let record = HandlerRecord {
            id,
            name: spec.name,
            group: spec.group,
            predicate: spec.predicate,
            callback: spec.callback,
            blocking: spec.blocking,
        };

        let mut guard = self.records.write().unwrap_or_else(|e| e.into_inner());
        let mut next = guard.to_vec();
        next.push(record);
        next.sort_by_key(|r| (r.group, r.id));
        *guard = Arc::from(next);
        drop(guard);

        tracing::debug!(handler_id = id.0, "handler registered");
        id
    }

    /// Returns `false` when `id` is not registered.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut guard = self.records.write().unwrap_or_else(|e| e.into_inner());
        if !guard.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<HandlerRecord> = guard.iter().filter(|r| r.id != id).cloned().collect();
        *guard = Arc::from(next);
        true
    }

    pub fn snapshot(&self) -> Arc<[HandlerRecord]> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}
