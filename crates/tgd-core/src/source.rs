//! Update acquisition: the `UpdateSource` port and the long-polling loop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    domain::Update,
    errors::{Error, FetchError, QueueError},
    offset::OffsetTracker,
    queue::{QueueEntry, UpdateQueue},
    Result,
};

/// Remote "get updates" endpoint.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    /// Updates with `update_id >= cursor`, waiting up to `timeout` for new ones.
    async fn fetch(
        &self,
        cursor: i64,
        timeout: Duration,
    ) -> std::result::Result<Vec<Update>, FetchError>;
}

/// Exponential backoff: doubles per failure, capped, reset on success.
#[derive(Clone, Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay for this failure. A server-provided `retry_after` is a lower bound.
    pub fn next_delay(&mut self, retry_after: Option<Duration>) -> Duration {
        let delay = self.current.max(retry_after.unwrap_or_default());
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Observable state of the polling loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    Idle,
    Polling,
    DataReceived(usize),
    Backoff(Duration),
    /// Terminal for this run of the loop.
    Stopped,
}

enum BatchOutcome {
    Done,
    QueueFull,
    Closed,
    Cancelled,
}

/// The acquisition loop: fetch, enqueue, advance the cursor, repeat.
pub struct Poller {
    source: Arc<dyn UpdateSource>,
    offsets: Arc<OffsetTracker>,
    queue: UpdateQueue,
    poll_timeout: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
    drop_pending_updates: bool,
    state: watch::Sender<PollState>,
}

impl Poller {
    pub fn new(
        source: Arc<dyn UpdateSource>,
        offsets: Arc<OffsetTracker>,
        queue: UpdateQueue,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            source,
            offsets,
            queue,
            poll_timeout: Duration::from_secs(30),
            backoff_initial: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            drop_pending_updates: false,
            state,
        }
    }

    pub fn from_config(
        cfg: &Config,
        source: Arc<dyn UpdateSource>,
        offsets: Arc<OffsetTracker>,
        queue: UpdateQueue,
    ) -> Self {
        Self::new(source, offsets, queue)
            .poll_timeout(cfg.poll_timeout)
            .backoff(cfg.backoff_initial, cfg.backoff_max)
            .drop_pending_updates(cfg.drop_pending_updates)
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.backoff_initial = initial;
        self.backoff_max = max;
        self
    }

    /// Skip whatever is pending on the server before the first real fetch.
    pub fn drop_pending_updates(mut self, drop: bool) -> Self {
        self.drop_pending_updates = drop;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    /// Run until `cancel` fires (`Ok`) or a fatal fetch error (`Error::FatalFetch`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.set_state(PollState::Idle);
        let mut backoff = Backoff::new(self.backoff_initial, self.backoff_max);

        let res = self.poll_loop(&cancel, &mut backoff).await;

        self.set_state(PollState::Stopped);
        if let Err(e) = self.offsets.flush().await {
            tracing::error!(error = %e, "failed to persist offset cursor");
        }
        match &res {
            Ok(()) => tracing::info!(cursor = self.offsets.next_cursor(), "poller stopped"),
            Err(e) => tracing::error!(error = %e, "poller stopped on fatal error"),
        }
        res
    }

    async fn poll_loop(&self, cancel: &CancellationToken, backoff: &mut Backoff) -> Result<()> {
        if self.drop_pending_updates && !self.skip_pending(cancel, backoff).await? {
            return Ok(());
        }

        tracing::info!(
            cursor = self.offsets.next_cursor(),
            timeout_secs = self.poll_timeout.as_secs(),
            "polling for updates"
        );

        while !cancel.is_cancelled() {
            self.set_state(PollState::Polling);
            let cursor = self.offsets.next_cursor();
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.source.fetch(cursor, self.poll_timeout) => r,
            };

            match fetched {
                Ok(batch) if batch.is_empty() => {
                    backoff.reset();
                    self.set_state(PollState::Idle);
                }
                Ok(batch) => {
                    self.set_state(PollState::DataReceived(batch.len()));
                    let outcome = self.enqueue_batch(batch, cancel).await;
                    if let Err(e) = self.offsets.flush().await {
                        tracing::warn!(error = %e, "failed to persist offset cursor");
                    }
                    match outcome {
                        BatchOutcome::Done => {
                            backoff.reset();
                            self.set_state(PollState::Idle);
                        }
                        BatchOutcome::QueueFull => {
                            // The rest of the batch is refetched from the unchanged cursor.
                            let delay = backoff.next_delay(None);
                            tracing::warn!(
                                delay_ms = delay.as_millis() as u64,
                                "queue full, backing off"
                            );
                            if !self.sleep(delay, cancel).await {
                                break;
                            }
                        }
                        BatchOutcome::Closed | BatchOutcome::Cancelled => break,
                    }
                }
                Err(FetchError::Fatal { reason }) => return Err(Error::FatalFetch(reason)),
                Err(FetchError::Transient { reason, retry_after }) => {
                    let delay = backoff.next_delay(retry_after);
                    tracing::warn!(
                        cursor,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "fetch failed, retrying"
                    );
                    if !self.sleep(delay, cancel).await {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Ask for the newest update only (offset -1) and move the cursor past it.
    /// Returns `false` if cancelled.
    async fn skip_pending(
        &self,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
    ) -> Result<bool> {
        loop {
            self.set_state(PollState::Polling);
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Ok(false),
                r = self.source.fetch(-1, Duration::ZERO) => r,
            };
            match fetched {
                Ok(batch) => {
                    if let Some(last) = batch.iter().map(|u| u.id).max() {
                        self.offsets.advance(last);
                        tracing::info!(skipped_through = %last, "dropped pending updates");
                    }
                    backoff.reset();
                    return Ok(true);
                }
                Err(FetchError::Fatal { reason }) => return Err(Error::FatalFetch(reason)),
                Err(FetchError::Transient { reason, retry_after }) => {
                    let delay = backoff.next_delay(retry_after);
                    tracing::warn!(
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "dropping pending updates failed, retrying"
                    );
                    if !self.sleep(delay, cancel).await {
                        return Ok(false);
                    }
                }
            }
        }
    }

    async fn enqueue_batch(
        &self,
        mut batch: Vec<Update>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        batch.sort_by_key(|u| u.id);
        for update in batch {
            let id = update.id;
            if self.offsets.is_acknowledged(id) {
                tracing::debug!(update_id = %id, "skipping already acknowledged update");
                continue;
            }

            let res = tokio::select! {
                _ = cancel.cancelled() => return BatchOutcome::Cancelled,
                r = self.queue.enqueue(QueueEntry::new(update)) => r,
            };
            match res {
                Ok(_) => {
                    self.offsets.advance(id);
                }
                Err(QueueError::Duplicate(_)) => {
                    tracing::debug!(update_id = %id, "update already queued");
                    self.offsets.advance(id);
                }
                Err(QueueError::Full) => return BatchOutcome::QueueFull,
                Err(QueueError::Closed) => return BatchOutcome::Closed,
            }
        }
        BatchOutcome::Done
    }

    /// Backoff sleep; `false` if cancelled first.
    async fn sleep(&self, delay: Duration, cancel: &CancellationToken) -> bool {
        self.set_state(PollState::Backoff(delay));
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn set_state(&self, state: PollState) {
        self.state.send_replace(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::UpdateKind, offset::MemoryOffsetStore, queue::QueueFullPolicy};
    use serde_json::json;
    use std::{collections::VecDeque, sync::Mutex};

    type Step = std::result::Result<Vec<i64>, FetchError>;

    /// Replays scripted responses, then returns empty batches.
    struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        cursors: Mutex<Vec<i64>>,
    }

    impl ScriptedSource {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                cursors: Mutex::new(Vec::new()),
            })
        }

        fn cursors(&self) -> Vec<i64> {
            self.cursors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UpdateSource for ScriptedSource {
        async fn fetch(
            &self,
            cursor: i64,
            _timeout: Duration,
        ) -> std::result::Result<Vec<Update>, FetchError> {
            self.cursors.lock().unwrap().push(cursor);
            let step = self.steps.lock().unwrap().pop_front();
            match step {
                Some(Ok(ids)) => Ok(ids
                    .into_iter()
                    .filter(|id| cursor < 0 || *id >= cursor)
                    .map(|id| Update::new(id, UpdateKind::Message, json!({"text": "x"})))
                    .collect()),
                Some(Err(e)) => Err(e),
                None => {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    fn queue_ids(q: &UpdateQueue) -> Vec<i64> {
        q.drain().into_iter().map(|e| e.id().0).collect()
    }

    #[test]
    fn backoff_doubles_caps_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(None), Duration::from_millis(100));
        assert_eq!(b.next_delay(None), Duration::from_millis(200));
        assert_eq!(b.next_delay(None), Duration::from_millis(350));
        assert_eq!(b.next_delay(None), Duration::from_millis(350));
        assert_eq!(b.next_delay(Some(Duration::from_secs(2))), Duration::from_secs(2));
        b.reset();
        assert_eq!(b.next_delay(None), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn fetched_updates_are_enqueued_and_acknowledged() {
        let source = ScriptedSource::new(vec![Ok(vec![101, 102]), Ok(vec![103])]);
        let store = Arc::new(MemoryOffsetStore::default());
        let offsets = Arc::new(OffsetTracker::restore(store.clone()).await.unwrap());
        let queue = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let poller = Poller::new(source.clone(), offsets.clone(), queue.clone());

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(queue_ids(&queue), vec![101, 102, 103]);
        assert_eq!(offsets.next_cursor(), 104);
        assert_eq!(store.value(), Some(104));
        assert_eq!(&source.cursors()[..3], &[0, 103, 104]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_back_off_without_losing_the_cursor() {
        let source = ScriptedSource::new(vec![
            Ok(vec![5]),
            Err(FetchError::transient("502 bad gateway")),
            Err(FetchError::Transient {
                reason: "429".into(),
                retry_after: Some(Duration::from_secs(3)),
            }),
            Ok(vec![6]),
        ]);
        let offsets = Arc::new(OffsetTracker::new(0));
        let queue = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let poller = Poller::new(source.clone(), offsets.clone(), queue.clone())
            .backoff(Duration::from_millis(100), Duration::from_secs(1));
        let mut states = poller.subscribe();

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };

        let mut backoffs = Vec::new();
        while backoffs.len() < 2 {
            states.changed().await.unwrap();
            if let PollState::Backoff(d) = *states.borrow_and_update() {
                backoffs.push(d);
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(backoffs, vec![Duration::from_millis(100), Duration::from_secs(3)]);
        assert_eq!(&source.cursors()[..4], &[0, 6, 6, 6]);
        assert_eq!(queue_ids(&queue), vec![5, 6]);
        assert_eq!(offsets.next_cursor(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_the_loop() {
        let source = ScriptedSource::new(vec![Err(FetchError::fatal("401 Unauthorized"))]);
        let offsets = Arc::new(OffsetTracker::new(0));
        let queue = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let poller = Poller::new(source, offsets, queue);
        let states = poller.subscribe();

        let err = poller.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::FatalFetch(ref r) if r.contains("401")));
        assert_eq!(*states.borrow(), PollState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_under_reject_refetches_from_unchanged_cursor() {
        let source = ScriptedSource::new(vec![Ok(vec![1, 2, 3]), Ok(vec![1, 2, 3])]);
        let offsets = Arc::new(OffsetTracker::new(0));
        let queue = UpdateQueue::new(2, QueueFullPolicy::Reject);
        let poller = Poller::new(source.clone(), offsets.clone(), queue.clone())
            .backoff(Duration::from_millis(100), Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Update 3 did not fit: the cursor stops right before it.
        assert_eq!(offsets.next_cursor(), 3);
        assert_eq!(queue_ids(&queue), vec![1, 2]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(source.cursors()[1], 3);
        assert_eq!(queue_ids(&queue), vec![3]);
        assert_eq!(offsets.next_cursor(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn drop_pending_skips_the_backlog() {
        let source = ScriptedSource::new(vec![Ok(vec![40]), Ok(vec![41])]);
        let offsets = Arc::new(OffsetTracker::new(0));
        let queue = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let poller = Poller::new(source.clone(), offsets.clone(), queue.clone())
            .drop_pending_updates(true);

        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(&source.cursors()[..2], &[-1, 41]);
        assert_eq!(queue_ids(&queue), vec![41]);
        assert_eq!(offsets.next_cursor(), 42);
    }
}
