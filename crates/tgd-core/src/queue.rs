//! Bounded FIFO connecting acquisition to dispatch.
//!
//! Entries are ordered by `(received_at, update_id)`. An update id stays
//! reserved from `enqueue` until the [`Lease`] returned by `dequeue` is
//! dropped, so the same update can never be queued or worked on twice at the
//! same time.

use std::{
    collections::{HashSet, VecDeque},
    fmt,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard},
};

use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{ContextData, Update, UpdateId},
    errors::{Error, QueueError},
};

/// What `enqueue` does when the queue is at capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueFullPolicy {
    /// Fail immediately with [`QueueError::Full`].
    Reject,
    /// Suspend the producer until a slot frees up.
    Block,
    /// Evict the oldest pending entry to make room.
    DropOldest,
}

impl FromStr for QueueFullPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            other => Err(Error::Config(format!("unknown queue full policy: {other}"))),
        }
    }
}

impl fmt::Display for QueueFullPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reject => "reject",
            Self::Block => "block",
            Self::DropOldest => "drop_oldest",
        })
    }
}

/// An update plus optional caller-supplied data for its handlers.
#[derive(Clone, Debug)]
pub struct QueueEntry {
    pub update: Arc<Update>,
    pub context: Option<ContextData>,
}

impl QueueEntry {
    pub fn new(update: Update) -> Self {
        Self {
            update: Arc::new(update),
            context: None,
        }
    }

    pub fn with_context(update: Update, context: ContextData) -> Self {
        Self {
            update: Arc::new(update),
            context: Some(context),
        }
    }

    pub fn id(&self) -> UpdateId {
        self.update.id
    }

    fn sorts_after(&self, other: &QueueEntry) -> bool {
        (self.update.received_at, self.update.id) >= (other.update.received_at, other.update.id)
    }
}

/// Result of a successful `enqueue`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// Queued after evicting this (oldest) update under [`QueueFullPolicy::DropOldest`].
    Evicted(UpdateId),
}

#[derive(Clone)]
pub struct UpdateQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    capacity: usize,
    policy: QueueFullPolicy,
    state: Mutex<QueueState>,
    // Free slots. Invariant (under `state` lock): permits + entries.len() == capacity.
    slots: Semaphore,
    available: Notify,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueueEntry>,
    // Queued and in-flight ids.
    reserved: HashSet<UpdateId>,
    closed: bool,
}

impl UpdateQueue {
    pub fn new(capacity: usize, policy: QueueFullPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(QueueInner {
                capacity,
                policy,
                state: Mutex::new(QueueState::default()),
                slots: Semaphore::new(capacity),
                available: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn policy(&self) -> QueueFullPolicy {
        self.inner.policy
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Updates currently held by a [`Lease`].
    pub fn in_flight(&self) -> usize {
        let st = self.inner.lock();
        st.reserved.len() - st.entries.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Add an entry according to the configured [`QueueFullPolicy`].
    pub async fn enqueue(&self, entry: QueueEntry) -> Result<Enqueued, QueueError> {
        let id = entry.id();
        self.inner.check_admissible(&self.inner.lock(), id)?;

        if self.inner.policy == QueueFullPolicy::Block {
            let permit = self
                .inner
                .slots
                .acquire()
                .await
                .map_err(|_| QueueError::Closed)?;
            let mut st = self.inner.lock();
            // Re-check: the id may have been queued while we were waiting.
            self.inner.check_admissible(&st, id)?;
            permit.forget();
            Self::insert(&mut st, entry);
            drop(st);
            self.inner.available.notify_one();
            return Ok(Enqueued::Queued);
        }

        let mut st = self.inner.lock();
        self.inner.check_admissible(&st, id)?;
        let outcome = match self.inner.slots.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Enqueued::Queued
            }
            Err(TryAcquireError::Closed) => return Err(QueueError::Closed),
            Err(TryAcquireError::NoPermits) => match self.inner.policy {
                QueueFullPolicy::DropOldest => {
                    // No permits means entries.len() == capacity >= 1.
                    let Some(oldest) = st.entries.pop_front() else {
                        return Err(QueueError::Full);
                    };
                    st.reserved.remove(&oldest.id());
                    tracing::warn!(
                        evicted = %oldest.id(),
                        update_id = %id,
                        "queue full, dropping oldest update"
                    );
                    Enqueued::Evicted(oldest.id())
                }
                _ => return Err(QueueError::Full),
            },
        };
        Self::insert(&mut st, entry);
        drop(st);
        self.inner.available.notify_one();
        Ok(outcome)
    }

    /// Wait for the next entry. Returns `None` once `cancel` fires, or when the
    /// queue is closed and empty.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Option<Lease> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut st = self.inner.lock();
                if let Some(entry) = st.entries.pop_front() {
                    self.inner.slots.add_permits(1);
                    let more = !st.entries.is_empty();
                    drop(st);
                    if more {
                        // Pass the wakeup on; Notify keeps at most one stored permit.
                        self.inner.available.notify_one();
                    }
                    return Some(Lease {
                        entry,
                        queue: self.inner.clone(),
                    });
                }
                if st.closed {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Stop accepting entries and wake every waiter. Pending entries stay until drained.
    pub fn close(&self) {
        let mut st = self.inner.lock();
        st.closed = true;
        self.inner.slots.close();
        drop(st);
        self.inner.available.notify_waiters();
    }

    /// Remove and return every pending (not in-flight) entry.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut st = self.inner.lock();
        let drained: Vec<QueueEntry> = st.entries.drain(..).collect();
        for e in &drained {
            st.reserved.remove(&e.id());
        }
        self.inner.slots.add_permits(drained.len());
        drained
    }

    fn insert(st: &mut QueueState, entry: QueueEntry) {
        st.reserved.insert(entry.id());
        let pos = st
            .entries
            .iter()
            .rposition(|e| entry.sorts_after(e))
            .map(|i| i + 1)
            .unwrap_or(0);
        st.entries.insert(pos, entry);
    }
}

impl fmt::Debug for UpdateQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateQueue")
            .field("capacity", &self.inner.capacity)
            .field("policy", &self.inner.policy)
            .field("len", &self.len())
            .finish()
    }
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A poisoned lock only means a panic elsewhere; the state itself stays consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_admissible(&self, st: &QueueState, id: UpdateId) -> Result<(), QueueError> {
        if st.closed {
            return Err(QueueError::Closed);
        }
        if st.reserved.contains(&id) {
            return Err(QueueError::Duplicate(id.0));
        }
        Ok(())
    }
}

/// A dequeued entry. The update id stays reserved until the lease is dropped.
pub struct Lease {
    entry: QueueEntry,
    queue: Arc<QueueInner>,
}

impl Lease {
    pub fn entry(&self) -> &QueueEntry {
        &self.entry
    }

    pub fn update(&self) -> &Arc<Update> {
        &self.entry.update
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.queue.lock().reserved.remove(&self.entry.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::UpdateKind;
    use serde_json::json;
    use std::time::Duration;

    fn entry(id: i64) -> QueueEntry {
        QueueEntry::new(Update::new(id, UpdateKind::Message, json!({"text": "x"})))
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let q = UpdateQueue::new(2, QueueFullPolicy::Reject);
        q.enqueue(entry(1)).await.unwrap();
        q.enqueue(entry(2)).await.unwrap();

        let third = tokio::time::timeout(Duration::from_millis(100), q.enqueue(entry(3)))
            .await
            .expect("reject must not block");
        assert_eq!(third, Err(QueueError::Full));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn drop_oldest_evicts_front() {
        let q = UpdateQueue::new(2, QueueFullPolicy::DropOldest);
        q.enqueue(entry(1)).await.unwrap();
        q.enqueue(entry(2)).await.unwrap();
        assert_eq!(
            q.enqueue(entry(3)).await.unwrap(),
            Enqueued::Evicted(UpdateId(1))
        );

        let cancel = CancellationToken::new();
        let a = q.dequeue(&cancel).await.unwrap();
        let b = q.dequeue(&cancel).await.unwrap();
        assert_eq!(a.update().id, UpdateId(2));
        assert_eq!(b.update().id, UpdateId(3));
        // The evicted id is no longer reserved.
        drop((a, b));
        q.enqueue(entry(1)).await.unwrap();
    }

    #[tokio::test]
    async fn block_policy_waits_for_a_free_slot() {
        let q = UpdateQueue::new(1, QueueFullPolicy::Block);
        q.enqueue(entry(1)).await.unwrap();

        let producer = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(entry(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!producer.is_finished());

        let cancel = CancellationToken::new();
        let first = q.dequeue(&cancel).await.unwrap();
        assert_eq!(first.update().id, UpdateId(1));

        let res = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(res, Ok(Enqueued::Queued));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected_while_queued_or_in_flight() {
        let q = UpdateQueue::new(8, QueueFullPolicy::Reject);
        q.enqueue(entry(7)).await.unwrap();
        assert_eq!(q.enqueue(entry(7)).await, Err(QueueError::Duplicate(7)));

        let cancel = CancellationToken::new();
        let lease = q.dequeue(&cancel).await.unwrap();
        assert_eq!(q.in_flight(), 1);
        assert_eq!(q.enqueue(entry(7)).await, Err(QueueError::Duplicate(7)));

        drop(lease);
        assert_eq!(q.in_flight(), 0);
        assert_eq!(q.enqueue(entry(7)).await, Ok(Enqueued::Queued));
    }

    #[tokio::test]
    async fn ties_on_arrival_are_broken_by_update_id() {
        let q = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let at = chrono::Utc::now();
        for id in [3, 1, 2] {
            let mut u = Update::new(id, UpdateKind::Message, json!({}));
            u.received_at = at;
            q.enqueue(QueueEntry::new(u)).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        while let Some(lease) = tokio::time::timeout(Duration::from_millis(20), q.dequeue(&cancel))
            .await
            .ok()
            .flatten()
        {
            seen.push(lease.update().id.0);
        }
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn dequeue_returns_none_on_cancel() {
        let q = UpdateQueue::new(1, QueueFullPolicy::Block);
        let cancel = CancellationToken::new();
        let waiter = {
            let q = q.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { q.dequeue(&cancel).await.is_none() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn close_rejects_producers_and_wakes_blocked_ones() {
        let q = UpdateQueue::new(1, QueueFullPolicy::Block);
        q.enqueue(entry(1)).await.unwrap();
        let blocked = {
            let q = q.clone();
            tokio::spawn(async move { q.enqueue(entry(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        q.close();
        assert_eq!(blocked.await.unwrap(), Err(QueueError::Closed));
        assert_eq!(q.enqueue(entry(3)).await, Err(QueueError::Closed));

        let drained = q.drain();
        assert_eq!(drained.len(), 1);
        assert!(q.dequeue(&CancellationToken::new()).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_workers_never_share_an_update() {
        let q = UpdateQueue::new(64, QueueFullPolicy::Block);
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let cancel = cancel.clone();
            let seen = seen.clone();
            workers.push(tokio::spawn(async move {
                while let Some(lease) = q.dequeue(&cancel).await {
                    seen.lock().unwrap().push(lease.update().id.0);
                    tokio::task::yield_now().await;
                }
            }));
        }

        for id in 0..500 {
            q.enqueue(entry(id)).await.unwrap();
        }
        while !q.is_empty() || q.in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        for w in workers {
            w.await.unwrap();
        }

        let mut ids = seen.lock().unwrap().clone();
        assert_eq!(ids.len(), 500);
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 500);
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!(
            "drop-oldest".parse::<QueueFullPolicy>().unwrap(),
            QueueFullPolicy::DropOldest
        );
        assert_eq!(
            "REJECT".parse::<QueueFullPolicy>().unwrap(),
            QueueFullPolicy::Reject
        );
        assert!("spill".parse::<QueueFullPolicy>().is_err());
    }
}
