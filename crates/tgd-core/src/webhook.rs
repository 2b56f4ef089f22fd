//! Push-mode entry point: one decoded update per call.
//!
//! Telegram pushes over several connections at once, so ids can arrive out
//! of order. Redeliveries are recognised by id against a bounded window of
//! recently accepted updates; the cursor is only advanced for persistence.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use serde_json::Value;

use crate::{
    domain::{Update, UpdateId, UpdateKind},
    errors::{Error, QueueError},
    offset::OffsetTracker,
    queue::{QueueEntry, UpdateQueue},
    Result,
};

/// What happened to a pushed update. All of these are acknowledged to the sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptOutcome {
    Enqueued,
    /// Already queued or in flight (a redelivery).
    Duplicate,
    /// Accepted before and already handed to the dispatcher.
    Stale,
    /// Kind not in `allowed_updates`.
    Filtered,
}

/// How many accepted ids are remembered for redelivery detection.
pub const RECENT_IDS: usize = 10_000;

#[derive(Clone)]
pub struct WebhookReceiver {
    queue: UpdateQueue,
    offsets: Arc<OffsetTracker>,
    allowed: Arc<[UpdateKind]>,
    recent: Arc<Mutex<RecentIds>>,
}

/// Insertion-ordered set that forgets its oldest id past `capacity`.
struct RecentIds {
    capacity: usize,
    ids: HashSet<UpdateId>,
    order: VecDeque<UpdateId>,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    fn contains(&self, id: UpdateId) -> bool {
        self.ids.contains(&id)
    }

    fn remove(&mut self, id: UpdateId) {
        if self.ids.remove(&id) {
            self.order.retain(|x| *x != id);
        }
    }

    fn insert(&mut self, id: UpdateId) {
        if !self.ids.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

impl WebhookReceiver {
    /// An empty `allowed` list accepts every kind.
    pub fn new(
        queue: UpdateQueue,
        offsets: Arc<OffsetTracker>,
        allowed: Vec<UpdateKind>,
    ) -> Self {
        Self::with_window(queue, offsets, allowed, RECENT_IDS)
    }

    /// Like [`new`](Self::new) with a custom redelivery window.
    pub fn with_window(
        queue: UpdateQueue,
        offsets: Arc<OffsetTracker>,
        allowed: Vec<UpdateKind>,
        window: usize,
    ) -> Self {
        Self {
            queue,
            offsets,
            allowed: allowed.into(),
            recent: Arc::new(Mutex::new(RecentIds::new(window))),
        }
    }

    /// Decode and enqueue a raw Bot API update.
    ///
    /// Fails with `Error::InvalidUpdate` for malformed payloads and with
    /// `Error::Queue(Full | Closed)` when the update could not be queued; the
    /// sender is expected to retry those.
    pub async fn accept(&self, payload: Value) -> Result<AcceptOutcome> {
        let update = Update::from_json(payload)?;
        self.accept_update(update).await
    }

    pub async fn accept_update(&self, update: Update) -> Result<AcceptOutcome> {
        let id = update.id;
        if !self.allowed.is_empty() && !self.allowed.contains(&update.kind) {
            tracing::debug!(update_id = %id, kind = %update.kind, "update kind filtered");
            self.offsets.advance(id);
            return Ok(AcceptOutcome::Filtered);
        }
        {
            let mut recent = self.recent();
            if recent.contains(id) {
                tracing::debug!(update_id = %id, "accepted update redelivered");
                return Ok(AcceptOutcome::Stale);
            }
            // Claimed up front so a redelivery racing the dispatcher is still caught.
            recent.insert(id);
        }

        match self.queue.enqueue(QueueEntry::new(update)).await {
            Ok(_) => {
                self.offsets.advance(id);
                Ok(AcceptOutcome::Enqueued)
            }
            Err(QueueError::Duplicate(_)) => Ok(AcceptOutcome::Duplicate),
            Err(e) => {
                self.recent().remove(id);
                tracing::warn!(update_id = %id, error = %e, "webhook update not queued");
                Err(Error::Queue(e))
            }
        }
    }

    pub fn offsets(&self) -> &Arc<OffsetTracker> {
        &self.offsets
    }

    fn recent(&self) -> std::sync::MutexGuard<'_, RecentIds> {
        self.recent.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueFullPolicy;
    use serde_json::json;

    fn receiver(capacity: usize, allowed: Vec<UpdateKind>) -> (WebhookReceiver, UpdateQueue) {
        let queue = UpdateQueue::new(capacity, QueueFullPolicy::Reject);
        let rx = WebhookReceiver::new(queue.clone(), Arc::new(OffsetTracker::new(0)), allowed);
        (rx, queue)
    }

    fn message(id: i64) -> Value {
        json!({"update_id": id, "message": {"text": "hi", "chat": {"id": 1}}})
    }

    #[tokio::test]
    async fn accept_enqueues_and_advances() {
        let (rx, queue) = receiver(4, Vec::new());
        assert_eq!(rx.accept(message(10)).await.unwrap(), AcceptOutcome::Enqueued);
        assert_eq!(queue.len(), 1);
        assert_eq!(rx.offsets().next_cursor(), 11);
    }

    #[tokio::test]
    async fn redeliveries_are_recognised() {
        let (rx, queue) = receiver(4, Vec::new());
        rx.accept(message(10)).await.unwrap();
        rx.accept(message(11)).await.unwrap();

        // 10 was accepted before.
        assert_eq!(rx.accept(message(10)).await.unwrap(), AcceptOutcome::Stale);

        // Same id while still queued, seen by a receiver without history.
        let restarted = Arc::new(OffsetTracker::new(0));
        let fresh = WebhookReceiver::new(queue.clone(), restarted, Vec::new());
        assert_eq!(fresh.accept(message(11)).await.unwrap(), AcceptOutcome::Duplicate);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn out_of_order_deliveries_are_both_queued() {
        let (rx, queue) = receiver(4, Vec::new());
        assert_eq!(rx.accept(message(11)).await.unwrap(), AcceptOutcome::Enqueued);
        assert_eq!(rx.accept(message(10)).await.unwrap(), AcceptOutcome::Enqueued);

        let ids: Vec<i64> = queue.drain().iter().map(|e| e.id().0).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&10) && ids.contains(&11));
        assert_eq!(rx.offsets().next_cursor(), 12);
    }

    #[tokio::test]
    async fn rejected_update_is_accepted_on_retry_after_a_later_one() {
        let (rx, queue) = receiver(1, Vec::new());
        rx.accept(message(9)).await.unwrap();
        assert!(rx.accept(message(10)).await.is_err());

        // 9 is dispatched, then 11 arrives before Telegram retries 10.
        let lease = queue.dequeue(&tokio_util::sync::CancellationToken::new()).await;
        drop(lease);
        assert_eq!(rx.accept(message(11)).await.unwrap(), AcceptOutcome::Enqueued);
        queue.drain();
        assert_eq!(rx.accept(message(10)).await.unwrap(), AcceptOutcome::Enqueued);
    }

    #[tokio::test]
    async fn redelivery_window_is_bounded() {
        let queue = UpdateQueue::new(8, QueueFullPolicy::Reject);
        let rx = WebhookReceiver::with_window(
            queue.clone(),
            Arc::new(OffsetTracker::new(0)),
            Vec::new(),
            2,
        );
        for id in 1..=3 {
            rx.accept(message(id)).await.unwrap();
        }
        queue.drain();

        assert_eq!(rx.accept(message(3)).await.unwrap(), AcceptOutcome::Stale);
        // Forgotten once the window moved past it.
        assert_eq!(rx.accept(message(1)).await.unwrap(), AcceptOutcome::Enqueued);
    }

    #[tokio::test]
    async fn kinds_outside_the_allow_list_are_filtered() {
        let (rx, queue) = receiver(4, vec![UpdateKind::Message]);
        let cb = json!({"update_id": 3, "callback_query": {"id": "x", "data": "d"}});
        assert_eq!(rx.accept(cb).await.unwrap(), AcceptOutcome::Filtered);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_and_bad_payloads_are_errors() {
        let (rx, _queue) = receiver(1, Vec::new());
        rx.accept(message(1)).await.unwrap();
        let err = rx.accept(message(2)).await.unwrap_err();
        assert!(matches!(err, Error::Queue(QueueError::Full)));
        // Not acknowledged: a retry must still be accepted later.
        assert_eq!(rx.offsets().next_cursor(), 2);

        let err = rx.accept(json!({"message": {}})).await.unwrap_err();
        assert!(matches!(err, Error::InvalidUpdate(_)));
    }
}
