//! Notification dispatch
//!
//! Matched change events are grouped into batches and appended to the owning
//! subscriber's mailbox while the mutating command still holds the store lock,
//! so each subscription sees rows in the order the mutations happened.
//! Subscribers drain their mailbox with a bounded wait.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::result::RowSet;
use crate::store::{ChangeEvent, Row, Table, TableStore};
use crate::subscription::{Action, SubscriberId, Subscription, SubscriptionId, SubscriptionRegistry};

/// One batch of rows for one subscription, all with the same action
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub pubsubid: SubscriptionId,
    pub action: Action,
    pub table: String,
    pub rows: RowSet,
}

// ============ Batching ============

/// Groups matched rows from one command into notifications.
///
/// Consecutive rows for the same subscription with the same action share a
/// notification; an action change starts a new one.
#[derive(Debug, Default)]
pub(crate) struct Batcher {
    batches: Vec<(SubscriberId, Notification)>,
    /// Index into `batches` of each subscription's latest notification
    open: HashMap<SubscriptionId, usize>,
}

impl Batcher {
    /// Match every event against the registry and batch the results
    pub fn collect(
        registry: &SubscriptionRegistry,
        store: &TableStore,
        events: &[ChangeEvent],
    ) -> Self {
        let mut batcher = Self::default();
        for event in events {
            let Some(table) = store.table(&event.table) else {
                continue;
            };
            for (subscription, action) in registry.matches(event) {
                batcher.push(subscription, action, table, event.change.row());
            }
        }
        batcher
    }

    fn push(&mut self, subscription: &Subscription, action: Action, table: &Table, row: &Row) {
        if let Some(&i) = self.open.get(&subscription.id) {
            let (_, notification) = &mut self.batches[i];
            if notification.action == action {
                let values = row.project(notification.rows.columns());
                notification.rows.push(values);
                return;
            }
        }

        let columns = table.projected_columns(&subscription.projection);
        let values = row.project(&columns);
        let mut rows = RowSet::new(columns, Vec::new());
        rows.push(values);

        self.open.insert(subscription.id, self.batches.len());
        self.batches.push((
            subscription.subscriber,
            Notification {
                pubsubid: subscription.id,
                action,
                table: subscription.table.clone(),
                rows,
            },
        ));
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn into_batches(self) -> Vec<(SubscriberId, Notification)> {
        self.batches
    }
}

// ============ Mailbox ============

/// Per-subscriber FIFO of pending notifications.
///
/// Single consumer. When a capacity is set the oldest notification is dropped
/// to make room for a new one.
#[derive(Debug)]
pub struct Mailbox {
    subscriber: SubscriberId,
    queue: Mutex<VecDeque<Notification>>,
    notify: Notify,
    capacity: Option<usize>,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl Mailbox {
    pub(crate) fn new(subscriber: SubscriberId, capacity: Option<usize>) -> Self {
        Self {
            subscriber,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscriber(&self) -> SubscriberId {
        self.subscriber
    }

    pub(crate) fn push(&self, notification: Notification) {
        if self.is_closed() {
            return;
        }
        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(capacity) = self.capacity {
                while queue.len() >= capacity.max(1) {
                    if let Some(oldest) = queue.pop_front() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "subscriber {} mailbox full ({}), dropped {} batch for pubsubid {}",
                            self.subscriber, capacity, oldest.action, oldest.pubsubid
                        );
                    }
                }
            }
            queue.push_back(notification);
        }
        self.notify.notify_one();
    }

    /// Next pending notification, without waiting
    pub fn try_recv(&self) -> Option<Notification> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Wait up to `timeout` for a notification. `None` means nothing arrived
    /// in time (or the mailbox was closed), which is not an error.
    pub async fn wait(&self, timeout: Duration) -> Option<Notification> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(notification) = self.try_recv() {
                return Some(notification);
            }
            if self.is_closed() {
                return None;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_recv();
            }
        }
    }

    /// Wait with no deadline; `None` once the mailbox is closed and drained
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            if let Some(notification) = self.try_recv() {
                return Some(notification);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Notifications discarded because the mailbox was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop accepting notifications and wake the consumer
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.notify.notify_one();
    }
}

// ============ Dispatcher ============

/// Routes batches to subscriber mailboxes
#[derive(Debug)]
pub struct Dispatcher {
    mailboxes: Mutex<HashMap<SubscriberId, Arc<Mailbox>>>,
    capacity: Option<usize>,
}

impl Dispatcher {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            mailboxes: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn register(&self, subscriber: SubscriberId) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(subscriber, self.capacity));
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscriber, mailbox.clone());
        mailbox
    }

    /// Forget a subscriber and abandon whatever it had pending
    pub fn remove(&self, subscriber: SubscriberId) {
        let removed = self
            .mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&subscriber);
        if let Some(mailbox) = removed {
            mailbox.close();
        }
    }

    /// Notifications dropped so far across connected subscribers
    pub fn dropped(&self) -> u64 {
        self.mailboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|mailbox| mailbox.dropped())
            .sum()
    }

    pub(crate) fn deliver(&self, batches: Vec<(SubscriberId, Notification)>) {
        let mailboxes = self.mailboxes.lock().unwrap_or_else(PoisonError::into_inner);
        for (subscriber, notification) in batches {
            match mailboxes.get(&subscriber) {
                Some(mailbox) => {
                    debug!(
                        "pubsubid {} -> subscriber {}: {} x{}",
                        notification.pubsubid,
                        subscriber,
                        notification.action,
                        notification.rows.len()
                    );
                    mailbox.push(notification);
                }
                None => debug!("subscriber {} is gone, dropping batch", subscriber),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Filter, Projection};
    use crate::store::Change;

    fn notification(pubsubid: SubscriptionId) -> Notification {
        Notification {
            pubsubid,
            action: Action::Insert,
            table: "T".into(),
            rows: RowSet::default(),
        }
    }

    fn insert_event(store: &mut TableStore, pairs: &[(&str, &str)]) -> ChangeEvent {
        let values = pairs.iter().map(|(c, v)| (c.to_string(), v.to_string()));
        store.insert_row("T", values).unwrap()
    }

    #[test]
    fn batches_consecutive_rows_with_same_action() {
        let mut store = TableStore::new();
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe(
            "T",
            Projection::Columns(vec!["k".into()]),
            Filter::eq("g", "1"),
            9,
        );

        let mut events = vec![
            insert_event(&mut store, &[("k", "a"), ("g", "1")]),
            insert_event(&mut store, &[("k", "b"), ("g", "2")]),
            insert_event(&mut store, &[("k", "c"), ("g", "1")]),
        ];
        let before = events[0].change.row().clone();
        let mut after = before.clone();
        after.set("g", "2");
        events.push(ChangeEvent {
            table: "T".into(),
            change: Change::Update { before, after },
        });

        let batches = Batcher::collect(&registry, &store, &events).into_batches();
        assert_eq!(batches.len(), 2);
        let (subscriber, first) = &batches[0];
        assert_eq!(*subscriber, 9);
        assert_eq!(first.pubsubid, id);
        assert_eq!(first.action, Action::Insert);
        assert_eq!(first.rows.columns(), &["k"]);
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.rows.value(1, "k"), Some("c"));
        assert_eq!(batches[1].1.action, Action::Remove);
    }

    #[test]
    fn mailbox_drops_oldest_when_full() {
        let mailbox = Mailbox::new(1, Some(2));
        for id in 1..=3 {
            mailbox.push(notification(id));
        }
        assert_eq!(mailbox.dropped(), 1);
        assert_eq!(mailbox.try_recv().map(|n| n.pubsubid), Some(2));
        assert_eq!(mailbox.try_recv().map(|n| n.pubsubid), Some(3));
        assert!(mailbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn wait_times_out_without_data() {
        let mailbox = Mailbox::new(1, None);
        assert!(mailbox.wait(Duration::from_millis(20)).await.is_none());
        mailbox.push(notification(4));
        let got = mailbox.wait(Duration::from_millis(20)).await;
        assert_eq!(got.map(|n| n.pubsubid), Some(4));
    }

    #[tokio::test]
    async fn wait_wakes_on_push_from_another_thread() {
        let mailbox = Arc::new(Mailbox::new(1, None));
        let producer = mailbox.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(notification(5));
        });
        let got = mailbox.wait(Duration::from_secs(2)).await;
        assert_eq!(got.map(|n| n.pubsubid), Some(5));
    }

    #[tokio::test]
    async fn closed_mailbox_ends_recv() {
        let dispatcher = Dispatcher::new(None);
        let mailbox = dispatcher.register(3);
        dispatcher.deliver(vec![(3, notification(1))]);
        dispatcher.remove(3);
        assert!(mailbox.recv().await.is_none());
        dispatcher.deliver(vec![(3, notification(2))]);
        assert!(mailbox.is_empty());
    }
}
