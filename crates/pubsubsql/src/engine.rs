//! Engine owning the table store, subscriptions and mailboxes
//!
//! Concurrency model:
//! - `select` runs under a shared lock; every other command takes the
//!   exclusive lock for its whole duration.
//! - Subscription matching and mailbox delivery happen before the exclusive
//!   lock is released, so notifications are queued by the time the mutating
//!   command returns, in mutation order per subscription.
//! - Delivery to the subscriber is decoupled: it waits on its own mailbox.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, info};

use crate::PubSubError;
use crate::ast::Command;
use crate::dispatch::{Batcher, Dispatcher, Mailbox, Notification};
use crate::exec::{self, Response, State};
use crate::parse::parse;
use crate::subscription::{SubscriberId, SubscriptionId};

/// Default bound on pending notifications per subscriber
pub const DEFAULT_MAX_PENDING: usize = 10_000;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pending notifications kept per subscriber before the oldest is
    /// dropped (None = unbounded)
    pub max_pending: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_pending: Some(DEFAULT_MAX_PENDING),
        }
    }
}

impl EngineConfig {
    pub fn with_max_pending(mut self, max_pending: Option<usize>) -> Self {
        self.max_pending = max_pending;
        self
    }
}

/// Pub/sub SQL engine
///
/// # Example
///
/// ```ignore
/// let engine = Arc::new(Engine::new());
/// let client = engine.connect();
/// let subscriber = engine.connect();
///
/// client.execute("key Stocks Ticker")?;
/// subscriber.execute("subscribe * from Stocks where MarketCap = 'MEGA CAP'")?;
/// client.execute("insert into Stocks (Ticker, MarketCap) values (GOOG, 'MEGA CAP')")?;
///
/// let batch = subscriber.wait(Duration::from_millis(100)).await;
/// ```
#[derive(Debug)]
pub struct Engine {
    state: RwLock<State>,
    dispatcher: Dispatcher,
    next_subscriber: AtomicU64,
}

impl Engine {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            state: RwLock::new(State::default()),
            dispatcher: Dispatcher::new(config.max_pending),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// Open a session: a subscriber identity with its own mailbox
    pub fn connect(self: &Arc<Self>) -> Session {
        let id = self.next_subscriber.fetch_add(1, Ordering::SeqCst);
        let mailbox = self.dispatcher.register(id);
        info!("subscriber {} connected", id);
        Session {
            id,
            engine: self.clone(),
            mailbox,
        }
    }

    /// Parse and run one command on behalf of a subscriber
    pub fn execute(&self, subscriber: SubscriberId, command: &str) -> Result<Response, PubSubError> {
        debug!("subscriber {}: {}", subscriber, command);
        let command = parse(command)?;
        self.execute_command(subscriber, command)
    }

    /// Run an already parsed command
    pub fn execute_command(
        &self,
        subscriber: SubscriberId,
        command: Command,
    ) -> Result<Response, PubSubError> {
        if let Command::Select {
            table,
            projection,
            filter,
        } = &command
        {
            let state = self.read();
            return exec::select(&state.store, table, projection, filter);
        }

        let mut state = self.write();
        let outcome = exec::apply(&mut state, subscriber, command);
        if !outcome.events.is_empty() {
            let batcher = Batcher::collect(&state.registry, &state.store, &outcome.events);
            if !batcher.is_empty() {
                self.dispatcher.deliver(batcher.into_batches());
            }
        }
        outcome.result
    }

    /// Remove a subscription by its pubsubid, whoever owns it
    pub fn unsubscribe(&self, pubsubid: SubscriptionId) -> Result<(), PubSubError> {
        self.write().registry.unsubscribe(pubsubid).map(|_| ())
    }

    /// Drop a subscriber: its subscriptions end and its pending queue is abandoned
    pub fn disconnect(&self, subscriber: SubscriberId) {
        let removed = self.write().registry.unsubscribe_all(subscriber);
        self.dispatcher.remove(subscriber);
        info!(
            "subscriber {} disconnected, {} subscriptions removed",
            subscriber,
            removed.len()
        );
    }

    /// Names of every table referenced so far
    pub fn table_names(&self) -> Vec<String> {
        self.read().store.table_names()
    }

    /// Number of active subscriptions across all subscribers
    pub fn subscription_count(&self) -> usize {
        self.read().registry.len()
    }

    /// Notifications dropped from full mailboxes of connected subscribers
    pub fn dropped_notifications(&self) -> u64 {
        self.dispatcher.dropped()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

/// One connected client. Dropping it disconnects.
#[derive(Debug)]
pub struct Session {
    id: SubscriberId,
    engine: Arc<Engine>,
    mailbox: Arc<Mailbox>,
}

impl Session {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn execute(&self, command: &str) -> Result<Response, PubSubError> {
        self.engine.execute(self.id, command)
    }

    pub fn execute_command(&self, command: Command) -> Result<Response, PubSubError> {
        self.engine.execute_command(self.id, command)
    }

    /// Wait up to `timeout` for the next notification batch
    pub async fn wait(&self, timeout: Duration) -> Option<Notification> {
        self.mailbox.wait(timeout).await
    }

    /// Next notification batch if one is already queued
    pub fn try_next(&self) -> Option<Notification> {
        self.mailbox.try_recv()
    }

    /// Shared handle to this session's mailbox (e.g. for a forwarding task)
    pub fn mailbox(&self) -> Arc<Mailbox> {
        self.mailbox.clone()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.engine.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Action;

    #[test]
    fn select_sees_own_insert() {
        let engine = Arc::new(Engine::new());
        let session = engine.connect();
        let inserted = session
            .execute("insert into T (k, v) values (a, 1)")
            .unwrap();
        assert_eq!(inserted, Response::Inserted { id: 1 });

        match session.execute("select * from T where k = a").unwrap() {
            Response::Selected(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows.value(0, "v"), Some("1"));
            }
            other => panic!("Expected rows, got {:?}", other),
        }
    }

    #[test]
    fn notification_queued_before_command_returns() {
        let engine = Arc::new(Engine::new());
        let publisher = engine.connect();
        let subscriber = engine.connect();
        subscriber.execute("subscribe * from T").unwrap();
        publisher
            .execute("insert into T (k) values (a)")
            .unwrap();
        let batch = subscriber.try_next().expect("batch should already be queued");
        assert_eq!(batch.action, Action::Insert);
    }

    #[test]
    fn dropped_notifications_are_counted() {
        let engine = Arc::new(Engine::with_config(
            EngineConfig::default().with_max_pending(Some(1)),
        ));
        let publisher = engine.connect();
        let subscriber = engine.connect();
        subscriber.execute("subscribe * from T").unwrap();
        for k in ["a", "b", "c"] {
            publisher
                .execute(&format!("insert into T (k) values ({k})"))
                .unwrap();
        }
        assert_eq!(engine.dropped_notifications(), 2);
        assert_eq!(subscriber.mailbox().len(), 1);
    }

    #[test]
    fn dropping_session_removes_subscriptions() {
        let engine = Arc::new(Engine::new());
        let subscriber = engine.connect();
        subscriber.execute("subscribe * from T").unwrap();
        subscriber.execute("subscribe * from U").unwrap();
        assert_eq!(engine.subscription_count(), 2);
        drop(subscriber);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn parse_errors_leave_state_untouched() {
        let engine = Arc::new(Engine::new());
        let session = engine.connect();
        assert!(matches!(
            session.execute("insert into T (k) values ('open"),
            Err(PubSubError::Parse(_))
        ));
        assert!(engine.table_names().is_empty());
    }
}
