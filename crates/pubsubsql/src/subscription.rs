//! Subscription registry
//!
//! A subscription is a standing filter on one table owned by one subscriber
//! (connection). Matching is change-only: existing rows are never replayed,
//! and each event is checked against the subscriptions of its table.
//!
//! For updates the action depends on how the row moved relative to the
//! filter:
//!
//! | before | after | action   |
//! |--------|-------|----------|
//! | match  | match | `update` |
//! | no     | match | `add`    |
//! | match  | no    | `remove` |
//! | no     | no    | (none)   |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use log::info;

use crate::PubSubError;
use crate::ast::{Filter, Projection};
use crate::store::{Change, ChangeEvent};

/// The `pubsubid` handed back by `subscribe`
pub type SubscriptionId = u64;

/// Identity of a connected subscriber
pub type SubscriberId = u64;

/// Category of a notification batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Update,
    Delete,
    /// An update moved the row into the filter
    Add,
    /// An update moved the row out of the filter
    Remove,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Insert => "insert",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Add => "add",
            Action::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An active subscription. Filter and projection never change after creation.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub subscriber: SubscriberId,
    pub table: String,
    pub projection: Projection,
    pub filter: Filter,
}

impl Subscription {
    /// Action this subscription sees for a change, if any
    pub fn action_for(&self, change: &Change) -> Option<Action> {
        match change {
            Change::Insert(row) => self.filter.matches(row).then_some(Action::Insert),
            Change::Delete(row) => self.filter.matches(row).then_some(Action::Delete),
            Change::Update { before, after } => {
                match (self.filter.matches(before), self.filter.matches(after)) {
                    (true, true) => Some(Action::Update),
                    (false, true) => Some(Action::Add),
                    (true, false) => Some(Action::Remove),
                    (false, false) => None,
                }
            }
        }
    }
}

/// All active subscriptions, by table and by owner
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    last_id: SubscriptionId,
    by_table: HashMap<String, BTreeMap<SubscriptionId, Subscription>>,
    tables: HashMap<SubscriptionId, String>,
    by_subscriber: HashMap<SubscriberId, BTreeSet<SubscriptionId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        let table = self.tables.get(&id)?;
        self.by_table.get(table)?.get(&id)
    }

    /// Register a subscription and return its id
    pub fn subscribe(
        &mut self,
        table: impl Into<String>,
        projection: Projection,
        filter: Filter,
        subscriber: SubscriberId,
    ) -> SubscriptionId {
        self.last_id += 1;
        let id = self.last_id;
        let table = table.into();

        info!(
            "subscriber {} subscribed to {}{} as pubsubid {}",
            subscriber, table, filter, id
        );

        self.tables.insert(id, table.clone());
        self.by_subscriber.entry(subscriber).or_default().insert(id);
        self.by_table.entry(table.clone()).or_default().insert(
            id,
            Subscription {
                id,
                subscriber,
                table,
                projection,
                filter,
            },
        );
        id
    }

    /// Remove one subscription by id
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Result<Subscription, PubSubError> {
        let table = self
            .tables
            .remove(&id)
            .ok_or_else(|| PubSubError::NotFound(format!("pubsubid {id}")))?;

        let subscription = self
            .by_table
            .get_mut(&table)
            .and_then(|subs| subs.remove(&id))
            .ok_or_else(|| PubSubError::NotFound(format!("pubsubid {id}")))?;
        if self.by_table.get(&table).is_some_and(BTreeMap::is_empty) {
            self.by_table.remove(&table);
        }

        if let Some(ids) = self.by_subscriber.get_mut(&subscription.subscriber) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_subscriber.remove(&subscription.subscriber);
            }
        }

        info!("pubsubid {} on {} unsubscribed", id, table);
        Ok(subscription)
    }

    /// `unsubscribe from <table> [where pubsubid = n]` on behalf of a subscriber
    pub fn unsubscribe_table(
        &mut self,
        subscriber: SubscriberId,
        table: &str,
        id: Option<SubscriptionId>,
    ) -> Result<Vec<SubscriptionId>, PubSubError> {
        let owned: Vec<SubscriptionId> = self
            .by_subscriber
            .get(&subscriber)
            .into_iter()
            .flatten()
            .copied()
            .filter(|sid| self.tables.get(sid).is_some_and(|t| t == table))
            .filter(|sid| id.is_none_or(|wanted| wanted == *sid))
            .collect();

        if owned.is_empty() {
            return Err(PubSubError::NotFound(match id {
                Some(id) => format!("pubsubid {id} on table '{table}'"),
                None => format!("subscription on table '{table}'"),
            }));
        }

        for sid in &owned {
            self.unsubscribe(*sid)?;
        }
        Ok(owned)
    }

    /// Drop everything a subscriber owns (on disconnect)
    pub fn unsubscribe_all(&mut self, subscriber: SubscriberId) -> Vec<SubscriptionId> {
        let ids: Vec<SubscriptionId> = self
            .by_subscriber
            .get(&subscriber)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        for id in &ids {
            let _ = self.unsubscribe(*id);
        }
        ids
    }

    /// Subscriptions on the event's table that want it, in id order
    pub fn matches(&self, event: &ChangeEvent) -> Vec<(&Subscription, Action)> {
        self.by_table
            .get(&event.table)
            .into_iter()
            .flat_map(|subs| subs.values())
            .filter_map(|sub| sub.action_for(&event.change).map(|action| (sub, action)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Row;

    fn row(id: u64, pairs: &[(&str, &str)]) -> Row {
        let mut row = Row::new(id);
        for (c, v) in pairs {
            row.set(*c, *v);
        }
        row
    }

    fn update(before: Row, after: Row) -> ChangeEvent {
        ChangeEvent {
            table: "Stocks".into(),
            change: Change::Update { before, after },
        }
    }

    fn mega_cap() -> Filter {
        Filter::eq("MarketCap", "MEGA CAP")
    }

    #[test]
    fn update_actions_follow_filter_transitions() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("Stocks", Projection::All, mega_cap(), 1);

        let large = row(2, &[("Ticker", "IBM"), ("MarketCap", "LARGE CAP")]);
        let mega = row(2, &[("Ticker", "IBM"), ("MarketCap", "MEGA CAP")]);

        let add = update(large.clone(), mega.clone());
        assert_eq!(registry.matches(&add)[0].1, Action::Add);

        let remove = update(mega.clone(), large.clone());
        assert_eq!(registry.matches(&remove)[0].1, Action::Remove);

        let stay = update(mega.clone(), mega);
        assert_eq!(registry.matches(&stay)[0].1, Action::Update);

        let outside = update(large.clone(), large);
        assert!(registry.matches(&outside).is_empty());
    }

    #[test]
    fn wildcard_matches_everything_on_its_table() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("Stocks", Projection::All, Filter::all(), 1);
        let insert = ChangeEvent {
            table: "Stocks".into(),
            change: Change::Insert(row(1, &[("Ticker", "X")])),
        };
        assert_eq!(registry.matches(&insert)[0].1, Action::Insert);

        let other_table = ChangeEvent {
            table: "Bonds".into(),
            change: Change::Insert(row(1, &[])),
        };
        assert!(registry.matches(&other_table).is_empty());
    }

    #[test]
    fn unsubscribe_by_id_and_by_table() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.subscribe("Stocks", Projection::All, mega_cap(), 1);
        let b = registry.subscribe("Stocks", Projection::All, Filter::all(), 1);
        let c = registry.subscribe("Stocks", Projection::All, Filter::all(), 2);
        assert_eq!((a, b, c), (1, 2, 3));

        registry.unsubscribe(a).unwrap();
        assert!(matches!(registry.unsubscribe(a), Err(PubSubError::NotFound(_))));

        // subscriber 1 cannot drop subscriber 2's subscription
        assert!(registry.unsubscribe_table(1, "Stocks", Some(c)).is_err());
        assert_eq!(registry.unsubscribe_table(1, "Stocks", None).unwrap(), vec![b]);
        assert!(registry.unsubscribe_table(1, "Stocks", None).is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unsubscribe_all_on_disconnect() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("A", Projection::All, Filter::all(), 7);
        registry.subscribe("B", Projection::All, Filter::all(), 7);
        registry.subscribe("B", Projection::All, Filter::all(), 8);
        assert_eq!(registry.unsubscribe_all(7).len(), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.unsubscribe_all(7).is_empty());
    }
}
