//! PubSubSQL - an in-memory table store that publishes row changes
//!
//! Clients run lowercase SQL-like commands against schema-less string tables
//! and subscribe to filtered change streams on them.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pubsubsql::Engine;
//!
//! let engine = Arc::new(Engine::new());
//! let client = engine.connect();
//! let subscriber = engine.connect();
//!
//! client.execute("key Stocks Ticker")?;
//! client.execute("tag Stocks MarketCap")?;
//!
//! // Returns Response::Subscribed { pubsubid }
//! subscriber.execute("subscribe * from Stocks where MarketCap = 'MEGA CAP'")?;
//!
//! client.execute("insert into Stocks (Ticker, Price, MarketCap) values (GOOG, '1,200.22', 'MEGA CAP')")?;
//!
//! // One batch per command and action: here `insert` with the GOOG row
//! if let Some(batch) = subscriber.wait(Duration::from_millis(100)).await {
//!     println!("{}: {:?}", batch.action, batch.rows.value(0, "Ticker"));
//! }
//! ```
//!
//! ## Commands
//!
//! - `key <table> <column>` / `tag <table> <column>` → unique / non-unique index
//! - `insert into <table> (<col>, ...) values (<val>, ...)`
//! - `update <table> set <col> = <val>, ... [where ...]`
//! - `delete from <table> [where ...]`
//! - `select [* | <col>, ...] from <table> [where ...]`
//! - `subscribe [* | <col>, ...] from <table> [where ...]`
//! - `unsubscribe from <table> [where pubsubid = <n>]`
//!
//! `where` takes `col = value` clauses joined by `and`. Every table has an
//! `id` pseudo-column holding the row id.
//!
//! ## Notifications
//!
//! Subscribers receive `insert`, `update` and `delete` batches for rows
//! matching their filter, plus `add` / `remove` when an update moves a row
//! into or out of it.

mod ast;
mod dispatch;
mod engine;
mod exec;
mod parse;
mod result;
mod store;
mod subscription;

use thiserror::Error;

// ============ Primary Public API ============

pub use dispatch::{Mailbox, Notification};
pub use engine::{DEFAULT_MAX_PENDING, Engine, EngineConfig, Session};
pub use exec::Response;
pub use result::{RowRef, RowSet};
pub use subscription::{Action, SubscriberId, SubscriptionId};

pub use ast::{Assignment, Clause, Command, Filter, ID_COLUMN, IndexKind, Projection, quote_literal};
pub use parse::{ParseError, parse};

// ============ Errors ============

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PubSubError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Duplicate key: {table}.{column} already has a row with value '{value}'")]
    DuplicateKey {
        table: String,
        column: String,
        value: String,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Index conflict: {table}.{column} is already a {existing} index")]
    IndexConflict {
        table: String,
        column: String,
        existing: &'static str,
    },
}

// ============ Advanced: Storage Access ============

/// Lower-level building blocks (for embedding or benchmarks)
pub mod advanced {
    pub use crate::store::{Change, ChangeEvent, Row, RowId, Table, TableStore, UpdateOutcome};
    pub use crate::subscription::{Subscription, SubscriptionRegistry};
}
