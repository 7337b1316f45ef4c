//! Query executor: applies one parsed command to the store and registry

use crate::PubSubError;
use crate::ast::{Command, Filter, IndexKind, Projection};
use crate::result::RowSet;
use crate::store::{ChangeEvent, RowId, TableStore};
use crate::subscription::{SubscriberId, SubscriptionId, SubscriptionRegistry};

/// Direct result of a successful command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `key` / `tag`
    Indexed {
        table: String,
        column: String,
        kind: IndexKind,
    },
    Inserted {
        id: RowId,
    },
    Updated {
        count: usize,
    },
    Deleted {
        count: usize,
    },
    Selected(RowSet),
    Subscribed {
        pubsubid: SubscriptionId,
    },
    Unsubscribed {
        count: usize,
    },
}

impl Response {
    /// Action name reported back to the caller
    pub fn action(&self) -> &'static str {
        match self {
            Response::Indexed { kind, .. } => kind.keyword(),
            Response::Inserted { .. } => "insert",
            Response::Updated { .. } => "update",
            Response::Deleted { .. } => "delete",
            Response::Selected(_) => "select",
            Response::Subscribed { .. } => "subscribe",
            Response::Unsubscribed { .. } => "unsubscribe",
        }
    }
}

/// Everything behind the engine's lock
#[derive(Debug, Default)]
pub(crate) struct State {
    pub store: TableStore,
    pub registry: SubscriptionRegistry,
}

/// A command's result plus the row changes it caused, in mutation order.
///
/// Events are present even when the result is an error: a partially
/// applied update still publishes the rows it changed.
#[derive(Debug)]
pub(crate) struct Outcome {
    pub result: Result<Response, PubSubError>,
    pub events: Vec<ChangeEvent>,
}

impl Outcome {
    fn from_result(result: Result<Response, PubSubError>) -> Self {
        Self {
            result,
            events: Vec::new(),
        }
    }
}

pub(crate) fn apply(state: &mut State, subscriber: SubscriberId, command: Command) -> Outcome {
    match command {
        Command::Key { table, column } => {
            create_index(&mut state.store, table, column, IndexKind::Key)
        }
        Command::Tag { table, column } => {
            create_index(&mut state.store, table, column, IndexKind::Tag)
        }

        Command::Insert {
            table,
            columns,
            values,
        } => match state.store.insert_row(&table, columns.into_iter().zip(values)) {
            Ok(event) => Outcome {
                result: Ok(Response::Inserted { id: event.row_id() }),
                events: vec![event],
            },
            Err(e) => Outcome::from_result(Err(e)),
        },

        Command::Update {
            table,
            assignments,
            filter,
        } => {
            let outcome = state.store.update_rows(&table, &filter, &assignments);
            let count = outcome.events.len();
            let result = match outcome.rejected.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(Response::Updated { count }),
            };
            Outcome {
                result,
                events: outcome.events,
            }
        }

        Command::Delete { table, filter } => {
            let events = state.store.delete_rows(&table, &filter);
            Outcome {
                result: Ok(Response::Deleted {
                    count: events.len(),
                }),
                events,
            }
        }

        Command::Select {
            table,
            projection,
            filter,
        } => Outcome::from_result(select(&state.store, &table, &projection, &filter)),

        Command::Subscribe {
            table,
            projection,
            filter,
        } => {
            state.store.ensure_table(&table);
            let pubsubid = state
                .registry
                .subscribe(table, projection, filter, subscriber);
            Outcome::from_result(Ok(Response::Subscribed { pubsubid }))
        }

        Command::Unsubscribe { table, pubsubid } => Outcome::from_result(
            state
                .registry
                .unsubscribe_table(subscriber, &table, pubsubid)
                .map(|ids| Response::Unsubscribed { count: ids.len() }),
        ),
    }
}

/// Read-only path, usable under a shared lock
pub(crate) fn select(
    store: &TableStore,
    table: &str,
    projection: &Projection,
    filter: &Filter,
) -> Result<Response, PubSubError> {
    store
        .select_rows(table, projection, filter)
        .map(Response::Selected)
}

fn create_index(store: &mut TableStore, table: String, column: String, kind: IndexKind) -> Outcome {
    let result = match kind {
        IndexKind::Key => store.create_key_index(&table, &column),
        IndexKind::Tag => store.create_tag_index(&table, &column),
    };
    Outcome::from_result(result.map(|()| Response::Indexed {
        table,
        column,
        kind,
    }))
}
