//! Structured commands produced by the parser

use std::fmt;

use crate::store::Row;

/// Name of the pseudo-column holding the row id
pub const ID_COLUMN: &str = "id";

/// Kind of index created by `key` / `tag`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Unique index
    Key,
    /// Non-unique index
    Tag,
}

impl IndexKind {
    pub fn keyword(self) -> &'static str {
        match self {
            IndexKind::Key => "key",
            IndexKind::Tag => "tag",
        }
    }
}

/// Columns requested by `select` / `subscribe`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Projection {
    /// `*` or no column list: `id` followed by every known column
    All,
    Columns(Vec<String>),
}

/// One `column = value` equality test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    pub column: String,
    pub value: String,
}

/// Conjunction of equality clauses. Empty means "every row".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub clauses: Vec<Clause>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            clauses: vec![Clause {
                column: column.into(),
                value: value.into(),
            }],
        }
    }

    /// Add another clause to the conjunction
    pub fn and(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.clauses.push(Clause {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn is_wildcard(&self) -> bool {
        self.clauses.is_empty()
    }

    /// String equality on every clause; absent columns read as empty.
    pub fn matches(&self, row: &Row) -> bool {
        self.clauses
            .iter()
            .all(|clause| row.get(&clause.column) == clause.value)
    }
}

/// `column = value` in an update's `set` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub column: String,
    pub value: String,
}

/// A parsed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Key {
        table: String,
        column: String,
    },
    Tag {
        table: String,
        column: String,
    },
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<String>,
    },
    Update {
        table: String,
        assignments: Vec<Assignment>,
        filter: Filter,
    },
    Delete {
        table: String,
        filter: Filter,
    },
    Select {
        table: String,
        projection: Projection,
        filter: Filter,
    },
    Subscribe {
        table: String,
        projection: Projection,
        filter: Filter,
    },
    Unsubscribe {
        table: String,
        pubsubid: Option<u64>,
    },
}

impl Command {
    pub fn table(&self) -> &str {
        match self {
            Command::Key { table, .. }
            | Command::Tag { table, .. }
            | Command::Insert { table, .. }
            | Command::Update { table, .. }
            | Command::Delete { table, .. }
            | Command::Select { table, .. }
            | Command::Subscribe { table, .. }
            | Command::Unsubscribe { table, .. } => table,
        }
    }

    /// Leading keyword of the command
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Key { .. } => "key",
            Command::Tag { .. } => "tag",
            Command::Insert { .. } => "insert",
            Command::Update { .. } => "update",
            Command::Delete { .. } => "delete",
            Command::Select { .. } => "select",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

// ============ Rendering ============

/// Quote a literal when a bare rendering would not read back verbatim
pub fn quote_literal(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c == ',' || c == ')' || c == '\'' || c.is_whitespace());
    if needs_quotes {
        format!("'{}'", value.replace('\'', "''"))
    } else {
        value.to_string()
    }
}

impl fmt::Display for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Projection::All => f.write_str("*"),
            Projection::Columns(columns) => f.write_str(&columns.join(", ")),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, clause) in self.clauses.iter().enumerate() {
            let sep = if i == 0 { " where " } else { " and " };
            write!(f, "{sep}{} = {}", clause.column, quote_literal(&clause.value))?;
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Key { table, column } => write!(f, "key {table} {column}"),
            Command::Tag { table, column } => write!(f, "tag {table} {column}"),
            Command::Insert {
                table,
                columns,
                values,
            } => {
                let values: Vec<String> = values.iter().map(|v| quote_literal(v)).collect();
                write!(
                    f,
                    "insert into {table} ({}) values ({})",
                    columns.join(", "),
                    values.join(", ")
                )
            }
            Command::Update {
                table,
                assignments,
                filter,
            } => {
                let set: Vec<String> = assignments
                    .iter()
                    .map(|a| format!("{} = {}", a.column, quote_literal(&a.value)))
                    .collect();
                write!(f, "update {table} set {}{filter}", set.join(", "))
            }
            Command::Delete { table, filter } => write!(f, "delete from {table}{filter}"),
            Command::Select {
                table,
                projection,
                filter,
            } => write!(f, "select {projection} from {table}{filter}"),
            Command::Subscribe {
                table,
                projection,
                filter,
            } => write!(f, "subscribe {projection} from {table}{filter}"),
            Command::Unsubscribe { table, pubsubid } => match pubsubid {
                Some(id) => write!(f, "unsubscribe from {table} where pubsubid = {id}"),
                None => write!(f, "unsubscribe from {table}"),
            },
        }
    }
}
