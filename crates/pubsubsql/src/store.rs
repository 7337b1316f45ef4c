//! In-memory table store with key (unique) and tag (non-unique) indexes
//!
//! Tables are created on first reference and never dropped. Rows are sparse
//! string maps kept in row-id order; a column missing from a row reads as the
//! empty string, both for projections and for index entries.

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::iter;

use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};

use crate::PubSubError;
use crate::ast::{Assignment, Filter, ID_COLUMN, IndexKind, Projection};
use crate::result::RowSet;

/// Internal row identifier, unique per table and never reused
pub type RowId = u64;

/// A single row: its id plus whatever columns were set on it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    id: RowId,
    values: IndexMap<String, String>,
}

impl Row {
    pub fn new(id: RowId) -> Self {
        Self {
            id,
            values: IndexMap::new(),
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    /// Value of a column; `id` yields the row id, absent columns are empty
    pub fn get(&self, column: &str) -> Cow<'_, str> {
        if column == ID_COLUMN {
            return Cow::Owned(self.id.to_string());
        }
        Cow::Borrowed(self.values.get(column).map(String::as_str).unwrap_or(""))
    }

    /// Whether the column was set on this row (even to the empty string)
    pub fn has(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<String>) {
        self.values.insert(column.into(), value.into());
    }

    /// Columns populated on this row, in the order they were first set
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Values for the given columns, in order
    pub fn project(&self, columns: &[String]) -> Vec<String> {
        columns.iter().map(|c| self.get(c).into_owned()).collect()
    }
}

/// What happened to one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Insert(Row),
    Update { before: Row, after: Row },
    /// Carries the last-known values of the removed row
    Delete(Row),
}

impl Change {
    /// The row as it stands after the change (or as last seen, for deletes)
    pub fn row(&self) -> &Row {
        match self {
            Change::Insert(row) | Change::Delete(row) => row,
            Change::Update { after, .. } => after,
        }
    }
}

/// Record of one mutated row, fed to subscription matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub table: String,
    pub change: Change,
}

impl ChangeEvent {
    pub fn row_id(&self) -> RowId {
        self.change.row().id()
    }
}

/// Result of a multi-row update: applied rows and per-row rejections
#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub events: Vec<ChangeEvent>,
    pub rejected: Vec<PubSubError>,
}

// ============ Indexes ============

#[derive(Debug)]
enum ColumnIndex {
    Key(HashMap<String, RowId>),
    Tag(HashMap<String, BTreeSet<RowId>>),
}

impl ColumnIndex {
    fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Key => ColumnIndex::Key(HashMap::new()),
            IndexKind::Tag => ColumnIndex::Tag(HashMap::new()),
        }
    }

    fn kind(&self) -> IndexKind {
        match self {
            ColumnIndex::Key(_) => IndexKind::Key,
            ColumnIndex::Tag(_) => IndexKind::Tag,
        }
    }

    /// Would storing `value` for row `id` break uniqueness?
    fn conflicts(&self, value: &str, id: RowId) -> bool {
        match self {
            ColumnIndex::Key(map) => map.get(value).is_some_and(|owner| *owner != id),
            ColumnIndex::Tag(_) => false,
        }
    }

    fn insert(&mut self, value: &str, id: RowId) {
        match self {
            ColumnIndex::Key(map) => {
                map.insert(value.to_string(), id);
            }
            ColumnIndex::Tag(map) => {
                map.entry(value.to_string()).or_default().insert(id);
            }
        }
    }

    fn remove(&mut self, value: &str, id: RowId) {
        match self {
            ColumnIndex::Key(map) => {
                if map.get(value) == Some(&id) {
                    map.remove(value);
                }
            }
            ColumnIndex::Tag(map) => {
                if let Some(ids) = map.get_mut(value) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        map.remove(value);
                    }
                }
            }
        }
    }

    /// Row ids holding `value`, ascending
    fn lookup(&self, value: &str) -> Vec<RowId> {
        match self {
            ColumnIndex::Key(map) => map.get(value).copied().into_iter().collect(),
            ColumnIndex::Tag(map) => map
                .get(value)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default(),
        }
    }
}

// ============ Table ============

/// A named table of sparse string rows
#[derive(Debug)]
pub struct Table {
    name: String,
    /// Every column ever used, in first-use order
    columns: IndexSet<String>,
    rows: BTreeMap<RowId, Row>,
    indexes: HashMap<String, ColumnIndex>,
    next_id: RowId,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: IndexSet::new(),
            rows: BTreeMap::new(),
            indexes: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(String::as_str)
    }

    pub fn has_column(&self, column: &str) -> bool {
        column == ID_COLUMN || self.columns.contains(column)
    }

    pub fn row(&self, id: RowId) -> Option<&Row> {
        self.rows.get(&id)
    }

    /// Rows in row-id order
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.values()
    }

    pub fn index_kind(&self, column: &str) -> Option<IndexKind> {
        self.indexes.get(column).map(ColumnIndex::kind)
    }

    /// Column names a projection expands to for this table
    pub fn projected_columns(&self, projection: &Projection) -> Vec<String> {
        match projection {
            Projection::All => iter::once(ID_COLUMN)
                .chain(self.columns())
                .map(String::from)
                .collect(),
            Projection::Columns(columns) => columns.clone(),
        }
    }

    /// Build an index over the current rows. Re-creating the same kind is a
    /// no-op, and so is `tag` over a key: the key already serves lookups.
    pub fn create_index(&mut self, column: &str, kind: IndexKind) -> Result<(), PubSubError> {
        if let Some(existing) = self.indexes.get(column) {
            if existing.kind() == kind {
                return Ok(());
            }
            if kind == IndexKind::Tag {
                debug!("{}.{} is already a key, tag is a no-op", self.name, column);
                return Ok(());
            }
            return Err(PubSubError::IndexConflict {
                table: self.name.clone(),
                column: column.to_string(),
                existing: existing.kind().keyword(),
            });
        }

        let mut index = ColumnIndex::new(kind);
        for row in self.rows.values().filter(|row| row.has(column)) {
            let value = row.get(column);
            if index.conflicts(&value, row.id()) {
                return Err(self.duplicate_key(column, &value));
            }
            index.insert(&value, row.id());
        }

        self.columns.insert(column.to_string());
        self.indexes.insert(column.to_string(), index);
        info!(
            "created {} index on {}.{} over {} rows",
            kind.keyword(),
            self.name,
            column,
            self.rows.len()
        );
        Ok(())
    }

    /// Insert a new row. On a key violation nothing changes, not even the next row id.
    pub fn insert(
        &mut self,
        values: impl IntoIterator<Item = (String, String)>,
    ) -> Result<ChangeEvent, PubSubError> {
        let mut row = Row::new(self.next_id);
        for (column, value) in values {
            row.set(column, value);
        }
        self.check_unique(&row)?;

        self.next_id += 1;
        for column in row.columns() {
            if !self.columns.contains(column) {
                self.columns.insert(column.to_string());
            }
        }
        self.index_row(&row);
        self.rows.insert(row.id(), row.clone());

        Ok(ChangeEvent {
            table: self.name.clone(),
            change: Change::Insert(row),
        })
    }

    /// Apply assignments to every matching row; rows are independent, so a
    /// key violation skips only the offending row.
    pub fn update(&mut self, filter: &Filter, assignments: &[Assignment]) -> UpdateOutcome {
        let mut outcome = UpdateOutcome::default();

        for id in self.matching_ids(filter) {
            let Some(before) = self.rows.get(&id).cloned() else {
                continue;
            };
            let mut after = before.clone();
            for assignment in assignments {
                after.set(assignment.column.as_str(), assignment.value.as_str());
            }

            if let Err(e) = self.check_unique(&after) {
                warn!("update of {}[{}] rejected: {}", self.name, id, e);
                outcome.rejected.push(e);
                continue;
            }

            for assignment in assignments {
                if !self.columns.contains(&assignment.column) {
                    self.columns.insert(assignment.column.clone());
                }
            }
            self.unindex_row(&before);
            self.index_row(&after);
            self.rows.insert(id, after.clone());

            outcome.events.push(ChangeEvent {
                table: self.name.clone(),
                change: Change::Update { before, after },
            });
        }

        outcome
    }

    /// Remove every matching row, returning one delete event per row
    pub fn delete(&mut self, filter: &Filter) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        for id in self.matching_ids(filter) {
            if let Some(row) = self.rows.remove(&id) {
                self.unindex_row(&row);
                events.push(ChangeEvent {
                    table: self.name.clone(),
                    change: Change::Delete(row),
                });
            }
        }
        events
    }

    /// Read matching rows projected to the requested columns
    pub fn select(&self, projection: &Projection, filter: &Filter) -> Result<RowSet, PubSubError> {
        if let Projection::Columns(columns) = projection {
            if let Some(missing) = columns.iter().find(|c| !self.has_column(c)) {
                return Err(PubSubError::NotFound(format!(
                    "column '{}' in table '{}'",
                    missing, self.name
                )));
            }
        }

        let columns = self.projected_columns(projection);
        let rows = self
            .matching_ids(filter)
            .into_iter()
            .filter_map(|id| self.rows.get(&id))
            .map(|row| row.project(&columns))
            .collect();
        Ok(RowSet::new(columns, rows))
    }

    /// Ids of rows satisfying the filter, ascending.
    ///
    /// The first clause on `id` or an indexed column narrows the candidates;
    /// every clause is then checked against each candidate row. Rows missing
    /// a column are not indexed, so an empty value always scans.
    pub fn matching_ids(&self, filter: &Filter) -> Vec<RowId> {
        let candidates = filter.clauses.iter().find_map(|clause| {
            if clause.column == ID_COLUMN {
                return Some(clause.value.parse::<RowId>().into_iter().collect::<Vec<_>>());
            }
            if clause.value.is_empty() {
                return None;
            }
            self.indexes
                .get(&clause.column)
                .map(|index| index.lookup(&clause.value))
        });

        match candidates {
            Some(ids) => ids
                .into_iter()
                .filter(|id| self.rows.get(id).is_some_and(|row| filter.matches(row)))
                .collect(),
            None => self
                .rows
                .values()
                .filter(|row| filter.matches(row))
                .map(Row::id)
                .collect(),
        }
    }

    fn check_unique(&self, row: &Row) -> Result<(), PubSubError> {
        for (column, index) in self.indexes.iter().filter(|(c, _)| row.has(c)) {
            let value = row.get(column);
            if index.conflicts(&value, row.id()) {
                return Err(self.duplicate_key(column, &value));
            }
        }
        Ok(())
    }

    fn duplicate_key(&self, column: &str, value: &str) -> PubSubError {
        PubSubError::DuplicateKey {
            table: self.name.clone(),
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    fn index_row(&mut self, row: &Row) {
        for (column, index) in self.indexes.iter_mut().filter(|(c, _)| row.has(c)) {
            index.insert(&row.get(column), row.id());
        }
    }

    fn unindex_row(&mut self, row: &Row) {
        for (column, index) in self.indexes.iter_mut().filter(|(c, _)| row.has(c)) {
            index.remove(&row.get(column), row.id());
        }
    }
}

// ============ Store ============

/// All tables in the process, owned by the engine
#[derive(Debug, Default)]
pub struct TableStore {
    tables: HashMap<String, Table>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing table, or a new empty one
    pub fn ensure_table(&mut self, name: &str) -> &mut Table {
        self.tables.entry(name.to_string()).or_insert_with(|| {
            debug!("created table {}", name);
            Table::new(name)
        })
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.tables.get(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn create_key_index(&mut self, table: &str, column: &str) -> Result<(), PubSubError> {
        self.ensure_table(table).create_index(column, IndexKind::Key)
    }

    pub fn create_tag_index(&mut self, table: &str, column: &str) -> Result<(), PubSubError> {
        self.ensure_table(table).create_index(column, IndexKind::Tag)
    }

    pub fn insert_row(
        &mut self,
        table: &str,
        values: impl IntoIterator<Item = (String, String)>,
    ) -> Result<ChangeEvent, PubSubError> {
        self.ensure_table(table).insert(values)
    }

    pub fn update_rows(
        &mut self,
        table: &str,
        filter: &Filter,
        assignments: &[Assignment],
    ) -> UpdateOutcome {
        self.ensure_table(table).update(filter, assignments)
    }

    pub fn delete_rows(&mut self, table: &str, filter: &Filter) -> Vec<ChangeEvent> {
        self.ensure_table(table).delete(filter)
    }

    /// Read-only; a table nobody has touched yet reads as empty
    pub fn select_rows(
        &self,
        table: &str,
        projection: &Projection,
        filter: &Filter,
    ) -> Result<RowSet, PubSubError> {
        match self.tables.get(table) {
            Some(t) => t.select(projection, filter),
            None => Table::new(table).select(projection, filter),
        }
    }
}
