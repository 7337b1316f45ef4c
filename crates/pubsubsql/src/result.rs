//! Row sets returned by `select` and carried by notifications

/// Rows of string values sharing one column list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowSet {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    pub(crate) fn push(&mut self, values: Vec<String>) {
        debug_assert_eq!(values.len(), self.columns.len());
        self.rows.push(values);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ordinal of a column name
    pub fn ordinal(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        self.value_by_ordinal(row, self.ordinal(column)?)
    }

    pub fn value_by_ordinal(&self, row: usize, ordinal: usize) -> Option<&str> {
        self.rows.get(row)?.get(ordinal).map(String::as_str)
    }

    pub fn row(&self, index: usize) -> Option<RowRef<'_>> {
        self.rows.get(index).map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = RowRef<'_>> {
        self.rows.iter().map(|values| RowRef {
            columns: &self.columns,
            values,
        })
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Vec<String>>) {
        (self.columns, self.rows)
    }
}

/// Borrowed view of one row in a `RowSet`
#[derive(Debug, Clone, Copy)]
pub struct RowRef<'a> {
    columns: &'a [String],
    values: &'a [String],
}

impl<'a> RowRef<'a> {
    pub fn value(&self, column: &str) -> Option<&'a str> {
        let ordinal = self.columns.iter().position(|c| c == column)?;
        self.value_by_ordinal(ordinal)
    }

    pub fn value_by_ordinal(&self, ordinal: usize) -> Option<&'a str> {
        self.values.get(ordinal).map(String::as_str)
    }

    pub fn values(&self) -> &'a [String] {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_by_name_and_ordinal() {
        let rows = RowSet::new(
            vec!["id".into(), "Ticker".into()],
            vec![vec!["1".into(), "GOOG".into()], vec!["2".into(), "MSFT".into()]],
        );
        assert_eq!(rows.value(1, "Ticker"), Some("MSFT"));
        assert_eq!(rows.value_by_ordinal(0, 0), Some("1"));
        assert_eq!(rows.value(0, "Price"), None);
        assert_eq!(rows.value(5, "id"), None);

        let tickers: Vec<&str> = rows.iter().filter_map(|r| r.value("Ticker")).collect();
        assert_eq!(tickers, vec!["GOOG", "MSFT"]);
    }
}
