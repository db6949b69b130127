use crate::error::DbError;
use crate::udbc::value::{self, Value};
use serde::Serialize;
use std::collections::HashMap;

/// Shape of the rows returned for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowMode {
    /// Each row is a column-name keyed map.
    #[default]
    Object,
    /// Each row is a positional list of values, for duplicate or unnamed columns.
    Array,
}

/// A normalized query: command text, positional parameters and optional
/// per-statement settings. Settings left as `None` are not sent to the driver.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryDescriptor {
    pub text: String,
    pub values: Vec<Value>,
    /// Prepared-statement name. Accepted so descriptors keep the familiar
    /// shape, but ignored: statements are prepared per call and never cached.
    pub name: Option<String>,
    pub row_mode: Option<RowMode>,
    /// Parameter type OIDs, in placeholder order.
    pub types: Option<Vec<u32>>,
}

impl QueryDescriptor {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Builds the descriptor for `raw_query(text, values)`.
    pub fn raw<T: Serialize + ?Sized>(text: impl Into<String>, values: &T) -> Result<Self, DbError> {
        Ok(Self::new(text).values(value::to_values(values)?))
    }

    pub fn values(mut self, values: Vec<Value>) -> Self {
        self.values = values;
        self
    }

    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.values.push(value.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn row_mode(mut self, row_mode: RowMode) -> Self {
        self.row_mode = Some(row_mode);
        self
    }

    pub fn types(mut self, types: Vec<u32>) -> Self {
        self.types = Some(types);
        self
    }

    /// The row shape a driver should produce; unset means [`RowMode::Object`].
    pub fn effective_row_mode(&self) -> RowMode {
        self.row_mode.unwrap_or_default()
    }
}

impl From<&str> for QueryDescriptor {
    fn from(text: &str) -> Self {
        QueryDescriptor::new(text)
    }
}

impl From<String> for QueryDescriptor {
    fn from(text: String) -> Self {
        QueryDescriptor::new(text)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub type_oid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Object(HashMap<String, Value>),
    Array(Vec<Value>),
}

impl Row {
    /// Looks a column up by name. Array rows need the result's fields for this,
    /// see [`QueryResult::get`].
    pub fn get(&self, column: &str) -> Option<&Value> {
        match self {
            Row::Object(map) => map.get(column),
            Row::Array(_) => None,
        }
    }

    pub fn get_index(&self, index: usize) -> Option<&Value> {
        match self {
            Row::Array(values) => values.get(index),
            Row::Object(_) => None,
        }
    }
}

/// What the driver returned for one statement, passed through unmodified.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryResult {
    /// Leading keyword of the statement, e.g. `SELECT` or `INSERT`.
    pub command: String,
    /// Rows returned or affected.
    pub row_count: u64,
    pub fields: Vec<Field>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let row = self.rows.get(row)?;
        match row {
            Row::Object(map) => map.get(column),
            Row::Array(values) => {
                let idx = self.fields.iter().position(|f| f.name == column)?;
                values.get(idx)
            }
        }
    }
}

/// The command tag for a statement, from its first keyword.
pub fn command_of(text: &str) -> String {
    text.split_whitespace()
        .next()
        .map(|word| word.trim_end_matches(';').to_ascii_uppercase())
        .unwrap_or_default()
}
