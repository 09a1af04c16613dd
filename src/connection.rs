//! Backend connection contract
//!
//! A connection executes commands and batches and answers table-metadata lookups.
//! Submission is synchronous (the call to `execute` is the point at which the command
//! is handed over); the returned future only carries the response.

use crate::command::{BatchOptions, Command};
use crate::error::OrmResult;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Response of an operation that has been handed to a connection, or queued for one
pub type Pending<T> = BoxFuture<'static, OrmResult<T>>;

/// One column of a returned row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cell {
    pub name: String,
    pub value: Value,
    /// Write time, for backends that track it per cell
    pub timestamp: Option<i64>,
    pub ttl: Option<u32>,
}

impl Cell {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp: None,
            ttl: None,
        }
    }
}

/// A returned row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub cells: Vec<Cell>,
}

impl Row {
    pub fn new(cells: Vec<Cell>) -> Self {
        Self { cells }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.cells.iter().find(|c| c.name == name).map(|c| &c.value)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Cell> {
        self.cells.iter()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl<'a> IntoIterator for &'a Row {
    type Item = &'a Cell;
    type IntoIter = std::slice::Iter<'a, Cell>;

    fn into_iter(self) -> Self::IntoIter {
        self.cells.iter()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            cells: iter.into_iter().map(|(name, value)| Cell::new(name, value)).collect(),
        }
    }
}

/// Result set of a command. A `None` entry is a null row.
pub type Rows = Vec<Option<Row>>;

/// Column as reported by the backend catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMetadata {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// Table as reported by the backend catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    pub name: String,
    pub schema: String,
    pub columns: Vec<ColumnMetadata>,
}

/// Executes commands against the backend
pub trait Connection: Send + Sync + 'static {
    /// Hand `command` to the backend
    fn execute(&self, command: Command) -> Pending<Rows>;

    /// Hand a group of commands to the backend as one batch
    fn batch(&self, commands: Vec<Command>, options: BatchOptions) -> Pending<()>;

    /// Look up a table in the backend catalog
    ///
    /// A missing table is reported either as `Ok(None)` or as `OrmError::NotFound`.
    fn table_metadata(&self, table: &str) -> Pending<Option<TableMetadata>>;
}
