//! Backend commands and the command-builder contract
//!
//! The runtime never looks inside a `Command`; it only hands it from a builder to a
//! connection. Builders are bound 1:1 to an entity schema.

use crate::schema::{FieldType, Identity, Record, Schema};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Equality conditions, field name -> expected value
pub type Conditions = Record;

/// Typed statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(Option<String>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Double(Option<f64>),
    Boolean(Option<bool>),
    Uuid(Option<Uuid>),
    Timestamp(Option<DateTime<Utc>>),
    Json(Option<Value>),
    /// A value that does not convert to its column type. Connections refuse to run it.
    Invalid { field_type: FieldType, value: Value },
}

/// An opaque backend request
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub statement: String,
    pub params: Vec<Param>,
}

impl Command {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            params: Vec::new(),
        }
    }

    pub fn with_params(statement: impl Into<String>, params: Vec<Param>) -> Self {
        Self {
            statement: statement.into(),
            params,
        }
    }
}

/// Read consistency requested by the caller. Backends without the notion ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Any,
    One,
    Quorum,
    LocalQuorum,
    All,
}

/// Sort order for `select_one`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

impl Order {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            descending: true,
        }
    }
}

/// Options for write commands
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub consistency: Option<Consistency>,
    pub ttl: Option<u32>,
    pub timestamp: Option<i64>,
}

/// Options for `batch`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Run the batch as one unit (a transaction on PostgreSQL)
    pub atomic: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self { atomic: true }
    }
}

/// A single `alter_table` change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TableChange {
    AddColumn { name: String, field_type: FieldType },
    DropColumn { name: String },
    RenameColumn { from: String, to: String },
}

/// Translates structured requests into backend commands for one schema
pub trait CommandBuilder: Send + Sync {
    fn table_name(&self) -> String;

    fn select_all(&self, filter: &Conditions, consistency: Option<Consistency>) -> Command;

    fn select(
        &self,
        columns: &[String],
        filter: &Conditions,
        consistency: Option<Consistency>,
    ) -> Command;

    fn select_one(
        &self,
        conds: &Conditions,
        order: Option<&Order>,
        offset: Option<u64>,
        consistency: Option<Consistency>,
    ) -> Command;

    fn select_by_id(&self, id: &Identity, consistency: Option<Consistency>) -> Command;

    fn count(
        &self,
        conds: &Conditions,
        limit: Option<u64>,
        offset: Option<u64>,
        consistency: Option<Consistency>,
    ) -> Command;

    fn insert(&self, data: &Record, options: &WriteOptions) -> Command;

    fn update(&self, data: &Record, conds: &Conditions, options: &WriteOptions) -> Command;

    fn update_by_id(&self, data: &Record, id: &Identity, options: &WriteOptions) -> Command;

    fn destroy(&self, columns: &[String], conds: &Conditions, options: &WriteOptions) -> Command;

    fn destroy_all(&self, conds: &Conditions, options: &WriteOptions) -> Command;

    fn destroy_by_id(&self, id: &Identity, options: &WriteOptions) -> Command;

    fn truncate(&self) -> Command;

    fn alter_table(&self, changes: &[TableChange]) -> Command;

    fn create_table(&self) -> Command;
}

/// Builds the command builder for a freshly declared schema
pub type BuilderFactory = Arc<dyn Fn(Arc<Schema>) -> Arc<dyn CommandBuilder> + Send + Sync>;
