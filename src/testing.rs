//! In-memory connection and builder used by the unit tests

use crate::command::{
    BatchOptions, Command, CommandBuilder, Conditions, Consistency, Order, TableChange,
    WriteOptions,
};
use crate::connection::{Connection, Pending, Rows, TableMetadata};
use crate::error::{OrmError, OrmResult};
use crate::schema::{Identity, Record, Schema};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// How `table_metadata` answers
pub enum Catalog {
    Exists,
    Missing,
    NotFound,
    Fails(String),
}

/// Records every command it receives and replays scripted responses
pub struct RecordingConnection {
    executed: Mutex<Vec<Command>>,
    batches: Mutex<Vec<Vec<Command>>>,
    responses: Mutex<VecDeque<OrmResult<Rows>>>,
    catalog: Mutex<Catalog>,
    lookups: Mutex<Vec<String>>,
}

impl RecordingConnection {
    pub fn new() -> Arc<Self> {
        Self::with_catalog(Catalog::Exists)
    }

    pub fn with_catalog(catalog: Catalog) -> Arc<Self> {
        Arc::new(Self {
            executed: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            catalog: Mutex::new(catalog),
            lookups: Mutex::new(Vec::new()),
        })
    }

    /// Queue the response for the next `execute`; unscripted executes return no rows
    pub fn respond(&self, response: OrmResult<Rows>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn statements(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.statement.clone())
            .collect()
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.iter().map(|c| c.statement.clone()).collect())
            .collect()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().unwrap().clone()
    }
}

impl Connection for RecordingConnection {
    fn execute(&self, command: Command) -> Pending<Rows> {
        self.executed.lock().unwrap().push(command);
        let response = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
        Box::pin(async move { response })
    }

    fn batch(&self, commands: Vec<Command>, _options: BatchOptions) -> Pending<()> {
        self.batches.lock().unwrap().push(commands);
        Box::pin(async { Ok(()) })
    }

    fn table_metadata(&self, table: &str) -> Pending<Option<TableMetadata>> {
        self.lookups.lock().unwrap().push(table.to_string());
        let answer = match &*self.catalog.lock().unwrap() {
            Catalog::Exists => Ok(Some(TableMetadata {
                name: table.to_string(),
                schema: "public".to_string(),
                columns: Vec::new(),
            })),
            Catalog::Missing => Ok(None),
            Catalog::NotFound => Err(OrmError::NotFound(table.to_string())),
            Catalog::Fails(msg) => Err(OrmError::Transport(msg.clone())),
        };
        Box::pin(async move { answer })
    }
}

/// Builder whose statements spell out the operation and its arguments
pub struct EchoBuilder {
    table: String,
}

impl EchoBuilder {
    pub fn new(schema: &Schema) -> Self {
        Self {
            table: schema.table().to_string(),
        }
    }

    fn command(&self, op: &str, args: serde_json::Value) -> Command {
        Command::new(format!("{op} {} {args}", self.table))
    }
}

impl CommandBuilder for EchoBuilder {
    fn table_name(&self) -> String {
        self.table.clone()
    }

    fn select_all(&self, filter: &Conditions, _consistency: Option<Consistency>) -> Command {
        self.command("select_all", json!(filter))
    }

    fn select(
        &self,
        columns: &[String],
        filter: &Conditions,
        _consistency: Option<Consistency>,
    ) -> Command {
        self.command("select", json!([columns, filter]))
    }

    fn select_one(
        &self,
        conds: &Conditions,
        order: Option<&Order>,
        offset: Option<u64>,
        _consistency: Option<Consistency>,
    ) -> Command {
        self.command("select_one", json!([conds, order, offset]))
    }

    fn select_by_id(&self, id: &Identity, _consistency: Option<Consistency>) -> Command {
        self.command("select_by_id", json!(id))
    }

    fn count(
        &self,
        conds: &Conditions,
        limit: Option<u64>,
        offset: Option<u64>,
        _consistency: Option<Consistency>,
    ) -> Command {
        self.command("count", json!([conds, limit, offset]))
    }

    fn insert(&self, data: &Record, _options: &WriteOptions) -> Command {
        self.command("insert", json!(data))
    }

    fn update(&self, data: &Record, conds: &Conditions, _options: &WriteOptions) -> Command {
        self.command("update", json!([data, conds]))
    }

    fn update_by_id(&self, data: &Record, id: &Identity, _options: &WriteOptions) -> Command {
        self.command("update_by_id", json!([data, id]))
    }

    fn destroy(&self, columns: &[String], conds: &Conditions, _options: &WriteOptions) -> Command {
        self.command("destroy", json!([columns, conds]))
    }

    fn destroy_all(&self, conds: &Conditions, _options: &WriteOptions) -> Command {
        self.command("destroy_all", json!(conds))
    }

    fn destroy_by_id(&self, id: &Identity, _options: &WriteOptions) -> Command {
        self.command("destroy_by_id", json!(id))
    }

    fn truncate(&self) -> Command {
        self.command("truncate", json!(null))
    }

    fn alter_table(&self, changes: &[TableChange]) -> Command {
        self.command("alter_table", json!(changes))
    }

    fn create_table(&self) -> Command {
        self.command("create_table", json!(null))
    }
}

/// Statement prefix up to the table name, e.g. `"insert user"`
pub fn op(statement: &str) -> String {
    statement.splitn(3, ' ').take(2).collect::<Vec<_>>().join(" ")
}
