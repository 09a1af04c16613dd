//! SchemaFlow ORM - deferred entity runtime
//!
//! Entity classes can be declared and used before the database is reachable. Every
//! command issued while a class is unbound is queued in call order and forwarded once
//! the backend publishes its connection and the class has reconciled its table.

pub mod command;
pub mod config;
pub mod connection;
pub mod db;
pub mod declaration;
pub mod dispatch;
pub mod error;
pub mod model;
pub mod orm;
pub mod readiness;
pub mod schema;

#[cfg(test)]
mod testing;

pub use command::{
    BatchOptions, Command, CommandBuilder, Conditions, Consistency, Order, Param, TableChange,
    WriteOptions,
};
pub use connection::{Cell, Connection, Pending, Row, Rows, TableMetadata};
pub use db::{PgCommandBuilder, PgConnection};
pub use error::{OrmError, OrmResult};
pub use model::{Entity, EntityClass};
pub use orm::{ModelEvent, Orm};
pub use schema::{FieldDef, FieldType, Identity, Record, Schema, SchemaInfo};
