//! PostgreSQL backend
//!
//! A pooled `Connection` implementation plus the command builder that targets it.

mod builder;
pub mod queries;

pub use builder::PgCommandBuilder;

use crate::command::{BatchOptions, Command, Param};
use crate::config::DatabaseConfig;
use crate::connection::{Cell, ColumnMetadata, Connection, Pending, Row, Rows, TableMetadata};
use crate::error::{configuration_error, not_found_error, OrmError, OrmResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use postgres_types::{ToSql, Type};
use queries::{GET_TABLE_COLUMNS, PING};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_postgres::NoTls;
use tracing::{debug, info, warn};
use uuid::Uuid;

type BoxedParam = Box<dyn ToSql + Sync + Send>;

/// Pooled PostgreSQL connection
pub struct PgConnection {
    pool: Pool,
    namespace: String,
}

impl PgConnection {
    /// Create a pool from `config` and verify it with a round trip
    pub async fn connect(config: &DatabaseConfig) -> OrmResult<Arc<Self>> {
        let pool = Self::create_pool(config)?;

        let client = pool.get().await?;
        client.query_one(PING, &[]).await?;
        drop(client);

        info!(
            "Database pool established ({}:{}/{}, TLS: {})",
            config.host, config.port, config.database, config.use_tls
        );
        Ok(Self::from_pool(pool, &config.namespace))
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: Pool, namespace: &str) -> Arc<Self> {
        Arc::new(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create_pool(config: &DatabaseConfig) -> OrmResult<Pool> {
        let mut cfg = Config::new();
        cfg.host = Some(config.host.clone());
        cfg.port = Some(config.port);
        cfg.user = Some(config.user.clone());
        cfg.password = Some(config.password.clone());
        cfg.dbname = Some(config.database.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(config.max_pool_size));

        if config.use_tls {
            let certs = rustls_native_certs::load_native_certs();
            let mut root_store = rustls::RootCertStore::empty();
            for cert in certs.certs {
                root_store.add(cert).ok();
            }

            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth();
            let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);

            cfg.create_pool(Some(Runtime::Tokio1), tls)
                .map_err(|e| configuration_error(format!("Failed to create TLS pool: {}", e)))
        } else {
            cfg.create_pool(Some(Runtime::Tokio1), NoTls)
                .map_err(|e| configuration_error(format!("Failed to create pool: {}", e)))
        }
    }
}

/// Start `work` now when a runtime is available, without waiting for the first poll
///
/// Each statement runs as its own task; statements issued back to back may reach the
/// server in either order.
fn issue<T, F>(work: F) -> Pending<T>
where
    T: Send + 'static,
    F: Future<Output = OrmResult<T>> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            let task = handle.spawn(work);
            Box::pin(async move {
                task.await
                    .map_err(|e| OrmError::Internal(format!("statement task failed: {}", e)))?
            })
        }
        Err(_) => Box::pin(work),
    }
}

impl Connection for PgConnection {
    fn execute(&self, command: Command) -> Pending<Rows> {
        issue(run_query(self.pool.clone(), command))
    }

    fn batch(&self, commands: Vec<Command>, options: BatchOptions) -> Pending<()> {
        issue(run_batch(self.pool.clone(), commands, options))
    }

    fn table_metadata(&self, table: &str) -> Pending<Option<TableMetadata>> {
        issue(load_table(
            self.pool.clone(),
            self.namespace.clone(),
            table.to_string(),
        ))
    }
}

async fn run_query(pool: Pool, command: Command) -> OrmResult<Rows> {
    let client = pool.get().await?;
    debug!("execute: {}", command.statement);

    // Multi-statement commands (ALTER + RENAME) go through the simple protocol.
    if command.params.is_empty() && command.statement.contains(';') {
        client.batch_execute(&command.statement).await?;
        return Ok(Vec::new());
    }

    let params = to_sql_params(command.params)?;
    let rows = client
        .query(command.statement.as_str(), &param_refs(&params))
        .await?;
    rows.iter().map(|row| decode_row(row).map(Some)).collect()
}

async fn run_batch(pool: Pool, commands: Vec<Command>, options: BatchOptions) -> OrmResult<()> {
    let mut client = pool.get().await?;
    debug!("batch: {} command(s), atomic: {}", commands.len(), options.atomic);

    if !options.atomic {
        for command in commands {
            let params = to_sql_params(command.params)?;
            client
                .execute(command.statement.as_str(), &param_refs(&params))
                .await?;
        }
        return Ok(());
    }

    let transaction = client.transaction().await?;
    for command in commands {
        let params = to_sql_params(command.params)?;
        transaction
            .execute(command.statement.as_str(), &param_refs(&params))
            .await?;
    }
    transaction.commit().await?;
    Ok(())
}

async fn load_table(pool: Pool, namespace: String, table: String) -> OrmResult<Option<TableMetadata>> {
    let client = pool.get().await?;
    let rows = client.query(GET_TABLE_COLUMNS, &[&namespace, &table]).await?;

    if rows.is_empty() {
        return Err(not_found_error(format!("table {}.{}", namespace, table)));
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        columns.push(ColumnMetadata {
            name: row.try_get("column_name")?,
            data_type: row.try_get("data_type")?,
            nullable: row.try_get("nullable")?,
            is_primary_key: row.try_get("is_primary_key")?,
        });
    }

    Ok(Some(TableMetadata {
        name: table,
        schema: namespace,
        columns,
    }))
}

fn to_sql_params(params: Vec<Param>) -> OrmResult<Vec<BoxedParam>> {
    let mut boxed: Vec<BoxedParam> = Vec::with_capacity(params.len());
    for (idx, param) in params.into_iter().enumerate() {
        boxed.push(match param {
            Param::Text(v) => Box::new(v),
            Param::Int(v) => Box::new(v),
            Param::BigInt(v) => Box::new(v),
            Param::Double(v) => Box::new(v),
            Param::Boolean(v) => Box::new(v),
            Param::Uuid(v) => Box::new(v),
            Param::Timestamp(v) => Box::new(v),
            Param::Json(v) => Box::new(v),
            Param::Invalid { field_type, value } => {
                return Err(OrmError::Decode(format!(
                    "parameter ${}: {} is not a valid {:?} value",
                    idx + 1,
                    value,
                    field_type
                )))
            }
        });
    }
    Ok(boxed)
}

fn param_refs(params: &[BoxedParam]) -> Vec<&(dyn ToSql + Sync)> {
    params
        .iter()
        .map(|p| p.as_ref() as &(dyn ToSql + Sync))
        .collect()
}

fn decode_row(row: &tokio_postgres::Row) -> OrmResult<Row> {
    let mut cells = Vec::with_capacity(row.len());
    for (idx, column) in row.columns().iter().enumerate() {
        cells.push(Cell::new(column.name(), decode_value(row, idx, column.type_())?));
    }
    Ok(Row::new(cells))
}

fn decode_value(row: &tokio_postgres::Row, idx: usize, ty: &Type) -> OrmResult<Value> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(Value::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(Value::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(Value::from),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::from),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(idx)?.map(Value::from)
        }
        Type::UUID => row
            .try_get::<_, Option<Uuid>>(idx)?
            .map(|id| Value::from(id.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|ts| Value::from(ts.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(idx)?
            .map(|ts| Value::from(ts.and_utc().to_rfc3339())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(idx)?
            .map(|d| Value::from(d.to_string())),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx)?,
        _ => match row.try_get::<_, Option<String>>(idx) {
            Ok(text) => text.map(Value::from),
            Err(_) => {
                warn!("column {} has unsupported type {}, read as null", idx, ty);
                None
            }
        },
    };
    Ok(value.unwrap_or(Value::Null))
}
