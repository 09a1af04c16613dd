//! PostgreSQL command builder
//!
//! Generates parameterised statements for one entity schema. Parameters are typed from
//! the schema's field types so the server sees the same types the table was created
//! with. Consistency levels, TTLs and write timestamps have no PostgreSQL counterpart
//! and are ignored.

use super::queries::SqlBuilder;
use crate::command::{
    Command, CommandBuilder, Conditions, Consistency, Order, Param, TableChange, WriteOptions,
};
use crate::schema::{FieldType, Identity, Record, Schema};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub struct PgCommandBuilder {
    schema: Arc<Schema>,
    namespace: String,
}

/// Accumulates `$n` placeholders and their parameters for one statement
struct Placeholders<'a> {
    schema: &'a Schema,
    params: Vec<Param>,
}

impl<'a> Placeholders<'a> {
    fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            params: Vec::new(),
        }
    }

    fn bind(&mut self, field: &str, value: &Value) -> String {
        let field_type = self.schema.field(field).map(|f| f.field_type);
        self.params.push(to_param(field_type, value));
        format!("${}", self.params.len())
    }

    /// `"a" = $1 AND "b" IS NULL`
    fn conditions<'v, I>(&mut self, conds: I) -> Option<String>
    where
        I: IntoIterator<Item = (&'v String, &'v Value)>,
    {
        let clauses: Vec<String> = conds
            .into_iter()
            .map(|(field, value)| {
                let column = SqlBuilder::quote_ident(field);
                if value.is_null() {
                    format!("{column} IS NULL")
                } else {
                    format!("{column} = {}", self.bind(field, value))
                }
            })
            .collect();

        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" AND "))
        }
    }

    /// WHERE clause for `conds`; `None` matches no row at all
    fn filter(&mut self, conds: Option<&Conditions>) -> String {
        match conds {
            Some(conds) => where_clause(self.conditions(conds)),
            None => " WHERE false".to_string(),
        }
    }

    fn finish(self, statement: String) -> Command {
        Command::with_params(statement, self.params)
    }
}

fn where_clause(conditions: Option<String>) -> String {
    conditions.map(|c| format!(" WHERE {c}")).unwrap_or_default()
}

impl PgCommandBuilder {
    pub fn new(schema: Arc<Schema>, namespace: &str) -> Self {
        Self {
            schema,
            namespace: namespace.to_string(),
        }
    }

    fn table(&self) -> String {
        SqlBuilder::qualified(&self.namespace, self.schema.table())
    }

    /// Conditions addressing the record `id` names
    ///
    /// `None` when the schema has no key or `id` does not carry one value per key field.
    fn id_conditions(&self, id: &Identity) -> Option<Conditions> {
        let keys = self.schema.primary_keys();
        let values = id.values();

        if keys.is_empty() || keys.len() != values.len() {
            warn!(
                "{}: identity with {} value(s) does not fit key ({}), statement matches nothing",
                self.schema.name(),
                values.len(),
                keys.join(", ")
            );
            return None;
        }

        Some(keys.iter().cloned().zip(values.into_iter().cloned()).collect())
    }

    fn update_statement(
        &self,
        data: &Record,
        conds: Option<&Conditions>,
        skip_keys: bool,
    ) -> Command {
        let mut ph = Placeholders::new(&self.schema);

        let mut sets: Vec<String> = data
            .iter()
            .filter(|(field, _)| !(skip_keys && self.schema.is_primary_key(field)))
            .map(|(field, value)| {
                format!("{} = {}", SqlBuilder::quote_ident(field), ph.bind(field, value))
            })
            .collect();

        // Nothing but keys to write: keep the statement valid and side-effect free.
        if sets.is_empty() {
            if let Some(key) = self.schema.primary_keys().first() {
                let column = SqlBuilder::quote_ident(key);
                sets.push(format!("{column} = {column}"));
            }
        }

        let filter = ph.filter(conds);
        ph.finish(format!(
            "UPDATE {} SET {}{} RETURNING *",
            self.table(),
            sets.join(", "),
            filter
        ))
    }

    fn select_statement(
        &self,
        columns: &[String],
        conds: Option<&Conditions>,
        order: Option<&Order>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Command {
        let mut ph = Placeholders::new(&self.schema);

        let projection = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| SqlBuilder::quote_ident(c))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut sql = format!(
            "SELECT {} FROM {}{}",
            projection,
            self.table(),
            ph.filter(conds)
        );
        if let Some(order) = order {
            sql.push_str(&format!(
                " ORDER BY {} {}",
                SqlBuilder::quote_ident(&order.field),
                if order.descending { "DESC" } else { "ASC" }
            ));
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        ph.finish(sql)
    }

    fn delete_statement(&self, conds: Option<&Conditions>) -> Command {
        let mut ph = Placeholders::new(&self.schema);
        let filter = ph.filter(conds);
        ph.finish(format!("DELETE FROM {}{}", self.table(), filter))
    }

    /// Single integer key: let the server number rows
    fn is_identity_column(&self, field: &str) -> bool {
        let keys = self.schema.primary_keys();
        keys.len() == 1
            && keys[0] == field
            && matches!(
                self.schema.field(field).map(|f| f.field_type),
                Some(FieldType::Int | FieldType::BigInt)
            )
    }
}

impl CommandBuilder for PgCommandBuilder {
    fn table_name(&self) -> String {
        self.schema.table().to_string()
    }

    fn select_all(&self, filter: &Conditions, _consistency: Option<Consistency>) -> Command {
        self.select_statement(&[], Some(filter), None, None, None)
    }

    fn select(
        &self,
        columns: &[String],
        filter: &Conditions,
        _consistency: Option<Consistency>,
    ) -> Command {
        self.select_statement(columns, Some(filter), None, None, None)
    }

    fn select_one(
        &self,
        conds: &Conditions,
        order: Option<&Order>,
        offset: Option<u64>,
        _consistency: Option<Consistency>,
    ) -> Command {
        self.select_statement(&[], Some(conds), order, Some(1), offset)
    }

    fn select_by_id(&self, id: &Identity, _consistency: Option<Consistency>) -> Command {
        self.select_statement(&[], self.id_conditions(id).as_ref(), None, Some(1), None)
    }

    fn count(
        &self,
        conds: &Conditions,
        limit: Option<u64>,
        offset: Option<u64>,
        _consistency: Option<Consistency>,
    ) -> Command {
        let inner = self.select_statement(&[], Some(conds), None, limit, offset);
        Command::with_params(
            format!("SELECT COUNT(*) AS count FROM ({}) AS counted", inner.statement),
            inner.params,
        )
    }

    fn insert(&self, data: &Record, _options: &WriteOptions) -> Command {
        let mut ph = Placeholders::new(&self.schema);
        let mut columns = Vec::new();
        let mut values = Vec::new();

        for (field, value) in data {
            // Unset keys are left to the column default (identity / generated).
            if value.is_null() && self.schema.is_primary_key(field) {
                continue;
            }
            columns.push(SqlBuilder::quote_ident(field));
            values.push(ph.bind(field, value));
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES RETURNING *", self.table())
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                self.table(),
                columns.join(", "),
                values.join(", ")
            )
        };
        ph.finish(sql)
    }

    fn update(&self, data: &Record, conds: &Conditions, _options: &WriteOptions) -> Command {
        self.update_statement(data, Some(conds), false)
    }

    fn update_by_id(&self, data: &Record, id: &Identity, _options: &WriteOptions) -> Command {
        self.update_statement(data, self.id_conditions(id).as_ref(), true)
    }

    fn destroy(&self, columns: &[String], conds: &Conditions, options: &WriteOptions) -> Command {
        if columns.is_empty() {
            return self.destroy_all(conds, options);
        }

        let mut ph = Placeholders::new(&self.schema);
        let sets: Vec<String> = columns
            .iter()
            .map(|c| format!("{} = NULL", SqlBuilder::quote_ident(c)))
            .collect();
        let filter = where_clause(ph.conditions(conds));
        ph.finish(format!("UPDATE {} SET {}{}", self.table(), sets.join(", "), filter))
    }

    fn destroy_all(&self, conds: &Conditions, _options: &WriteOptions) -> Command {
        self.delete_statement(Some(conds))
    }

    fn destroy_by_id(&self, id: &Identity, _options: &WriteOptions) -> Command {
        self.delete_statement(self.id_conditions(id).as_ref())
    }

    fn truncate(&self) -> Command {
        Command::new(format!("TRUNCATE TABLE {}", self.table()))
    }

    /// Renames cannot share an ALTER with other actions, so they become extra statements.
    fn alter_table(&self, changes: &[TableChange]) -> Command {
        let table = self.table();
        let mut actions = Vec::new();
        let mut statements = Vec::new();

        for change in changes {
            match change {
                TableChange::AddColumn { name, field_type } => actions.push(format!(
                    "ADD COLUMN IF NOT EXISTS {} {}",
                    SqlBuilder::quote_ident(name),
                    SqlBuilder::column_type(*field_type)
                )),
                TableChange::DropColumn { name } => actions.push(format!(
                    "DROP COLUMN IF EXISTS {}",
                    SqlBuilder::quote_ident(name)
                )),
                TableChange::RenameColumn { from, to } => statements.push(format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    table,
                    SqlBuilder::quote_ident(from),
                    SqlBuilder::quote_ident(to)
                )),
            }
        }

        if !actions.is_empty() {
            statements.insert(0, format!("ALTER TABLE {} {}", table, actions.join(", ")));
        }
        Command::new(statements.join(";\n"))
    }

    fn create_table(&self) -> Command {
        let columns: Vec<String> = self
            .schema
            .fields()
            .iter()
            .map(|(name, def)| {
                let mut column = format!(
                    "    {} {}",
                    SqlBuilder::quote_ident(name),
                    SqlBuilder::column_type(def.field_type)
                );
                if self.is_identity_column(name) {
                    column.push_str(" GENERATED BY DEFAULT AS IDENTITY");
                } else if self.schema.is_primary_key(name) {
                    column.push_str(" NOT NULL");
                }
                column
            })
            .collect();

        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n{}",
            self.table(),
            columns.join(",\n")
        );

        if !self.schema.primary_keys().is_empty() {
            let keys: Vec<String> = self
                .schema
                .primary_keys()
                .iter()
                .map(|k| SqlBuilder::quote_ident(k))
                .collect();
            sql.push_str(&format!(",\n    PRIMARY KEY ({})", keys.join(", ")));
        }

        sql.push_str("\n)");
        Command::new(sql)
    }
}

/// Convert a JSON value into the parameter type of its column
///
/// Values that do not convert become `Param::Invalid`, which the connection refuses to
/// execute instead of binding a NULL in their place.
fn to_param(field_type: Option<FieldType>, value: &Value) -> Param {
    let field_type = field_type.unwrap_or_default();
    if value.is_null() {
        return null_param(field_type);
    }

    let converted = match field_type {
        FieldType::Text => Some(Param::Text(Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }))),
        FieldType::Int => as_i64(value)
            .and_then(|n| i32::try_from(n).ok())
            .map(|n| Param::Int(Some(n))),
        FieldType::BigInt => as_i64(value).map(|n| Param::BigInt(Some(n))),
        FieldType::Double => match value {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }
        .map(|n| Param::Double(Some(n))),
        FieldType::Boolean => as_bool(value).map(|b| Param::Boolean(Some(b))),
        FieldType::Uuid => value
            .as_str()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(|id| Param::Uuid(Some(id))),
        FieldType::Timestamp => match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
        .map(|ts| Param::Timestamp(Some(ts))),
        FieldType::Json => Some(Param::Json(Some(value.clone()))),
    };

    converted.unwrap_or_else(|| Param::Invalid {
        field_type,
        value: value.clone(),
    })
}

fn null_param(field_type: FieldType) -> Param {
    match field_type {
        FieldType::Text => Param::Text(None),
        FieldType::Int => Param::Int(None),
        FieldType::BigInt => Param::BigInt(None),
        FieldType::Double => Param::Double(None),
        FieldType::Boolean => Param::Boolean(None),
        FieldType::Uuid => Param::Uuid(None),
        FieldType::Timestamp => Param::Timestamp(None),
        FieldType::Json => Param::Json(None),
    }
}

/// Integers, integral floats and numeric strings
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDef, SchemaInfo};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn builder() -> PgCommandBuilder {
        let schema = Schema::new(
            "User",
            SchemaInfo::new()
                .field("id", FieldDef::key(FieldType::Int))
                .field("email", FieldDef::new(FieldType::Text))
                .field("profile", FieldDef::new(FieldType::Json)),
        );
        PgCommandBuilder::new(Arc::new(schema), "public")
    }

    fn composite() -> PgCommandBuilder {
        let schema = Schema::new(
            "Membership",
            SchemaInfo::new()
                .field("org", FieldDef::key(FieldType::Uuid))
                .field("member", FieldDef::key(FieldType::BigInt))
                .field("role", FieldDef::new(FieldType::Text))
                .primary_keys(["org", "member"]),
        );
        PgCommandBuilder::new(Arc::new(schema), "app")
    }

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_table_with_identity_key() {
        let command = builder().create_table();
        assert_eq!(
            command.statement,
            "CREATE TABLE IF NOT EXISTS \"public\".\"user\" (\n    \"email\" text,\n    \"id\" integer GENERATED BY DEFAULT AS IDENTITY,\n    \"profile\" jsonb,\n    PRIMARY KEY (\"id\")\n)"
        );
        assert!(command.params.is_empty());
    }

    #[test]
    fn test_create_table_with_composite_key() {
        let command = composite().create_table();
        assert!(command.statement.contains("\"member\" bigint NOT NULL"));
        assert!(command.statement.contains("\"org\" uuid NOT NULL"));
        assert!(command.statement.ends_with("PRIMARY KEY (\"org\", \"member\")\n)"));
    }

    #[test]
    fn test_insert_skips_null_keys_and_types_params() {
        let command = builder().insert(
            &record(json!({"id": null, "email": "a@b.c", "profile": {"x": 1}})),
            &WriteOptions::default(),
        );

        assert_eq!(
            command.statement,
            "INSERT INTO \"public\".\"user\" (\"email\", \"profile\") VALUES ($1, $2) RETURNING *"
        );
        assert_eq!(
            command.params,
            vec![
                Param::Text(Some("a@b.c".to_string())),
                Param::Json(Some(json!({"x": 1})))
            ]
        );
    }

    #[test]
    fn test_update_by_id_leaves_keys_out_of_set() {
        let command = builder().update_by_id(
            &record(json!({"id": 4, "email": "new@b.c"})),
            &Identity::Single(json!(4)),
            &WriteOptions::default(),
        );

        assert_eq!(
            command.statement,
            "UPDATE \"public\".\"user\" SET \"email\" = $1 WHERE \"id\" = $2 RETURNING *"
        );
        assert_eq!(command.params[1], Param::Int(Some(4)));
    }

    #[test]
    fn test_composite_identity_maps_in_key_order() {
        let org = "6f1c1f7e-8f7c-4d65-a8a6-0d1f3c6a0b11";
        let command = composite().destroy_by_id(
            &Identity::Composite(vec![json!(org), json!(12)]),
            &WriteOptions::default(),
        );

        assert_eq!(
            command.statement,
            "DELETE FROM \"app\".\"membership\" WHERE \"member\" = $1 AND \"org\" = $2"
        );
        assert_eq!(
            command.params,
            vec![
                Param::BigInt(Some(12)),
                Param::Uuid(Some(Uuid::parse_str(org).unwrap()))
            ]
        );
    }

    #[test]
    fn test_keyless_identity_matches_nothing() {
        let schema = Schema::new(
            "Log",
            SchemaInfo::new().field("line", FieldDef::new(FieldType::Text)),
        );
        let id = schema.identity(&record(json!({"line": "boot"})));
        let builder = PgCommandBuilder::new(Arc::new(schema), "public");
        let options = WriteOptions::default();

        assert_eq!(
            builder.destroy_by_id(&id, &options).statement,
            "DELETE FROM \"public\".\"log\" WHERE false"
        );
        assert_eq!(
            builder
                .update_by_id(&record(json!({"line": "x"})), &id, &options)
                .statement,
            "UPDATE \"public\".\"log\" SET \"line\" = $1 WHERE false RETURNING *"
        );
        assert_eq!(
            builder.select_by_id(&id, None).statement,
            "SELECT * FROM \"public\".\"log\" WHERE false LIMIT 1"
        );
    }

    #[test]
    fn test_identity_of_wrong_length_matches_nothing() {
        let builder = composite();
        let options = WriteOptions::default();

        let single = builder.destroy_by_id(&Identity::Single(json!(1)), &options);
        assert_eq!(single.statement, "DELETE FROM \"app\".\"membership\" WHERE false");
        assert!(single.params.is_empty());

        let too_long = builder.destroy_by_id(
            &Identity::Composite(vec![json!("a"), json!(1), json!(2)]),
            &options,
        );
        assert_eq!(too_long.statement, "DELETE FROM \"app\".\"membership\" WHERE false");
    }

    #[test]
    fn test_unconvertible_values_are_marked_invalid() {
        let schema = Schema::new(
            "Account",
            SchemaInfo::new()
                .field("id", FieldDef::key(FieldType::Int))
                .field("age", FieldDef::new(FieldType::Int))
                .field("active", FieldDef::new(FieldType::Boolean))
                .field("ref", FieldDef::new(FieldType::Uuid)),
        );
        let builder = PgCommandBuilder::new(Arc::new(schema), "public");

        let command = builder.update_by_id(
            &record(json!({"id": 1, "age": 3000000000u64, "active": "maybe", "ref": "not-a-uuid"})),
            &Identity::Single(json!(1)),
            &WriteOptions::default(),
        );

        assert_eq!(
            command.params,
            vec![
                Param::Invalid {
                    field_type: FieldType::Boolean,
                    value: json!("maybe")
                },
                Param::Invalid {
                    field_type: FieldType::Int,
                    value: json!(3000000000u64)
                },
                Param::Invalid {
                    field_type: FieldType::Uuid,
                    value: json!("not-a-uuid")
                },
                Param::Int(Some(1)),
            ]
        );
    }

    #[test]
    fn test_lenient_conversions_keep_values() {
        assert_eq!(to_param(Some(FieldType::Int), &json!(5.0)), Param::Int(Some(5)));
        assert_eq!(to_param(Some(FieldType::Int), &json!("42")), Param::Int(Some(42)));
        assert_eq!(
            to_param(Some(FieldType::Boolean), &json!("true")),
            Param::Boolean(Some(true))
        );
        assert_eq!(to_param(Some(FieldType::Boolean), &json!(0)), Param::Boolean(Some(false)));
        assert_eq!(to_param(Some(FieldType::Uuid), &Value::Null), Param::Uuid(None));
        assert!(matches!(
            to_param(Some(FieldType::Int), &json!(5.5)),
            Param::Invalid { .. }
        ));
        assert!(matches!(
            to_param(Some(FieldType::Timestamp), &json!(true)),
            Param::Invalid { .. }
        ));
    }

    #[test]
    fn test_select_one_orders_and_offsets() {
        let command = builder().select_one(
            &record(json!({"email": null})),
            Some(&Order::desc("id")),
            Some(2),
            Some(Consistency::Quorum),
        );

        assert_eq!(
            command.statement,
            "SELECT * FROM \"public\".\"user\" WHERE \"email\" IS NULL ORDER BY \"id\" DESC LIMIT 1 OFFSET 2"
        );
        assert!(command.params.is_empty());
    }

    #[test]
    fn test_count_wraps_limited_select() {
        let command = builder().count(&record(json!({"email": "x"})), Some(10), None, None);
        assert_eq!(
            command.statement,
            "SELECT COUNT(*) AS count FROM (SELECT * FROM \"public\".\"user\" WHERE \"email\" = $1 LIMIT 10) AS counted"
        );
    }

    #[test]
    fn test_destroy_columns_nulls_them() {
        let command = builder().destroy(
            &["profile".to_string()],
            &record(json!({"id": 1})),
            &WriteOptions::default(),
        );
        assert_eq!(
            command.statement,
            "UPDATE \"public\".\"user\" SET \"profile\" = NULL WHERE \"id\" = $1"
        );
    }

    #[test]
    fn test_alter_table_splits_renames() {
        let command = builder().alter_table(&[
            TableChange::AddColumn {
                name: "age".to_string(),
                field_type: FieldType::Int,
            },
            TableChange::RenameColumn {
                from: "email".to_string(),
                to: "mail".to_string(),
            },
            TableChange::DropColumn {
                name: "profile".to_string(),
            },
        ]);

        assert_eq!(
            command.statement,
            "ALTER TABLE \"public\".\"user\" ADD COLUMN IF NOT EXISTS \"age\" integer, DROP COLUMN IF EXISTS \"profile\";\nALTER TABLE \"public\".\"user\" RENAME COLUMN \"email\" TO \"mail\""
        );
    }
}
