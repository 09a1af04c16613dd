//! SQL query constants and builders
//!
//! Catalog queries used by the PostgreSQL connection, and identifier helpers shared
//! with the command builder.

use crate::schema::FieldType;

/// Columns of one table, with primary-key membership. `$1` = schema, `$2` = table.
pub const GET_TABLE_COLUMNS: &str = r#"
    SELECT
        c.column_name,
        c.data_type,
        c.is_nullable = 'YES' AS nullable,
        COALESCE(pk.is_pk, false) AS is_primary_key
    FROM information_schema.columns c
    LEFT JOIN (
        SELECT kcu.column_name, true AS is_pk
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
            ON tc.constraint_name = kcu.constraint_name
            AND tc.table_schema = kcu.table_schema
        WHERE tc.constraint_type = 'PRIMARY KEY'
            AND tc.table_schema = $1
            AND tc.table_name = $2
    ) pk ON c.column_name = pk.column_name
    WHERE c.table_schema = $1
        AND c.table_name = $2
    ORDER BY c.ordinal_position
"#;

/// Connectivity check run when a pool is created
pub const PING: &str = "SELECT 1";

/// SQL builder for safe identifier quoting
pub struct SqlBuilder;

impl SqlBuilder {
    /// Quote an identifier (table/column name) safely
    pub fn quote_ident(ident: &str) -> String {
        // PostgreSQL identifier quoting
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// `"schema"."table"`
    pub fn qualified(namespace: &str, table: &str) -> String {
        format!("{}.{}", Self::quote_ident(namespace), Self::quote_ident(table))
    }

    /// Column type used when creating a table for a field
    pub fn column_type(field_type: FieldType) -> &'static str {
        match field_type {
            FieldType::Text => "text",
            FieldType::Int => "integer",
            FieldType::BigInt => "bigint",
            FieldType::Double => "double precision",
            FieldType::Boolean => "boolean",
            FieldType::Uuid => "uuid",
            FieldType::Timestamp => "timestamp with time zone",
            FieldType::Json => "jsonb",
        }
    }
}
