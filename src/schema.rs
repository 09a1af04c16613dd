//! Entity schema
//!
//! Field and primary-key metadata for one entity type, plus default generation,
//! identity projection and decoding of raw backend values.

use crate::error::{configuration_error, OrmResult};
use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// One record's data. Absent keys and `Value::Null` are different things.
pub type Record = Map<String, Value>;

/// Column types an entity field can map to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Text,
    Int,
    BigInt,
    Double,
    Boolean,
    Uuid,
    Timestamp,
    Json,
}

/// Declaration of a single field
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,

    #[serde(default)]
    pub primary_key: bool,

    /// `Some(Value::Null)` is a declared null default, `None` means no default.
    #[serde(default, deserialize_with = "declared_default", skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn declared_default<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl FieldDef {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            ..Self::default()
        }
    }

    /// A primary-key field of the given type
    pub fn key(field_type: FieldType) -> Self {
        Self {
            field_type,
            primary_key: true,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Produces one value per primary-key field, in key order
#[derive(Clone)]
pub struct KeyGenerator(Arc<dyn Fn() -> Vec<Value> + Send + Sync>);

impl KeyGenerator {
    pub fn new<F>(generate: F) -> Self
    where
        F: Fn() -> Vec<Value> + Send + Sync + 'static,
    {
        Self(Arc::new(generate))
    }

    /// Random v4 UUIDs for `uuid` keys; every other key is left for the backend (null).
    fn for_fields(key_types: Vec<FieldType>) -> Self {
        Self::new(move || {
            key_types
                .iter()
                .map(|ty| match ty {
                    FieldType::Uuid => Value::String(Uuid::new_v4().to_string()),
                    _ => Value::Null,
                })
                .collect()
        })
    }

    pub fn generate(&self) -> Vec<Value> {
        (self.0)()
    }
}

impl fmt::Debug for KeyGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyGenerator(..)")
    }
}

/// Raw schema declaration, as written by callers or loaded from a declaration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldDef>,

    /// Ordered key fields. When empty, fields flagged `primaryKey` are used in name order.
    #[serde(default)]
    pub primary_keys: Vec<String>,

    #[serde(skip)]
    pub key_generator: Option<KeyGenerator>,
}

impl SchemaInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    pub fn primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn key_generator<F>(mut self, generate: F) -> Self
    where
        F: Fn() -> Vec<Value> + Send + Sync + 'static,
    {
        self.key_generator = Some(KeyGenerator::new(generate));
        self
    }

    fn resolved_primary_keys(&self) -> Vec<String> {
        if !self.primary_keys.is_empty() {
            return self.primary_keys.clone();
        }
        self.fields
            .iter()
            .filter(|(_, def)| def.primary_key)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Check a declaration for the mistakes the runtime would otherwise carry silently:
    /// bad identifiers, no key, keys that are not fields.
    pub fn check(&self, entity: &str) -> OrmResult<()> {
        for name in self.table.iter().chain(self.fields.keys()) {
            validate_identifier(name).map_err(|e| {
                configuration_error(format!("{entity}: {}", e.message.unwrap_or_default()))
            })?;
        }

        let keys = self.resolved_primary_keys();
        if keys.is_empty() {
            return Err(configuration_error(format!("{entity}: no primary key declared")));
        }
        if let Some(missing) = keys.iter().find(|k| !self.fields.contains_key(*k)) {
            return Err(configuration_error(format!(
                "{entity}: primary key '{missing}' is not a declared field"
            )));
        }
        Ok(())
    }
}

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_$]*$").expect("identifier pattern compiles"));

/// Validate a table or column identifier
pub fn validate_identifier(name: &str) -> Result<(), validator::ValidationError> {
    if name.is_empty() || name.len() > 63 || !IDENTIFIER.is_match(name) {
        let mut err = validator::ValidationError::new("invalid_identifier");
        err.message = Some(
            format!("Invalid identifier '{name}'. Must start with a letter or underscore and contain only letters, digits, underscores.")
                .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// Primary-key value(s) of a record
///
/// A single-key schema yields a bare value, anything else an ordered list. Callers
/// must keep whichever shape they were handed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identity {
    Composite(Vec<Value>),
    Single(Value),
}

impl Identity {
    /// Key values in schema order
    pub fn values(&self) -> Vec<&Value> {
        match self {
            Identity::Single(value) => vec![value],
            Identity::Composite(values) => values.iter().collect(),
        }
    }
}

impl From<Value> for Identity {
    fn from(value: Value) -> Self {
        Identity::Single(value)
    }
}

impl From<Vec<Value>> for Identity {
    fn from(values: Vec<Value>) -> Self {
        Identity::Composite(values)
    }
}

/// Resolved schema of one entity type
#[derive(Debug, Clone)]
pub struct Schema {
    name: String,
    table: String,
    fields: BTreeMap<String, FieldDef>,
    primary_keys: Vec<String>,
    key_generator: KeyGenerator,
}

impl Schema {
    pub fn new(name: impl Into<String>, info: SchemaInfo) -> Self {
        let name = name.into();
        let primary_keys = info.resolved_primary_keys();
        let table = info.table.clone().unwrap_or_else(|| snake_case(&name));
        let key_generator = info.key_generator.clone().unwrap_or_else(|| {
            KeyGenerator::for_fields(
                primary_keys
                    .iter()
                    .map(|k| info.fields.get(k).map(|f| f.field_type).unwrap_or_default())
                    .collect(),
            )
        });

        Self {
            name,
            table,
            fields: info.fields,
            primary_keys,
            key_generator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldDef> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn is_primary_key(&self, field: &str) -> bool {
        self.primary_keys.iter().any(|k| k == field)
    }

    pub fn generate_keys(&self) -> Vec<Value> {
        self.key_generator.generate()
    }

    /// Fresh record: generated key values plus declared non-key defaults
    pub fn defaults(&self) -> Record {
        let mut defaults = Record::new();

        for (key, value) in self.primary_keys.iter().zip(self.generate_keys()) {
            defaults.insert(key.clone(), value);
        }

        for (name, def) in &self.fields {
            if self.is_primary_key(name) {
                continue;
            }
            if let Some(default) = &def.default {
                defaults.insert(name.clone(), default.clone());
            }
        }

        defaults
    }

    /// Project `data` over the primary keys
    pub fn identity(&self, data: &Record) -> Identity {
        let mut values: Vec<Value> = self
            .primary_keys
            .iter()
            .map(|k| data.get(k).cloned().unwrap_or(Value::Null))
            .collect();

        if values.len() == 1 {
            Identity::Single(values.remove(0))
        } else {
            Identity::Composite(values)
        }
    }

    /// Convert a raw backend value into the field's in-memory representation
    pub fn from_database(&self, raw: Value, field: &str) -> Value {
        let Some(def) = self.fields.get(field) else {
            return raw;
        };
        if raw.is_null() {
            return raw;
        }

        match (def.field_type, raw) {
            (FieldType::Json, Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            (FieldType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64() != Some(0)),
            (FieldType::Boolean, Value::String(s)) => match s.as_str() {
                "true" | "t" | "1" => Value::Bool(true),
                "false" | "f" | "0" => Value::Bool(false),
                _ => Value::String(s),
            },
            (FieldType::Int | FieldType::BigInt, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).unwrap_or(Value::String(s))
            }
            (FieldType::Double, Value::String(s)) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or(Value::String(s)),
            (FieldType::Timestamp, Value::Number(n)) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
                .map(|ts| Value::String(ts.to_rfc3339()))
                .unwrap_or(Value::Number(n)),
            (FieldType::Timestamp, Value::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|ts| Value::String(ts.with_timezone(&Utc).to_rfc3339()))
                .unwrap_or(Value::String(s)),
            (FieldType::Uuid, Value::String(s)) => Value::String(s.to_lowercase()),
            (_, raw) => raw,
        }
    }
}

/// `UserProfile` -> `user_profile`
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.extend(ch.to_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
