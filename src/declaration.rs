//! Entity declaration files
//!
//! A declaration file is a JSON array of entities:
//!
//! ```json
//! [
//!   {
//!     "name": "User",
//!     "table": "users",
//!     "fields": {
//!       "id": { "type": "uuid", "primaryKey": true },
//!       "email": { "type": "text" },
//!       "active": { "type": "boolean", "default": true }
//!     }
//!   }
//! ]
//! ```

use crate::error::{configuration_error, OrmError, OrmResult};
use crate::schema::{validate_identifier, SchemaInfo};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use validator::Validate;

/// One declared entity
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EntityDeclaration {
    #[validate(length(min = 1, max = 63, message = "Entity name must be between 1 and 63 characters"))]
    #[validate(custom(function = "validate_identifier"))]
    pub name: String,

    #[serde(flatten)]
    pub schema: SchemaInfo,
}

/// Parse and validate declarations from JSON text
pub fn parse_declarations(source: &str) -> OrmResult<Vec<EntityDeclaration>> {
    let declarations: Vec<EntityDeclaration> = serde_json::from_str(source)
        .map_err(|e| OrmError::Decode(format!("declaration file: {}", e)))?;

    let mut seen = HashSet::new();
    for declaration in &declarations {
        declaration
            .validate()
            .map_err(|e| configuration_error(format!("{}: {}", declaration.name, e)))?;
        declaration.schema.check(&declaration.name)?;

        if !seen.insert(declaration.name.as_str()) {
            return Err(configuration_error(format!(
                "{}: declared more than once",
                declaration.name
            )));
        }
    }

    Ok(declarations)
}

/// Read and validate a declaration file
pub fn load_declarations(path: &Path) -> OrmResult<Vec<EntityDeclaration>> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| configuration_error(format!("{}: {}", path.display(), e)))?;
    parse_declarations(&source)
}
