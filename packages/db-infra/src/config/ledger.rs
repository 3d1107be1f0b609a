//! Layout of the version ledger table.

use serde::Deserialize;

use crate::error::DbInfraError;

pub const DEFAULT_SCHEMA_NAME: &str = "public";
pub const DEFAULT_TABLE_NAME: &str = "version_info";
pub const DEFAULT_UNIQUE_INDEX_NAME: &str = "uc_version";

pub const VERSION_COLUMN: &str = "version";
pub const DESCRIPTION_COLUMN: &str = "description";
pub const APPLIED_ON_COLUMN: &str = "applied_on";

/// Where the ledger lives. Schema and table are overridable from
/// `DbSettings.Ledger`; column names are fixed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LedgerConfig {
    pub schema_name: String,
    pub table_name: String,
    pub unique_index_name: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            schema_name: DEFAULT_SCHEMA_NAME.to_string(),
            table_name: DEFAULT_TABLE_NAME.to_string(),
            unique_index_name: DEFAULT_UNIQUE_INDEX_NAME.to_string(),
        }
    }
}

impl LedgerConfig {
    /// The ledger creates its schema when it is not the server default.
    pub fn owns_schema(&self) -> bool {
        self.schema_name != DEFAULT_SCHEMA_NAME
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema_name, self.table_name)
    }

    /// Names end up in DDL; only plain identifiers are accepted.
    pub fn validate(&self) -> Result<(), DbInfraError> {
        for (field, value) in [
            ("SchemaName", &self.schema_name),
            ("TableName", &self.table_name),
            ("UniqueIndexName", &self.unique_index_name),
        ] {
            if !is_plain_identifier(value) {
                return Err(DbInfraError::config(format!(
                    "Ledger.{field} must match [A-Za-z_][A-Za-z0-9_]{{0,62}}, got '{value}'"
                )));
            }
        }
        Ok(())
    }
}

fn is_plain_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    value.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
