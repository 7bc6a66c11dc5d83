//! Table catalog: the static per-table field specifications
//!
//! Loaded once at process start from a TOML file and shared read-only by
//! every upload. Field order is the expected header order.
//!
//! ```toml
//! [[tables]]
//! key = "customers"
//! table = "customers"
//! unique_key = ["email"]
//!
//! [[tables.fields]]
//! name = "email"
//! type = "text"
//! required = true
//!
//! [[tables.fields]]
//! name = "tier"
//! type = "enum"
//! enum_values = ["free", "pro"]
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use stowage_common::{Result, StowageError};

/// Postgres caps a statement at 65535 bind parameters.
pub const MAX_BIND_PARAMETERS: usize = 65_535;

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap_or_else(|_| unreachable!())
});

/// Value type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Numeric,
    Date,
    Boolean,
    Enum,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Numeric => "numeric",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
            FieldType::Enum => "enum",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declaration of one column of a target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Expected CSV header (compared case-insensitively)
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_allow_empty")]
    pub allow_empty: bool,
    #[serde(default)]
    pub enum_values: Vec<String>,
    /// Physical column; defaults to `name`
    #[serde(default)]
    pub db_column: Option<String>,
}

fn default_allow_empty() -> bool {
    true
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            allow_empty: true,
            enum_values: Vec::new(),
            db_column: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn not_empty(mut self) -> Self {
        self.allow_empty = false;
        self
    }

    pub fn with_enum_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.enum_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_db_column(mut self, column: impl Into<String>) -> Self {
        self.db_column = Some(column.into());
        self
    }

    pub fn column(&self) -> &str {
        self.db_column.as_deref().unwrap_or(&self.name)
    }
}

/// One importable table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Key callers use to select the table
    pub key: String,
    /// Physical table name
    #[serde(rename = "table")]
    pub table_name: String,
    pub fields: Vec<FieldSpec>,
    /// Field names forming the composite unique key
    #[serde(default)]
    pub unique_key: Vec<String>,
}

impl TableSpec {
    pub fn new(key: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            table_name: table_name.into(),
            fields: Vec::new(),
            unique_key: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_unique_key<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_key = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn expected_headers(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Index of a field by name, case-insensitive
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name.trim()))
    }

    /// Positions of the unique-key fields within `fields`
    pub fn unique_key_indices(&self) -> Vec<usize> {
        self.unique_key
            .iter()
            .filter_map(|name| self.field_index(name))
            .collect()
    }

    pub fn has_unique_key(&self) -> bool {
        !self.unique_key.is_empty()
    }

    /// Largest batch that fits in one INSERT (one extra parameter per row
    /// for `upload_id`).
    pub fn max_rows_per_statement(&self) -> usize {
        (MAX_BIND_PARAMETERS / (self.fields.len() + 1)).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !IDENTIFIER.is_match(&self.table_name) {
            return Err(StowageError::catalog(format!(
                "table '{}': '{}' is not a valid SQL identifier",
                self.key, self.table_name
            )));
        }
        if self.fields.is_empty() {
            return Err(StowageError::catalog(format!("table '{}' has no fields", self.key)));
        }

        let mut names = HashSet::new();
        let mut columns = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.to_lowercase()) {
                return Err(StowageError::catalog(format!(
                    "table '{}': duplicate field '{}'",
                    self.key, field.name
                )));
            }
            let column = field.column();
            if !IDENTIFIER.is_match(column) || column.eq_ignore_ascii_case("upload_id") {
                return Err(StowageError::catalog(format!(
                    "table '{}': '{}' cannot be used as a column name",
                    self.key, column
                )));
            }
            if !columns.insert(column.to_lowercase()) {
                return Err(StowageError::catalog(format!(
                    "table '{}': column '{}' mapped twice",
                    self.key, column
                )));
            }
            if field.field_type == FieldType::Enum && field.enum_values.is_empty() {
                return Err(StowageError::catalog(format!(
                    "table '{}': enum field '{}' lists no values",
                    self.key, field.name
                )));
            }
        }

        for name in &self.unique_key {
            if self.field_index(name).is_none() {
                return Err(StowageError::catalog(format!(
                    "table '{}': unique key names unknown field '{}'",
                    self.key, name
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    tables: Vec<TableSpec>,
}

/// All importable tables, keyed by `TableSpec::key`
#[derive(Debug, Clone, Default)]
pub struct TableCatalog {
    tables: HashMap<String, Arc<TableSpec>>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(source)?;
        let mut catalog = Self::new();
        for table in file.tables {
            catalog.insert(table)?;
        }
        Ok(catalog)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let catalog = Self::from_toml_str(&source)?;
        tracing::info!(
            path = %path.display(),
            tables = catalog.len(),
            "Loaded table catalog"
        );
        Ok(catalog)
    }

    pub fn insert(&mut self, table: TableSpec) -> Result<()> {
        table.validate()?;
        if self.tables.contains_key(&table.key) {
            return Err(StowageError::catalog(format!("duplicate table key '{}'", table.key)));
        }
        self.tables.insert(table.key.clone(), Arc::new(table));
        Ok(())
    }

    pub fn with_table(mut self, table: TableSpec) -> Result<Self> {
        self.insert(table)?;
        Ok(self)
    }

    pub fn get(&self, key: &str) -> Option<Arc<TableSpec>> {
        self.tables.get(key).cloned()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
        [[tables]]
        key = "customers"
        table = "customers"
        unique_key = ["Email"]

        [[tables.fields]]
        name = "email"
        type = "text"
        required = true

        [[tables.fields]]
        name = "balance"
        type = "numeric"
        db_column = "balance_usd"

        [[tables.fields]]
        name = "tier"
        type = "enum"
        enum_values = ["free", "pro"]
    "#;

    #[test]
    fn test_parse_catalog() {
        let catalog = TableCatalog::from_toml_str(CATALOG).unwrap();
        let table = catalog.get("customers").unwrap();

        assert_eq!(table.fields.len(), 3);
        assert!(table.fields[0].required);
        assert!(table.fields[1].allow_empty);
        assert_eq!(table.fields[1].column(), "balance_usd");
        assert_eq!(table.fields[2].field_type, FieldType::Enum);
        assert_eq!(table.unique_key_indices(), vec![0]);
        assert!(catalog.get("orders").is_none());
    }

    #[test]
    fn test_rejects_unknown_unique_key_field() {
        let table = TableSpec::new("t", "t")
            .field(FieldSpec::new("a", FieldType::Text))
            .with_unique_key(["b"]);
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_rejects_unsafe_identifiers() {
        let table = TableSpec::new("t", "t; DROP TABLE x")
            .field(FieldSpec::new("a", FieldType::Text));
        assert!(table.validate().is_err());

        let table = TableSpec::new("t", "t")
            .field(FieldSpec::new("a", FieldType::Text).with_db_column("upload_id"));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_rejects_enum_without_values() {
        let table = TableSpec::new("t", "t").field(FieldSpec::new("status", FieldType::Enum));
        assert!(table.validate().is_err());
    }

    #[test]
    fn test_duplicate_table_key() {
        let table = TableSpec::new("t", "t").field(FieldSpec::new("a", FieldType::Text));
        let catalog = TableCatalog::new().with_table(table.clone()).unwrap();
        assert!(catalog.with_table(table).is_err());
    }

    #[test]
    fn test_max_rows_per_statement() {
        let table = TableSpec::new("t", "t")
            .field(FieldSpec::new("a", FieldType::Text))
            .field(FieldSpec::new("b", FieldType::Text));
        assert_eq!(table.max_rows_per_statement(), 65_535 / 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tables.toml");
        std::fs::write(&path, CATALOG).unwrap();

        let catalog = TableCatalog::from_file(&path).unwrap();
        assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["customers"]);

        assert!(TableCatalog::from_file(dir.path().join("missing.toml")).is_err());
    }
}
