//! Raw descriptor types matching the entity model JSON document.

use serde::{Deserialize, Serialize};

/// One column name or an ordered list of names (primary keys, foreign keys).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnListConfig {
    Single(String),
    Composite(Vec<String>),
}

impl ColumnListConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            ColumnListConfig::Single(s) => vec![s.clone()],
            ColumnListConfig::Composite(v) => v.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnTypeConfig {
    Simple(String),
    Parameterized { name: String, params: Option<Vec<u32>> },
}

impl ColumnTypeConfig {
    pub fn base_name(&self) -> &str {
        match self {
            ColumnTypeConfig::Simple(s) => s.as_str(),
            ColumnTypeConfig::Parameterized { name, .. } => name.as_str(),
        }
    }

    /// Type as written in DDL, e.g. `varchar(50)`.
    pub fn ddl(&self) -> String {
        match self {
            ColumnTypeConfig::Simple(s) => s.clone(),
            ColumnTypeConfig::Parameterized { name, params } => {
                let p = params
                    .as_ref()
                    .map(|v| v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(", "))
                    .unwrap_or_default();
                if p.is_empty() {
                    name.clone()
                } else {
                    format!("{}({})", name, p)
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ColumnConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: ColumnTypeConfig,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// SQL default expression, emitted as-is in DDL.
    #[serde(default)]
    pub default: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardinalityConfig {
    One,
    Many,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationshipConfig {
    pub name: String,
    pub target: String,
    pub cardinality: CardinalityConfig,
    /// For `one`: FK columns on this entity. For `many` without `through`: FK columns on the target.
    #[serde(default)]
    pub foreign_key: Option<ColumnListConfig>,
    /// Association table name; makes a `many` relationship many-to-many.
    #[serde(default)]
    pub through: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PermissionConfig {
    pub verbs: Vec<String>,
    /// Static group list.
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    /// Column holding a list-group id, on this entity or at the end of `path`.
    #[serde(default)]
    pub list_column: Option<String>,
    /// Relationship names leading from this entity to the entity carrying `list_column`.
    #[serde(default)]
    pub path: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileConfig {
    /// Column holding the object-storage key.
    pub key_column: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    /// Table name; defaults to the lowercased entity name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    pub primary_key: ColumnListConfig,
    pub columns: Vec<ColumnConfig>,
    #[serde(default)]
    pub relationships: Vec<RelationshipConfig>,
    #[serde(default)]
    pub permissions: Vec<PermissionConfig>,
    #[serde(default)]
    pub files: Option<FileConfig>,
    /// Rows are immutable versions keyed by a `version` column; changes are releases.
    #[serde(default)]
    pub versioned: bool,
}

impl EntityConfig {
    pub fn table_name(&self) -> String {
        self.table.clone().unwrap_or_else(|| self.name.to_lowercase())
    }
}

/// Whole descriptor document.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default schema for entities that do not name one.
    #[serde(default = "default_schema")]
    pub schema: String,
    pub entities: Vec<EntityConfig>,
}

fn default_schema() -> String {
    "public".into()
}
