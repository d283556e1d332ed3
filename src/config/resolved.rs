//! Resolved entity model: descriptors validated and flattened for runtime use.
//! Built once at startup and never mutated afterwards.

use crate::error::AppError;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Scalar storage type of a column. Drives value casting and SQL parameter casts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarType {
    SmallInt,
    Integer,
    BigInt,
    Real,
    Double,
    Numeric,
    Text,
    Boolean,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Json,
    Jsonb,
}

impl ScalarType {
    /// Map a PostgreSQL type name to a scalar type. The flag is true for serial types
    /// (integer columns with a sequence default).
    pub fn from_type_name(name: &str) -> Option<(ScalarType, bool)> {
        let lower = name.trim().to_lowercase();
        let ty = match lower.as_str() {
            "smallserial" | "serial2" => return Some((ScalarType::SmallInt, true)),
            "serial" | "serial4" => return Some((ScalarType::Integer, true)),
            "bigserial" | "serial8" => return Some((ScalarType::BigInt, true)),
            "smallint" | "int2" => ScalarType::SmallInt,
            "integer" | "int" | "int4" => ScalarType::Integer,
            "bigint" | "int8" => ScalarType::BigInt,
            "real" | "float4" => ScalarType::Real,
            "double precision" | "float8" | "float" => ScalarType::Double,
            "numeric" | "decimal" => ScalarType::Numeric,
            "text" | "varchar" | "character varying" | "char" | "character" | "string" => {
                ScalarType::Text
            }
            "boolean" | "bool" => ScalarType::Boolean,
            "uuid" => ScalarType::Uuid,
            "timestamp" | "timestamp without time zone" => ScalarType::Timestamp,
            "timestamptz" | "timestamp with time zone" => ScalarType::TimestampTz,
            "date" => ScalarType::Date,
            "json" => ScalarType::Json,
            "jsonb" => ScalarType::Jsonb,
            _ => return None,
        };
        Some((ty, false))
    }

    /// Type name used in `$n::type` parameter casts.
    pub fn pg_cast(&self) -> &'static str {
        match self {
            ScalarType::SmallInt => "smallint",
            ScalarType::Integer => "integer",
            ScalarType::BigInt => "bigint",
            ScalarType::Real => "real",
            ScalarType::Double => "double precision",
            ScalarType::Numeric => "numeric",
            ScalarType::Text => "text",
            ScalarType::Boolean => "boolean",
            ScalarType::Uuid => "uuid",
            ScalarType::Timestamp => "timestamp",
            ScalarType::TimestampTz => "timestamptz",
            ScalarType::Date => "date",
            ScalarType::Json => "json",
            ScalarType::Jsonb => "jsonb",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ScalarType::SmallInt
                | ScalarType::Integer
                | ScalarType::BigInt
                | ScalarType::Real
                | ScalarType::Double
                | ScalarType::Numeric
        )
    }

    pub fn is_text(&self) -> bool {
        matches!(self, ScalarType::Text)
    }
}

#[derive(Clone, Debug)]
pub struct Column {
    pub name: String,
    pub ty: ScalarType,
    /// Type as declared, used for DDL.
    pub ddl_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    /// Whether the store fills the column when omitted (serial or explicit default).
    pub has_default: bool,
}

/// Column pairing used by joins. Meaning of each side depends on the relationship kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyPair {
    pub local: String,
    pub remote: String,
}

#[derive(Clone, Debug)]
pub struct Association {
    pub schema_name: String,
    pub table_name: String,
    /// local: source entity PK column, remote: association column.
    pub source: Vec<KeyPair>,
    /// local: association column, remote: target entity PK column.
    pub target: Vec<KeyPair>,
}

#[derive(Clone, Debug)]
pub enum RelationshipKind {
    /// FK on the source row. local: source FK column, remote: target PK column.
    ManyToOne { pairs: Vec<KeyPair> },
    /// FK on the target rows. local: source PK column, remote: target FK column.
    OneToMany { pairs: Vec<KeyPair> },
    ManyToMany { association: Association },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    One,
    Many,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    Owning,
    Associative,
}

#[derive(Clone, Debug)]
pub struct Relationship {
    pub name: String,
    /// Target entity name.
    pub target: String,
    pub kind: RelationshipKind,
}

impl Relationship {
    pub fn cardinality(&self) -> Cardinality {
        match self.kind {
            RelationshipKind::ManyToOne { .. } => Cardinality::One,
            _ => Cardinality::Many,
        }
    }

    pub fn ownership(&self) -> Ownership {
        match self.kind {
            RelationshipKind::ManyToMany { .. } => Ownership::Associative,
            _ => Ownership::Owning,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Verb {
    Create,
    Read,
    Update,
    Delete,
    Download,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Read => "read",
            Verb::Update => "update",
            Verb::Delete => "delete",
            Verb::Download => "download",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verb {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "create" => Ok(Verb::Create),
            "read" => Ok(Verb::Read),
            "update" => Ok(Verb::Update),
            "delete" => Ok(Verb::Delete),
            "download" => Ok(Verb::Download),
            other => Err(format!("unknown verb '{}'", other)),
        }
    }
}

/// Where the allowed groups of a permission entry come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupSource {
    Static(BTreeSet<String>),
    /// List-group id stored in `column` of the entity reached by following `path`.
    ListColumn { path: Vec<String>, column: String },
}

#[derive(Clone, Debug)]
pub struct PermissionEntry {
    pub verbs: BTreeSet<Verb>,
    pub source: GroupSource,
}

#[derive(Clone, Debug)]
pub struct FileStorage {
    pub key_column: String,
}

/// Optional behaviours an entity opts into.
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    pub permissions: Vec<PermissionEntry>,
    pub files: Option<FileStorage>,
    /// Key includes [`VERSION_COLUMN`]; updates are refused in favour of releases.
    pub versioned: bool,
}

/// Key column numbering the versions of a versioned entity.
pub const VERSION_COLUMN: &str = "version";

#[derive(Clone, Debug)]
pub struct Entity {
    pub name: String,
    pub schema_name: String,
    pub table_name: String,
    pub pk_columns: Vec<String>,
    pub columns: Vec<Column>,
    pub relationships: Vec<Relationship>,
    pub capabilities: Capabilities,
}

impl Entity {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_pk(&self, name: &str) -> bool {
        self.pk_columns.iter().any(|p| p == name)
    }

    pub fn is_versioned(&self) -> bool {
        self.capabilities.versioned
    }

    pub fn pk(&self) -> impl Iterator<Item = &Column> {
        self.pk_columns.iter().filter_map(|p| self.column(p))
    }

    pub fn relationship(&self, name: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Entities embedding nested payloads get the composite service.
    pub fn is_composite(&self) -> bool {
        !self.relationships.is_empty()
    }

    /// Split an underscore-joined primary key path in declared PK column order.
    /// The last column takes the remainder, so it may itself contain underscores.
    pub fn split_pk_path(&self, encoded: &str) -> Result<Vec<String>, AppError> {
        let n = self.pk_columns.len();
        let parts: Vec<String> = encoded.splitn(n, '_').map(String::from).collect();
        if parts.len() != n || parts.iter().any(|p| p.is_empty()) {
            return Err(AppError::BadRequest(format!(
                "{}: expected {} primary key value(s) joined by '_', got '{}'",
                self.name, n, encoded
            )));
        }
        Ok(parts)
    }

    pub fn permissions_for(&self, verb: Verb) -> Vec<&PermissionEntry> {
        self.capabilities
            .permissions
            .iter()
            .filter(|p| p.verbs.contains(&verb))
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ResolvedModel {
    pub entities: BTreeMap<String, Arc<Entity>>,
}

impl ResolvedModel {
    pub fn entity(&self, name: &str) -> Option<&Arc<Entity>> {
        self.entities.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Arc<Entity>, AppError> {
        self.entity(name)
            .ok_or_else(|| AppError::BadRequest(format!("unknown entity '{}'", name)))
    }

    /// Target entity of a relationship. Resolution guarantees it exists.
    pub fn target_of(&self, rel: &Relationship) -> Result<&Arc<Entity>, AppError> {
        self.require(&rel.target)
    }
}
