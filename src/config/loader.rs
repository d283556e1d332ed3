//! Build the resolved model from descriptors held in memory, in a JSON string or in a file.

use crate::config::resolved::*;
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Build resolved model from descriptors (validates first).
pub fn resolve(config: &ModelConfig) -> Result<ResolvedModel, ConfigError> {
    let config = &with_version_keys(config);
    validate(config)?;
    let by_name: HashMap<&str, &EntityConfig> = config.entities.iter().map(|e| (e.name.as_str(), e)).collect();

    let mut entities = BTreeMap::new();
    for e in &config.entities {
        let schema_name = e.schema.clone().unwrap_or_else(|| config.schema.clone());
        let columns = e
            .columns
            .iter()
            .map(|c| resolve_column(e, c))
            .collect::<Result<Vec<_>, _>>()?;

        let mut relationships = Vec::with_capacity(e.relationships.len());
        for r in &e.relationships {
            let target = by_name.get(r.target.as_str()).copied().ok_or_else(|| ConfigError::MissingReference {
                kind: "entity",
                id: r.target.clone(),
            })?;
            let kind = resolve_relationship_kind(e, &schema_name, r, target)?;
            relationships.push(Relationship {
                name: r.name.clone(),
                target: r.target.clone(),
                kind,
            });
        }

        let permissions = e
            .permissions
            .iter()
            .map(resolve_permission)
            .collect::<Result<Vec<_>, _>>()?;

        let entity = Entity {
            name: e.name.clone(),
            schema_name,
            table_name: e.table_name(),
            pk_columns: e.primary_key.names(),
            columns,
            relationships,
            capabilities: Capabilities {
                permissions,
                files: e.files.as_ref().map(|f| FileStorage {
                    key_column: f.key_column.clone(),
                }),
                versioned: e.versioned,
            },
        };
        tracing::debug!(entity = %entity.name, table = %entity.table_name, composite = entity.is_composite(), "entity resolved");
        entities.insert(e.name.clone(), Arc::new(entity));
    }

    Ok(ResolvedModel { entities })
}

/// Versioned entities get a `version integer NOT NULL DEFAULT 1` column appended to
/// their key unless the descriptor already declares it.
fn with_version_keys(config: &ModelConfig) -> ModelConfig {
    let mut config = config.clone();
    for e in config.entities.iter_mut().filter(|e| e.versioned) {
        match e.columns.iter_mut().find(|c| c.name == VERSION_COLUMN) {
            Some(c) => {
                if c.default.is_none() {
                    c.default = Some("1".into());
                }
            }
            None => e.columns.push(ColumnConfig {
                name: VERSION_COLUMN.into(),
                type_: ColumnTypeConfig::Simple("integer".into()),
                nullable: false,
                default: Some("1".into()),
            }),
        }
        let mut pk = e.primary_key.names();
        if !pk.iter().any(|p| p == VERSION_COLUMN) {
            pk.push(VERSION_COLUMN.into());
            e.primary_key = ColumnListConfig::Composite(pk);
        }
    }
    config
}

fn resolve_column(e: &EntityConfig, c: &ColumnConfig) -> Result<Column, ConfigError> {
    let (ty, serial) = ScalarType::from_type_name(c.type_.base_name()).ok_or_else(|| ConfigError::UnsupportedType {
        entity: e.name.clone(),
        column: c.name.clone(),
        ty: c.type_.ddl(),
    })?;
    let is_pk = e.primary_key.names().contains(&c.name);
    Ok(Column {
        name: c.name.clone(),
        ty,
        ddl_type: c.type_.ddl(),
        nullable: c.nullable && !is_pk,
        default: c.default.clone(),
        has_default: serial || c.default.is_some(),
    })
}

fn resolve_relationship_kind(
    source: &EntityConfig,
    source_schema: &str,
    r: &RelationshipConfig,
    target: &EntityConfig,
) -> Result<RelationshipKind, ConfigError> {
    let source_pk = source.primary_key.names();
    let target_pk = target.primary_key.names();

    match (r.cardinality, &r.through) {
        (CardinalityConfig::One, _) => {
            let fk = match &r.foreign_key {
                Some(list) => list.names(),
                None => default_key_columns(&format!("id_{}", r.name), &target_pk),
            };
            check_key_columns(source, r, &fk, target_pk.len())?;
            Ok(RelationshipKind::ManyToOne {
                pairs: pair(fk, target_pk),
            })
        }
        (CardinalityConfig::Many, None) => {
            let fk = match &r.foreign_key {
                Some(list) => list.names(),
                None => default_key_columns(&format!("id_{}", source.table_name()), &source_pk),
            };
            check_key_columns(target, r, &fk, source_pk.len())?;
            Ok(RelationshipKind::OneToMany {
                pairs: pair(source_pk, fk),
            })
        }
        (CardinalityConfig::Many, Some(through)) => {
            let source_table = source.table_name();
            let source_cols: Vec<String> = source_pk.iter().map(|p| format!("{}_{}", source_table, p)).collect();
            let target_cols: Vec<String> = target_pk.iter().map(|p| format!("{}_{}", r.name, p)).collect();
            if source_cols.iter().any(|c| target_cols.contains(c)) {
                return Err(ConfigError::Duplicate {
                    kind: "association column",
                    name: format!("{}.{}", through, r.name),
                });
            }
            Ok(RelationshipKind::ManyToMany {
                association: Association {
                    schema_name: source_schema.to_string(),
                    table_name: through.clone(),
                    source: pair(source_pk, source_cols),
                    target: pair(target_cols, target_pk),
                },
            })
        }
    }
}

/// `id_<name>` for single-column keys, `id_<name>_<pk>` per column otherwise.
fn default_key_columns(prefix: &str, pk: &[String]) -> Vec<String> {
    if pk.len() == 1 {
        vec![prefix.to_string()]
    } else {
        pk.iter().map(|p| format!("{}_{}", prefix, p)).collect()
    }
}

fn check_key_columns(owner: &EntityConfig, r: &RelationshipConfig, fk: &[String], expected: usize) -> Result<(), ConfigError> {
    if fk.len() != expected {
        return Err(ConfigError::Validation(format!(
            "relationship '{}': expected {} foreign key column(s), got {}",
            r.name,
            expected,
            fk.len()
        )));
    }
    for col in fk {
        if !owner.columns.iter().any(|c| &c.name == col) {
            return Err(ConfigError::MissingReference {
                kind: "column",
                id: format!("{}.{}", owner.name, col),
            });
        }
    }
    Ok(())
}

fn pair(local: Vec<String>, remote: Vec<String>) -> Vec<KeyPair> {
    local
        .into_iter()
        .zip(remote)
        .map(|(local, remote)| KeyPair { local, remote })
        .collect()
}

fn resolve_permission(p: &PermissionConfig) -> Result<PermissionEntry, ConfigError> {
    let verbs = p
        .verbs
        .iter()
        .map(|v| v.parse::<Verb>().map_err(ConfigError::Validation))
        .collect::<Result<BTreeSet<_>, _>>()?;
    let source = match (&p.groups, &p.list_column) {
        (Some(groups), _) => GroupSource::Static(groups.iter().cloned().collect()),
        (None, Some(column)) => GroupSource::ListColumn {
            path: p.path.clone(),
            column: column.clone(),
        },
        (None, None) => return Err(ConfigError::Validation("permission without group source".into())),
    };
    Ok(PermissionEntry { verbs, source })
}

pub fn from_json_str(json: &str) -> Result<ResolvedModel, ConfigError> {
    let config: ModelConfig = serde_json::from_str(json).map_err(|e| ConfigError::Load(e.to_string()))?;
    resolve(&config)
}

/// Read and resolve a descriptor document from disk.
pub async fn load_from_file(path: impl AsRef<Path>) -> Result<ResolvedModel, ConfigError> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    tracing::info!(path = %path.display(), "loading entity descriptors");
    from_json_str(&raw)
}
