//! Descriptor validation: referential integrity between entities, columns and relationships.

use crate::config::resolved::{ScalarType, Verb, VERSION_COLUMN};
use crate::config::types::{CardinalityConfig, EntityConfig, ModelConfig};
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

pub fn validate(config: &ModelConfig) -> Result<(), ConfigError> {
    let mut by_name: HashMap<&str, &EntityConfig> = HashMap::new();
    for e in &config.entities {
        if by_name.insert(e.name.as_str(), e).is_some() {
            return Err(ConfigError::Duplicate {
                kind: "entity",
                name: e.name.clone(),
            });
        }
    }

    for e in &config.entities {
        validate_entity(e, &by_name)?;
    }
    Ok(())
}

fn validate_entity(e: &EntityConfig, by_name: &HashMap<&str, &EntityConfig>) -> Result<(), ConfigError> {
    let mut columns = HashSet::new();
    for c in &e.columns {
        if !columns.insert(c.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "column",
                name: format!("{}.{}", e.name, c.name),
            });
        }
        if ScalarType::from_type_name(c.type_.base_name()).is_none() {
            return Err(ConfigError::UnsupportedType {
                entity: e.name.clone(),
                column: c.name.clone(),
                ty: c.type_.ddl(),
            });
        }
    }

    let pk = e.primary_key.names();
    if pk.is_empty() {
        return Err(ConfigError::Validation(format!("{}: primary key is empty", e.name)));
    }
    for p in &pk {
        if !columns.contains(p.as_str()) {
            return Err(ConfigError::InvalidPrimaryKey {
                entity: e.name.clone(),
                column: p.clone(),
            });
        }
    }

    if e.versioned {
        let version = e.columns.iter().find(|c| c.name == VERSION_COLUMN);
        let integer = version
            .and_then(|c| ScalarType::from_type_name(c.type_.base_name()))
            .is_some_and(|(ty, serial)| {
                !serial && matches!(ty, ScalarType::SmallInt | ScalarType::Integer | ScalarType::BigInt)
            });
        if !integer || !pk.iter().any(|p| p == VERSION_COLUMN) {
            return Err(ConfigError::Validation(format!(
                "{}: versioned entities need an integer '{}' key column",
                e.name, VERSION_COLUMN
            )));
        }
    }

    let mut rel_names = HashSet::new();
    for r in &e.relationships {
        if !rel_names.insert(r.name.as_str()) {
            return Err(ConfigError::Duplicate {
                kind: "relationship",
                name: format!("{}.{}", e.name, r.name),
            });
        }
        if columns.contains(r.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "{}: relationship '{}' shadows a column",
                e.name, r.name
            )));
        }
        if !by_name.contains_key(r.target.as_str()) {
            return Err(ConfigError::MissingReference {
                kind: "entity",
                id: r.target.clone(),
            });
        }
        if r.through.is_some() && r.cardinality == CardinalityConfig::One {
            return Err(ConfigError::Validation(format!(
                "{}.{}: 'through' requires cardinality 'many'",
                e.name, r.name
            )));
        }
    }

    for p in &e.permissions {
        if p.verbs.is_empty() {
            return Err(ConfigError::Validation(format!("{}: permission without verbs", e.name)));
        }
        for v in &p.verbs {
            let verb: Verb = v.parse().map_err(|err| ConfigError::Validation(format!("{}: {}", e.name, err)))?;
            if verb == Verb::Download && e.files.is_none() {
                return Err(ConfigError::Validation(format!(
                    "{}: 'download' permission on an entity without file storage",
                    e.name
                )));
            }
        }
        match (&p.groups, &p.list_column) {
            (Some(_), None) => {
                if !p.path.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "{}: 'path' only applies to 'list_column' permissions",
                        e.name
                    )));
                }
            }
            (None, Some(col)) => {
                let holder = follow_path(e, &p.path, by_name)?;
                if !holder.columns.iter().any(|c| &c.name == col) {
                    return Err(ConfigError::MissingReference {
                        kind: "column",
                        id: format!("{}.{}", holder.name, col),
                    });
                }
            }
            _ => {
                return Err(ConfigError::Validation(format!(
                    "{}: permission needs exactly one of 'groups' or 'list_column'",
                    e.name
                )))
            }
        }
    }

    if let Some(files) = &e.files {
        if !columns.contains(files.key_column.as_str()) {
            return Err(ConfigError::MissingReference {
                kind: "column",
                id: format!("{}.{}", e.name, files.key_column),
            });
        }
    }
    Ok(())
}

fn follow_path<'a>(
    from: &'a EntityConfig,
    path: &[String],
    by_name: &HashMap<&str, &'a EntityConfig>,
) -> Result<&'a EntityConfig, ConfigError> {
    let mut current = from;
    for seg in path {
        let rel = current
            .relationships
            .iter()
            .find(|r| &r.name == seg)
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "relationship",
                id: format!("{}.{}", current.name, seg),
            })?;
        current = by_name
            .get(rel.target.as_str())
            .copied()
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "entity",
                id: rel.target.clone(),
            })?;
    }
    Ok(current)
}
