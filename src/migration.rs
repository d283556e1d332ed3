//! Create tables for a resolved model: schemas, entity tables, association tables, foreign keys.
//! Idempotent (IF NOT EXISTS); existing tables are left as they are.

use crate::config::{Entity, RelationshipKind, ResolvedModel};
use crate::error::AppError;
use crate::sql::{entity_table, qualified_table, quoted};
use sqlx::PgPool;
use std::collections::{BTreeSet, HashSet};

fn column_list(cols: &[&String]) -> String {
    cols.iter().map(|c| quoted(c)).collect::<Vec<_>>().join(", ")
}

pub fn table_ddl(entity: &Entity) -> String {
    let mut defs: Vec<String> = entity
        .columns
        .iter()
        .map(|c| {
            let mut def = format!("{} {}", quoted(&c.name), c.ddl_type);
            if !c.nullable {
                def.push_str(" NOT NULL");
            }
            if let Some(d) = &c.default {
                def.push_str(" DEFAULT ");
                def.push_str(d);
            }
            def
        })
        .collect();
    let pk: Vec<&String> = entity.pk_columns.iter().collect();
    defs.push(format!("PRIMARY KEY ({})", column_list(&pk)));
    format!("CREATE TABLE IF NOT EXISTS {} ({})", entity_table(entity), defs.join(", "))
}

/// Association table of a many-to-many relationship: both key sets, jointly unique.
pub fn association_ddl(model: &ResolvedModel, source: &Entity, rel_name: &str) -> Result<Option<String>, AppError> {
    let Some(rel) = source.relationship(rel_name) else {
        return Ok(None);
    };
    let RelationshipKind::ManyToMany { association } = &rel.kind else {
        return Ok(None);
    };
    let target = model.target_of(rel)?;
    let mut defs = Vec::new();
    let mut all = Vec::new();
    for kp in &association.source {
        let ty = source.column(&kp.local).map(|c| c.ty.pg_cast()).unwrap_or("text");
        defs.push(format!("{} {} NOT NULL", quoted(&kp.remote), ty));
        all.push(&kp.remote);
    }
    for kp in &association.target {
        let ty = target.column(&kp.remote).map(|c| c.ty.pg_cast()).unwrap_or("text");
        defs.push(format!("{} {} NOT NULL", quoted(&kp.local), ty));
        all.push(&kp.local);
    }
    let src_cols: Vec<&String> = association.source.iter().map(|kp| &kp.remote).collect();
    let src_refs: Vec<&String> = association.source.iter().map(|kp| &kp.local).collect();
    let tgt_cols: Vec<&String> = association.target.iter().map(|kp| &kp.local).collect();
    let tgt_refs: Vec<&String> = association.target.iter().map(|kp| &kp.remote).collect();
    defs.push(format!("PRIMARY KEY ({})", column_list(&all)));
    defs.push(format!(
        "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
        column_list(&src_cols),
        entity_table(source),
        column_list(&src_refs)
    ));
    defs.push(format!(
        "FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE CASCADE",
        column_list(&tgt_cols),
        entity_table(target),
        column_list(&tgt_refs)
    ));
    Ok(Some(format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        qualified_table(&association.schema_name, &association.table_name),
        defs.join(", ")
    )))
}

/// `ALTER TABLE ... ADD CONSTRAINT` for every foreign key the model implies, each once.
/// Deleting a referenced row clears the references to it.
pub fn foreign_key_ddl(model: &ResolvedModel) -> Result<Vec<String>, AppError> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for entity in model.entities.values() {
        for rel in &entity.relationships {
            let target = model.target_of(rel)?;
            // (owning table, fk columns, referenced table, referenced columns)
            let (owner, cols, referenced, refs) = match &rel.kind {
                RelationshipKind::ManyToOne { pairs } => (
                    &**entity,
                    pairs.iter().map(|kp| &kp.local).collect::<Vec<_>>(),
                    &**target,
                    pairs.iter().map(|kp| &kp.remote).collect::<Vec<_>>(),
                ),
                RelationshipKind::OneToMany { pairs } => (
                    &**target,
                    pairs.iter().map(|kp| &kp.remote).collect(),
                    &**entity,
                    pairs.iter().map(|kp| &kp.local).collect(),
                ),
                RelationshipKind::ManyToMany { .. } => continue,
            };
            let key = (entity_table(owner), column_list(&cols), entity_table(referenced));
            if !seen.insert(key) {
                continue;
            }
            let name = format!(
                "fk_{}_{}",
                owner.table_name,
                cols.iter().map(|c| c.as_str()).collect::<Vec<_>>().join("_")
            );
            out.push(format!(
                "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE SET NULL",
                entity_table(owner),
                quoted(&name),
                column_list(&cols),
                entity_table(referenced),
                column_list(&refs)
            ));
        }
    }
    Ok(out)
}

/// Create every schema and table of `model`, then foreign keys. Re-adding an existing
/// constraint fails and is ignored.
pub async fn create_all(pool: &PgPool, model: &ResolvedModel) -> Result<(), AppError> {
    let mut schemas = BTreeSet::new();
    for e in model.entities.values() {
        schemas.insert(e.schema_name.clone());
        for rel in &e.relationships {
            if let RelationshipKind::ManyToMany { association } = &rel.kind {
                schemas.insert(association.schema_name.clone());
            }
        }
    }
    for s in &schemas {
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(s)))
            .execute(pool)
            .await?;
    }

    for e in model.entities.values() {
        let ddl = table_ddl(e);
        tracing::debug!(sql = %ddl, "create table");
        sqlx::query(&ddl).execute(pool).await?;
    }
    for e in model.entities.values() {
        for rel in &e.relationships {
            if let Some(ddl) = association_ddl(model, e, &rel.name)? {
                tracing::debug!(sql = %ddl, "create association table");
                sqlx::query(&ddl).execute(pool).await?;
            }
        }
    }
    for ddl in foreign_key_ddl(model)? {
        if let Err(e) = sqlx::query(&ddl).execute(pool).await {
            tracing::debug!(sql = %ddl, error = %e, "foreign key not added");
        }
    }
    tracing::info!(entities = model.entities.len(), "tables ready");
    Ok(())
}
