//! Compile parsed conditions into SQL over the root table (`t0`) and its joins.

use super::{like_pattern, Condition, FilterQuery, Operator, Test, WILDCARD};
use crate::config::{Entity, KeyPair, Relationship, RelationshipKind, ResolvedModel};
use crate::error::AppError;
use crate::sql::{cast_raw, entity_table, qualified_table, quoted, select_column_list, QueryBuf};
use std::collections::HashMap;
use std::sync::Arc;

pub const ROOT_ALIAS: &str = "t0";

/// `JOIN` clause(s) from `from_alias` through `rel` to its target aliased `to_alias`.
/// Many-to-many goes through the association table aliased `<to_alias>_a`.
pub fn join_relationship(
    model: &ResolvedModel,
    rel: &Relationship,
    from_alias: &str,
    to_alias: &str,
) -> Result<(String, Arc<Entity>), AppError> {
    let target = model.target_of(rel)?.clone();
    // remote column on `left`, local column on `right`
    let on = |pairs: &[KeyPair], left: &str, right: &str| {
        pairs
            .iter()
            .map(|kp| format!("{}.{} = {}.{}", left, quoted(&kp.remote), right, quoted(&kp.local)))
            .collect::<Vec<_>>()
            .join(" AND ")
    };
    let sql = match &rel.kind {
        RelationshipKind::ManyToOne { pairs } | RelationshipKind::OneToMany { pairs } => format!(
            " JOIN {} {} ON {}",
            entity_table(&target),
            to_alias,
            on(pairs, to_alias, from_alias)
        ),
        RelationshipKind::ManyToMany { association } => {
            let assoc_alias = format!("{}_a", to_alias);
            format!(
                " JOIN {} {} ON {} JOIN {} {} ON {}",
                qualified_table(&association.schema_name, &association.table_name),
                assoc_alias,
                on(&association.source, &assoc_alias, from_alias),
                entity_table(&target),
                to_alias,
                on(&association.target, to_alias, &assoc_alias)
            )
        }
    };
    Ok((sql, target))
}

/// Accumulates joins and WHERE terms for one read statement. Joins are keyed by
/// relationship path prefix, so a path touched twice joins once.
pub struct FilterCompiler<'m> {
    model: &'m ResolvedModel,
    root: Arc<Entity>,
    buf: QueryBuf,
    joins: Vec<String>,
    aliases: HashMap<Vec<String>, (String, Arc<Entity>)>,
    wheres: Vec<String>,
}

impl<'m> FilterCompiler<'m> {
    pub fn new(model: &'m ResolvedModel, root: Arc<Entity>) -> Self {
        Self {
            model,
            root,
            buf: QueryBuf::new(),
            joins: Vec::new(),
            aliases: HashMap::new(),
            wheres: Vec::new(),
        }
    }

    pub fn root(&self) -> &Arc<Entity> {
        &self.root
    }

    pub fn buf_mut(&mut self) -> &mut QueryBuf {
        &mut self.buf
    }

    /// Add a raw predicate over the aliases this compiler produced.
    pub fn push_predicate(&mut self, sql: String) {
        self.wheres.push(sql);
    }

    pub fn apply(&mut self, query: &FilterQuery) -> Result<(), AppError> {
        for cond in &query.conditions {
            self.add(cond)?;
        }
        Ok(())
    }

    /// Walk relationship segments from the root, joining as needed.
    pub fn resolve_path(&mut self, relationships: &[String]) -> Result<(String, Arc<Entity>), AppError> {
        let mut alias = ROOT_ALIAS.to_string();
        let mut entity = self.root.clone();
        for i in 0..relationships.len() {
            let prefix = relationships[..=i].to_vec();
            if let Some((a, e)) = self.aliases.get(&prefix) {
                alias = a.clone();
                entity = e.clone();
                continue;
            }
            let seg = &relationships[i];
            let rel = entity.relationship(seg).ok_or_else(|| {
                AppError::BadRequest(format!("{}: unknown relationship '{}'", entity.name, seg))
            })?;
            let next_alias = format!("j{}", self.aliases.len() + 1);
            let (sql, target) = join_relationship(self.model, rel, &alias, &next_alias)?;
            self.joins.push(sql);
            self.aliases.insert(prefix, (next_alias.clone(), target.clone()));
            alias = next_alias;
            entity = target;
        }
        Ok((alias, entity))
    }

    fn add(&mut self, cond: &Condition) -> Result<(), AppError> {
        let (rels, column_name) = match cond.path.split_last() {
            Some((last, rels)) => (rels, last),
            None => return Err(AppError::BadRequest("empty attribute path".into())),
        };
        let (alias, entity) = self.resolve_path(rels)?;
        let column = entity
            .column(column_name)
            .ok_or_else(|| AppError::BadRequest(format!("{}: unknown attribute '{}'", entity.name, column_name)))?
            .clone();
        let lhs = format!("{}.{}", alias, quoted(&column.name));

        let sql = match &cond.test {
            Test::AnyOf(values) => {
                let mut terms = Vec::with_capacity(values.len());
                for v in values {
                    if v.contains(WILDCARD) {
                        if !column.ty.is_text() {
                            return Err(AppError::BadRequest(format!(
                                "wildcard '{}' is only allowed on text attributes, '{}' is {}",
                                WILDCARD,
                                column.name,
                                column.ty.pg_cast()
                            )));
                        }
                        let n = self.buf.push_param(Some(like_pattern(v)));
                        terms.push(format!("{} LIKE ${}::text", lhs, n));
                    } else {
                        let cast = cast_raw(&column, v)?;
                        let ph = self.buf.placeholder(&column, Some(cast));
                        terms.push(format!("{} = {}", lhs, ph));
                    }
                }
                format!("({})", terms.join(" OR "))
            }
            Test::Compare(op, arg) => {
                self.require_numeric(&entity, &column.name, column.ty.is_numeric())?;
                let cast = cast_raw(&column, arg)?;
                let ph = self.buf.placeholder(&column, Some(cast));
                format!("{} {} {}", lhs, op.sql(), ph)
            }
            Test::Extremum(op) => {
                self.require_numeric(&entity, &column.name, column.ty.is_numeric())?;
                debug_assert!(matches!(op, Operator::Min | Operator::Max));
                format!(
                    "{} = (SELECT {}({}) FROM {})",
                    lhs,
                    op.sql(),
                    quoted(&column.name),
                    entity_table(&entity)
                )
            }
        };
        self.wheres.push(sql);
        Ok(())
    }

    fn require_numeric(&self, entity: &Entity, column: &str, ok: bool) -> Result<(), AppError> {
        if ok {
            Ok(())
        } else {
            Err(AppError::BadRequest(format!(
                "numeric operators only apply to numeric attributes, '{}.{}' is not numeric",
                entity.name, column
            )))
        }
    }

    fn from_where(&self) -> String {
        let mut sql = format!("{} {}", entity_table(&self.root), ROOT_ALIAS);
        for j in &self.joins {
            sql.push_str(j);
        }
        if !self.wheres.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.wheres.join(" AND "));
        }
        sql
    }

    fn pk_list(&self, alias: &str) -> String {
        self.root
            .pk_columns
            .iter()
            .map(|p| format!("{}.{}", alias, quoted(p)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Rows of the root entity, ordered by primary key. With joins, root rows are picked
    /// through a key semi-join so one-to-many joins never duplicate them.
    pub fn into_select(mut self, limit: i64, offset: i64) -> QueryBuf {
        let sql = if self.joins.is_empty() {
            format!(
                "SELECT {} FROM {} ORDER BY {} LIMIT {} OFFSET {}",
                select_column_list(&self.root, Some(ROOT_ALIAS)),
                self.from_where(),
                self.pk_list(ROOT_ALIAS),
                limit,
                offset
            )
        } else {
            format!(
                "SELECT {} FROM {} r WHERE ({}) IN (SELECT {} FROM {}) ORDER BY {} LIMIT {} OFFSET {}",
                select_column_list(&self.root, Some("r")),
                entity_table(&self.root),
                self.pk_list("r"),
                self.pk_list(ROOT_ALIAS),
                self.from_where(),
                self.pk_list("r"),
                limit,
                offset
            )
        };
        self.buf.sql = sql;
        self.buf
    }

    /// Number of distinct root rows matching.
    pub fn into_count(mut self) -> QueryBuf {
        self.buf.sql = if self.joins.is_empty() {
            format!("SELECT COUNT(*) AS count FROM {}", self.from_where())
        } else {
            format!(
                "SELECT COUNT(*) AS count FROM (SELECT DISTINCT {} FROM {}) matched",
                self.pk_list(ROOT_ALIAS),
                self.from_where()
            )
        };
        self.buf
    }

    /// Rows of the entity reached through `relationships`, ordered by its key.
    pub fn into_select_joined(mut self, relationships: &[String]) -> Result<QueryBuf, AppError> {
        let (alias, target) = self.resolve_path(relationships)?;
        let target_pk = |a: &str| {
            target
                .pk_columns
                .iter()
                .map(|p| format!("{}.{}", a, quoted(p)))
                .collect::<Vec<_>>()
                .join(", ")
        };
        self.buf.sql = format!(
            "SELECT {} FROM {} r WHERE ({}) IN (SELECT {} FROM {}) ORDER BY {}",
            select_column_list(&target, Some("r")),
            entity_table(&target),
            target_pk("r"),
            target_pk(&alias),
            self.from_where(),
            target_pk("r")
        );
        Ok(self.buf)
    }
}
