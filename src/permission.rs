//! Group-based access control declared on entities.
//!
//! Entities without entries for a verb are public. Every entry declared for a verb must
//! grant, and an entry grants when any of the caller's groups is allowed. Static entries
//! are decided in memory; list-group entries become a row predicate evaluated in SQL.

use crate::config::{Entity, GroupSource, ResolvedModel, Verb};
use crate::error::AppError;
use crate::query::join_relationship;
use crate::session::UnitOfWork;
use crate::sql::{entity_table, pk_condition, qualified_table, quoted, QueryBuf};
use std::collections::BTreeSet;

/// Identity handed over by the authentication layer: the groups a caller belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    pub groups: BTreeSet<String>,
}

impl Caller {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups.into_iter().map(Into::into).collect(),
        }
    }
}

/// Outcome of evaluating an entity's entries for one verb.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Granted,
    Denied,
    /// Decided per row by this SQL predicate over the given alias.
    Rows(String),
}

pub fn list_groups_table(sys_schema: &str) -> String {
    qualified_table(sys_schema, "_sys_list_groups")
}

pub fn list_group_members_table(sys_schema: &str) -> String {
    qualified_table(sys_schema, "_sys_list_group_members")
}

/// Text form of a `text[]` literal, bound as one parameter.
pub fn text_array_literal(items: &BTreeSet<String>) -> String {
    let inner = items
        .iter()
        .map(|g| format!("\"{}\"", g.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{}}}", inner)
}

pub struct Evaluator<'m> {
    model: &'m ResolvedModel,
    sys_schema: &'m str,
}

impl<'m> Evaluator<'m> {
    pub fn new(model: &'m ResolvedModel, sys_schema: &'m str) -> Self {
        Self { model, sys_schema }
    }

    /// Evaluate `verb` on rows of `entity` aliased `alias`. Parameters of a row predicate
    /// are pushed to `q`.
    pub fn evaluate(
        &self,
        entity: &Entity,
        verb: Verb,
        caller: &Caller,
        alias: &str,
        q: &mut QueryBuf,
    ) -> Result<Access, AppError> {
        if verb == Verb::Download && entity.capabilities.files.is_none() {
            return Err(AppError::BadRequest(format!("{}: entity does not store files", entity.name)));
        }
        let mut predicates = Vec::new();
        for entry in entity.permissions_for(verb) {
            match &entry.source {
                GroupSource::Static(groups) => {
                    if !groups.is_empty() && groups.is_disjoint(&caller.groups) {
                        return Ok(Access::Denied);
                    }
                }
                GroupSource::ListColumn { path, column } => {
                    predicates.push(self.list_predicate(entity, path, column, caller, alias, q)?);
                }
            }
        }
        if predicates.is_empty() {
            Ok(Access::Granted)
        } else {
            Ok(Access::Rows(predicates.join(" AND ")))
        }
    }

    /// True when the referenced list group is absent or empty, or contains a caller group.
    fn list_predicate(
        &self,
        entity: &Entity,
        path: &[String],
        column: &str,
        caller: &Caller,
        alias: &str,
        q: &mut QueryBuf,
    ) -> Result<String, AppError> {
        let mut from = format!("{} p0", entity_table(entity));
        let mut holder_alias = "p0".to_string();
        let mut holder = entity.clone();
        for (i, seg) in path.iter().enumerate() {
            let rel = holder
                .relationship(seg)
                .ok_or_else(|| AppError::BadRequest(format!("{}: unknown relationship '{}'", holder.name, seg)))?
                .clone();
            let next = format!("p{}", i + 1);
            let (join, target) = join_relationship(self.model, &rel, &holder_alias, &next)?;
            from.push_str(&join);
            holder_alias = next;
            holder = (*target).clone();
        }
        from.push_str(&format!(
            " JOIN {} m ON m.list_group_id = {}.{}",
            list_group_members_table(self.sys_schema),
            holder_alias,
            quoted(column)
        ));
        let same_row = entity
            .pk_columns
            .iter()
            .map(|p| format!("p0.{0} = {1}.{0}", quoted(p), alias))
            .collect::<Vec<_>>()
            .join(" AND ");
        let n = q.push_param(Some(text_array_literal(&caller.groups)));
        Ok(format!(
            "(NOT EXISTS (SELECT 1 FROM {from} WHERE {same_row}) OR EXISTS (SELECT 1 FROM {from} WHERE {same_row} AND m.group_name = ANY(${n}::text[])))",
            from = from,
            same_row = same_row,
            n = n
        ))
    }

    /// Check one row identified by `pk`. A row that does not exist passes, so the
    /// operation itself reports not-found or no-effect.
    pub async fn authorize_row(
        &self,
        session: &mut UnitOfWork,
        entity: &Entity,
        verb: Verb,
        caller: &Caller,
        pk: &[String],
    ) -> Result<(), AppError> {
        let mut q = QueryBuf::new();
        let predicate = match self.evaluate(entity, verb, caller, "t0", &mut q)? {
            Access::Granted => return Ok(()),
            Access::Denied => return Err(unauthorized(entity, verb)),
            Access::Rows(p) => p,
        };
        let cond = pk_condition(&mut q, entity, Some("t0"), pk);
        q.sql = format!(
            "SELECT ({}) AS allowed FROM {} t0 WHERE {}",
            predicate,
            entity_table(entity),
            cond
        );
        match session.fetch_scalar::<bool>(&q).await? {
            Some(false) => Err(unauthorized(entity, verb)),
            _ => Ok(()),
        }
    }
}

pub fn unauthorized(entity: &Entity, verb: Verb) -> AppError {
    AppError::Unauthorized(format!("{} on {}", verb, entity.name))
}
