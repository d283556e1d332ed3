//! Insertion plans for nested payloads.
//!
//! A plan holds the rows of one entity plus the plans that must run before it (targets
//! of `one` relationships, whose keys the rows store) and after it (children of `many`
//! relationships, which reference the rows' keys). SQL is rendered at execution time,
//! once the keys produced by earlier steps are known.

use crate::config::{Entity, RelationshipKind, Verb};
use crate::error::AppError;
use crate::permission::Caller;
use crate::session::{BoxFuture, UnitOfWork};
use crate::sql::{insert_association, insert_rows, supplied_key, ConflictMode};
use crate::state::AppState;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Row = Map<String, Value>;

type PlanFuture<'a> = BoxFuture<'a, Result<Vec<Row>, AppError>>;

#[derive(Debug, Clone)]
pub struct InsertPlan {
    pub entity: Arc<Entity>,
    /// Scalar payloads, one per row to insert.
    pub rows: Vec<Row>,
    /// `one` relationship name -> plan of the row the root references.
    pub pre: BTreeMap<String, InsertPlan>,
    /// `many` relationship name -> plans of the rows referencing the root.
    pub post: BTreeMap<String, Vec<InsertPlan>>,
}

impl InsertPlan {
    pub fn new(entity: Arc<Entity>, rows: Vec<Row>) -> Self {
        Self {
            entity,
            rows,
            pre: BTreeMap::new(),
            post: BTreeMap::new(),
        }
    }

    /// Number of rows this plan inserts, nested plans included.
    pub fn row_count(&self) -> usize {
        self.rows.len()
            + self.pre.values().map(InsertPlan::row_count).sum::<usize>()
            + self.post.values().flatten().map(InsertPlan::row_count).sum::<usize>()
    }

    /// Run pre plans, the root insert, then post plans, all in `session`. Returns the
    /// inserted rows with nested rows attached under their relationship names. Create
    /// permission is checked on every inserted row before returning.
    pub fn execute<'a>(
        self,
        state: &'a AppState,
        session: &'a mut UnitOfWork,
        caller: Option<&'a Caller>,
        mode: ConflictMode,
    ) -> PlanFuture<'a> {
        Box::pin(async move {
            let InsertPlan {
                entity,
                mut rows,
                pre,
                post,
            } = self;

            let mut parents = Vec::with_capacity(pre.len());
            for (name, plan) in pre {
                let rel = entity
                    .relationship(&name)
                    .ok_or_else(|| AppError::BadRequest(format!("{}: unknown relationship '{}'", entity.name, name)))?;
                let RelationshipKind::ManyToOne { pairs } = &rel.kind else {
                    return Err(AppError::BadRequest(format!("{}.{} is not a 'one' relationship", entity.name, name)));
                };
                let pairs = pairs.clone();
                let parent = plan
                    .execute(state, session, caller, ConflictMode::Overwrite)
                    .await?
                    .pop()
                    .ok_or_else(|| AppError::CreateFailed(format!("{}.{}: nested insert returned no row", entity.name, name)))?;
                for row in rows.iter_mut() {
                    for kp in &pairs {
                        row.insert(kp.local.clone(), parent.get(&kp.remote).cloned().unwrap_or(Value::Null));
                    }
                }
                parents.push((name, parent));
            }

            let mut created = if entity.is_versioned() {
                insert_versions(&entity, &rows, session).await?
            } else {
                let q = insert_rows(&entity, &rows, mode)?;
                session.fetch_all(&q).await.map_err(AppError::on_create)?
            };
            if created.len() != rows.len() {
                return Err(AppError::CreateFailed(format!(
                    "{}: expected {} row(s), store returned {}",
                    entity.name,
                    rows.len(),
                    created.len()
                )));
            }
            tracing::debug!(entity = %entity.name, rows = created.len(), "rows inserted");

            if let Some(caller) = caller {
                let evaluator = state.evaluator();
                for row in &created {
                    let pk = super::row_pk(&entity, row)?;
                    evaluator.authorize_row(session, &entity, Verb::Create, caller, &pk).await?;
                }
            }

            if !post.is_empty() {
                let root = match created.as_slice() {
                    [one] => one.clone(),
                    _ => {
                        return Err(AppError::BadRequest(format!(
                            "{}: nested collections need exactly one root row",
                            entity.name
                        )))
                    }
                };
                for (name, plans) in post {
                    let rel = entity
                        .relationship(&name)
                        .ok_or_else(|| AppError::BadRequest(format!("{}: unknown relationship '{}'", entity.name, name)))?
                        .clone();
                    let mut children = Vec::new();
                    for mut plan in plans {
                        match &rel.kind {
                            RelationshipKind::OneToMany { pairs } => {
                                for row in plan.rows.iter_mut() {
                                    for kp in pairs {
                                        row.insert(kp.remote.clone(), root.get(&kp.local).cloned().unwrap_or(Value::Null));
                                    }
                                }
                                children.extend(plan.execute(state, session, caller, ConflictMode::Overwrite).await?);
                            }
                            RelationshipKind::ManyToMany { association } => {
                                let target = state.model.target_of(&rel)?.clone();
                                let inserted = plan.execute(state, session, caller, ConflictMode::Overwrite).await?;
                                for child in &inserted {
                                    let q = insert_association(association, &entity, &root, &target, child)?;
                                    session.execute(&q).await.map_err(AppError::on_create)?;
                                }
                                children.extend(inserted);
                            }
                            RelationshipKind::ManyToOne { .. } => {
                                return Err(AppError::BadRequest(format!(
                                    "{}.{} is not a 'many' relationship",
                                    entity.name, name
                                )))
                            }
                        }
                    }
                    created[0].insert(name, Value::Array(children.into_iter().map(Value::Object).collect()));
                }
            }

            for (name, parent) in parents {
                for row in created.iter_mut() {
                    row.insert(name.clone(), Value::Object(parent.clone()));
                }
            }
            Ok(created)
        })
    }
}

/// Rows of a versioned entity go in one by one. A row naming a full key and nothing
/// else refers to the stored version; any other row must be a new version.
async fn insert_versions(entity: &Entity, rows: &[Row], session: &mut UnitOfWork) -> Result<Vec<Row>, AppError> {
    let mut created = Vec::with_capacity(rows.len());
    for row in rows {
        let reference = supplied_key(entity, row)?.is_some() && row.keys().all(|k| entity.is_pk(k));
        let mode = if reference { ConflictMode::Keep } else { ConflictMode::Reject };
        let q = insert_rows(entity, std::slice::from_ref(row), mode)?;
        let inserted = session.fetch_all(&q).await.map_err(|e| {
            if e.is_unique_violation() {
                AppError::UpdateVersioned(format!("{}: stored versions cannot change, release a new one", entity.name))
            } else {
                e.on_create()
            }
        })?;
        created.extend(inserted);
    }
    Ok(created)
}
