//! CRUD against a single entity table.

use super::{cast_pk, DatabaseService, InsertPlan, Row};
use crate::config::{Cardinality, Entity, RelationshipKind, Verb, VERSION_COLUMN};
use crate::error::AppError;
use crate::permission::{Access, Caller};
use crate::query::{FilterCompiler, FilterQuery, QueryParams};
use crate::session::{Scope, UnitOfWork};
use crate::sql::{
    copy_associations, delete_by_pk, insert_rows, latest_version, pk_condition, repoint_children, select_by_pk,
    update_by_pk, ConflictMode,
};
use crate::state::AppState;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

const ROOT: &str = "t0";

pub struct UnaryEntityService {
    entity: Arc<Entity>,
}

impl UnaryEntityService {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self { entity }
    }

    async fn check(
        &self,
        state: &AppState,
        session: &mut UnitOfWork,
        verb: Verb,
        pk: &[String],
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        match caller {
            Some(c) => state.evaluator().authorize_row(session, &self.entity, verb, c, pk).await,
            None => Ok(()),
        }
    }

    async fn fetch_row(&self, session: &mut UnitOfWork, pk: &[String]) -> Result<Option<Row>, AppError> {
        session.fetch_optional(&select_by_pk(&self.entity, pk)).await
    }

    async fn read_in(
        &self,
        state: &AppState,
        pk: &[String],
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let pk = cast_pk(&self.entity, pk)?;
        self.check(state, session, Verb::Read, &pk, caller).await?;
        self.fetch_row(session, &pk)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", self.entity.name, pk.join("_"))))
    }

    /// Compile `params` with read permissions applied. `None` when the caller may not
    /// read any row.
    fn compile<'m>(
        &self,
        state: &'m AppState,
        query: &FilterQuery,
        caller: Option<&Caller>,
    ) -> Result<Option<FilterCompiler<'m>>, AppError> {
        let mut compiler = FilterCompiler::new(&state.model, self.entity.clone());
        compiler.apply(query)?;
        if let Some(c) = caller {
            match state.evaluator().evaluate(&self.entity, Verb::Read, c, ROOT, compiler.buf_mut())? {
                Access::Granted => {}
                Access::Denied => return Ok(None),
                Access::Rows(p) => compiler.push_predicate(p),
            }
        }
        Ok(Some(compiler))
    }

    async fn filter_in(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Vec<Row>, AppError> {
        let query = FilterQuery::parse(params)?;
        let Some(compiler) = self.compile(state, &query, caller)? else {
            return Ok(Vec::new());
        };
        let q = compiler.into_select(state.settings.limit(query.limit), query.offset);
        session.fetch_all(&q).await
    }

    async fn count_in(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<i64, AppError> {
        let query = FilterQuery::parse(params)?;
        let Some(compiler) = self.compile(state, &query, caller)? else {
            return Ok(0);
        };
        Ok(session.fetch_scalar::<i64>(&compiler.into_count()).await?.unwrap_or(0))
    }

    async fn read_nested_in(
        &self,
        state: &AppState,
        pk: &[String],
        relationship: &str,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        let rel = self
            .entity
            .relationship(relationship)
            .ok_or_else(|| AppError::BadRequest(format!("{}: unknown relationship '{}'", self.entity.name, relationship)))?;
        self.read_in(state, pk, session, caller).await?;
        let pk = cast_pk(&self.entity, pk)?;

        let mut compiler = FilterCompiler::new(&state.model, self.entity.clone());
        let cond = pk_condition(compiler.buf_mut(), &self.entity, Some(ROOT), &pk);
        compiler.push_predicate(cond);
        let path = vec![rel.name.clone()];
        let (alias, target) = compiler.resolve_path(&path)?;
        let denied = match caller {
            Some(c) => match state.evaluator().evaluate(&target, Verb::Read, c, &alias, compiler.buf_mut())? {
                Access::Granted => false,
                Access::Denied => true,
                Access::Rows(p) => {
                    compiler.push_predicate(p);
                    false
                }
            },
            None => false,
        };
        let rows = if denied {
            Vec::new()
        } else {
            session.fetch_all(&compiler.into_select_joined(&path)?).await?
        };
        Ok(match rel.cardinality() {
            Cardinality::One => rows.into_iter().next().map(Value::Object).unwrap_or(Value::Null),
            Cardinality::Many => Value::Array(rows.into_iter().map(Value::Object).collect()),
        })
    }

    async fn update_in(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let pk = cast_pk(&self.entity, pk)?;
        if self.entity.is_versioned() && data.keys().any(|k| !self.entity.is_pk(k)) {
            return Err(AppError::UpdateVersioned(format!(
                "{} {}: stored versions cannot change, release a new one",
                self.entity.name,
                pk.join("_")
            )));
        }
        self.check(state, session, Verb::Update, &pk, caller).await?;
        let q = update_by_pk(&self.entity, &pk, data)?;
        session
            .fetch_optional(&q)
            .await?
            .ok_or_else(|| AppError::UpdateFailed(format!("{} {} does not exist", self.entity.name, pk.join("_"))))
    }

    async fn delete_in(
        &self,
        state: &AppState,
        pk: &[String],
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        let pk = cast_pk(&self.entity, pk)?;
        self.check(state, session, Verb::Delete, &pk, caller).await?;
        let affected = session
            .execute(&delete_by_pk(&self.entity, &pk))
            .await
            .map_err(AppError::on_delete)?;
        if affected == 0 {
            return Err(AppError::DeleteFailed(format!("{} {} does not exist", self.entity.name, pk.join("_"))));
        }
        tracing::debug!(entity = %self.entity.name, pk = %pk.join("_"), "row deleted");
        Ok(())
    }

    async fn release_in(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let entity = &self.entity;
        if !entity.is_versioned() {
            return Err(AppError::BadRequest(format!("{}: entity is not versioned", entity.name)));
        }
        let pk = cast_pk(entity, pk)?;
        self.check(state, session, Verb::Update, &pk, caller).await?;
        let old = self
            .fetch_row(session, &pk)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("{} {}", entity.name, pk.join("_"))))?;

        let current = entity
            .pk_columns
            .iter()
            .position(|p| p == VERSION_COLUMN)
            .and_then(|i| pk[i].parse::<i64>().ok())
            .ok_or_else(|| AppError::BadRequest(format!("{}: key without a version", entity.name)))?;
        let latest = session.fetch_scalar::<i64>(&latest_version(entity, &pk)).await?.unwrap_or(current);
        if latest != current {
            return Err(AppError::ReleaseVersion(format!(
                "{} {}: version {} is already released, latest is {}",
                entity.name,
                pk.join("_"),
                current,
                latest
            )));
        }

        let mut item = old.clone();
        for (k, v) in data {
            if !entity.is_pk(k) {
                item.insert(k.clone(), v.clone());
            }
        }
        item.insert(VERSION_COLUMN.to_string(), Value::from(current + 1));
        let q = insert_rows(entity, std::slice::from_ref(&item), ConflictMode::Reject)?;
        let released = session
            .fetch_optional(&q)
            .await
            .map_err(|e| {
                if e.is_unique_violation() {
                    AppError::ReleaseVersion(format!("{}: version {} already exists", entity.name, current + 1))
                } else {
                    e.on_create()
                }
            })?
            .ok_or_else(|| AppError::CreateFailed(format!("{}: release returned no row", entity.name)))?;

        for rel in &entity.relationships {
            match &rel.kind {
                RelationshipKind::ManyToMany { association } => {
                    session.execute(&copy_associations(association, entity, &old, &released)?).await?;
                }
                RelationshipKind::OneToMany { pairs } => {
                    let child = state.model.target_of(rel)?;
                    session.execute(&repoint_children(child, pairs, &old, &released)?).await?;
                }
                RelationshipKind::ManyToOne { .. } => {}
            }
        }
        tracing::info!(entity = %entity.name, pk = %pk.join("_"), version = current + 1, "version released");
        Ok(released)
    }

    async fn authorize_in(
        &self,
        state: &AppState,
        verb: Verb,
        pk: &[String],
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        let pk = cast_pk(&self.entity, pk)?;
        if verb == Verb::Download && self.entity.capabilities.files.is_none() {
            return Err(AppError::BadRequest(format!("{}: entity does not store files", self.entity.name)));
        }
        self.check(state, session, verb, &pk, caller).await?;
        match self.fetch_row(session, &pk).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("{} {}", self.entity.name, pk.join("_")))),
        }
    }

    /// One batched statement for a list, a single row otherwise.
    async fn create_in(
        &self,
        state: &AppState,
        data: &Value,
        session: &mut UnitOfWork,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        match data {
            Value::Object(item) => {
                let plan = self.plan(state, item)?;
                let mut rows = plan.execute(state, session, caller, ConflictMode::Overwrite).await?;
                rows.pop()
                    .map(Value::Object)
                    .ok_or_else(|| AppError::CreateFailed(format!("{}: insert returned no row", self.entity.name)))
            }
            Value::Array(items) => {
                let rows = items.iter().map(as_object).collect::<Result<Vec<_>, _>>()?;
                if rows.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                let plan = InsertPlan::new(self.entity.clone(), rows);
                let rows = plan.execute(state, session, caller, ConflictMode::Overwrite).await?;
                Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
            }
            _ => Err(AppError::BadRequest(format!(
                "{}: expected an object or a list of objects",
                self.entity.name
            ))),
        }
    }
}

pub(super) fn as_object(v: &Value) -> Result<Row, AppError> {
    v.as_object()
        .cloned()
        .ok_or_else(|| AppError::BadRequest("expected an object".into()))
}

/// Merge key values from the path into `data` and write it with merge-on-conflict.
/// Shared by both services so nested payloads go through the composite plan.
pub(super) async fn create_or_update_with(
    service: &dyn DatabaseService,
    state: &AppState,
    pk: &[String],
    data: &Row,
    session: &mut UnitOfWork,
    caller: Option<&Caller>,
) -> Result<Row, AppError> {
    let entity = service.entity().clone();
    let cast = cast_pk(&entity, pk)?;
    if let Some(c) = caller {
        state.evaluator().authorize_row(session, &entity, Verb::Update, c, &cast).await?;
    }
    let mut item = data.clone();
    for (name, value) in entity.pk_columns.iter().zip(cast) {
        item.insert(name.clone(), Value::String(value));
    }
    let plan = service.plan(state, &item)?;
    plan.execute(state, session, caller, ConflictMode::Merge)
        .await?
        .pop()
        .ok_or_else(|| AppError::CreateFailed(format!("{}: upsert returned no row", entity.name)))
}

#[async_trait]
impl DatabaseService for UnaryEntityService {
    fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    fn plan(&self, _state: &AppState, item: &Row) -> Result<InsertPlan, AppError> {
        Ok(InsertPlan::new(self.entity.clone(), vec![item.clone()]))
    }

    async fn create(
        &self,
        state: &AppState,
        data: &Value,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.create_in(state, data, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn read(
        &self,
        state: &AppState,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.read_in(state, pk, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn read_nested(
        &self,
        state: &AppState,
        pk: &[String],
        relationship: &str,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.read_nested_in(state, pk, relationship, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn filter(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Vec<Row>, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.filter_in(state, params, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn count(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<i64, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.count_in(state, params, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn update(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.update_in(state, pk, data, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn create_or_update(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = create_or_update_with(self, state, pk, data, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn delete(
        &self,
        state: &AppState,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.delete_in(state, pk, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn release(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.release_in(state, pk, data, scope.session(), caller).await;
        scope.finish(result).await
    }

    async fn authorize(
        &self,
        state: &AppState,
        verb: Verb,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.authorize_in(state, verb, pk, scope.session(), caller).await;
        scope.finish(result).await
    }
}
