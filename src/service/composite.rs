//! Entities with relationships: nested payloads become multi-statement insert plans.

use super::unary::{as_object, create_or_update_with};
use super::{DatabaseService, InsertPlan, Row, UnaryEntityService};
use crate::config::{Cardinality, Entity, Verb};
use crate::error::AppError;
use crate::permission::Caller;
use crate::query::QueryParams;
use crate::session::{Scope, UnitOfWork};
use crate::sql::ConflictMode;
use crate::state::AppState;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Wraps the unary service: reads, updates and deletes touch the root row only;
/// create walks the relationships present in the payload.
pub struct CompositeEntityService {
    inner: UnaryEntityService,
    entity: Arc<Entity>,
}

impl CompositeEntityService {
    pub fn new(entity: Arc<Entity>) -> Self {
        Self {
            inner: UnaryEntityService::new(entity.clone()),
            entity,
        }
    }

    /// Drop relationship keys; updates never cascade into nested rows.
    fn scalar_part(&self, data: &Row) -> Row {
        let mut data = data.clone();
        for rel in &self.entity.relationships {
            if data.remove(&rel.name).is_some() {
                tracing::debug!(entity = %self.entity.name, relationship = %rel.name, "nested value ignored on update");
            }
        }
        data
    }

    /// Each item of a list runs in its own step: committed before the next starts when
    /// this call owns the unit of work, so a failure leaves the earlier items in place.
    async fn create_in(
        &self,
        state: &AppState,
        data: &Value,
        scope: &mut Scope<'_>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        let (items, single) = match data {
            Value::Object(item) => (vec![item.clone()], true),
            Value::Array(items) => (items.iter().map(as_object).collect::<Result<Vec<_>, _>>()?, false),
            _ => {
                return Err(AppError::BadRequest(format!(
                    "{}: expected an object or a list of objects",
                    self.entity.name
                )))
            }
        };
        let total = items.len();
        let mut created = Vec::with_capacity(total);
        for (i, item) in items.iter().enumerate() {
            let plan = self.plan(state, item)?;
            tracing::debug!(entity = %self.entity.name, item = i, rows = plan.row_count(), "executing insert plan");
            let mut rows = plan
                .execute(state, scope.session(), caller, ConflictMode::Overwrite)
                .await?;
            let row = rows
                .pop()
                .ok_or_else(|| AppError::CreateFailed(format!("{}: insert returned no row", self.entity.name)))?;
            created.push(Value::Object(row));
            if i + 1 < total {
                scope.checkpoint().await?;
            }
        }
        if single {
            created
                .pop()
                .ok_or_else(|| AppError::CreateFailed(format!("{}: insert returned no row", self.entity.name)))
        } else {
            Ok(Value::Array(created))
        }
    }
}

#[async_trait]
impl DatabaseService for CompositeEntityService {
    fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    /// Split relationship values off the payload: `one` targets become pre plans,
    /// `many` items become post plans. Only relationships present in the payload are
    /// followed, so cyclic schemas terminate.
    fn plan(&self, state: &AppState, item: &Row) -> Result<InsertPlan, AppError> {
        let mut data = item.clone();
        let mut plan = InsertPlan::new(self.entity.clone(), Vec::with_capacity(1));
        for rel in &self.entity.relationships {
            let Some(value) = data.remove(&rel.name) else { continue };
            let target = state.service(&rel.target)?;
            match (rel.cardinality(), value) {
                (_, Value::Null) => {}
                (Cardinality::One, Value::Object(obj)) => {
                    plan.pre.insert(rel.name.clone(), target.plan(state, &obj)?);
                }
                (Cardinality::Many, Value::Array(values)) => {
                    let nested = values
                        .iter()
                        .map(|v| as_object(v).and_then(|obj| target.plan(state, &obj)))
                        .collect::<Result<Vec<_>, _>>()?;
                    if !nested.is_empty() {
                        plan.post.insert(rel.name.clone(), nested);
                    }
                }
                (Cardinality::One, _) => {
                    return Err(AppError::BadRequest(format!(
                        "{}.{} expects an object",
                        self.entity.name, rel.name
                    )))
                }
                (Cardinality::Many, _) => {
                    return Err(AppError::BadRequest(format!(
                        "{}.{} expects a list",
                        self.entity.name, rel.name
                    )))
                }
            }
        }
        plan.rows.push(data);
        Ok(plan)
    }

    async fn create(
        &self,
        state: &AppState,
        data: &Value,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        let mut scope = Scope::enter(&state.pool, session).await?;
        let result = self.create_in(state, data, &mut scope, caller).await;
        scope.finish(result).await
    }

    async fn read(
        &self,
        state: &AppState,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        self.inner.read(state, pk, session, caller).await
    }

    async fn read_nested(
        &self,
        state: &AppState,
        pk: &[String],
        relationship: &str,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError> {
        self.inner.read_nested(state, pk, relationship, session, caller).await
    }

    async fn filter(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Vec<Row>, AppError> {
        self.inner.filter(state, params, session, caller).await
    }

    async fn count(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<i64, AppError> {
        self.inner.count(state, params, session, caller).await
    }

    async fn update(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let data = self.scalar_part(data);
        self.inner.update(state, pk, &data, session, caller).await
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
        self.inner.delete(state, pk, session, caller).await
    }

    async fn release(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError> {
        let data = self.scalar_part(data);
        self.inner.release(state, pk, &data, session, caller).await
    }

    async fn authorize(
        &self,
        state: &AppState,
        verb: Verb,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<(), AppError> {
        self.inner.authorize(state, verb, pk, session, caller).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::fixtures;
    use serde_json::json;

    fn state() -> AppState {
        let settings = Settings::default();
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy(&settings.database_url)
            .unwrap();
        AppState::new(pool, fixtures::model(), settings)
    }

    fn obj(v: Value) -> Row {
        v.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn plan_splits_nested_payload() {
        let state = state();
        let svc = state.service("A").unwrap();
        let plan = svc
            .plan(&state, &obj(json!({"x": 1, "y": 2, "c": {"data": "1234"}, "bs": [{"name": "bip"}, {"name": "bap"}]})))
            .unwrap();
        assert_eq!(plan.rows, vec![obj(json!({"x": 1, "y": 2}))]);
        assert_eq!(plan.pre["c"].rows, vec![obj(json!({"data": "1234"}))]);
        assert_eq!(plan.post["bs"].len(), 2);
        assert_eq!(plan.row_count(), 4);
    }

    #[tokio::test]
    async fn plan_follows_payload_not_schema() {
        let state = state();
        let svc = state.service("Node").unwrap();
        let plan = svc
            .plan(&state, &obj(json!({"label": "root", "children": [{"label": "leaf", "children": []}]})))
            .unwrap();
        assert!(plan.pre.is_empty());
        let leaf = &plan.post["children"][0];
        assert!(leaf.post.is_empty());
        assert_eq!(plan.row_count(), 2);
    }

    #[tokio::test]
    async fn plan_checks_cardinality_shape() {
        let state = state();
        let svc = state.service("A").unwrap();
        assert!(matches!(svc.plan(&state, &obj(json!({"c": [1]}))), Err(AppError::BadRequest(_))));
        assert!(matches!(svc.plan(&state, &obj(json!({"bs": {"name": "x"}}))), Err(AppError::BadRequest(_))));
        assert!(matches!(svc.plan(&state, &obj(json!({"bs": [3]}))), Err(AppError::BadRequest(_))));
        let plan = svc.plan(&state, &obj(json!({"x": 1, "c": null}))).unwrap();
        assert!(plan.pre.is_empty());
    }

    #[tokio::test]
    async fn update_payload_drops_relationships() {
        let model = fixtures::model();
        let svc = CompositeEntityService::new(model.entity("A").unwrap().clone());
        let data = svc.scalar_part(&obj(json!({"x": 5, "bs": [{"name": "q"}]})));
        assert_eq!(data, obj(json!({"x": 5})));
    }
}
