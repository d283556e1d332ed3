//! Entity services: generic CRUD and filtering over resolved entities.
//!
//! Every operation receives the application context, an optional unit of work to join
//! and an optional caller. Without a unit of work the operation opens and finalizes its
//! own; without a caller it runs as an internal request and skips permission checks.

mod composite;
mod plan;
mod unary;

pub use composite::CompositeEntityService;
pub use plan::{InsertPlan, Row};
pub use unary::UnaryEntityService;

use crate::config::{Entity, Verb};
use crate::error::AppError;
use crate::permission::Caller;
use crate::query::QueryParams;
use crate::session::UnitOfWork;
use crate::sql::{cast_raw, json_to_param};
use crate::state::AppState;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

#[async_trait]
pub trait DatabaseService: Send + Sync {
    fn entity(&self) -> &Arc<Entity>;

    /// Unexecuted plan for one payload object, nested payloads included.
    fn plan(&self, state: &AppState, item: &Row) -> Result<InsertPlan, AppError>;

    /// Insert an object or a list of objects, overwriting rows whose key already exists.
    async fn create(
        &self,
        state: &AppState,
        data: &Value,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError>;

    /// Row identified by the raw primary key values, in declared key order.
    async fn read(
        &self,
        state: &AppState,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError>;

    /// Rows related to one row through `relationship`: an object (or null) for `one`,
    /// an array for `many`.
    async fn read_nested(
        &self,
        state: &AppState,
        pk: &[String],
        relationship: &str,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Value, AppError>;

    async fn filter(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Vec<Row>, AppError>;

    /// Number of rows `filter` would match, paging aside.
    async fn count(
        &self,
        state: &AppState,
        params: &QueryParams,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<i64, AppError>;

    async fn update(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError>;

    /// Insert the row with this key or merge `data` into the existing one.
    async fn create_or_update(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError>;

    async fn delete(
        &self,
        state: &AppState,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<(), AppError>;

    /// Store the row at `pk`, with `data` merged over it, as the next version of a
    /// versioned entity. Only the latest version can be released. Many-to-many links are
    /// copied to the new version and one-to-many children move to it.
    async fn release(
        &self,
        state: &AppState,
        pk: &[String],
        data: &Row,
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<Row, AppError>;

    /// Check `verb` on an existing row, e.g. before handing out a download.
    async fn authorize(
        &self,
        state: &AppState,
        verb: Verb,
        pk: &[String],
        session: Option<&mut UnitOfWork>,
        caller: Option<&Caller>,
    ) -> Result<(), AppError>;
}

/// Cast raw key values to their columns' types, in declared key order.
pub fn cast_pk(entity: &Entity, raw: &[String]) -> Result<Vec<String>, AppError> {
    if raw.len() != entity.pk_columns.len() {
        return Err(AppError::BadRequest(format!(
            "{}: expected {} primary key value(s), got {}",
            entity.name,
            entity.pk_columns.len(),
            raw.len()
        )));
    }
    entity.pk().zip(raw).map(|(c, v)| cast_raw(c, v)).collect()
}

/// Key values of a row returned by the store.
pub(crate) fn row_pk(entity: &Entity, row: &Row) -> Result<Vec<String>, AppError> {
    entity
        .pk()
        .map(|c| {
            json_to_param(c, row.get(&c.name).unwrap_or(&Value::Null))?
                .ok_or_else(|| AppError::CreateFailed(format!("{}: row without '{}'", entity.name, c.name)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use serde_json::json;

    #[test]
    fn pk_values_are_cast_in_key_order() {
        let model = fixtures::model();
        let pair = model.entity("Pair").unwrap();
        assert_eq!(cast_pk(pair, &["07".into(), "x_y".into()]).unwrap(), vec!["7".to_string(), "x_y".to_string()]);
        assert!(matches!(cast_pk(pair, &["x".into(), "y".into()]), Err(AppError::BadRequest(_))));
        assert!(matches!(cast_pk(pair, &["1".into()]), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn row_keys_come_back_as_text() {
        let model = fixtures::model();
        let pair = model.entity("Pair").unwrap();
        let row = json!({"a": 3, "b": "k", "v": "1.50"}).as_object().cloned().unwrap();
        assert_eq!(row_pk(pair, &row).unwrap(), vec!["3".to_string(), "k".to_string()]);
        let row = json!({"b": "k"}).as_object().cloned().unwrap();
        assert!(row_pk(pair, &row).is_err());
    }
}
