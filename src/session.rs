//! Unit of work: one transaction shared by every statement of an operation.
//!
//! A [`UnitOfWork`] is finalized only by value (`commit(self)` / `rollback(self)`), so code
//! that merely borrows one can never end the transaction. Dropping an unfinalized unit
//! rolls it back, which covers early returns, panics and cancelled futures alike.

use crate::error::AppError;
use crate::sql::{row_to_json, QueryBuf};
use serde_json::{Map, Value};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub struct UnitOfWork {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

fn bind_all<'q>(q: &'q QueryBuf) -> Query<'q, Postgres, PgArguments> {
    let mut query = sqlx::query(&q.sql);
    for p in &q.params {
        query = query.bind(p.as_deref());
    }
    query
}

impl UnitOfWork {
    pub async fn begin(pool: &PgPool) -> Result<Self, AppError> {
        let tx = pool.begin().await?;
        tracing::debug!("unit of work opened");
        Ok(Self {
            pool: pool.clone(),
            tx: Some(tx),
        })
    }

    pub fn is_open(&self) -> bool {
        self.tx.is_some()
    }

    /// Connection of the open transaction. Fails fast once the unit is closed.
    pub fn connection(&mut self) -> Result<&mut PgConnection, AppError> {
        self.tx.as_deref_mut().ok_or(AppError::SessionClosed)
    }

    /// Commit what has been done so far and continue in a fresh transaction.
    pub(crate) async fn checkpoint(&mut self) -> Result<(), AppError> {
        let tx = self.tx.take().ok_or(AppError::SessionClosed)?;
        tx.commit().await?;
        self.tx = Some(self.pool.begin().await?);
        tracing::debug!("unit of work checkpoint");
        Ok(())
    }

    pub async fn commit(mut self) -> Result<(), AppError> {
        let tx = self.tx.take().ok_or(AppError::SessionClosed)?;
        tx.commit().await?;
        tracing::debug!("unit of work committed");
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<(), AppError> {
        let tx = self.tx.take().ok_or(AppError::SessionClosed)?;
        tx.rollback().await?;
        tracing::debug!("unit of work rolled back");
        Ok(())
    }

    pub async fn fetch_all(&mut self, q: &QueryBuf) -> Result<Vec<Map<String, Value>>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let conn = self.connection()?;
        let rows = bind_all(q).fetch_all(&mut *conn).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    pub async fn fetch_optional(&mut self, q: &QueryBuf) -> Result<Option<Map<String, Value>>, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let conn = self.connection()?;
        let row = bind_all(q).fetch_optional(&mut *conn).await?;
        Ok(row.map(|r| row_to_json(&r)))
    }

    /// Single scalar of the first row, e.g. `SELECT COUNT(*)`.
    pub async fn fetch_scalar<T>(&mut self, q: &QueryBuf) -> Result<Option<T>, AppError>
    where
        T: for<'r> sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres> + Send + Unpin,
    {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let conn = self.connection()?;
        let row = bind_all(q).fetch_optional(&mut *conn).await?;
        match row {
            Some(r) => {
                use sqlx::Row;
                Ok(r.try_get::<Option<T>, _>(0)?)
            }
            None => Ok(None),
        }
    }

    /// Execute without reading rows; returns rows affected.
    pub async fn execute(&mut self, q: &QueryBuf) -> Result<u64, AppError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "execute");
        let conn = self.connection()?;
        let done = bind_all(q).execute(&mut *conn).await?;
        Ok(done.rows_affected())
    }
}

/// The unit of work an operation runs in: the caller's, or one opened for the operation.
pub enum Scope<'a> {
    Owned(UnitOfWork),
    Borrowed(&'a mut UnitOfWork),
}

impl<'a> Scope<'a> {
    /// Reuse `session` when given, otherwise open a new unit owned by this scope.
    pub async fn enter(pool: &PgPool, session: Option<&'a mut UnitOfWork>) -> Result<Scope<'a>, AppError> {
        match session {
            Some(s) => Ok(Scope::Borrowed(s)),
            None => Ok(Scope::Owned(UnitOfWork::begin(pool).await?)),
        }
    }

    pub fn owns(&self) -> bool {
        matches!(self, Scope::Owned(_))
    }

    pub fn session(&mut self) -> &mut UnitOfWork {
        match self {
            Scope::Owned(s) => s,
            Scope::Borrowed(s) => &mut **s,
        }
    }

    /// Commit and continue, only when this scope owns the unit. A borrowed unit belongs
    /// to an outer operation that decides when it commits.
    pub async fn checkpoint(&mut self) -> Result<(), AppError> {
        match self {
            Scope::Owned(s) => s.checkpoint().await,
            Scope::Borrowed(_) => Ok(()),
        }
    }

    /// Finalize an owned unit according to `result`: commit on success, roll back on
    /// error. Borrowed units pass through untouched.
    pub async fn finish<T>(self, result: Result<T, AppError>) -> Result<T, AppError> {
        match self {
            Scope::Borrowed(_) => result,
            Scope::Owned(s) => match result {
                Ok(v) => {
                    s.commit().await?;
                    Ok(v)
                }
                Err(e) => {
                    if let Err(rb) = s.rollback().await {
                        tracing::warn!(error = %rb, "rollback failed");
                    }
                    Err(e)
                }
            },
        }
    }
}

/// Run `body` in `session` when given, otherwise in a unit opened here and committed
/// or rolled back by the result.
///
/// ```ignore
/// session::run(&state.pool, None, move |s| {
///     Box::pin(async move { svc.create(&state, &data, Some(s), None).await })
/// })
/// .await?;
/// ```
pub async fn run<T, F>(pool: &PgPool, session: Option<&mut UnitOfWork>, body: F) -> Result<T, AppError>
where
    F: for<'s> FnOnce(&'s mut UnitOfWork) -> BoxFuture<'s, Result<T, AppError>>,
{
    let mut scope = Scope::enter(pool, session).await?;
    let result = body(scope.session()).await;
    scope.finish(result).await
}
