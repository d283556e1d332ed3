//! Typed errors and HTTP mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid primary key: entity {entity} column {column}")]
    InvalidPrimaryKey { entity: String, column: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("unsupported column type '{ty}' for {entity}.{column}")]
    UnsupportedType {
        entity: String,
        column: String,
        ty: String,
    },
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Abstract error kinds surfaced to callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request data: filter syntax, casts, unknown attributes.
    Input,
    NotFound,
    /// Update or delete that touched no row.
    NoEffect,
    /// Insert that produced no row.
    Structural,
    Forbidden,
    Internal,
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("read failed: {0}")]
    NotFound(String),
    #[error("create failed: {0}")]
    CreateFailed(String),
    #[error("update failed: {0}")]
    UpdateFailed(String),
    #[error("delete failed: {0}")]
    DeleteFailed(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Stored versions are immutable; changes go through a release.
    #[error("update of a versioned row: {0}")]
    UpdateVersioned(String),
    #[error("release failed: {0}")]
    ReleaseVersion(String),
    #[error("unit of work already finalized")]
    SessionClosed,
    #[error("database: {0}")]
    Db(#[from] sqlx::Error),
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::BadRequest(_) | AppError::UpdateVersioned(_) => ErrorKind::Input,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::UpdateFailed(_) | AppError::DeleteFailed(_) => ErrorKind::NoEffect,
            AppError::CreateFailed(_) | AppError::ReleaseVersion(_) => ErrorKind::Structural,
            AppError::Unauthorized(_) => ErrorKind::Forbidden,
            AppError::Config(_) | AppError::SessionClosed | AppError::Db(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(self, AppError::Db(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505"))
    }

    /// Reclassify driver errors raised by an insert: constraint violations are structural,
    /// bad literals are client input.
    pub(crate) fn on_create(self) -> Self {
        match self {
            AppError::Db(sqlx::Error::Database(db)) => match db.code().as_deref() {
                // unique, foreign key, not null, check, same key twice in one upsert
                Some("23505") | Some("23503") | Some("23502") | Some("23514") | Some("21000") => {
                    AppError::CreateFailed(db.message().to_string())
                }
                // invalid text representation, numeric out of range
                Some("22P02") | Some("22003") => AppError::BadRequest(db.message().to_string()),
                _ => AppError::Db(sqlx::Error::Database(db)),
            },
            other => other,
        }
    }

    /// Reclassify driver errors raised by a delete: a row still referenced by a key that
    /// cannot be cleared is a request the caller has to change.
    pub(crate) fn on_delete(self) -> Self {
        match self {
            AppError::Db(sqlx::Error::Database(db)) => match db.code().as_deref() {
                // foreign key, not null
                Some("23503") | Some("23502") => {
                    AppError::BadRequest(format!("row is still referenced: {}", db.message()))
                }
                _ => AppError::Db(sqlx::Error::Database(db)),
            },
            other => other,
        }
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match self.kind() {
            ErrorKind::Input if matches!(self, AppError::UpdateVersioned(_)) => {
                (StatusCode::METHOD_NOT_ALLOWED, "update_versioned")
            }
            ErrorKind::Input => (StatusCode::BAD_REQUEST, "bad_request"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::NoEffect => (StatusCode::NOT_FOUND, "no_effect"),
            ErrorKind::Structural => (StatusCode::CONFLICT, "create_failed"),
            ErrorKind::Forbidden => (StatusCode::FORBIDDEN, "unauthorized"),
            ErrorKind::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details: None,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(AppError::BadRequest("x".into()).kind(), ErrorKind::Input);
        assert_eq!(AppError::NotFound("x".into()).kind(), ErrorKind::NotFound);
        assert_eq!(AppError::UpdateFailed("x".into()).kind(), ErrorKind::NoEffect);
        assert_eq!(AppError::DeleteFailed("x".into()).kind(), ErrorKind::NoEffect);
        assert_eq!(AppError::CreateFailed("x".into()).kind(), ErrorKind::Structural);
        assert_eq!(AppError::Unauthorized("x".into()).kind(), ErrorKind::Forbidden);
        assert_eq!(AppError::UpdateVersioned("x".into()).kind(), ErrorKind::Input);
        assert_eq!(AppError::ReleaseVersion("x".into()).kind(), ErrorKind::Structural);
        assert_eq!(AppError::SessionClosed.kind(), ErrorKind::Internal);
    }

    #[test]
    fn non_driver_errors_pass_reclassification_untouched() {
        assert!(matches!(AppError::NotFound("x".into()).on_delete(), AppError::NotFound(_)));
        assert!(matches!(AppError::SessionClosed.on_create(), AppError::SessionClosed));
        assert!(matches!(AppError::Db(sqlx::Error::RowNotFound).on_delete(), AppError::Db(_)));
        assert!(!AppError::Db(sqlx::Error::RowNotFound).is_unique_violation());
    }

    #[test]
    fn status_codes() {
        let resp = AppError::BadRequest("bad".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = AppError::DeleteFailed("gone".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = AppError::Unauthorized("no".into()).into_response();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        let resp = AppError::UpdateVersioned("v".into()).into_response();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let resp = AppError::ReleaseVersion("v".into()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
