//! Convert request values to text parameters checked against the column's scalar type.
//! Every parameter is bound as text and cast in SQL (`$n::integer`), so the driver never
//! guesses a wire type and a malformed value is rejected before reaching the store.

use crate::config::{Column, ScalarType};
use crate::error::AppError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;

/// Cast a raw string (path segment, filter value) to the canonical text of `column`'s type.
pub fn cast_raw(column: &Column, raw: &str) -> Result<String, AppError> {
    cast_str(column.ty, raw).map_err(|reason| bad_value(column, raw, &reason))
}

/// Cast a JSON payload value. `null` maps to SQL NULL.
pub fn json_to_param(column: &Column, value: &Value) -> Result<Option<String>, AppError> {
    let text = match (column.ty, value) {
        (_, Value::Null) => return Ok(None),
        (ScalarType::Json | ScalarType::Jsonb, v) => return Ok(Some(v.to_string())),
        (_, Value::Array(_) | Value::Object(_)) => {
            return Err(bad_value(column, &value.to_string(), "structured value for a scalar column"))
        }
        (_, Value::String(s)) => s.clone(),
        (_, other) => other.to_string(),
    };
    cast_str(column.ty, &text)
        .map(Some)
        .map_err(|reason| bad_value(column, &text, &reason))
}

fn bad_value(column: &Column, raw: &str, reason: &str) -> AppError {
    AppError::BadRequest(format!(
        "value '{}' for '{}' ({}): {}",
        raw,
        column.name,
        column.ty.pg_cast(),
        reason
    ))
}

fn cast_str(ty: ScalarType, raw: &str) -> Result<String, String> {
    let s = raw.trim();
    match ty {
        ScalarType::SmallInt => parse_int(s, i16::MIN as i64, i16::MAX as i64),
        ScalarType::Integer => parse_int(s, i32::MIN as i64, i32::MAX as i64),
        ScalarType::BigInt => parse_int(s, i64::MIN, i64::MAX),
        ScalarType::Real | ScalarType::Double | ScalarType::Numeric => {
            let f: f64 = s.parse().map_err(|_| "not a number".to_string())?;
            if !f.is_finite() {
                return Err("not a finite number".into());
            }
            Ok(s.to_string())
        }
        ScalarType::Text => Ok(raw.to_string()),
        ScalarType::Boolean => match s.to_lowercase().as_str() {
            "true" | "t" | "1" | "yes" => Ok("true".into()),
            "false" | "f" | "0" | "no" => Ok("false".into()),
            _ => Err("not a boolean".into()),
        },
        ScalarType::Uuid => uuid::Uuid::parse_str(s)
            .map(|u| u.to_string())
            .map_err(|e| e.to_string()),
        ScalarType::Timestamp => parse_naive_datetime(s)
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
            .ok_or_else(|| "not a timestamp".to_string()),
        ScalarType::TimestampTz => DateTime::parse_from_rfc3339(s)
            .map(|d| d.with_timezone(&Utc))
            .ok()
            .or_else(|| parse_naive_datetime(s).map(|d| d.and_utc()))
            .map(|d| d.to_rfc3339())
            .ok_or_else(|| "not a timestamp".to_string()),
        ScalarType::Date => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(|d| d.format("%Y-%m-%d").to_string())
            .map_err(|e| e.to_string()),
        ScalarType::Json | ScalarType::Jsonb => serde_json::from_str::<Value>(s)
            .map(|v| v.to_string())
            .map_err(|e| e.to_string()),
    }
}

fn parse_int(s: &str, min: i64, max: i64) -> Result<String, String> {
    let n: i64 = s.parse().map_err(|_| "not an integer".to_string())?;
    if n < min || n > max {
        return Err("integer out of range".into());
    }
    Ok(n.to_string())
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    const FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.naive_utc()))
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}
