//! Filter queries: flat `dotted.path -> "v1,v2"` mappings parsed into conditions and
//! compiled into a predicate over the root entity and the relationships it traverses.

mod compile;
pub use compile::{join_relationship, FilterCompiler};

use crate::error::{AppError, ConfigError};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Raw query mapping as handed over by the request layer.
pub type QueryParams = BTreeMap<String, String>;

pub const WILDCARD: char = '*';

/// Reserved keys handled by the core (`fields` is consumed upstream and ignored here).
const OFFSET_KEY: &str = "start";
const LIMIT_KEY: &str = "end";
const FIELDS_KEY: &str = "fields";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operator {
    Gt,
    Ge,
    Lt,
    Le,
    Min,
    Max,
}

impl Operator {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "gt" => Operator::Gt,
            "ge" => Operator::Ge,
            "lt" => Operator::Lt,
            "le" => Operator::Le,
            "min" => Operator::Min,
            "max" => Operator::Max,
            _ => return None,
        })
    }

    pub fn sql(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Min => "MIN",
            Operator::Max => "MAX",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Test {
    /// Equality or wildcard match against any of the values.
    AnyOf(Vec<String>),
    /// `gt`/`ge`/`lt`/`le` against one argument.
    Compare(Operator, String),
    /// Column equals its table-wide `min`/`max`.
    Extremum(Operator),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Condition {
    /// Relationship names followed by a column name.
    pub path: Vec<String>,
    pub test: Test,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterQuery {
    pub conditions: Vec<Condition>,
    pub offset: i64,
    /// Requested limit; clamped against settings at execution time.
    pub limit: Option<i64>,
}

fn operator_key() -> Result<&'static Regex, AppError> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?P<attr>[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\.(?P<op>[a-z]+)\((?P<arg>[^()]*)\)$")
    })
    .as_ref()
    .map_err(|e| AppError::Config(ConfigError::Validation(format!("operator key pattern: {}", e))))
}

fn parse_path(attr: &str) -> Result<Vec<String>, AppError> {
    let path: Vec<String> = attr.split('.').map(str::to_string).collect();
    if path.iter().any(|s| s.trim().is_empty()) {
        return Err(AppError::BadRequest(format!("malformed attribute path '{}'", attr)));
    }
    Ok(path)
}

fn parse_count(key: &str, raw: &str) -> Result<i64, AppError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| AppError::BadRequest(format!("'{}' expects a non-negative integer, got '{}'", key, raw)))
}

impl FilterQuery {
    pub fn parse(params: &QueryParams) -> Result<Self, AppError> {
        let mut query = FilterQuery::default();
        for (key, value) in params {
            match key.as_str() {
                OFFSET_KEY => {
                    query.offset = parse_count(key, value)?;
                    continue;
                }
                LIMIT_KEY => {
                    query.limit = Some(parse_count(key, value)?);
                    continue;
                }
                FIELDS_KEY => continue,
                _ => {}
            }

            if let Some(caps) = operator_key()?.captures(key) {
                if !value.trim().is_empty() {
                    return Err(AppError::BadRequest(format!("operator key '{}' takes no value", key)));
                }
                let op_name = &caps["op"];
                let op = Operator::parse(op_name).ok_or_else(|| {
                    AppError::BadRequest(format!(
                        "unknown operator '{}': expected one of gt, ge, lt, le, min, max",
                        op_name
                    ))
                })?;
                let arg = caps["arg"].trim().to_string();
                let test = match op {
                    Operator::Min | Operator::Max if arg.is_empty() => Test::Extremum(op),
                    Operator::Min | Operator::Max => {
                        return Err(AppError::BadRequest(format!("'{}' takes no argument", op_name)))
                    }
                    _ if arg.is_empty() => {
                        return Err(AppError::BadRequest(format!("'{}' requires an argument", op_name)))
                    }
                    _ => Test::Compare(op, arg),
                };
                query.conditions.push(Condition {
                    path: parse_path(&caps["attr"])?,
                    test,
                });
                continue;
            }

            if key.contains('(') || key.contains(')') {
                return Err(AppError::BadRequest(format!(
                    "malformed key '{}': expected 'field=v1,v2' or 'field.op(v)'",
                    key
                )));
            }
            let values: Vec<String> = value
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty() && v.chars().any(|c| c != WILDCARD))
                .map(str::to_string)
                .collect();
            if values.is_empty() {
                continue;
            }
            query.conditions.push(Condition {
                path: parse_path(key)?,
                test: Test::AnyOf(values),
            });
        }
        Ok(query)
    }
}

/// Escape LIKE metacharacters, then turn wildcards into `%`.
pub fn like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' | '%' | '_' => {
                out.push('\\');
                out.push(ch);
            }
            WILDCARD => out.push('%'),
            _ => out.push(ch),
        }
    }
    out
}
