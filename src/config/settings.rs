//! Process settings read from the environment (`.env` honoured).

use crate::error::ConfigError;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub max_connections: u32,
    /// Schema holding the `_sys_*` tables.
    pub sys_schema: String,
    /// Row limit applied to filters without `end`.
    pub default_limit: i64,
    /// Upper bound for `end`.
    pub max_limit: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/entity_store".into(),
            max_connections: 5,
            sys_schema: "entity_store".into(),
            default_limit: 50,
            max_limit: 1000,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let defaults = Settings::default();
        let settings = Settings {
            database_url: std::env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            max_connections: parse_var("ENTITY_STORE_MAX_CONNECTIONS", defaults.max_connections)?,
            sys_schema: std::env::var("ENTITY_STORE_SYS_SCHEMA").unwrap_or(defaults.sys_schema),
            default_limit: parse_var("ENTITY_STORE_DEFAULT_LIMIT", defaults.default_limit)?,
            max_limit: parse_var("ENTITY_STORE_MAX_LIMIT", defaults.max_limit)?,
        };
        settings.check()?;
        Ok(settings)
    }

    fn check(&self) -> Result<(), ConfigError> {
        if !is_identifier(&self.sys_schema) {
            return Err(ConfigError::Validation(format!(
                "ENTITY_STORE_SYS_SCHEMA '{}' is not a valid identifier",
                self.sys_schema
            )));
        }
        if self.default_limit <= 0 || self.max_limit < self.default_limit {
            return Err(ConfigError::Validation(
                "limits must satisfy 0 < ENTITY_STORE_DEFAULT_LIMIT <= ENTITY_STORE_MAX_LIMIT".into(),
            ));
        }
        Ok(())
    }

    /// Clamp a requested limit into `1..=max_limit`, defaulting when absent.
    pub fn limit(&self, requested: Option<i64>) -> i64 {
        requested.unwrap_or(self.default_limit).clamp(1, self.max_limit)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Load(format!("{}: cannot parse '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_is_clamped() {
        let s = Settings::default();
        assert_eq!(s.limit(None), 50);
        assert_eq!(s.limit(Some(5000)), 1000);
        assert_eq!(s.limit(Some(0)), 1);
        assert_eq!(s.limit(Some(10)), 10);
    }

    #[test]
    fn sys_schema_must_be_identifier() {
        let mut s = Settings::default();
        assert!(s.check().is_ok());
        s.sys_schema = "bad schema;".into();
        assert!(s.check().is_err());
    }
}
