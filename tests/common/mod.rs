//! Shared setup for database tests: one fresh schema per test, skipped without a database.

#![allow(dead_code)]

use entity_store::{create_all, ensure_sys_tables, from_json_str, AppState, Caller, Settings};
use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;

const MODEL_JSON: &str = r#"{
    "schema": "__SCHEMA__",
    "entities": [
        {"name": "C", "primary_key": "id", "columns": [
            {"name": "id", "type": "serial"},
            {"name": "data", "type": "text"}
        ]},
        {"name": "B", "primary_key": "id", "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text", "nullable": false}
        ]},
        {"name": "A", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "x", "type": "integer"},
            {"name": "y", "type": "integer"},
            {"name": "id_c", "type": "integer"}
         ],
         "relationships": [
            {"name": "c", "target": "C", "cardinality": "one"},
            {"name": "bs", "target": "B", "cardinality": "many", "through": "asso_a_b"}
         ]},
        {"name": "Project", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text"},
            {"name": "id_perm_read", "type": "bigint"}
         ],
         "relationships": [
            {"name": "datasets", "target": "Dataset", "cardinality": "many"}
         ]},
        {"name": "Dataset", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": {"name": "varchar", "params": [50]}},
            {"name": "size", "type": "bigint"},
            {"name": "id_project", "type": "integer"}
         ],
         "relationships": [
            {"name": "project", "target": "Project", "cardinality": "one"}
         ],
         "permissions": [
            {"verbs": ["read"], "list_column": "id_perm_read", "path": ["project"]}
         ]},
        {"name": "Secret", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "integer"},
            {"name": "label", "type": "text"}
         ],
         "permissions": [
            {"verbs": ["read", "update", "delete"], "groups": ["G"]}
         ]},
        {"name": "Locked", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "label", "type": "text"}
         ],
         "permissions": [
            {"verbs": ["create"], "groups": ["admin"]}
         ]},
        {"name": "Upload", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "key", "type": "text"}
         ],
         "files": {"key_column": "key"},
         "permissions": [
            {"verbs": ["download"], "groups": ["G"]}
         ]},
        {"name": "Pair", "primary_key": ["a", "b"],
         "columns": [
            {"name": "a", "type": "integer"},
            {"name": "b", "type": "text"},
            {"name": "v", "type": "numeric"}
         ]},
        {"name": "Owner", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text"}
         ],
         "relationships": [
            {"name": "items", "target": "Item", "cardinality": "many"}
         ]},
        {"name": "Item", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "label", "type": "text"},
            {"name": "id_owner", "type": "integer", "nullable": false}
         ]},
        {"name": "Sample", "primary_key": "id", "versioned": true,
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "name", "type": "text"},
            {"name": "size", "type": "integer"}
         ],
         "relationships": [
            {"name": "tags", "target": "B", "cardinality": "many", "through": "asso_sample_tag"},
            {"name": "notes", "target": "Note", "cardinality": "many"}
         ]},
        {"name": "Note", "primary_key": "id",
         "columns": [
            {"name": "id", "type": "serial"},
            {"name": "body", "type": "text"},
            {"name": "id_sample_id", "type": "integer"},
            {"name": "id_sample_version", "type": "integer"}
         ]}
    ]
}"#;

pub struct TestStore {
    pub state: AppState,
    pub schema: String,
}

impl TestStore {
    /// Drop the test's schemas.
    pub async fn cleanup(self) {
        for s in [&self.schema, &self.state.settings.sys_schema] {
            let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", s))
                .execute(&self.state.pool)
                .await;
        }
    }

    pub async fn count(&self, table: &str) -> i64 {
        let (n,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM \"{}\".\"{}\"", self.schema, table))
            .fetch_one(&self.state.pool)
            .await
            .expect("count rows");
        n
    }
}

/// Connect to `TEST_DATABASE_URL` (or `DATABASE_URL`) and create a fresh model schema.
/// `None` when no database is reachable.
pub async fn maybe_store() -> Option<TestStore> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let database_url = std::env::var("TEST_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .ok()?;
    let pool = PgPoolOptions::new()
        .max_connections(4)
        .connect(&database_url)
        .await
        .ok()?;

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let schema = format!("es_test_{}", &suffix[..12]);
    let settings = Settings {
        database_url,
        sys_schema: format!("es_sys_{}", &suffix[..12]),
        ..Settings::default()
    };
    let model = from_json_str(&MODEL_JSON.replace("__SCHEMA__", &schema)).expect("test model resolves");

    ensure_sys_tables(&pool, &settings.sys_schema).await.expect("system tables");
    create_all(&pool, &model).await.expect("model tables");
    Some(TestStore {
        state: AppState::new(pool, model, settings),
        schema,
    })
}

macro_rules! store_or_skip {
    ($name:expr) => {
        match common::maybe_store().await {
            Some(s) => s,
            None => {
                eprintln!(
                    "Skipping {}: TEST_DATABASE_URL/DATABASE_URL is not set or database is unreachable.",
                    $name
                );
                return;
            }
        }
    };
}

pub fn obj(v: Value) -> Map<String, Value> {
    v.as_object().cloned().expect("object literal")
}

pub fn params(pairs: &[(&str, &str)]) -> entity_store::QueryParams {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn caller(groups: &[&str]) -> Caller {
    Caller::new(groups.iter().copied())
}

/// Key of a created row as a raw path value.
pub fn id_of(row: &Value) -> String {
    row["id"].to_string()
}
