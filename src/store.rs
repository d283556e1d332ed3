//! `_sys_*` tables (list groups backing permissions) and database bootstrap.
//! All `_sys_*` tables live in the schema named by `ENTITY_STORE_SYS_SCHEMA`.

use crate::error::AppError;
use crate::permission::{list_group_members_table, list_groups_table};
use crate::sql::quoted;
use sqlx::ConnectOptions;
use sqlx::PgPool;
use std::str::FromStr;

/// Create the system schema if not exists, then the list-group tables.
pub async fn ensure_sys_tables(pool: &PgPool, sys_schema: &str) -> Result<(), AppError> {
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", quoted(sys_schema)))
        .execute(pool)
        .await?;

    let groups = list_groups_table(sys_schema);
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            id BIGSERIAL PRIMARY KEY,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
        groups
    );
    sqlx::query(&ddl).execute(pool).await?;

    let members = list_group_members_table(sys_schema);
    let ddl = format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
            list_group_id BIGINT NOT NULL REFERENCES {} (id) ON DELETE CASCADE,
            group_name TEXT NOT NULL,
            PRIMARY KEY (list_group_id, group_name)
        )
        "#,
        members, groups
    );
    sqlx::query(&ddl).execute(pool).await?;
    tracing::info!(schema = %sys_schema, "system tables ready");
    Ok(())
}

/// New list group holding `groups`. Returns its id, to be stored in a list-group column.
pub async fn create_list_group(pool: &PgPool, sys_schema: &str, groups: &[&str]) -> Result<i64, AppError> {
    let mut tx = pool.begin().await?;
    let (id,): (i64,) = sqlx::query_as(&format!(
        "INSERT INTO {} DEFAULT VALUES RETURNING id",
        list_groups_table(sys_schema)
    ))
    .fetch_one(&mut *tx)
    .await?;
    let insert = format!(
        "INSERT INTO {} (list_group_id, group_name) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        list_group_members_table(sys_schema)
    );
    for g in groups {
        sqlx::query(&insert).bind(id).bind(*g).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    tracing::debug!(list_group = id, members = groups.len(), "list group created");
    Ok(id)
}

/// Group names of a list group, sorted.
pub async fn list_group_members(pool: &PgPool, sys_schema: &str, id: i64) -> Result<Vec<String>, AppError> {
    let rows: Vec<(String,)> = sqlx::query_as(&format!(
        "SELECT group_name FROM {} WHERE list_group_id = $1 ORDER BY group_name",
        list_group_members_table(sys_schema)
    ))
    .bind(id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(g,)| g).collect())
}

/// Ensure the database in `database_url` exists; create it if not. Connects to the
/// default `postgres` database to run CREATE DATABASE. Call before creating the main pool.
pub async fn ensure_database_exists(database_url: &str) -> Result<(), AppError> {
    let (admin_url, db_name) = parse_db_name_from_url(database_url)?;
    if db_name.is_empty() || db_name == "postgres" {
        return Ok(());
    }
    let opts = sqlx::postgres::PgConnectOptions::from_str(&admin_url)
        .map_err(|e| AppError::BadRequest(format!("invalid DATABASE_URL: {}", e)))?;
    let mut conn: sqlx::PgConnection = opts.connect().await?;
    let exists: (bool,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
        .bind(&db_name)
        .fetch_one(&mut conn)
        .await?;
    if !exists.0 {
        sqlx::query(&format!("CREATE DATABASE {}", quoted(&db_name)))
            .execute(&mut conn)
            .await?;
        tracing::info!(database = %db_name, "database created");
    }
    Ok(())
}

/// Split a connection URL into the admin URL (same server, `postgres` database) and
/// the target database name.
fn parse_db_name_from_url(url: &str) -> Result<(String, String), AppError> {
    let path_start = url.rfind('/').ok_or_else(|| AppError::BadRequest("DATABASE_URL: no path".into()))? + 1;
    let path_and_query = url.get(path_start..).unwrap_or("");
    let mut parts = path_and_query.splitn(2, '?');
    let db_name = parts.next().unwrap_or("").trim();
    let query = parts.next().map(|q| format!("?{}", q)).unwrap_or_default();
    let base = url.get(..path_start).unwrap_or(url);
    Ok((format!("{}postgres{}", base, query), db_name.to_string()))
}
