//! Prepare a database for an entity model: create the database if missing, the system
//! tables and every entity and association table.
//!
//! Usage: `entity-store-init [model.json]` (or set `ENTITY_STORE_MODEL`).

use entity_store::{create_all, ensure_database_exists, ensure_sys_tables, load_from_file, AppState, Settings};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::from_env()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("entity_store=info")),
        )
        .init();

    let model_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("ENTITY_STORE_MODEL").ok())
        .ok_or("no model file: pass a path or set ENTITY_STORE_MODEL")?;
    let model = load_from_file(&model_path).await?;

    ensure_database_exists(&settings.database_url).await?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .connect(&settings.database_url)
        .await?;

    ensure_sys_tables(&pool, &settings.sys_schema).await?;
    create_all(&pool, &model).await?;

    let state = AppState::new(pool, model, settings);
    tracing::info!(
        entities = state.model.entities.len(),
        services = state.services.len(),
        "entity store initialized"
    );
    Ok(())
}
