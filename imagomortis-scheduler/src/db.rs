use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    let options = match &config.url {
        Some(url) => PgConnectOptions::from_str(url)?,
        None => PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.name)
            .username(&config.user)
            .password(&config.password),
    };

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
}

/// Makes sure the columns the scheduler relies on exist
///
/// The `images` table belongs to the ingest side; this only fills in what
/// is missing so the scheduler can start against a fresh database.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id UUID PRIMARY KEY,
            data BYTEA,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("ALTER TABLE images ADD COLUMN IF NOT EXISTS job JSONB")
        .execute(pool)
        .await?;

    // Claims only ever scan unassigned rows
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_images_unassigned ON images (id) WHERE job IS NULL")
        .execute(pool)
        .await?;

    tracing::info!("Database schema verified");
    Ok(())
}
