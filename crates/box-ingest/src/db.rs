use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

/// Connect to the catalog database and apply the embedded migrations.
pub async fn init_db(database_url: &str, max_connections: u32) -> anyhow::Result<Pool<Postgres>> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(3))
        .connect(database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    info!(max_connections, "catalog_migrations_applied");
    Ok(pool)
}
