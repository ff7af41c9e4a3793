use anyhow::Result;
use log::info;
use sqlx::{Executor, SqlitePool};

/// Migrations compiled into the binary, applied in order
const MIGRATIONS: &[(&str, &str)] = &[(
    "0001_create_streams.sql",
    include_str!("sql/0001_create_streams.sql"),
)];

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for (name, sql) in MIGRATIONS {
        execute_migration(pool, name, sql).await?;
    }

    Ok(())
}

async fn execute_migration(pool: &SqlitePool, name: &str, sql: &str) -> Result<()> {
    pool.execute(sql).await?;
    info!("Applied migration: {}", name);

    Ok(())
}
