use crate::config::DatabaseConfig;
use crate::error::Error;
use anyhow::Result;
use log::{error, info};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::sync::Arc;
use std::time::Duration;

pub mod migrations;
pub mod models;
pub mod repositories;

/// Database service for handling connections and migrations
pub struct DatabaseService {
    pub pool: Arc<SqlitePool>,
}

impl DatabaseService {
    /// Create a new database service
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Initializing Database service");

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

        info!("Connected to SQLite database at {}", config.url);

        let service = Self {
            pool: Arc::new(pool),
        };

        if config.auto_migrate {
            service.run_migrations().await?;
        }

        Ok(service)
    }

    /// In-memory database with the schema applied. A single pinned connection
    /// keeps the database alive for the lifetime of the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::Database(format!("Failed to open in-memory database: {}", e)))?;

        let service = Self {
            pool: Arc::new(pool),
        };
        service.run_migrations().await?;

        Ok(service)
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        migrations::run_migrations(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to run migrations: {}", e)))?;

        info!("Database migrations completed successfully");

        Ok(())
    }
}

pub async fn health_check(pool: &SqlitePool) -> bool {
    match sqlx::query("SELECT 1").execute(pool).await {
        Ok(_) => true,
        Err(e) => {
            error!("Database health check failed: {}", e);
            false
        }
    }
}
