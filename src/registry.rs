//! Persisted catalogue of known streams.

use crate::db::models::stream_models::StreamRecord;
use crate::db::repositories::streams::StreamsRepository;
use crate::error::Error;
use crate::security::short_hash;
use log::info;
use sqlx::SqlitePool;
use std::sync::Arc;

/// Derive the public routing hash for a stream key
pub fn derive_routing_hash(stream_key: &str) -> String {
    short_hash(stream_key)
}

/// Stream registry: the only component that writes stream records
#[derive(Clone)]
pub struct StreamRegistry {
    streams_repo: StreamsRepository,
}

impl StreamRegistry {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self {
            streams_repo: StreamsRepository::new(pool),
        }
    }

    /// Register a stream key. Fails with `Conflict` when the key or its
    /// derived hash is already taken.
    pub async fn register(&self, stream_key: &str) -> Result<StreamRecord, Error> {
        if stream_key.is_empty() || stream_key.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(Error::InvalidInput(format!(
                "Stream key must be non-empty without whitespace or '/': {:?}",
                stream_key
            )));
        }

        let routing_hash = derive_routing_hash(stream_key);
        let record = self.streams_repo.create(stream_key, &routing_hash).await?;
        info!("Registered stream {} as {}", record.id, record.routing_hash);

        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<StreamRecord>, Error> {
        self.streams_repo.get_all().await
    }

    /// Remove a stream by id. Running sessions are left to the orchestrator.
    pub async fn delete(&self, id: i64) -> Result<(), Error> {
        if self.streams_repo.delete(id).await? {
            info!("Deleted stream {}", id);
            Ok(())
        } else {
            Err(Error::NotFound(format!("Stream {} not found", id)))
        }
    }

    pub async fn find_by_key(&self, stream_key: &str) -> Result<Option<StreamRecord>, Error> {
        self.streams_repo.get_by_key(stream_key).await
    }

    pub async fn find_by_hash(&self, routing_hash: &str) -> Result<Option<StreamRecord>, Error> {
        self.streams_repo.get_by_hash(routing_hash).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;

    async fn registry() -> (DatabaseService, StreamRegistry) {
        let db = DatabaseService::in_memory().await.unwrap();
        let registry = StreamRegistry::new(db.pool.clone());
        (db, registry)
    }

    #[tokio::test]
    async fn register_derives_hash_from_key() {
        let (_db, registry) = registry().await;

        let record = registry.register("studio-a").await.unwrap();
        assert_eq!(record.stream_key, "studio-a");
        assert_eq!(record.routing_hash, derive_routing_hash("studio-a"));
        assert_eq!(record.routing_hash.len(), 8);
    }

    #[tokio::test]
    async fn duplicate_register_conflicts_and_keeps_one_record() {
        let (_db, registry) = registry().await;

        registry.register("studio-a").await.unwrap();
        let err = registry.register("studio-a").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {:?}", err);

        let records = registry.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].stream_key, "studio-a");
    }

    #[tokio::test]
    async fn truncated_hash_collision_is_a_conflict() {
        let (db, registry) = registry().await;

        // Occupy the hash that "studio-b" will derive, under a different key
        let repo = StreamsRepository::new(db.pool.clone());
        repo.create("squatter", &derive_routing_hash("studio-b"))
            .await
            .unwrap();

        let err = registry.register("studio-b").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)), "got {:?}", err);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_reflects_registers_and_deletes() {
        let (_db, registry) = registry().await;

        assert!(registry.list().await.unwrap().is_empty());

        let mut ids = Vec::new();
        for key in ["a1", "b2", "c3", "d4", "e5"] {
            ids.push(registry.register(key).await.unwrap().id);
        }
        registry.delete(ids[1]).await.unwrap();
        registry.delete(ids[3]).await.unwrap();

        let remaining: Vec<i64> = registry.list().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(remaining, vec![ids[0], ids[2], ids[4]]);
    }

    #[tokio::test]
    async fn delete_missing_id_is_not_found() {
        let (_db, registry) = registry().await;
        registry.register("studio-a").await.unwrap();

        let err = registry.delete(4242).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_keys_are_rejected() {
        let (_db, registry) = registry().await;

        assert!(matches!(
            registry.register("").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            registry.register("two words").await,
            Err(Error::InvalidInput(_))
        ));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn lookups_by_key_and_hash() {
        let (_db, registry) = registry().await;
        let record = registry.register("studio-a").await.unwrap();

        assert_eq!(registry.find_by_key("studio-a").await.unwrap(), Some(record.clone()));
        assert_eq!(
            registry.find_by_hash(&record.routing_hash).await.unwrap(),
            Some(record)
        );
        assert_eq!(registry.find_by_key("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn closed_store_is_a_backend_failure() {
        let (db, registry) = registry().await;
        db.pool.close().await;

        let err = registry.list().await.unwrap_err();
        assert!(matches!(err, Error::Database(_)), "got {:?}", err);
    }
}
