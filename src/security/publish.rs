use crate::db::models::stream_models::StreamRecord;
use crate::error::Error;
use crate::registry::StreamRegistry;
use log::{info, warn};

/// Outcome of a publish authorization that reached the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishDecision {
    Authorized(StreamRecord),
    Denied,
}

/// Publish authorizer: answers whether a stream key may publish.
///
/// Storage problems come back as `Err`, so a broken backend is never
/// mistaken for an unknown key.
#[derive(Clone)]
pub struct PublishAuthorizer {
    registry: StreamRegistry,
}

impl PublishAuthorizer {
    pub fn new(registry: StreamRegistry) -> Self {
        Self { registry }
    }

    pub async fn authorize(&self, stream_key: &str) -> Result<PublishDecision, Error> {
        match self.registry.find_by_key(stream_key).await? {
            Some(record) => {
                info!("Publish authorized for stream {}", record.routing_hash);
                Ok(PublishDecision::Authorized(record))
            }
            None => {
                warn!("Publish denied for unknown stream key");
                Ok(PublishDecision::Denied)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseService;

    #[tokio::test]
    async fn known_key_is_authorized_unknown_is_denied() {
        let db = DatabaseService::in_memory().await.unwrap();
        let registry = StreamRegistry::new(db.pool.clone());
        let record = registry.register("studio-a").await.unwrap();
        let authorizer = PublishAuthorizer::new(registry);

        assert_eq!(
            authorizer.authorize("studio-a").await.unwrap(),
            PublishDecision::Authorized(record)
        );
        assert_eq!(
            authorizer.authorize("never-registered").await.unwrap(),
            PublishDecision::Denied
        );
    }

    #[tokio::test]
    async fn backend_failure_is_not_denied() {
        let db = DatabaseService::in_memory().await.unwrap();
        let authorizer = PublishAuthorizer::new(StreamRegistry::new(db.pool.clone()));
        db.pool.close().await;

        let result = authorizer.authorize("studio-a").await;
        assert!(matches!(result, Err(Error::Database(_))), "got {:?}", result);
    }
}
