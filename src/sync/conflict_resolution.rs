use crate::error::Result;
use crate::storage::{ConflictRecord, Database, MutationQueueItem};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Conflicts the remote authority reported while replaying the queue.
/// Records stay until a caller dismisses them.
pub struct ConflictStore {
    db: Arc<Database>,
}

impl ConflictStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Capture the local attempt next to the server's state
    pub async fn record(&self, item: &MutationQueueItem, server_state: &Value) -> Result<i64> {
        let id = self.db.insert_conflict(item, server_state).await?;
        warn!(
            "Conflict on {} {} ({}), recorded as #{}",
            item.method, item.endpoint, item.entity, id
        );
        Ok(id)
    }

    pub async fn list(&self) -> Result<Vec<ConflictRecord>> {
        self.db.list_conflicts().await
    }

    /// Returns false when no such conflict exists
    pub async fn dismiss(&self, id: i64) -> Result<bool> {
        let removed = self.db.delete_conflict(id).await?;
        if removed {
            info!("Dismissed conflict #{}", id);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MutationType, NewMutation};
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_record_and_dismiss() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::new(Some(dir.path().join("c.db"))).await.unwrap());
        let store = ConflictStore::new(db.clone());

        let queue_id = db
            .insert_queue_item(&NewMutation {
                mutation_type: MutationType::Update,
                entity: "events".into(),
                entity_id: Some("5".into()),
                data: Some(r#"{"title":"Retreat"}"#.into()),
                original_checksum: Some("abc".into()),
                endpoint: "/api/events/5".into(),
                method: "PUT".into(),
            })
            .await
            .unwrap();
        let item = db.get_queue_item(queue_id).await.unwrap().unwrap();

        let id = store.record(&item, &json!({"title": "Camp"})).await.unwrap();
        let conflicts = store.list().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].local_data, Some(json!({"title": "Retreat"})));
        assert_eq!(conflicts[0].server_data, json!({"title": "Camp"}));

        assert!(store.dismiss(id).await.unwrap());
        assert!(!store.dismiss(id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }
}
