use crate::error::Result;
use crate::storage::{Database, DeadLetter, MutationQueueItem, MutationType, NewMutation};
use reqwest::Method;
use std::sync::Arc;
use tracing::{debug, warn};

/// Mutation type implied by an HTTP write method
pub fn mutation_type_for(method: &Method) -> Option<MutationType> {
    match *method {
        Method::POST => Some(MutationType::Create),
        Method::PUT | Method::PATCH => Some(MutationType::Update),
        Method::DELETE => Some(MutationType::Delete),
        _ => None,
    }
}

/// Durable FIFO of writes made while offline
pub struct MutationQueue {
    db: Arc<Database>,
}

impl MutationQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn enqueue(&self, mutation: NewMutation) -> Result<i64> {
        let id = self.db.insert_queue_item(&mutation).await?;
        debug!(
            "Queued {} {} as #{} ({})",
            mutation.method, mutation.endpoint, id, mutation.mutation_type
        );
        Ok(id)
    }

    /// Pending items, oldest first
    pub async fn pending(&self) -> Result<Vec<MutationQueueItem>> {
        self.db.list_queue().await
    }

    pub async fn get(&self, id: i64) -> Result<Option<MutationQueueItem>> {
        self.db.get_queue_item(id).await
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(usize::try_from(self.db.count_queue().await?).unwrap_or_default())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove an item the remote authority has accepted
    pub async fn acknowledge(&self, id: i64) -> Result<()> {
        if !self.db.delete_queue_item(id).await? {
            warn!("Queue item #{} was already gone", id);
        }
        Ok(())
    }

    pub async fn schedule_retry(
        &self,
        id: i64,
        retry_count: u32,
        next_retry_at: i64,
        error: &str,
    ) -> Result<()> {
        self.db
            .update_queue_retry(id, retry_count, next_retry_at, error)
            .await
    }

    /// Archive an item that exhausted its attempts
    pub async fn drop_item(&self, item: &MutationQueueItem) -> Result<i64> {
        self.db.move_to_dead_letters(item).await
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        self.db.list_dead_letters().await
    }

    pub async fn purge_dead_letters(&self) -> Result<u64> {
        self.db.purge_dead_letters().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn queue() -> (TempDir, MutationQueue) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(Some(dir.path().join("queue.db"))).await.unwrap();
        (dir, MutationQueue::new(Arc::new(db)))
    }

    fn mutation(entity_id: &str) -> NewMutation {
        NewMutation {
            mutation_type: MutationType::Update,
            entity: "tasks".into(),
            entity_id: Some(entity_id.into()),
            data: Some(r#"{"status":"done"}"#.into()),
            original_checksum: None,
            endpoint: format!("/api/tasks/{}", entity_id),
            method: "PUT".into(),
        }
    }

    #[test]
    fn test_mutation_type_for() {
        assert_eq!(mutation_type_for(&Method::POST), Some(MutationType::Create));
        assert_eq!(mutation_type_for(&Method::PATCH), Some(MutationType::Update));
        assert_eq!(mutation_type_for(&Method::DELETE), Some(MutationType::Delete));
        assert_eq!(mutation_type_for(&Method::GET), None);
    }

    #[tokio::test]
    async fn test_pending_keeps_enqueue_order() {
        let (_dir, queue) = queue().await;
        let ids = [
            queue.enqueue(mutation("1")).await.unwrap(),
            queue.enqueue(mutation("2")).await.unwrap(),
            queue.enqueue(mutation("3")).await.unwrap(),
        ];

        let pending: Vec<i64> = queue.pending().await.unwrap().iter().map(|i| i.id).collect();
        assert_eq!(pending, ids);

        queue.acknowledge(ids[1]).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_drop_moves_to_dead_letters() {
        let (_dir, queue) = queue().await;
        let id = queue.enqueue(mutation("9")).await.unwrap();
        queue.schedule_retry(id, 5, 0, "HTTP 500").await.unwrap();

        let item = queue.get(id).await.unwrap().unwrap();
        queue.drop_item(&item).await.unwrap();

        assert!(queue.is_empty().await.unwrap());
        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue_id, id);
        assert_eq!(dead[0].retry_count, 5);
        assert_eq!(dead[0].last_error.as_deref(), Some("HTTP 500"));
    }
}
