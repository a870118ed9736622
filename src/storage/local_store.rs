use crate::error::{OfflineError, Result};
use crate::storage::database::{CacheRecord, Database, CACHE_TABLES};
use crate::storage::hasher::checksum_value;
use crate::sync::auth::Role;
use crate::sync::encryption::KeyManager;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString};
use tracing::{debug, info, warn};

/// Domain collections that may be cached offline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Entity {
    Users,
    Events,
    Tasks,
    Messages,
}

impl Entity {
    pub fn table(self) -> &'static str {
        match self {
            Self::Users => CACHE_TABLES[0],
            Self::Events => CACHE_TABLES[1],
            Self::Tasks => CACHE_TABLES[2],
            Self::Messages => CACHE_TABLES[3],
        }
    }

    /// Map an API collection segment (e.g. `tasks`) to its cache
    pub fn from_collection(name: &str) -> Option<Self> {
        name.parse().ok()
    }
}

/// A decrypted cache row
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntity {
    pub id: String,
    pub value: Value,
    pub checksum: String,
    pub synced_at: DateTime<Utc>,
    pub is_modified: bool,
}

/// Extract a record's identity as stored in the cache
pub fn record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Encrypted read-through cache, one table per entity
pub struct LocalStore {
    db: Arc<Database>,
    keys: Arc<KeyManager>,
    offline_roles: Vec<Role>,
    retention: chrono::Duration,
}

impl LocalStore {
    pub fn new(
        db: Arc<Database>,
        keys: Arc<KeyManager>,
        offline_roles: Vec<Role>,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            db,
            keys,
            offline_roles,
            retention,
        }
    }

    pub fn can_cache(&self, role: Role) -> bool {
        self.offline_roles.contains(&role)
    }

    /// Encrypt and persist records, replacing any existing copies.
    ///
    /// Roles outside the offline allow-list persist nothing.
    pub async fn save(&self, entity: Entity, records: &[Value], role: Role) -> Result<usize> {
        if !self.can_cache(role) {
            debug!("Role {} may not cache {}, skipping {} records", role, entity, records.len());
            return Ok(0);
        }

        let synced_at = Utc::now();
        let mut saved = 0;

        for record in records {
            let Some(id) = record_id(record) else {
                warn!("Skipping {} record without an id", entity);
                continue;
            };

            let checksum = checksum_value(record)?;
            let (encrypted_payload, version) = self.keys.encrypt_value(record).await?;

            self.db
                .upsert_cache_record(
                    entity.table(),
                    &CacheRecord {
                        id,
                        encrypted_payload,
                        checksum,
                        synced_at,
                        is_modified: false,
                        version,
                    },
                )
                .await?;
            saved += 1;
        }

        debug!("Cached {} {} records", saved, entity);
        Ok(saved)
    }

    /// Decrypt every cached record; undecryptable rows are logged and skipped
    pub async fn get_all(&self, entity: Entity) -> Result<Vec<Value>> {
        Ok(self
            .get_all_entries(entity)
            .await?
            .into_iter()
            .map(|entry| entry.value)
            .collect())
    }

    pub async fn get_all_entries(&self, entity: Entity) -> Result<Vec<CachedEntity>> {
        let records = self.db.get_cache_records(entity.table()).await?;
        let mut entries = Vec::with_capacity(records.len());

        for record in records {
            match self.decrypt(record).await {
                Ok(entry) => entries.push(entry),
                Err((id, e)) => warn!("Skipping cached {} {}: {}", entity, id, e),
            }
        }

        Ok(entries)
    }

    pub async fn get(&self, entity: Entity, id: &str) -> Result<Option<CachedEntity>> {
        let Some(record) = self.db.get_cache_record(entity.table(), id).await? else {
            return Ok(None);
        };

        match self.decrypt(record).await {
            Ok(entry) => Ok(Some(entry)),
            Err((id, e)) => {
                warn!("Cached {} {} is unreadable: {}", entity, id, e);
                Ok(None)
            }
        }
    }

    /// Shallow-merge `patch` into a cached record and flag it locally modified
    pub async fn update(&self, entity: Entity, id: &str, patch: &Value) -> Result<Value> {
        let record = self
            .db
            .get_cache_record(entity.table(), id)
            .await?
            .ok_or_else(|| OfflineError::NotFound(format!("{}/{}", entity, id)))?;
        let synced_at = record.synced_at;

        let mut value = self.keys.decrypt_value(&record.encrypted_payload).await?;
        match (value.as_object_mut(), patch.as_object()) {
            (Some(target), Some(fields)) => {
                for (field, field_value) in fields {
                    target.insert(field.clone(), field_value.clone());
                }
            }
            _ => value = patch.clone(),
        }

        let checksum = checksum_value(&value)?;
        let (encrypted_payload, version) = self.keys.encrypt_value(&value).await?;
        self.db
            .upsert_cache_record(
                entity.table(),
                &CacheRecord {
                    id: id.to_string(),
                    encrypted_payload,
                    checksum,
                    synced_at,
                    is_modified: true,
                    version,
                },
            )
            .await?;

        debug!("Updated cached {} {}", entity, id);
        Ok(value)
    }

    /// Drop a whole collection so the next read goes to the network
    pub async fn invalidate(&self, entity: Entity) -> Result<u64> {
        let removed = self.db.clear_cache_table(entity.table()).await?;
        if removed > 0 {
            debug!("Invalidated {} cached {} records", removed, entity);
        }
        Ok(removed)
    }

    /// Remove records older than the retention window across every entity
    pub async fn clean_expired_data(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.retention;
        let mut removed = 0;

        for table in CACHE_TABLES {
            removed += self.db.delete_expired(table, cutoff).await?;
        }

        if removed > 0 {
            info!("Removed {} expired cache records", removed);
        }
        Ok(removed)
    }

    async fn decrypt(
        &self,
        record: CacheRecord,
    ) -> std::result::Result<CachedEntity, (String, OfflineError)> {
        match self.keys.decrypt_value(&record.encrypted_payload).await {
            Ok(value) => Ok(CachedEntity {
                id: record.id,
                value,
                checksum: record.checksum,
                synced_at: record.synced_at,
                is_modified: record.is_modified,
            }),
            Err(e) => Err((record.id, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use crate::sync::encryption::{CryptoProvider, DeviceFingerprint};
    use serde_json::json;
    use tempfile::TempDir;

    async fn store(temp_dir: &TempDir) -> (Arc<Database>, LocalStore) {
        let db = Arc::new(
            Database::new(Some(temp_dir.path().join("cache.db")))
                .await
                .unwrap(),
        );
        let keys = Arc::new(KeyManager::with_provider(
            db.clone(),
            Environment::Production,
            CryptoProvider::System,
            DeviceFingerprint {
                platform: "linux-x86_64".into(),
                locale: "pt_BR.UTF-8".into(),
                host: "secretaria".into(),
            },
        ));
        let store = LocalStore::new(
            db.clone(),
            keys,
            vec![Role::SuperAdmin, Role::Admin, Role::Pastor],
            chrono::Duration::days(7),
        );
        (db, store)
    }

    fn members() -> Vec<Value> {
        vec![
            json!({"id": 4425, "name": "Ana", "role": "member"}),
            json!({"id": 4411, "name": "Pedro", "role": "interested"}),
        ]
    }

    #[tokio::test]
    async fn test_save_is_gated_by_role() {
        let temp_dir = TempDir::new().unwrap();
        let (db, store) = store(&temp_dir).await;

        assert_eq!(store.save(Entity::Users, &members(), Role::Member).await.unwrap(), 0);
        assert_eq!(db.count_cache("users").await.unwrap(), 0);

        assert_eq!(store.save(Entity::Users, &members(), Role::Admin).await.unwrap(), 2);
        assert_eq!(db.count_cache("users").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_records_are_stored_encrypted() {
        let temp_dir = TempDir::new().unwrap();
        let (db, store) = store(&temp_dir).await;
        store.save(Entity::Users, &members(), Role::Pastor).await.unwrap();

        for record in db.get_cache_records("users").await.unwrap() {
            assert!(!record.encrypted_payload.contains("Ana"));
            assert_eq!(record.version, 1);
            assert!(!record.is_modified);
        }

        let mut names: Vec<String> = store
            .get_all(Entity::Users)
            .await
            .unwrap()
            .iter()
            .map(|u| u["name"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["Ana", "Pedro"]);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (db, store) = store(&temp_dir).await;
        store.save(Entity::Events, &[json!({"id": 1, "title": "Vigília"})], Role::Admin).await.unwrap();

        db.upsert_cache_record(
            "events",
            &CacheRecord {
                id: "2".into(),
                encrypted_payload: "AQIDBAUGBwgJCgsMDQ4P".into(),
                checksum: "bogus".into(),
                synced_at: Utc::now(),
                is_modified: false,
                version: 1,
            },
        )
        .await
        .unwrap();

        let events = store.get_all(Entity::Events).await.unwrap();
        assert_eq!(events, vec![json!({"id": 1, "title": "Vigília"})]);
        assert!(store.get(Entity::Events, "2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_without_id_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, store) = store(&temp_dir).await;

        let saved = store
            .save(Entity::Tasks, &[json!({"title": "sem id"}), json!({"id": "t-1"})], Role::Admin)
            .await
            .unwrap();
        assert_eq!(saved, 1);
    }

    #[tokio::test]
    async fn test_update_merges_and_marks_modified() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, store) = store(&temp_dir).await;
        store
            .save(Entity::Tasks, &[json!({"id": 42, "status": "open", "title": "Limpeza"})], Role::Admin)
            .await
            .unwrap();
        let before = store.get(Entity::Tasks, "42").await.unwrap().unwrap();

        let updated = store.update(Entity::Tasks, "42", &json!({"status": "done"})).await.unwrap();
        assert_eq!(updated, json!({"id": 42, "status": "done", "title": "Limpeza"}));

        let after = store.get(Entity::Tasks, "42").await.unwrap().unwrap();
        assert!(after.is_modified);
        assert_ne!(after.checksum, before.checksum);
        assert_eq!(after.synced_at, before.synced_at);

        let missing = store.update(Entity::Tasks, "99", &json!({})).await;
        assert!(matches!(missing, Err(OfflineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_clean_expired_data() {
        let temp_dir = TempDir::new().unwrap();
        let (db, store) = store(&temp_dir).await;
        store.save(Entity::Messages, &[json!({"id": 1, "body": "Olá"})], Role::Admin).await.unwrap();

        let mut stale = db.get_cache_record("messages", "1").await.unwrap().unwrap();
        stale.id = "2".into();
        stale.synced_at = Utc::now() - chrono::Duration::days(8);
        db.upsert_cache_record("messages", &stale).await.unwrap();

        assert_eq!(store.clean_expired_data().await.unwrap(), 1);
        let remaining = store.get_all_entries(Entity::Messages).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "1");
    }

    #[test]
    fn test_entity_collections() {
        assert_eq!(Entity::from_collection("tasks"), Some(Entity::Tasks));
        assert_eq!(Entity::from_collection("elections"), None);
        assert_eq!(Entity::Messages.table(), "messages");
    }
}
