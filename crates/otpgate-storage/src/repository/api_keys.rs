//! API Key repository

use crate::db::DatabasePool;
use crate::models::{ApiKey, NewApiKey};
use async_trait::async_trait;
use chrono::Utc;
use otpgate_common::types::ApiKeyId;
use otpgate_common::{Error, Result};
use tokio::sync::RwLock;
use uuid::Uuid;

/// API key repository trait
#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    /// Store a new key hash
    async fn create(&self, input: NewApiKey) -> Result<ApiKey>;

    /// Find non-revoked API keys by their prefix (for initial lookup)
    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>>;

    /// Update last_used_at timestamp
    async fn update_last_used(&self, id: ApiKeyId) -> Result<()>;
}

/// Database API key repository
pub struct DbApiKeyRepository {
    pool: DatabasePool,
}

impl DbApiKeyRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApiKeyRepository for DbApiKeyRepository {
    async fn create(&self, input: NewApiKey) -> Result<ApiKey> {
        sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (id, account_id, label, key_hash, key_prefix, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING id, account_id, label, key_hash, key_prefix,
                      revoked_at, last_used_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(input.account_id)
        .bind(&input.label)
        .bind(&input.key_hash)
        .bind(&input.key_prefix)
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, account_id, label, key_hash, key_prefix,
                   revoked_at, last_used_at, created_at
            FROM api_keys
            WHERE key_prefix = $1
              AND revoked_at IS NULL
            LIMIT 10
            "#,
        )
        .bind(prefix)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        let now = Utc::now();
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(now)
            .execute(self.pool.pool())
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

/// In-memory API key repository
#[derive(Default)]
pub struct MemoryApiKeyRepository {
    keys: RwLock<Vec<ApiKey>>,
}

impl MemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a key as revoked
    pub async fn revoke(&self, id: ApiKeyId) {
        if let Some(key) = self.keys.write().await.iter_mut().find(|k| k.id == id) {
            key.revoked_at = Some(Utc::now());
        }
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyRepository {
    async fn create(&self, input: NewApiKey) -> Result<ApiKey> {
        let key = ApiKey {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            label: input.label,
            key_hash: input.key_hash,
            key_prefix: input.key_prefix,
            revoked_at: None,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.keys.write().await.push(key.clone());
        Ok(key)
    }

    async fn find_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        Ok(self
            .keys
            .read()
            .await
            .iter()
            .filter(|k| k.key_prefix == prefix && !k.is_revoked())
            .take(10)
            .cloned()
            .collect())
    }

    async fn update_last_used(&self, id: ApiKeyId) -> Result<()> {
        if let Some(key) = self.keys.write().await.iter_mut().find(|k| k.id == id) {
            key.last_used_at = Some(Utc::now());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_revoked_keys_are_not_found() {
        let repo = MemoryApiKeyRepository::new();
        let key = repo
            .create(NewApiKey {
                account_id: Uuid::new_v4(),
                label: "default".to_string(),
                key_hash: "hash".to_string(),
                key_prefix: "abcdefgh".to_string(),
            })
            .await
            .unwrap();

        assert_eq!(repo.find_by_prefix("abcdefgh").await.unwrap().len(), 1);
        assert!(repo.find_by_prefix("zzzzzzzz").await.unwrap().is_empty());

        repo.update_last_used(key.id).await.unwrap();
        assert!(repo.find_by_prefix("abcdefgh").await.unwrap()[0]
            .last_used_at
            .is_some());

        repo.revoke(key.id).await;
        assert!(repo.find_by_prefix("abcdefgh").await.unwrap().is_empty());
    }
}
