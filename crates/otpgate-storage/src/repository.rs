//! Repository layer for data access

pub mod accounts;
pub mod api_keys;
pub mod messages;
pub mod templates;

pub use accounts::{AccountRepository, DbAccountRepository, MemoryAccountRepository};
pub use api_keys::{ApiKeyRepository, DbApiKeyRepository, MemoryApiKeyRepository};
pub use messages::{DbMessageRepository, MemoryMessageRepository, MessageRepository};
pub use templates::{DbTemplateRepository, MemoryTemplateRepository, TemplateRepository};

use crate::db::DatabasePool;
use otpgate_common::Result;
use std::sync::Arc;

/// The full set of repositories behind one storage backend
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub templates: Arc<dyn TemplateRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pool: Option<DatabasePool>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            accounts: Arc::new(DbAccountRepository::new(pool.clone())),
            api_keys: Arc::new(DbApiKeyRepository::new(pool.clone())),
            templates: Arc::new(DbTemplateRepository::new(pool.clone())),
            messages: Arc::new(DbMessageRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Process-local repositories; data is lost on restart
    pub fn memory() -> Self {
        Self {
            accounts: Arc::new(MemoryAccountRepository::new()),
            api_keys: Arc::new(MemoryApiKeyRepository::new()),
            templates: Arc::new(MemoryTemplateRepository::new()),
            messages: Arc::new(MemoryMessageRepository::new()),
            pool: None,
        }
    }

    /// Whether the backing store is reachable
    pub async fn health_check(&self) -> Result<()> {
        match &self.pool {
            Some(pool) => pool.health_check().await,
            None => Ok(()),
        }
    }
}
