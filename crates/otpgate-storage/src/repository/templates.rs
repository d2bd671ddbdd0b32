//! Template repository

use crate::db::DatabasePool;
use crate::models::{NewTemplate, Template, TemplateUpdate};
use async_trait::async_trait;
use chrono::Utc;
use otpgate_common::types::{AccountId, TemplateId, TemplateStatus};
use otpgate_common::{Error, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Template repository trait
#[async_trait]
pub trait TemplateRepository: Send + Sync {
    /// Create a template in `pending` state
    async fn create(&self, input: NewTemplate) -> Result<Template>;

    /// Get a template by ID
    async fn get(&self, id: TemplateId) -> Result<Option<Template>>;

    /// List an account's templates, newest first
    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Template>>;

    /// List templates across accounts, oldest submission first
    async fn list_by_status(&self, status: Option<TemplateStatus>) -> Result<Vec<Template>>;

    /// Overwrite the mutable fields if the stored status is still `expected`.
    ///
    /// Returns `None` when the status changed in the meantime.
    async fn update(
        &self,
        id: TemplateId,
        expected: TemplateStatus,
        update: TemplateUpdate,
    ) -> Result<Option<Template>>;
}

const TEMPLATE_COLUMNS: &str = "id, account_id, name, channel, category, content, variables, \
     status, admin_comment, last_submitted_at, approved_at, created_at, updated_at";

/// PostgreSQL template repository
pub struct DbTemplateRepository {
    pool: DatabasePool,
}

impl DbTemplateRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TemplateRepository for DbTemplateRepository {
    async fn create(&self, input: NewTemplate) -> Result<Template> {
        sqlx::query_as::<_, Template>(&format!(
            r#"
            INSERT INTO templates (id, account_id, name, channel, category, content, variables,
                                   status, last_submitted_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW(), NOW())
            RETURNING {}
            "#,
            TEMPLATE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(input.account_id)
        .bind(&input.name)
        .bind(input.channel.as_str())
        .bind(&input.category)
        .bind(&input.content)
        .bind(&input.variables)
        .bind(TemplateStatus::Pending.as_str())
        .fetch_one(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>(&format!(
            "SELECT {} FROM templates WHERE id = $1",
            TEMPLATE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Template>> {
        sqlx::query_as::<_, Template>(&format!(
            "SELECT {} FROM templates WHERE account_id = $1 ORDER BY created_at DESC",
            TEMPLATE_COLUMNS
        ))
        .bind(account_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn list_by_status(&self, status: Option<TemplateStatus>) -> Result<Vec<Template>> {
        sqlx::query_as::<_, Template>(&format!(
            r#"
            SELECT {} FROM templates
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY last_submitted_at ASC
            "#,
            TEMPLATE_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn update(
        &self,
        id: TemplateId,
        expected: TemplateStatus,
        update: TemplateUpdate,
    ) -> Result<Option<Template>> {
        sqlx::query_as::<_, Template>(&format!(
            r#"
            UPDATE templates
            SET name = $3, channel = $4, category = $5, content = $6, variables = $7, status = $8,
                admin_comment = $9, last_submitted_at = $10, approved_at = $11, updated_at = $12
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            TEMPLATE_COLUMNS
        ))
        .bind(id)
        .bind(expected.as_str())
        .bind(&update.name)
        .bind(update.channel.as_str())
        .bind(&update.category)
        .bind(&update.content)
        .bind(&update.variables)
        .bind(update.status.as_str())
        .bind(&update.admin_comment)
        .bind(update.last_submitted_at)
        .bind(update.approved_at)
        .bind(update.updated_at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}

/// In-memory template repository
#[derive(Default)]
pub struct MemoryTemplateRepository {
    templates: RwLock<HashMap<TemplateId, Template>>,
}

impl MemoryTemplateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateRepository for MemoryTemplateRepository {
    async fn create(&self, input: NewTemplate) -> Result<Template> {
        let now = Utc::now();
        let template = Template {
            id: Uuid::new_v4(),
            account_id: input.account_id,
            name: input.name,
            channel: input.channel.as_str().to_string(),
            category: input.category,
            content: input.content,
            variables: input.variables,
            status: TemplateStatus::Pending.as_str().to_string(),
            admin_comment: None,
            last_submitted_at: now,
            approved_at: None,
            created_at: now,
            updated_at: now,
        };
        self.templates
            .write()
            .await
            .insert(template.id, template.clone());
        Ok(template)
    }

    async fn get(&self, id: TemplateId) -> Result<Option<Template>> {
        Ok(self.templates.read().await.get(&id).cloned())
    }

    async fn list_by_account(&self, account_id: AccountId) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> = self
            .templates
            .read()
            .await
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        templates.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(templates)
    }

    async fn list_by_status(&self, status: Option<TemplateStatus>) -> Result<Vec<Template>> {
        let mut templates: Vec<Template> = self
            .templates
            .read()
            .await
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s.as_str()))
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.last_submitted_at.cmp(&b.last_submitted_at));
        Ok(templates)
    }

    async fn update(
        &self,
        id: TemplateId,
        expected: TemplateStatus,
        update: TemplateUpdate,
    ) -> Result<Option<Template>> {
        let mut templates = self.templates.write().await;
        let Some(template) = templates.get_mut(&id) else {
            return Ok(None);
        };
        if template.status != expected.as_str() {
            return Ok(None);
        }

        template.name = update.name;
        template.channel = update.channel.as_str().to_string();
        template.category = update.category;
        template.content = update.content;
        template.variables = update.variables;
        template.status = update.status.as_str().to_string();
        template.admin_comment = update.admin_comment;
        template.last_submitted_at = update.last_submitted_at;
        template.approved_at = update.approved_at;
        template.updated_at = update.updated_at;
        Ok(Some(template.clone()))
    }
}
