//! Message repository

use crate::db::DatabasePool;
use crate::models::{
    CallbackOutcome, DispatchStatusCount, Message, MessageFilter, MessagePage, NewMessage,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use otpgate_common::types::{AccountId, MessageId, MessageStatus};
use otpgate_common::{Error, Result};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Message repository trait
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Insert a PENDING message.
    ///
    /// Returns `None` if the account already has a message with the same
    /// request id.
    async fn insert(&self, input: NewMessage) -> Result<Option<Message>>;

    /// Get a message by ID
    async fn get(&self, id: MessageId) -> Result<Option<Message>>;

    /// Find a message by its idempotency key
    async fn find_by_request_id(
        &self,
        account_id: AccountId,
        request_id: &str,
    ) -> Result<Option<Message>>;

    /// Move a PENDING message to a terminal status.
    ///
    /// Returns the updated message, or `None` if it was not PENDING.
    async fn mark_terminal(
        &self,
        id: MessageId,
        status: MessageStatus,
        error_code: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>>;

    /// Expire PENDING messages created before `created_before`
    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Message>>;

    /// Store the result of the status webhook
    async fn record_callback_outcome(&self, id: MessageId, outcome: &CallbackOutcome)
        -> Result<()>;

    /// One page of an account's messages, newest first
    async fn list(&self, filter: &MessageFilter) -> Result<MessagePage>;

    /// Per-status counts and spend for one dispatch, ordered by status
    async fn dispatch_summary(
        &self,
        account_id: AccountId,
        dispatch_id: &str,
    ) -> Result<Vec<DispatchStatusCount>>;
}

fn ensure_terminal(status: MessageStatus) -> Result<()> {
    if status.is_terminal() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "{} is not a terminal message status",
            status
        )))
    }
}

const MESSAGE_COLUMNS: &str = "id, request_id, account_id, mobile_phone, content, sender, \
     encoding, part_count, price, currency, promotional, template_id, metadata, \
     dlr_callback_url, dispatch_id, status, error_code, created_at, delivered_at, callback_attempts, \
     callback_delivered_at, callback_error";

/// Filter shared by the history count and page queries; NULL parameters match everything
const HISTORY_WHERE: &str = "WHERE account_id = $1 \
     AND ($2::text IS NULL OR dispatch_id = $2) \
     AND ($3::text IS NULL OR status = $3) \
     AND ($4::bool IS NULL OR promotional = $4) \
     AND ($5::timestamptz IS NULL OR created_at >= $5) \
     AND ($6::timestamptz IS NULL OR created_at <= $6)";

/// PostgreSQL message repository
pub struct DbMessageRepository {
    pool: DatabasePool,
}

impl DbMessageRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageRepository for DbMessageRepository {
    async fn insert(&self, input: NewMessage) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            r#"
            INSERT INTO messages (id, request_id, account_id, mobile_phone, content, sender,
                                  encoding, part_count, price, currency, promotional,
                                  template_id, metadata, dlr_callback_url, dispatch_id, status,
                                  created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, NOW())
            ON CONFLICT (account_id, request_id) DO NOTHING
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(input.id)
        .bind(&input.request_id)
        .bind(input.account_id)
        .bind(&input.mobile_phone)
        .bind(&input.content)
        .bind(&input.sender)
        .bind(input.encoding.as_str())
        .bind(input.part_count as i32)
        .bind(input.price)
        .bind(&input.currency)
        .bind(input.promotional)
        .bind(input.template_id)
        .bind(&input.metadata)
        .bind(&input.dlr_callback_url)
        .bind(&input.dispatch_id)
        .bind(MessageStatus::Pending.as_str())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE id = $1",
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn find_by_request_id(
        &self,
        account_id: AccountId,
        request_id: &str,
    ) -> Result<Option<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE account_id = $1 AND request_id = $2",
            MESSAGE_COLUMNS
        ))
        .bind(account_id)
        .bind(request_id)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn mark_terminal(
        &self,
        id: MessageId,
        status: MessageStatus,
        error_code: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        ensure_terminal(status)?;
        sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET status = $2, error_code = $3, delivered_at = $4
            WHERE id = $1 AND status = 'PENDING'
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(id)
        .bind(status.as_str())
        .bind(&error_code)
        .bind(at)
        .fetch_optional(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(&format!(
            r#"
            UPDATE messages
            SET status = 'EXPIRED', delivered_at = $2
            WHERE status = 'PENDING' AND created_at < $1
            RETURNING {}
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(created_before)
        .bind(at)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }

    async fn record_callback_outcome(
        &self,
        id: MessageId,
        outcome: &CallbackOutcome,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE messages
            SET callback_attempts = $2, callback_delivered_at = $3, callback_error = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.attempts as i32)
        .bind(outcome.delivered_at)
        .bind(&outcome.error)
        .execute(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    async fn list(&self, filter: &MessageFilter) -> Result<MessagePage> {
        let total: i64 =
            sqlx::query_scalar(&format!("SELECT COUNT(*) FROM messages {}", HISTORY_WHERE))
                .bind(filter.account_id)
                .bind(&filter.dispatch_id)
                .bind(filter.status.map(|s| s.as_str()))
                .bind(filter.promotional)
                .bind(filter.created_from)
                .bind(filter.created_to)
                .fetch_one(self.pool.pool())
                .await
                .map_err(|e| Error::Database(e.to_string()))?;

        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages {} ORDER BY created_at DESC, id DESC LIMIT $7 OFFSET $8",
            MESSAGE_COLUMNS, HISTORY_WHERE
        ))
        .bind(filter.account_id)
        .bind(&filter.dispatch_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.promotional)
        .bind(filter.created_from)
        .bind(filter.created_to)
        .bind(i64::from(filter.limit))
        .bind(i64::from(filter.offset))
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(MessagePage {
            total: total.max(0) as u64,
            messages,
        })
    }

    async fn dispatch_summary(
        &self,
        account_id: AccountId,
        dispatch_id: &str,
    ) -> Result<Vec<DispatchStatusCount>> {
        sqlx::query_as::<_, DispatchStatusCount>(
            r#"
            SELECT status, COUNT(*) AS count, COALESCE(SUM(price), 0) AS price
            FROM messages
            WHERE account_id = $1 AND dispatch_id = $2
            GROUP BY status
            ORDER BY status
            "#,
        )
        .bind(account_id)
        .bind(dispatch_id)
        .fetch_all(self.pool.pool())
        .await
        .map_err(|e| Error::Database(e.to_string()))
    }
}

/// In-memory message repository
#[derive(Default)]
pub struct MemoryMessageRepository {
    messages: RwLock<HashMap<MessageId, Message>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn insert(&self, input: NewMessage) -> Result<Option<Message>> {
        let mut messages = self.messages.write().await;
        let duplicate = messages
            .values()
            .any(|m| m.account_id == input.account_id && m.request_id == input.request_id);
        if duplicate {
            return Ok(None);
        }

        let message = Message {
            id: input.id,
            request_id: input.request_id,
            account_id: input.account_id,
            mobile_phone: input.mobile_phone,
            content: input.content,
            sender: input.sender,
            encoding: input.encoding.as_str().to_string(),
            part_count: input.part_count as i32,
            price: input.price,
            currency: input.currency,
            promotional: input.promotional,
            template_id: input.template_id,
            metadata: input.metadata,
            dlr_callback_url: input.dlr_callback_url,
            dispatch_id: input.dispatch_id,
            status: MessageStatus::Pending.as_str().to_string(),
            error_code: None,
            created_at: Utc::now(),
            delivered_at: None,
            callback_attempts: 0,
            callback_delivered_at: None,
            callback_error: None,
        };
        messages.insert(message.id, message.clone());
        Ok(Some(message))
    }

    async fn get(&self, id: MessageId) -> Result<Option<Message>> {
        Ok(self.messages.read().await.get(&id).cloned())
    }

    async fn find_by_request_id(
        &self,
        account_id: AccountId,
        request_id: &str,
    ) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .find(|m| m.account_id == account_id && m.request_id == request_id)
            .cloned())
    }

    async fn mark_terminal(
        &self,
        id: MessageId,
        status: MessageStatus,
        error_code: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        ensure_terminal(status)?;
        let mut messages = self.messages.write().await;
        match messages.get_mut(&id) {
            Some(message) if message.status == MessageStatus::Pending.as_str() => {
                message.status = status.as_str().to_string();
                message.error_code = error_code;
                message.delivered_at = Some(at);
                Ok(Some(message.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn expire_pending(
        &self,
        created_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let mut messages = self.messages.write().await;
        let mut expired = Vec::new();
        for message in messages.values_mut() {
            if message.status == MessageStatus::Pending.as_str()
                && message.created_at < created_before
            {
                message.status = MessageStatus::Expired.as_str().to_string();
                message.delivered_at = Some(at);
                expired.push(message.clone());
            }
        }
        Ok(expired)
    }

    async fn record_callback_outcome(
        &self,
        id: MessageId,
        outcome: &CallbackOutcome,
    ) -> Result<()> {
        if let Some(message) = self.messages.write().await.get_mut(&id) {
            message.callback_attempts = outcome.attempts as i32;
            message.callback_delivered_at = outcome.delivered_at;
            message.callback_error = outcome.error.clone();
        }
        Ok(())
    }

    async fn list(&self, filter: &MessageFilter) -> Result<MessagePage> {
        let messages = self.messages.read().await;
        let mut matching: Vec<&Message> = messages.values().filter(|m| filter.matches(m)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(MessagePage {
            total: matching.len() as u64,
            messages: matching
                .into_iter()
                .skip(filter.offset as usize)
                .take(filter.limit as usize)
                .cloned()
                .collect(),
        })
    }

    async fn dispatch_summary(
        &self,
        account_id: AccountId,
        dispatch_id: &str,
    ) -> Result<Vec<DispatchStatusCount>> {
        let messages = self.messages.read().await;
        let mut by_status: BTreeMap<&str, DispatchStatusCount> = BTreeMap::new();
        for message in messages.values().filter(|m| {
            m.account_id == account_id && m.dispatch_id.as_deref() == Some(dispatch_id)
        }) {
            let entry = by_status
                .entry(message.status.as_str())
                .or_insert_with(|| DispatchStatusCount {
                    status: message.status.clone(),
                    count: 0,
                    price: Decimal::ZERO,
                });
            entry.count += 1;
            entry.price += message.price;
        }
        Ok(by_status.into_values().collect())
    }
}
