//! Database models

use chrono::{DateTime, Utc};
use otpgate_common::types::{
    AccountId, AccountStatus, ApiKeyId, Channel, Encoding, MessageId, MessageStatus, TemplateId,
    TemplateStatus,
};
use otpgate_common::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Account model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
    pub credit_limit: Decimal,
    pub currency: String,
    pub rate_limit_rps: Option<i32>,
    pub allowed_ips: Vec<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Funds that can still be spent, counting the credit line
    pub fn available(&self) -> Decimal {
        self.balance + self.credit_limit
    }

    /// Configured requests per second, if any
    pub fn rate_limit(&self) -> Option<u32> {
        self.rate_limit_rps
            .and_then(|rps| u32::try_from(rps).ok())
            .filter(|rps| *rps > 0)
    }

    pub fn status_enum(&self) -> Result<AccountStatus> {
        self.status.parse()
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status_enum(), Ok(AccountStatus::Active))
    }
}

/// Fields for a new account
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: AccountId,
    pub name: String,
    pub balance: Decimal,
    pub credit_limit: Decimal,
    pub currency: String,
    pub rate_limit_rps: Option<u32>,
    pub allowed_ips: Vec<String>,
}

/// API key model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub account_id: AccountId,
    pub label: String,
    pub key_hash: String,
    pub key_prefix: String,
    pub revoked_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

/// Fields for a new API key
#[derive(Debug, Clone)]
pub struct NewApiKey {
    pub account_id: AccountId,
    pub label: String,
    pub key_hash: String,
    pub key_prefix: String,
}

/// Template model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Template {
    pub id: TemplateId,
    pub account_id: AccountId,
    pub name: String,
    pub channel: String,
    pub category: Option<String>,
    pub content: String,
    pub variables: Vec<String>,
    pub status: String,
    pub admin_comment: Option<String>,
    pub last_submitted_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Template {
    pub fn status_enum(&self) -> Result<TemplateStatus> {
        self.status.parse()
    }

    pub fn channel_enum(&self) -> Result<Channel> {
        self.channel.parse()
    }
}

/// Fields for a new template
#[derive(Debug, Clone)]
pub struct NewTemplate {
    pub account_id: AccountId,
    pub name: String,
    pub channel: Channel,
    pub category: Option<String>,
    pub content: String,
    pub variables: Vec<String>,
}

/// Replacement values for a template's mutable fields
#[derive(Debug, Clone)]
pub struct TemplateUpdate {
    pub name: String,
    pub channel: Channel,
    pub category: Option<String>,
    pub content: String,
    pub variables: Vec<String>,
    pub status: TemplateStatus,
    pub admin_comment: Option<String>,
    pub last_submitted_at: DateTime<Utc>,
    pub approved_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Message model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub request_id: String,
    pub account_id: AccountId,
    pub mobile_phone: String,
    pub content: String,
    pub sender: String,
    pub encoding: String,
    pub part_count: i32,
    pub price: Decimal,
    pub currency: String,
    pub promotional: bool,
    pub template_id: Option<TemplateId>,
    pub metadata: serde_json::Value,
    pub dlr_callback_url: Option<String>,
    pub dispatch_id: Option<String>,
    pub status: String,
    pub error_code: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub callback_attempts: i32,
    pub callback_delivered_at: Option<DateTime<Utc>>,
    pub callback_error: Option<String>,
}

impl Message {
    pub fn status_enum(&self) -> Result<MessageStatus> {
        self.status.parse()
    }

    pub fn encoding_enum(&self) -> Result<Encoding> {
        self.encoding.parse()
    }
}

/// Fields for a new message; always stored as PENDING
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub request_id: String,
    pub account_id: AccountId,
    pub mobile_phone: String,
    pub content: String,
    pub sender: String,
    pub encoding: Encoding,
    pub part_count: u32,
    pub price: Decimal,
    pub currency: String,
    pub promotional: bool,
    pub template_id: Option<TemplateId>,
    pub metadata: serde_json::Value,
    pub dlr_callback_url: Option<String>,
    /// Batch the message was sent in
    pub dispatch_id: Option<String>,
}

/// Filters for a page of an account's message history
#[derive(Debug, Clone)]
pub struct MessageFilter {
    pub account_id: AccountId,
    pub dispatch_id: Option<String>,
    pub status: Option<MessageStatus>,
    pub promotional: Option<bool>,
    /// Inclusive lower bound on `created_at`
    pub created_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`
    pub created_to: Option<DateTime<Utc>>,
    pub limit: u32,
    pub offset: u32,
}

impl MessageFilter {
    pub fn for_account(account_id: AccountId) -> Self {
        Self {
            account_id,
            dispatch_id: None,
            status: None,
            promotional: None,
            created_from: None,
            created_to: None,
            limit: 50,
            offset: 0,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        message.account_id == self.account_id
            && self
                .dispatch_id
                .as_deref()
                .map_or(true, |id| message.dispatch_id.as_deref() == Some(id))
            && self.status.map_or(true, |s| message.status == s.as_str())
            && self.promotional.map_or(true, |p| message.promotional == p)
            && self.created_from.map_or(true, |from| message.created_at >= from)
            && self.created_to.map_or(true, |to| message.created_at <= to)
    }
}

/// One page of messages, newest first, with the total matching count
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub total: u64,
    pub messages: Vec<Message>,
}

/// Message count and spend for one status within a dispatch
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DispatchStatusCount {
    pub status: String,
    pub count: i64,
    pub price: Decimal,
}

/// Result of delivering a message's status webhook
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub attempts: u32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}
