//! Gateway service - composes guard, segmentation, pricing, ledger and tracking

use crate::delivery::{validate_callback_url, DeliveryReport, TrackerHandle};
use crate::encoding::{segment, Segmentation};
use crate::guard::Guard;
use crate::ledger::Ledger;
use crate::moderation::{Decision, Moderation, TemplateSubmission};
use crate::normalizer::{normalize, Normalization};
use crate::operator::OperatorLink;
use crate::pricing::RateTable;
use chrono::{DateTime, Utc};
use otpgate_common::types::{
    Encoding, MessageClass, MessageId, MessageStatus, TemplateId, TemplateStatus,
};
use otpgate_common::{Config, Error, Result};
use otpgate_storage::models::{Account, Message, MessageFilter, MessagePage, NewMessage, Template};
use otpgate_storage::repository::{MessageRepository, Repositories};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

const MAX_SENDER_CHARS: usize = 11;
const MAX_REQUEST_ID_CHARS: usize = 128;
const MAX_DISPATCH_ID_CHARS: usize = 100;
const MAX_BATCH_MESSAGES: usize = 10_000;
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 1000;

/// Body of a send request
#[derive(Debug, Clone, Deserialize)]
pub struct SendRequest {
    pub to: String,
    pub message: Option<String>,
    pub template_id: Option<TemplateId>,
    pub metadata: Option<Value>,
    pub sender: Option<String>,
    pub dlr_callback_url: Option<String>,
    pub request_id: Option<String>,
    #[serde(default, alias = "is_ad")]
    pub promotional: bool,
}

/// One destination within a batch
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    #[serde(alias = "mobile_phone")]
    pub to: String,
    pub message: Option<String>,
    pub template_id: Option<TemplateId>,
    pub metadata: Option<Value>,
    #[serde(alias = "user_sms_id")]
    pub request_id: Option<String>,
}

/// Body of a batch send; sender, callback and class apply to every item
#[derive(Debug, Clone, Deserialize)]
pub struct BatchRequest {
    pub messages: Vec<BatchItem>,
    #[serde(alias = "from")]
    pub sender: Option<String>,
    pub dispatch_id: Option<String>,
    #[serde(alias = "callback_url")]
    pub dlr_callback_url: Option<String>,
    #[serde(default, alias = "is_ad")]
    pub promotional: bool,
}

/// Filters for a page of message history
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(alias = "start_date")]
    pub from: Option<DateTime<Utc>>,
    #[serde(alias = "to_date")]
    pub to: Option<DateTime<Utc>>,
    pub status: Option<String>,
    #[serde(alias = "is_ad")]
    pub promotional: Option<bool>,
    pub dispatch_id: Option<String>,
    #[serde(alias = "page_size")]
    pub limit: Option<u32>,
    #[serde(alias = "count")]
    pub offset: Option<u32>,
}

/// Body of a preview request
#[derive(Debug, Clone, Deserialize)]
pub struct CheckRequest {
    pub to: Option<String>,
    pub message: Option<String>,
    pub template_id: Option<TemplateId>,
    pub metadata: Option<Value>,
    #[serde(default, alias = "is_ad")]
    pub promotional: bool,
}

/// Result of a send
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// Balance right after this send's debit, or the current balance on replay
    pub balance_after: Decimal,
    /// True when the request id had already been used
    pub replayed: bool,
}

/// Result of one batch item
#[derive(Debug)]
pub struct BatchItemOutcome {
    /// Position of the item in the request
    pub index: usize,
    pub result: Result<SendOutcome>,
}

/// Result of a batch send
#[derive(Debug)]
pub struct BatchOutcome {
    pub dispatch_id: String,
    pub items: Vec<BatchItemOutcome>,
    pub currency: String,
    /// Balance after the last item was debited
    pub balance_after: Decimal,
}

impl BatchOutcome {
    pub fn accepted(&self) -> usize {
        self.items.iter().filter(|item| item.result.is_ok()).count()
    }

    /// Sum of the prices of accepted, non-replayed items
    pub fn total_price(&self) -> Decimal {
        self.items
            .iter()
            .filter_map(|item| item.result.as_ref().ok())
            .filter(|outcome| !outcome.replayed)
            .map(|outcome| outcome.message.price)
            .sum()
    }
}

/// Per-status breakdown of a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSummary {
    pub dispatch_id: String,
    pub total_messages: u64,
    pub status_breakdown: BTreeMap<String, u64>,
    pub total_price: Decimal,
    pub currency: String,
}

/// A validated, priced send that has not touched the balance yet
enum Prepared {
    Replay(Message),
    Fresh(NewMessage),
}

/// Result of a preview
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub segmentation: Segmentation,
    pub currency: String,
    pub price_estimate: Option<Decimal>,
    pub balance_sufficient: Option<bool>,
}

/// Message composition settings
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_parts: u32,
    pub default_sender: String,
    pub allow_private_callback_hosts: bool,
}

impl From<&Config> for GatewayConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_parts: config.messaging.max_parts,
            default_sender: config.messaging.default_sender.clone(),
            allow_private_callback_hosts: config.delivery.allow_private_callback_hosts,
        }
    }
}

/// Entry point for every integrator and moderator operation
pub struct Gateway {
    messages: Arc<dyn MessageRepository>,
    guard: Guard,
    ledger: Ledger,
    moderation: Moderation,
    rates: Arc<RateTable>,
    tracker: TrackerHandle,
    operator: Arc<dyn OperatorLink>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        repos: &Repositories,
        config: &Config,
        tracker: TrackerHandle,
        operator: Arc<dyn OperatorLink>,
    ) -> Result<Self> {
        let rates = RateTable::from_config(&config.pricing)?;
        if rates.is_empty() {
            warn!("Rate table is empty; every send will fail with UNKNOWN_DESTINATION");
        }

        Ok(Self {
            messages: repos.messages.clone(),
            guard: Guard::new(
                config.guard.default_rate_limit_rps,
                config.api.admin_token.as_deref(),
            ),
            ledger: Ledger::new(repos.accounts.clone()),
            moderation: Moderation::new(repos.templates.clone())?,
            rates: Arc::new(rates),
            tracker,
            operator,
            config: GatewayConfig::from(config),
        })
    }

    pub fn rates(&self) -> &RateTable {
        &self.rates
    }

    fn authorize_account(account: &Account) -> Result<()> {
        if account.is_active() {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("account is {}", account.status)))
        }
    }

    /// Status, IP and rate checks shared by every account operation
    pub async fn authorize(&self, account: &Account, client_ip: Option<IpAddr>) -> Result<()> {
        Self::authorize_account(account)?;
        self.guard.authorize(account, client_ip).await
    }

    /// Check the moderator token
    pub fn verify_admin_token(&self, token: Option<&str>) -> Result<()> {
        self.guard.verify_admin_token(token)
    }

    /// Send one message, debiting the account.
    pub async fn send(
        &self,
        account: &Account,
        client_ip: Option<IpAddr>,
        request: SendRequest,
    ) -> Result<SendOutcome> {
        self.authorize(account, client_ip).await?;

        match self.prepare(account, request, None).await? {
            Prepared::Replay(message) => Ok(SendOutcome {
                message,
                balance_after: account.balance,
                replayed: true,
            }),
            Prepared::Fresh(new_message) => self.commit(account, new_message).await,
        }
    }

    /// Send every item of a batch under one dispatch id.
    ///
    /// Items are validated and priced first; the batch fails as a whole when
    /// the account cannot cover every valid item. Each item is then debited on
    /// its own, so one failing item never rolls back another.
    pub async fn send_batch(
        &self,
        account: &Account,
        client_ip: Option<IpAddr>,
        batch: BatchRequest,
    ) -> Result<BatchOutcome> {
        self.authorize(account, client_ip).await?;

        if batch.messages.is_empty() {
            return Err(Error::validation("messages", "messages must not be empty"));
        }
        if batch.messages.len() > MAX_BATCH_MESSAGES {
            return Err(Error::validation(
                "messages",
                format!("a batch holds at most {} messages", MAX_BATCH_MESSAGES),
            ));
        }
        let dispatch_id = match batch.dispatch_id.as_deref().map(str::trim) {
            Some(id) if id.is_empty() || id.chars().count() > MAX_DISPATCH_ID_CHARS => {
                return Err(Error::validation(
                    "dispatch_id",
                    format!("dispatch_id must be 1 to {} characters", MAX_DISPATCH_ID_CHARS),
                ))
            }
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };
        self.resolve_sender(batch.sender.as_deref())?;
        if let Some(url) = &batch.dlr_callback_url {
            validate_callback_url(url, self.config.allow_private_callback_hosts)?;
        }

        let mut prepared = Vec::with_capacity(batch.messages.len());
        for item in batch.messages {
            let request = SendRequest {
                to: item.to,
                message: item.message,
                template_id: item.template_id,
                metadata: item.metadata,
                sender: batch.sender.clone(),
                dlr_callback_url: batch.dlr_callback_url.clone(),
                request_id: item.request_id,
                promotional: batch.promotional,
            };
            prepared.push(self.prepare(account, request, Some(&dispatch_id)).await);
        }

        let required: Decimal = prepared
            .iter()
            .filter_map(|p| match p {
                Ok(Prepared::Fresh(new_message)) => Some(new_message.price),
                _ => None,
            })
            .sum();
        let check = self.ledger.check(account.id, required).await?;
        if !check.sufficient {
            warn!(
                account_id = %account.id,
                %dispatch_id,
                %required,
                "Batch exceeds available balance"
            );
            return Err(Error::InsufficientBalance {
                required,
                available: check.balance + check.credit_limit,
            });
        }

        let mut items = Vec::with_capacity(prepared.len());
        for (index, prepared) in prepared.into_iter().enumerate() {
            let result = match prepared {
                Ok(Prepared::Replay(message)) => Ok(SendOutcome {
                    message,
                    balance_after: Decimal::ZERO,
                    replayed: true,
                }),
                Ok(Prepared::Fresh(new_message)) => self.commit(account, new_message).await,
                Err(e) => Err(e),
            };
            items.push(BatchItemOutcome { index, result });
        }

        let balance_after = self.ledger.check(account.id, Decimal::ZERO).await?.balance;
        for item in &mut items {
            if let Ok(outcome) = &mut item.result {
                if outcome.replayed {
                    outcome.balance_after = balance_after;
                }
            }
        }

        let outcome = BatchOutcome {
            dispatch_id,
            items,
            currency: account.currency.to_uppercase(),
            balance_after,
        };
        info!(
            account_id = %account.id,
            dispatch_id = %outcome.dispatch_id,
            accepted = outcome.accepted(),
            rejected = outcome.items.len() - outcome.accepted(),
            total_price = %outcome.total_price(),
            "Batch dispatched"
        );
        Ok(outcome)
    }

    /// Validate and price a send; replays resolve to the stored message
    async fn prepare(
        &self,
        account: &Account,
        request: SendRequest,
        dispatch_id: Option<&str>,
    ) -> Result<Prepared> {
        let request_id = match request.request_id.as_deref().map(str::trim) {
            Some(id) => {
                if id.is_empty() || id.chars().count() > MAX_REQUEST_ID_CHARS {
                    return Err(Error::validation(
                        "request_id",
                        format!("request_id must be 1 to {} characters", MAX_REQUEST_ID_CHARS),
                    ));
                }
                if let Some(existing) = self.messages.find_by_request_id(account.id, id).await? {
                    info!(request_id = id, message_id = %existing.id, "Replaying send");
                    return Ok(Prepared::Replay(existing));
                }
                id.to_string()
            }
            None => Uuid::new_v4().to_string(),
        };

        let to = normalize_phone(&request.to)?;
        let sender = self.resolve_sender(request.sender.as_deref())?;
        let metadata = metadata_object(request.metadata)?;
        let (content, template_id) = self
            .resolve_body(account, request.message, request.template_id, &metadata)
            .await?;
        if let Some(url) = &request.dlr_callback_url {
            validate_callback_url(url, self.config.allow_private_callback_hosts)?;
        }

        let segmentation = segment(&content, self.config.max_parts)?;
        let class = MessageClass::from_flag(request.promotional);
        let quote = self
            .rates
            .quote(&to, class, segmentation.part_count, &account.currency)?;

        Ok(Prepared::Fresh(NewMessage {
            id: Uuid::now_v7(),
            request_id,
            account_id: account.id,
            mobile_phone: to,
            content,
            sender,
            encoding: segmentation.encoding,
            part_count: segmentation.part_count,
            price: quote.total,
            currency: quote.currency,
            promotional: request.promotional,
            template_id,
            metadata,
            dlr_callback_url: request.dlr_callback_url,
            dispatch_id: dispatch_id.map(str::to_string),
        }))
    }

    /// Debit, store and hand a prepared message to the operator
    async fn commit(&self, account: &Account, new_message: NewMessage) -> Result<SendOutcome> {
        let price = new_message.price;
        let request_id = new_message.request_id.clone();
        let debit = self.ledger.check_and_debit(account.id, price).await?;

        let message = match self.messages.insert(new_message).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                // Lost a race with a concurrent send using the same request id
                self.refund(account, price).await;
                let existing = self
                    .messages
                    .find_by_request_id(account.id, &request_id)
                    .await?
                    .ok_or_else(|| Error::Internal("request id conflict".to_string()))?;
                return Ok(SendOutcome {
                    message: existing,
                    balance_after: debit.balance_after + price,
                    replayed: true,
                });
            }
            Err(e) => {
                self.refund(account, price).await;
                return Err(e);
            }
        };

        info!(
            message_id = %message.id,
            account_id = %account.id,
            parts = message.part_count,
            price = %message.price,
            "Message accepted"
        );

        if let Err(e) = self.operator.submit(&message).await {
            error!(message_id = %message.id, "Operator submission failed: {}", e);
            let report = DeliveryReport {
                id: message.id.to_string(),
                message_status: "FAILED".to_string(),
                donedate: None,
                err: Some("SUBMIT".to_string()),
            };
            if let Err(e) = self.tracker.submit(report).await {
                error!(message_id = %message.id, "Could not mark message failed: {}", e);
            }
        }

        Ok(SendOutcome {
            message,
            balance_after: debit.balance_after,
            replayed: false,
        })
    }

    async fn refund(&self, account: &Account, amount: Decimal) {
        if let Err(e) = self.ledger.credit(account.id, amount).await {
            error!(account_id = %account.id, %amount, "Failed to refund debit: {}", e);
        }
    }

    /// Segment and price a message without debiting
    pub async fn check(
        &self,
        account: &Account,
        client_ip: Option<IpAddr>,
        request: CheckRequest,
    ) -> Result<CheckOutcome> {
        self.authorize(account, client_ip).await?;

        let metadata = metadata_object(request.metadata)?;
        let (content, _) = self
            .resolve_body(account, request.message, request.template_id, &metadata)
            .await?;
        let segmentation = segment(&content, self.config.max_parts)?;

        let (price_estimate, balance_sufficient) = match request.to.as_deref() {
            Some(to) => {
                let to = normalize_phone(to)?;
                let class = MessageClass::from_flag(request.promotional);
                let quote =
                    self.rates
                        .quote(&to, class, segmentation.part_count, &account.currency)?;
                let check = self.ledger.check(account.id, quote.total).await?;
                (Some(quote.total), Some(check.sufficient))
            }
            None => (None, None),
        };

        Ok(CheckOutcome {
            segmentation,
            currency: account.currency.to_uppercase(),
            price_estimate,
            balance_sufficient,
        })
    }

    /// Message text from either a literal body or an approved template
    async fn resolve_body(
        &self,
        account: &Account,
        message: Option<String>,
        template_id: Option<TemplateId>,
        metadata: &Value,
    ) -> Result<(String, Option<TemplateId>)> {
        match (message, template_id) {
            (Some(_), Some(_)) => Err(Error::validation(
                "message",
                "provide either message or template_id, not both",
            )),
            (Some(text), None) => Ok((text, None)),
            (None, Some(id)) => {
                let template = self.moderation.approved_for_send(account.id, id).await?;
                let text = self.moderation.render(&template.content, metadata)?;
                Ok((text, Some(id)))
            }
            (None, None) => Err(Error::validation(
                "message",
                "message or template_id is required",
            )),
        }
    }

    fn resolve_sender(&self, sender: Option<&str>) -> Result<String> {
        let sender = sender.map(str::trim).filter(|s| !s.is_empty());
        match sender {
            None => Ok(self.config.default_sender.clone()),
            Some(s) if s.chars().count() <= MAX_SENDER_CHARS => Ok(s.to_string()),
            Some(_) => Err(Error::validation(
                "sender",
                format!("sender must be 1 to {} characters", MAX_SENDER_CHARS),
            )),
        }
    }

    /// A message owned by `account`
    pub async fn message_status(&self, account: &Account, message_id: MessageId) -> Result<Message> {
        self.messages
            .get(message_id)
            .await?
            .filter(|m| m.account_id == account.id)
            .ok_or_else(|| Error::NotFound(format!("message {}", message_id)))
    }

    /// A page of the account's messages, newest first
    pub async fn list_messages(&self, account: &Account, query: HistoryQuery) -> Result<MessagePage> {
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(Error::validation(
                "limit",
                format!("limit must be 1 to {}", MAX_PAGE_SIZE),
            ));
        }
        if let (Some(from), Some(to)) = (query.from, query.to) {
            if from > to {
                return Err(Error::validation("from", "from must not be after to"));
            }
        }
        let status = query
            .status
            .as_deref()
            .map(|s| {
                s.trim()
                    .to_ascii_uppercase()
                    .parse::<MessageStatus>()
                    .map_err(|_| Error::validation("status", format!("unknown message status '{}'", s)))
            })
            .transpose()?;

        let filter = MessageFilter {
            account_id: account.id,
            dispatch_id: query.dispatch_id.filter(|id| !id.trim().is_empty()),
            status,
            promotional: query.promotional,
            created_from: query.from,
            created_to: query.to,
            limit,
            offset: query.offset.unwrap_or(0),
        };
        self.messages.list(&filter).await
    }

    /// Status breakdown of one of the account's batches
    pub async fn dispatch_status(&self, account: &Account, dispatch_id: &str) -> Result<DispatchSummary> {
        let counts = self.messages.dispatch_summary(account.id, dispatch_id).await?;
        if counts.is_empty() {
            return Err(Error::NotFound(format!("dispatch {}", dispatch_id)));
        }

        let mut summary = DispatchSummary {
            dispatch_id: dispatch_id.to_string(),
            total_messages: 0,
            status_breakdown: BTreeMap::new(),
            total_price: Decimal::ZERO,
            currency: account.currency.to_uppercase(),
        };
        for count in counts {
            let n = count.count.max(0) as u64;
            summary.total_messages += n;
            summary.total_price += count.price;
            summary.status_breakdown.insert(count.status, n);
        }
        Ok(summary)
    }

    /// Suggest a cheaper rewrite of a message
    pub async fn normalize(
        &self,
        account: &Account,
        client_ip: Option<IpAddr>,
        message: &str,
    ) -> Result<Normalization> {
        self.authorize(account, client_ip).await?;
        normalize(message)
    }

    /// Queue an operator delivery report for the tracker
    pub async fn ingest_dlr(&self, report: DeliveryReport) -> Result<()> {
        self.tracker.submit(report).await
    }

    pub async fn submit_template(
        &self,
        account: &Account,
        submission: TemplateSubmission,
    ) -> Result<Template> {
        self.moderation.submit(account.id, submission).await
    }

    pub async fn resubmit_template(
        &self,
        account: &Account,
        template_id: TemplateId,
        submission: TemplateSubmission,
    ) -> Result<Template> {
        self.moderation
            .resubmit(account.id, template_id, submission)
            .await
    }

    pub async fn list_templates(&self, account: &Account) -> Result<Vec<Template>> {
        self.moderation.list_for_account(account.id).await
    }

    /// Templates awaiting review, or all templates in `status`
    pub async fn list_templates_for_review(
        &self,
        status: Option<TemplateStatus>,
    ) -> Result<Vec<Template>> {
        self.moderation
            .list_for_review(Some(status.unwrap_or(TemplateStatus::Pending)))
            .await
    }

    pub async fn decide_template(&self, template_id: TemplateId, decision: Decision) -> Result<Template> {
        self.moderation.decide(template_id, decision).await
    }
}

/// Normalize a destination to `+` followed by 7 to 15 digits
pub fn normalize_phone(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let rest = trimmed.strip_prefix('+').unwrap_or(trimmed);

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '(' | ')' | '.' => {}
            _ => {
                return Err(Error::validation(
                    "to",
                    "phone number may only contain digits",
                ))
            }
        }
    }

    if !(7..=15).contains(&digits.len()) {
        return Err(Error::validation(
            "to",
            "phone number must have 7 to 15 digits",
        ));
    }
    Ok(format!("+{}", digits))
}

fn metadata_object(metadata: Option<Value>) -> Result<Value> {
    match metadata {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(value @ Value::Object(_)) => Ok(value),
        Some(_) => Err(Error::validation("metadata", "metadata must be a JSON object")),
    }
}

impl SendOutcome {
    pub fn encoding(&self) -> Result<Encoding> {
        self.message.encoding_enum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::spawn_tracker;
    use crate::moderation::TemplateSubmission;
    use crate::operator::LoggingOperatorLink;
    use otpgate_common::config::{PriceConfig, RateEntryConfig};
    use otpgate_common::types::{Channel, Verdict};
    use otpgate_storage::models::NewAccount;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::sync::{mpsc, watch};

    struct Fixture {
        gateway: Gateway,
        repos: Repositories,
        _shutdown: watch::Sender<bool>,
        _callbacks: mpsc::Receiver<crate::delivery::CallbackJob>,
    }

    fn config() -> Config {
        let mut config = Config::default();
        let mut prices = HashMap::new();
        prices.insert(
            "UZS".to_string(),
            PriceConfig {
                service_price: dec!(115),
                promo_price: Some(dec!(150)),
            },
        );
        config.pricing.rates.push(RateEntryConfig {
            country_code: "998".to_string(),
            prefix: "90".to_string(),
            operator: "Beeline".to_string(),
            prices,
        });
        config.api.admin_token = Some("admin".to_string());
        config
    }

    fn fixture() -> Fixture {
        let repos = Repositories::memory();
        let (cb_tx, cb_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tracker, _) = spawn_tracker(
            repos.messages.clone(),
            cb_tx,
            chrono::Duration::hours(48),
            16,
            shutdown_rx,
        );
        let gateway =
            Gateway::new(&repos, &config(), tracker, Arc::new(LoggingOperatorLink)).unwrap();
        Fixture {
            gateway,
            repos,
            _shutdown: shutdown_tx,
            _callbacks: cb_rx,
        }
    }

    async fn account(repos: &Repositories, balance: Decimal, rps: Option<u32>) -> Account {
        repos
            .accounts
            .create(NewAccount {
                id: Uuid::new_v4(),
                name: "acme".to_string(),
                balance,
                credit_limit: Decimal::ZERO,
                currency: "UZS".to_string(),
                rate_limit_rps: rps,
                allowed_ips: vec![],
            })
            .await
            .unwrap()
    }

    fn send_request(message: &str) -> SendRequest {
        SendRequest {
            to: "+998901234567".to_string(),
            message: Some(message.to_string()),
            template_id: None,
            metadata: None,
            sender: None,
            dlr_callback_url: None,
            request_id: None,
            promotional: false,
        }
    }

    #[test]
    fn test_normalize_phone() {
        assert_eq!(normalize_phone("+998 90 123-45-67").unwrap(), "+998901234567");
        assert_eq!(normalize_phone("998901234567").unwrap(), "+998901234567");
        assert!(normalize_phone("+99890abc").is_err());
        assert!(normalize_phone("12345").is_err());
        assert!(normalize_phone("+1234567890123456").is_err());
        assert_eq!(normalize_phone("").unwrap_err().field(), Some("to"));
    }

    #[tokio::test]
    async fn test_send_two_part_message() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let outcome = f
            .gateway
            .send(&acc, None, send_request(&"a".repeat(170)))
            .await
            .unwrap();
        assert!(!outcome.replayed);
        assert_eq!(outcome.message.part_count, 2);
        assert_eq!(outcome.message.price, dec!(230));
        assert_eq!(outcome.balance_after, dec!(770));
        assert_eq!(outcome.message.status, "PENDING");
        assert_eq!(outcome.message.sender, "OTP");
        assert_eq!(outcome.encoding().unwrap(), Encoding::Gsm7);
    }

    #[tokio::test]
    async fn test_send_is_idempotent() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let mut request = send_request("Your code is 1234");
        request.request_id = Some("order-77".to_string());
        let first = f.gateway.send(&acc, None, request.clone()).await.unwrap();

        let acc = f.repos.accounts.get(acc.id).await.unwrap().unwrap();
        let second = f.gateway.send(&acc, None, request).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.message.id, first.message.id);
        assert_eq!(second.balance_after, dec!(885));

        let stored = f.repos.accounts.get(acc.id).await.unwrap().unwrap();
        assert_eq!(stored.balance, dec!(885));
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_no_trace() {
        let f = fixture();
        let acc = account(&f.repos, dec!(100), None).await;

        let mut request = send_request("Your code is 1234");
        request.request_id = Some("r1".to_string());
        let err = f.gateway.send(&acc, None, request).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));

        assert_eq!(
            f.repos.accounts.get(acc.id).await.unwrap().unwrap().balance,
            dec!(100)
        );
        assert!(f
            .repos
            .messages
            .find_by_request_id(acc.id, "r1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_validation_before_side_effects() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let mut request = send_request("hi");
        request.sender = Some("TWELVE_CHARS".to_string());
        let err = f.gateway.send(&acc, None, request).await.unwrap_err();
        assert_eq!(err.field(), Some("sender"));

        let mut request = send_request("hi");
        request.to = "+12025550100".to_string();
        let err = f.gateway.send(&acc, None, request).await.unwrap_err();
        assert!(matches!(err, Error::UnknownDestination(_)));

        let mut request = send_request("hi");
        request.dlr_callback_url = Some("http://10.0.0.1/hook".to_string());
        let err = f.gateway.send(&acc, None, request).await.unwrap_err();
        assert_eq!(err.field(), Some("dlr_callback_url"));

        let err = f
            .gateway
            .send(&acc, None, send_request(&"a".repeat(153 * 6 + 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLong { .. }));

        assert_eq!(
            f.repos.accounts.get(acc.id).await.unwrap().unwrap().balance,
            dec!(1000)
        );
    }

    #[tokio::test]
    async fn test_rate_limit_applies_to_sends() {
        let f = fixture();
        let acc = account(&f.repos, dec!(10000), Some(2)).await;

        assert!(f.gateway.send(&acc, None, send_request("a")).await.is_ok());
        assert!(f.gateway.send(&acc, None, send_request("b")).await.is_ok());
        assert!(matches!(
            f.gateway.send(&acc, None, send_request("c")).await,
            Err(Error::RateLimited)
        ));
    }

    #[tokio::test]
    async fn test_send_with_template() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let template = f
            .gateway
            .submit_template(
                &acc,
                TemplateSubmission {
                    name: "login".to_string(),
                    channel: Channel::Sms,
                    category: None,
                    content: "Your code is {{code}}".to_string(),
                    variables: None,
                },
            )
            .await
            .unwrap();

        let mut request = send_request("unused");
        request.message = None;
        request.template_id = Some(template.id);
        request.metadata = Some(json!({"code": "9911"}));

        // Pending templates cannot be used
        let err = f.gateway.send(&acc, None, request.clone()).await.unwrap_err();
        assert_eq!(err.field(), Some("template_id"));

        f.gateway
            .decide_template(
                template.id,
                Decision {
                    status: Verdict::Approved,
                    comment: None,
                },
            )
            .await
            .unwrap();

        let outcome = f.gateway.send(&acc, None, request).await.unwrap();
        assert_eq!(outcome.message.content, "Your code is 9911");
        assert_eq!(outcome.message.template_id, Some(template.id));
        assert_eq!(outcome.message.metadata, json!({"code": "9911"}));
    }

    #[tokio::test]
    async fn test_check_does_not_debit() {
        let f = fixture();
        let acc = account(&f.repos, dec!(200), None).await;

        let outcome = f
            .gateway
            .check(
                &acc,
                None,
                CheckRequest {
                    to: Some("+998901234567".to_string()),
                    message: Some("a".repeat(170)),
                    template_id: None,
                    metadata: None,
                    promotional: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.segmentation.part_count, 2);
        assert_eq!(outcome.price_estimate, Some(dec!(230)));
        assert_eq!(outcome.balance_sufficient, Some(false));

        let without_destination = f
            .gateway
            .check(
                &acc,
                None,
                CheckRequest {
                    to: None,
                    message: Some("Привет".to_string()),
                    template_id: None,
                    metadata: None,
                    promotional: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(without_destination.segmentation.encoding, Encoding::Ucs2);
        assert!(without_destination.price_estimate.is_none());

        assert_eq!(
            f.repos.accounts.get(acc.id).await.unwrap().unwrap().balance,
            dec!(200)
        );
    }

    #[tokio::test]
    async fn test_message_status_is_scoped_to_owner() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;
        let other = account(&f.repos, dec!(1000), None).await;

        let sent = f.gateway.send(&acc, None, send_request("hi")).await.unwrap();
        assert!(f.gateway.message_status(&acc, sent.message.id).await.is_ok());
        assert!(matches!(
            f.gateway.message_status(&other, sent.message.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_review_queue_defaults_to_pending() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;
        for name in ["a", "b"] {
            f.gateway
                .submit_template(
                    &acc,
                    TemplateSubmission {
                        name: name.to_string(),
                        channel: Channel::Sms,
                        category: None,
                        content: "Code {{code}}".to_string(),
                        variables: None,
                    },
                )
                .await
                .unwrap();
        }
        let pending = f.gateway.list_templates_for_review(None).await.unwrap();
        assert_eq!(pending.len(), 2);
        let approved = f
            .gateway
            .list_templates_for_review(Some(TemplateStatus::Approved))
            .await
            .unwrap();
        assert!(approved.is_empty());
    }

    fn batch_item(to: &str, message: &str) -> BatchItem {
        BatchItem {
            to: to.to_string(),
            message: Some(message.to_string()),
            template_id: None,
            metadata: None,
            request_id: None,
        }
    }

    fn batch(items: Vec<BatchItem>) -> BatchRequest {
        BatchRequest {
            messages: items,
            sender: None,
            dispatch_id: Some("promo-1".to_string()),
            dlr_callback_url: None,
            promotional: false,
        }
    }

    #[tokio::test]
    async fn test_batch_reports_each_item() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let outcome = f
            .gateway
            .send_batch(
                &acc,
                None,
                batch(vec![
                    batch_item("+998901234567", "Hello one"),
                    batch_item("+12025550100", "No route"),
                    batch_item("+998901234568", &"a".repeat(170)),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(outcome.dispatch_id, "promo-1");
        assert_eq!(outcome.items.len(), 3);
        assert_eq!(outcome.accepted(), 2);
        assert!(matches!(
            outcome.items[1].result,
            Err(Error::UnknownDestination(_))
        ));
        assert_eq!(outcome.total_price(), dec!(345));
        assert_eq!(outcome.balance_after, dec!(655));

        // One debit per accepted item
        let first = outcome.items[0].result.as_ref().unwrap();
        let third = outcome.items[2].result.as_ref().unwrap();
        assert_eq!(first.balance_after, dec!(885));
        assert_eq!(third.balance_after, dec!(655));
        assert_eq!(first.message.dispatch_id.as_deref(), Some("promo-1"));
    }

    #[tokio::test]
    async fn test_batch_rejected_when_balance_short() {
        let f = fixture();
        let acc = account(&f.repos, dec!(200), None).await;

        let err = f
            .gateway
            .send_batch(
                &acc,
                None,
                batch(vec![
                    batch_item("+998901234567", "one"),
                    batch_item("+998901234568", "two"),
                ]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(
            f.repos.accounts.get(acc.id).await.unwrap().unwrap().balance,
            dec!(200)
        );
        let page = f
            .gateway
            .list_messages(&acc, HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn test_batch_replays_known_request_ids() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let mut item = batch_item("+998901234567", "Hello");
        item.request_id = Some("ref-1".to_string());
        let mut request = batch(vec![item]);
        request.dispatch_id = None;

        let first = f.gateway.send_batch(&acc, None, request.clone()).await.unwrap();
        assert!(Uuid::parse_str(&first.dispatch_id).is_ok());

        let second = f.gateway.send_batch(&acc, None, request).await.unwrap();
        let replay = second.items[0].result.as_ref().unwrap();
        assert!(replay.replayed);
        assert_eq!(replay.balance_after, dec!(885));
        assert_eq!(second.total_price(), Decimal::ZERO);
        assert_eq!(
            f.repos.accounts.get(acc.id).await.unwrap().unwrap().balance,
            dec!(885)
        );
    }

    #[tokio::test]
    async fn test_batch_validation() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), None).await;

        let err = f.gateway.send_batch(&acc, None, batch(vec![])).await.unwrap_err();
        assert_eq!(err.field(), Some("messages"));

        let mut request = batch(vec![batch_item("+998901234567", "hi")]);
        request.dispatch_id = Some("x".repeat(101));
        let err = f.gateway.send_batch(&acc, None, request).await.unwrap_err();
        assert_eq!(err.field(), Some("dispatch_id"));

        let mut request = batch(vec![batch_item("+998901234567", "hi")]);
        request.dlr_callback_url = Some("http://10.0.0.1/hook".to_string());
        let err = f.gateway.send_batch(&acc, None, request).await.unwrap_err();
        assert_eq!(err.field(), Some("dlr_callback_url"));
    }

    #[tokio::test]
    async fn test_history_and_dispatch_status() {
        let f = fixture();
        let acc = account(&f.repos, dec!(10000), None).await;
        let other = account(&f.repos, dec!(10000), None).await;

        f.gateway.send(&acc, None, send_request("single")).await.unwrap();
        f.gateway.send(&other, None, send_request("foreign")).await.unwrap();
        let mut promo = batch(vec![
            batch_item("+998901234567", "Sale one"),
            batch_item("+998901234568", "Sale two"),
        ]);
        promo.promotional = true;
        let sent = f.gateway.send_batch(&acc, None, promo).await.unwrap();

        let delivered = sent.items[0].result.as_ref().unwrap().message.id;
        f.gateway
            .ingest_dlr(DeliveryReport {
                id: delivered.to_string(),
                message_status: "DELIVRD".to_string(),
                donedate: None,
                err: None,
            })
            .await
            .unwrap();
        // Wait for the tracker to apply the queued report
        for _ in 0..100 {
            if f.gateway.message_status(&acc, delivered).await.unwrap().status == "DELIVRD" {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let all = f
            .gateway
            .list_messages(&acc, HistoryQuery::default())
            .await
            .unwrap();
        assert_eq!(all.total, 3);

        let ads = f
            .gateway
            .list_messages(
                &acc,
                HistoryQuery {
                    promotional: Some(true),
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(ads.total, 2);
        assert_eq!(ads.messages.len(), 1);

        let delivrd = f
            .gateway
            .list_messages(
                &acc,
                HistoryQuery {
                    status: Some("delivrd".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(delivrd.messages[0].id, delivered);

        let err = f
            .gateway
            .list_messages(
                &acc,
                HistoryQuery {
                    status: Some("LOST".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("status"));
        let err = f
            .gateway
            .list_messages(
                &acc,
                HistoryQuery {
                    limit: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.field(), Some("limit"));

        let summary = f.gateway.dispatch_status(&acc, "promo-1").await.unwrap();
        assert_eq!(summary.total_messages, 2);
        assert_eq!(summary.status_breakdown.get("DELIVRD"), Some(&1));
        assert_eq!(summary.status_breakdown.get("PENDING"), Some(&1));
        assert_eq!(summary.total_price, dec!(300));
        assert_eq!(summary.currency, "UZS");

        assert!(matches!(
            f.gateway.dispatch_status(&other, "promo-1").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_normalize_counts_against_rate_limit() {
        let f = fixture();
        let acc = account(&f.repos, dec!(1000), Some(1)).await;

        let result = f.gateway.normalize(&acc, None, "Hi \u{2014} there").await.unwrap();
        assert_eq!(result.normalized_message, "Hi - there");
        assert!(matches!(
            f.gateway.normalize(&acc, None, "again").await,
            Err(Error::RateLimited)
        ));
    }
}
