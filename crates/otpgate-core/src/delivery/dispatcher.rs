//! Webhook Dispatcher - delivers status callbacks to integrators

use super::CallbackJob;
use chrono::Utc;
use hmac::{Hmac, Mac};
use otpgate_common::config::DeliveryConfig;
use otpgate_common::{Error, Result};
use otpgate_storage::models::CallbackOutcome;
use otpgate_storage::repository::MessageRepository;
use reqwest::{Client, Url};
use sha2::Sha256;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Retry and signing settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
    pub signing_secret: Option<String>,
    pub allow_private_hosts: bool,
}

impl From<&DeliveryConfig> for DispatcherConfig {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.webhook_max_attempts.max(1),
            base_delay: Duration::from_millis(config.webhook_base_delay_ms),
            max_delay: Duration::from_millis(config.webhook_max_delay_ms),
            timeout: Duration::from_secs(config.webhook_timeout_secs),
            signing_secret: config.signing_secret.clone(),
            allow_private_hosts: config.allow_private_callback_hosts,
        }
    }
}

/// Posts callbacks with retries and records the outcome on the message
pub struct WebhookDispatcher {
    http_client: Client,
    messages: Arc<dyn MessageRepository>,
    config: DispatcherConfig,
}

impl WebhookDispatcher {
    pub fn new(messages: Arc<dyn MessageRepository>, config: DispatcherConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            messages,
            config,
        })
    }

    /// Consume jobs until every sender is gone; each job is delivered on its own task.
    ///
    /// The tracker owns the only sender, so the queue closes once the tracker has
    /// drained its own commands. After shutdown is signalled, deliveries stop
    /// retrying and record their outcome; `run` returns once every in-flight
    /// delivery has finished.
    pub async fn run(
        self: Arc<Self>,
        mut rx: mpsc::Receiver<CallbackJob>,
        shutdown_rx: watch::Receiver<bool>,
    ) {
        info!("Webhook dispatcher started");
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                Some(result) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(result);
                }

                job = rx.recv() => {
                    let Some(job) = job else {
                        info!("Callback channel closed");
                        break;
                    };
                    let dispatcher = self.clone();
                    let stop = shutdown_rx.clone();
                    in_flight.spawn(async move {
                        dispatcher.deliver_until(job, Some(stop)).await;
                    });
                }
            }
        }

        if !in_flight.is_empty() {
            info!(pending = in_flight.len(), "Waiting for in-flight webhooks");
        }
        while let Some(result) = in_flight.join_next().await {
            log_join(result);
        }
        info!("Webhook dispatcher stopped");
    }

    /// Deliver one callback, retrying with backoff, and record the result
    pub async fn deliver(&self, job: CallbackJob) -> CallbackOutcome {
        self.deliver_until(job, None).await
    }

    async fn deliver_until(
        &self,
        job: CallbackJob,
        stop: Option<watch::Receiver<bool>>,
    ) -> CallbackOutcome {
        let message_id = job.payload.message_id;
        let outcome = self.deliver_with_retries(&job, stop).await;

        match &outcome.error {
            None => info!(%message_id, attempts = outcome.attempts, "Status webhook delivered"),
            Some(e) => warn!(
                %message_id,
                attempts = outcome.attempts,
                "{}",
                Error::WebhookDeliveryFailed(e.clone())
            ),
        }

        if let Err(e) = self.messages.record_callback_outcome(message_id, &outcome).await {
            error!(%message_id, "Failed to record webhook outcome: {}", e);
        }
        outcome
    }

    async fn deliver_with_retries(
        &self,
        job: &CallbackJob,
        mut stop: Option<watch::Receiver<bool>>,
    ) -> CallbackOutcome {
        if let Err(e) = validate_callback_url(&job.url, self.config.allow_private_hosts) {
            return CallbackOutcome {
                attempts: 0,
                delivered_at: None,
                error: Some(e.to_string()),
            };
        }

        let body = match serde_json::to_vec(&job.payload) {
            Ok(body) => body,
            Err(e) => {
                return CallbackOutcome {
                    attempts: 0,
                    delivered_at: None,
                    error: Some(format!("Failed to serialize payload: {}", e)),
                }
            }
        };

        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts {
            match self.attempt(&job.url, &body).await {
                Ok(()) => {
                    return CallbackOutcome {
                        attempts: attempt,
                        delivered_at: Some(Utc::now()),
                        error: None,
                    }
                }
                Err(e) => {
                    debug!(url = %job.url, attempt, "Webhook attempt failed: {}", e);
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.config.max_attempts {
                let delay = calculate_backoff(attempt - 1, self.config.base_delay, self.config.max_delay);
                if !backoff(delay, stop.as_mut()).await {
                    debug!(url = %job.url, attempt, "Stopping webhook retries for shutdown");
                    return CallbackOutcome {
                        attempts: attempt,
                        delivered_at: None,
                        error: last_error,
                    };
                }
            }
        }

        CallbackOutcome {
            attempts: self.config.max_attempts,
            delivered_at: None,
            error: last_error,
        }
    }

    async fn attempt(&self, url: &str, body: &[u8]) -> anyhow::Result<()> {
        let mut request = self
            .http_client
            .post(url)
            .header("Content-Type", "application/json");

        if let Some(secret) = &self.config.signing_secret {
            request = request.header("X-Webhook-Signature", format!("sha256={}", sign(secret, body)?));
        }

        let response = request.body(body.to_vec()).send().await?;
        if !response.status().is_success() {
            return Err(anyhow::anyhow!("Webhook returned status {}", response.status()));
        }
        Ok(())
    }
}

/// Sleep before the next retry; false when shutdown cut the wait short
async fn backoff(delay: Duration, stop: Option<&mut watch::Receiver<bool>>) -> bool {
    let Some(stop) = stop else {
        tokio::time::sleep(delay).await;
        return true;
    };
    if *stop.borrow() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stop.wait_for(|stopping| *stopping) => false,
    }
}

fn log_join(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        error!("Webhook task failed: {}", e);
    }
}

/// Hex HMAC-SHA256 of `body`
pub fn sign(secret: &str, body: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid HMAC key: {}", e))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Delay before retry number `retry` (0-based): base * 2^retry, capped
pub fn calculate_backoff(retry: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry.min(31));
    base.saturating_mul(factor).min(max)
}

/// Validate a callback URL to prevent SSRF.
///
/// Only http and https are accepted. Internal host names and private,
/// loopback or link-local addresses are rejected unless `allow_private` is set.
pub fn validate_callback_url(url_str: &str, allow_private: bool) -> Result<()> {
    let invalid = |message: String| Error::validation("dlr_callback_url", message);

    let url = Url::parse(url_str).map_err(|e| invalid(format!("invalid URL: {}", e)))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(invalid(format!(
                "scheme '{}' is not allowed, use http or https",
                scheme
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| invalid("URL has no host".to_string()))?;

    if allow_private {
        return Ok(());
    }

    let lower_host = host.to_lowercase();
    if lower_host == "localhost"
        || lower_host.ends_with(".localhost")
        || lower_host.ends_with(".local")
        || lower_host.ends_with(".internal")
    {
        return Err(invalid(format!("host '{}' is internal", host)));
    }

    let bare = lower_host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(&ip.to_canonical()) {
            return Err(invalid(format!("address '{}' is private", ip)));
        }
    }

    Ok(())
}

fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                // 100.64.0.0/10 (CGNAT)
                || (ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                // fc00::/7 (ULA)
                || (ipv6.segments()[0] & 0xfe00) == 0xfc00
                // fe80::/10 (link-local)
                || (ipv6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}
