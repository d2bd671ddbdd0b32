//! Configuration for OtpGate

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Message composition defaults
    #[serde(default)]
    pub messaging: MessagingConfig,

    /// Rate limiting defaults
    #[serde(default)]
    pub guard: GuardConfig,

    /// Delivery tracking and webhook dispatch
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Rate table
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Accounts created at startup
    #[serde(default)]
    pub seed: SeedConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Seconds to wait for background tasks on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_shutdown_grace() -> u64 {
    5
}

/// Storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    #[default]
    Postgres,
    Memory,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database backend: "postgres" or "memory"
    #[serde(default)]
    pub backend: DatabaseBackend,

    /// Database URL (for postgres)
    pub url: Option<String>,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::default(),
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
        }
    }
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// API port
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Token required in `X-Admin-Token` for moderation endpoints.
    /// Moderation is disabled when unset.
    pub admin_token: Option<String>,

    /// Take the client IP from `X-Forwarded-For`
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// CORS allowed origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            admin_token: None,
            trust_forwarded_for: false,
            cors_origins: Vec::new(),
        }
    }
}

fn default_api_port() -> u16 {
    8080
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

/// Message composition defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Maximum number of parts a single send may be split into
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,

    /// Sender used when a request omits one
    #[serde(default = "default_sender")]
    pub default_sender: String,

    /// Currency used for accounts that do not set one
    #[serde(default = "default_currency")]
    pub default_currency: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            max_parts: default_max_parts(),
            default_sender: default_sender(),
            default_currency: default_currency(),
        }
    }
}

fn default_max_parts() -> u32 {
    6
}

fn default_sender() -> String {
    "OTP".to_string()
}

fn default_currency() -> String {
    "UZS".to_string()
}

/// Rate limiting defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Requests per second for accounts without their own limit.
    /// Unlimited when unset.
    pub default_rate_limit_rps: Option<u32>,
}

/// Delivery tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Hours after which a pending message expires
    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: u64,

    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Tracker command channel capacity
    #[serde(default = "default_tracker_buffer")]
    pub tracker_buffer: usize,

    /// Maximum webhook delivery attempts
    #[serde(default = "default_webhook_max_attempts")]
    pub webhook_max_attempts: u32,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_webhook_base_delay")]
    pub webhook_base_delay_ms: u64,

    /// Upper bound on the retry delay in milliseconds
    #[serde(default = "default_webhook_max_delay")]
    pub webhook_max_delay_ms: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,

    /// HMAC-SHA256 key for `X-Webhook-Signature`
    pub signing_secret: Option<String>,

    /// Accept callback URLs pointing at private or loopback addresses
    #[serde(default)]
    pub allow_private_callback_hosts: bool,

    /// Token the operator link must present in `X-Dlr-Token`
    pub dlr_ingest_token: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            expiry_hours: default_expiry_hours(),
            sweep_interval_secs: default_sweep_interval(),
            tracker_buffer: default_tracker_buffer(),
            webhook_max_attempts: default_webhook_max_attempts(),
            webhook_base_delay_ms: default_webhook_base_delay(),
            webhook_max_delay_ms: default_webhook_max_delay(),
            webhook_timeout_secs: default_webhook_timeout(),
            signing_secret: None,
            allow_private_callback_hosts: false,
            dlr_ingest_token: None,
        }
    }
}

fn default_expiry_hours() -> u64 {
    48
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_tracker_buffer() -> usize {
    1024
}

fn default_webhook_max_attempts() -> u32 {
    5
}

fn default_webhook_base_delay() -> u64 {
    500
}

fn default_webhook_max_delay() -> u64 {
    60_000
}

fn default_webhook_timeout() -> u64 {
    10
}

/// Rate table configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default)]
    pub rates: Vec<RateEntryConfig>,
}

/// One destination prefix and its prices
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateEntryConfig {
    /// Country calling code without `+`, e.g. "998"
    pub country_code: String,

    /// Network prefix following the country code; empty matches the whole country
    #[serde(default)]
    pub prefix: String,

    /// Operator name reported in quotes
    #[serde(default)]
    pub operator: String,

    /// Prices keyed by ISO currency code
    #[serde(default)]
    pub prices: HashMap<String, PriceConfig>,
}

/// Per-part prices in one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceConfig {
    pub service_price: Decimal,
    pub promo_price: Option<Decimal>,
}

/// Accounts created at startup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default)]
    pub accounts: Vec<SeedAccount>,
}

/// A seeded account with one API key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedAccount {
    pub id: Option<Uuid>,

    pub name: String,

    /// Plaintext key; stored hashed
    pub api_key: String,

    #[serde(default)]
    pub balance: Decimal,

    #[serde(default)]
    pub credit_limit: Decimal,

    pub currency: Option<String>,

    pub rate_limit_rps: Option<u32>,

    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from an optional file, then `OTPGATE__SECTION__KEY`
    /// environment variables on top.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        let mut builder = ::config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(::config::File::from(path).required(true));
            }
            None => {
                for candidate in ["./config.toml", "/etc/otpgate/config.toml"] {
                    if Path::new(candidate).exists() {
                        builder = builder.add_source(::config::File::with_name(candidate));
                        break;
                    }
                }
            }
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("OTPGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::Error::Config(format!("Failed to load config: {}", e)))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work at runtime
    pub fn validate(&self) -> crate::Result<()> {
        if self.database.backend == DatabaseBackend::Postgres && self.database.url.is_none() {
            return Err(crate::Error::Config(
                "database.url is required for the postgres backend".to_string(),
            ));
        }
        if self.messaging.max_parts == 0 {
            return Err(crate::Error::Config(
                "messaging.max_parts must be at least 1".to_string(),
            ));
        }
        let sender_len = self.messaging.default_sender.chars().count();
        if sender_len == 0 || sender_len > 11 {
            return Err(crate::Error::Config(
                "messaging.default_sender must be 1 to 11 characters".to_string(),
            ));
        }
        if self.delivery.webhook_max_attempts == 0 {
            return Err(crate::Error::Config(
                "delivery.webhook_max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0");
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.messaging.max_parts, 6);
        assert_eq!(config.messaging.default_sender, "OTP");
        assert_eq!(config.delivery.expiry_hours, 48);
        assert!(config.api.admin_token.is_none());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[database]
backend = "memory"

[api]
admin_token = "s3cret"

[guard]
default_rate_limit_rps = 10

[[pricing.rates]]
country_code = "998"
prefix = "90"
operator = "Beeline"

[pricing.rates.prices.UZS]
service_price = 115
promo_price = 150

[[seed.accounts]]
name = "demo"
api_key = "demo-key-0001"
balance = 1000
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
        assert_eq!(config.api.admin_token.as_deref(), Some("s3cret"));
        assert_eq!(config.guard.default_rate_limit_rps, Some(10));

        let rate = &config.pricing.rates[0];
        assert_eq!(rate.country_code, "998");
        assert_eq!(rate.prefix, "90");
        assert_eq!(rate.prices["UZS"].service_price, dec!(115));
        assert_eq!(rate.prices["UZS"].promo_price, Some(dec!(150)));

        let seed = &config.seed.accounts[0];
        assert_eq!(seed.balance, dec!(1000));
        assert_eq!(seed.credit_limit, Decimal::ZERO);
        config.validate().unwrap();
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sender_length_validated() {
        let mut config = Config::default();
        config.database.backend = DatabaseBackend::Memory;
        config.messaging.default_sender = "TWELVE-CHARS".to_string();
        assert!(config.validate().is_err());
    }
}
