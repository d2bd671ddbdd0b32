//! Rate & Access Guard
//!
//! Per-account token buckets, IP allow-lists and the moderator token check.

use ipnet::IpNet;
use otpgate_common::types::AccountId;
use otpgate_common::{Error, Result};
use otpgate_storage::models::Account;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Token bucket with lazy refill
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
    rps: u32,
}

impl TokenBucket {
    fn new(rps: u32, now: Instant) -> Self {
        Self {
            tokens: rps as f64,
            capacity: rps as f64,
            refill_rate: rps as f64,
            last_refill: now,
            rps,
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Access guard shared by all request handlers
pub struct Guard {
    default_rps: Option<u32>,
    buckets: RwLock<HashMap<AccountId, Arc<Mutex<TokenBucket>>>>,
    admin_token_digest: Option<[u8; 32]>,
}

impl Guard {
    pub fn new(default_rps: Option<u32>, admin_token: Option<&str>) -> Self {
        Self {
            default_rps: default_rps.filter(|rps| *rps > 0),
            buckets: RwLock::new(HashMap::new()),
            admin_token_digest: admin_token.map(digest),
        }
    }

    /// IP and rate checks for an API call, in that order
    pub async fn authorize(&self, account: &Account, client_ip: Option<IpAddr>) -> Result<()> {
        check_ip(&account.allowed_ips, client_ip)?;
        self.acquire(account.id, account.rate_limit()).await
    }

    /// Take one token from the account's bucket
    pub async fn acquire(&self, account_id: AccountId, account_rps: Option<u32>) -> Result<()> {
        self.acquire_at(account_id, account_rps, Instant::now()).await
    }

    pub async fn acquire_at(
        &self,
        account_id: AccountId,
        account_rps: Option<u32>,
        now: Instant,
    ) -> Result<()> {
        let Some(rps) = account_rps.or(self.default_rps) else {
            return Ok(());
        };

        let bucket = self.bucket_for(account_id, rps, now).await;
        let mut bucket = bucket.lock().await;
        if bucket.rps != rps {
            debug!(%account_id, old = bucket.rps, new = rps, "Rate limit changed, rebuilding bucket");
            *bucket = TokenBucket::new(rps, now);
        }

        if bucket.try_acquire(now) {
            Ok(())
        } else {
            debug!(%account_id, rps, "Rate limit exceeded");
            Err(Error::RateLimited)
        }
    }

    async fn bucket_for(&self, account_id: AccountId, rps: u32, now: Instant) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().await;
            if let Some(bucket) = buckets.get(&account_id) {
                return bucket.clone();
            }
        }

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(rps, now))))
            .clone()
    }

    /// Check the `X-Admin-Token` value against the configured moderator token
    pub fn verify_admin_token(&self, supplied: Option<&str>) -> Result<()> {
        let Some(expected) = &self.admin_token_digest else {
            return Err(Error::Forbidden("moderation is not enabled".to_string()));
        };
        let Some(supplied) = supplied else {
            return Err(Error::Forbidden("admin token required".to_string()));
        };

        if constant_time_eq(&digest(supplied), expected) {
            Ok(())
        } else {
            warn!("Rejected invalid admin token");
            Err(Error::Forbidden("invalid admin token".to_string()))
        }
    }
}

fn digest(value: &str) -> [u8; 32] {
    Sha256::digest(value.as_bytes()).into()
}

fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Enforce an account's IP allow-list.
///
/// An empty list allows everyone. Entries may be single addresses or CIDR
/// blocks; entries that parse as neither are ignored.
pub fn check_ip(allowed_ips: &[String], client_ip: Option<IpAddr>) -> Result<()> {
    if allowed_ips.is_empty() {
        return Ok(());
    }

    let Some(ip) = client_ip.map(|ip| ip.to_canonical()) else {
        return Err(Error::ForbiddenIp("unknown client address".to_string()));
    };

    for entry in allowed_ips {
        let entry = entry.trim();
        let net = match entry.parse::<IpNet>() {
            Ok(net) => net,
            Err(_) => match entry.parse::<IpAddr>() {
                Ok(addr) => IpNet::from(addr),
                Err(_) => {
                    warn!(entry, "Skipping unparseable allow-list entry");
                    continue;
                }
            },
        };
        if net.contains(&ip) {
            return Ok(());
        }
    }

    warn!(%ip, "Client address not in allow-list");
    Err(Error::ForbiddenIp(ip.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_rps_two_allows_two() {
        let guard = Guard::new(None, None);
        let account = Uuid::new_v4();
        let now = Instant::now();

        assert!(guard.acquire_at(account, Some(2), now).await.is_ok());
        assert!(guard.acquire_at(account, Some(2), now).await.is_ok());
        assert!(matches!(
            guard.acquire_at(account, Some(2), now).await,
            Err(Error::RateLimited)
        ));
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let guard = Guard::new(None, None);
        let account = Uuid::new_v4();
        let start = Instant::now();

        assert!(guard.acquire_at(account, Some(1), start).await.is_ok());
        assert!(guard.acquire_at(account, Some(1), start).await.is_err());
        let later = start + Duration::from_millis(1000);
        assert!(guard.acquire_at(account, Some(1), later).await.is_ok());
    }

    #[tokio::test]
    async fn test_default_and_unlimited() {
        let account = Uuid::new_v4();
        let now = Instant::now();

        let unlimited = Guard::new(None, None);
        for _ in 0..100 {
            assert!(unlimited.acquire_at(account, None, now).await.is_ok());
        }

        let defaulted = Guard::new(Some(1), None);
        assert!(defaulted.acquire_at(account, None, now).await.is_ok());
        assert!(defaulted.acquire_at(account, None, now).await.is_err());
    }

    #[tokio::test]
    async fn test_bucket_rebuilt_on_rps_change() {
        let guard = Guard::new(None, None);
        let account = Uuid::new_v4();
        let now = Instant::now();

        assert!(guard.acquire_at(account, Some(1), now).await.is_ok());
        assert!(guard.acquire_at(account, Some(1), now).await.is_err());
        assert!(guard.acquire_at(account, Some(3), now).await.is_ok());
    }

    #[tokio::test]
    async fn test_buckets_are_per_account() {
        let guard = Guard::new(None, None);
        let now = Instant::now();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(guard.acquire_at(a, Some(1), now).await.is_ok());
        assert!(guard.acquire_at(a, Some(1), now).await.is_err());
        assert!(guard.acquire_at(b, Some(1), now).await.is_ok());
    }

    #[test]
    fn test_ip_allow_list() {
        let allowed = vec![
            "10.0.0.0/8".to_string(),
            "203.0.113.7".to_string(),
            "not-an-ip".to_string(),
        ];

        assert!(check_ip(&allowed, Some("10.1.2.3".parse().unwrap())).is_ok());
        assert!(check_ip(&allowed, Some("203.0.113.7".parse().unwrap())).is_ok());
        assert!(check_ip(&allowed, Some("::ffff:10.9.9.9".parse().unwrap())).is_ok());
        assert!(matches!(
            check_ip(&allowed, Some("198.51.100.1".parse().unwrap())),
            Err(Error::ForbiddenIp(_))
        ));
        assert!(check_ip(&allowed, None).is_err());
        assert!(check_ip(&[], None).is_ok());
    }

    #[test]
    fn test_admin_token() {
        let guard = Guard::new(None, Some("s3cret"));
        assert!(guard.verify_admin_token(Some("s3cret")).is_ok());
        assert!(guard.verify_admin_token(Some("guess")).is_err());
        assert!(guard.verify_admin_token(None).is_err());

        let disabled = Guard::new(None, None);
        assert!(matches!(
            disabled.verify_admin_token(Some("s3cret")),
            Err(Error::Forbidden(_))
        ));
    }
}
