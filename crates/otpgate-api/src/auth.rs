//! Authentication module

use argon2::password_hash::{rand_core::OsRng, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use otpgate_common::types::{AccountId, ApiKeyId};
use otpgate_common::{Config, Error, Result};
use otpgate_core::guard::check_ip;
use otpgate_core::Gateway;
use otpgate_storage::models::{Account, ApiKey, NewApiKey};
use otpgate_storage::repository::Repositories;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::ApiError;

const KEY_PREFIX_LEN: usize = 8;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub repos: Repositories,
    pub config: Arc<Config>,
}

/// Authenticated context extracted from API key
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Account the key belongs to, as loaded for this request
    pub account: Account,
    /// API key ID for audit logging
    pub api_key_id: ApiKeyId,
    /// Resolved client address
    pub client_ip: Option<IpAddr>,
}

/// Extract API key from request
pub fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key.trim());
    }

    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// The lookup prefix of an API key (first 8 characters)
pub fn key_prefix(api_key: &str) -> Option<&str> {
    api_key.get(..KEY_PREFIX_LEN)
}

/// Address of the caller, from `X-Forwarded-For` when trusted
pub fn client_ip(request: &Request, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn sha256_hex(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Hash an API key for storage
pub fn hash_api_key(api_key: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(api_key.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::Internal(format!("failed to hash API key: {}", e)))
}

/// Verify an API key against a stored hash.
///
/// Supports Argon2 hashes (`$argon2...`) and plain SHA-256 hex digests.
fn verify_api_key(api_key: &str, stored_hash: &str) -> bool {
    if stored_hash.starts_with("$argon2") {
        return PasswordHash::new(stored_hash)
            .ok()
            .and_then(|parsed_hash| {
                Argon2::default()
                    .verify_password(api_key.as_bytes(), &parsed_hash)
                    .ok()
            })
            .is_some();
    }

    tokens_match(&sha256_hex(api_key), stored_hash)
}

/// Constant-time comparison of two secrets
pub fn tokens_match(supplied: &str, expected: &str) -> bool {
    let a = Sha256::digest(supplied.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Store a new API key for `account_id`
pub async fn provision_api_key(
    repos: &Repositories,
    account_id: AccountId,
    label: &str,
    api_key: &str,
) -> Result<ApiKey> {
    let prefix = key_prefix(api_key).ok_or_else(|| {
        Error::validation(
            "api_key",
            format!("API key must be at least {} characters", KEY_PREFIX_LEN),
        )
    })?;

    repos
        .api_keys
        .create(NewApiKey {
            account_id,
            label: label.to_string(),
            key_hash: hash_api_key(api_key)?,
            key_prefix: prefix.to_string(),
        })
        .await
}

/// Validate an API key against the key store
async fn validate_api_key(repos: &Repositories, api_key: &str) -> Result<ApiKey> {
    let prefix = key_prefix(api_key).ok_or_else(|| {
        warn!("API key too short");
        Error::Unauthorized("invalid API key".to_string())
    })?;

    let candidates = repos.api_keys.find_by_prefix(prefix).await?;
    if candidates.is_empty() {
        warn!("No API key found with prefix: {}", prefix);
        return Err(Error::Unauthorized("invalid API key".to_string()));
    }

    for candidate in candidates {
        if verify_api_key(api_key, &candidate.key_hash) {
            let api_keys = repos.api_keys.clone();
            let key_id = candidate.id;
            tokio::spawn(async move {
                if let Err(e) = api_keys.update_last_used(key_id).await {
                    error!("Failed to update API key last_used_at: {}", e);
                }
            });

            debug!(
                "API key {} authenticated for account {}",
                candidate.id, candidate.account_id
            );
            return Ok(candidate);
        }
    }

    warn!("API key hash mismatch for prefix: {}", prefix);
    Err(Error::Unauthorized("invalid API key".to_string()))
}

/// Authentication middleware for integrator endpoints
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> std::result::Result<Response, ApiError> {
    let api_key = extract_api_key(request.headers()).ok_or_else(|| {
        warn!("Missing API key in request to {}", request.uri().path());
        Error::Unauthorized("missing API key".to_string())
    })?;

    let validated_key = validate_api_key(&state.repos, api_key).await?;

    let account = state
        .repos
        .accounts
        .get(validated_key.account_id)
        .await?
        .ok_or_else(|| {
            warn!(account_id = %validated_key.account_id, "API key for missing account");
            Error::Unauthorized("invalid API key".to_string())
        })?;

    if !account.is_active() {
        return Err(Error::Forbidden(format!("account is {}", account.status)).into());
    }

    let ip = client_ip(&request, state.config.api.trust_forwarded_for);
    check_ip(&account.allowed_ips, ip)?;

    request.extensions_mut().insert(AuthContext {
        account,
        api_key_id: validated_key.id,
        client_ip: ip,
    });

    Ok(next.run(request).await)
}

/// Check the `X-Admin-Token` header
pub fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let token = headers.get("x-admin-token").and_then(|v| v.to_str().ok());
    state.gateway.verify_admin_token(token)
}

/// Check the `X-Dlr-Token` header when DLR ingestion is protected
pub fn require_dlr_token(state: &AppState, headers: &HeaderMap) -> Result<()> {
    let Some(expected) = state.config.delivery.dlr_ingest_token.as_deref() else {
        return Ok(());
    };

    match headers.get("x-dlr-token").and_then(|v| v.to_str().ok()) {
        Some(supplied) if tokens_match(supplied, expected) => Ok(()),
        _ => {
            warn!("Rejected delivery report with bad token");
            Err(Error::Unauthorized("invalid DLR token".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn verifies_sha256_hash() {
        let api_key = "otp_test_legacy_key";
        let digest = sha256_hex(api_key);

        assert!(verify_api_key(api_key, &digest));
        assert!(!verify_api_key("wrong_key", &digest));
    }

    #[test]
    fn verifies_argon2_hash() {
        let api_key = "otp_test_argon2_key";
        let hash = hash_api_key(api_key).unwrap();

        assert!(verify_api_key(api_key, &hash));
        assert!(!verify_api_key("wrong_key", &hash));
    }

    #[test]
    fn extracts_key_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer abc12345"));
        assert_eq!(extract_api_key(&headers), Some("abc12345"));

        headers.insert("x-api-key", HeaderValue::from_static("xyz98765"));
        assert_eq!(extract_api_key(&headers), Some("xyz98765"));
    }

    #[test]
    fn prefix_requires_eight_chars() {
        assert_eq!(key_prefix("otp_live_abc"), Some("otp_live"));
        assert_eq!(key_prefix("short"), None);
    }
}
