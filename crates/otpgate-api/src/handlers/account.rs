//! Account snapshot handlers

use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::AuthContext;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub credit_limit: Decimal,
    /// Balance plus credit limit
    #[serde(with = "rust_decimal::serde::float")]
    pub available: Decimal,
    pub currency: String,
}

#[derive(Debug, Serialize)]
pub struct ProfileResponse {
    pub id: Uuid,
    pub name: String,
    pub status: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub credit_limit: Decimal,
    pub currency: String,
    pub rate_limit_rps: Option<u32>,
    pub allowed_ips: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// GET /balance
pub async fn get_balance(Extension(ctx): Extension<AuthContext>) -> Json<BalanceResponse> {
    let account = ctx.account;
    Json(BalanceResponse {
        balance: account.balance,
        credit_limit: account.credit_limit,
        available: account.available(),
        currency: account.currency,
    })
}

/// GET /profile
pub async fn get_profile(Extension(ctx): Extension<AuthContext>) -> Json<ProfileResponse> {
    let account = ctx.account;
    Json(ProfileResponse {
        rate_limit_rps: account.rate_limit(),
        id: account.id,
        name: account.name,
        status: account.status,
        balance: account.balance,
        credit_limit: account.credit_limit,
        currency: account.currency,
        allowed_ips: account.allowed_ips,
        created_at: account.created_at,
    })
}
