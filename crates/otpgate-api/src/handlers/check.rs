//! Message preview and normalization handlers

use axum::{extract::State, Extension, Json};
use otpgate_common::types::Encoding;
use otpgate_core::CheckRequest;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::auth::{AppState, AuthContext};
use crate::error::{ApiError, ApiJson};

#[derive(Debug, Clone, Serialize)]
pub struct CheckResponse {
    pub message_parts: u32,
    pub encoding: Encoding,
    /// Present when a destination was given
    #[serde(with = "rust_decimal::serde::float_option")]
    pub price_estimate: Option<Decimal>,
    pub message_length: u32,
    pub currency: String,
    pub balance_sufficient: Option<bool>,
}

/// Segment and price a message without sending it
///
/// POST /check
pub async fn check_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(input): ApiJson<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let outcome = state
        .gateway
        .check(&ctx.account, ctx.client_ip, input)
        .await?;

    Ok(Json(CheckResponse {
        message_parts: outcome.segmentation.part_count,
        encoding: outcome.segmentation.encoding,
        price_estimate: outcome.price_estimate,
        message_length: outcome.segmentation.length,
        currency: outcome.currency,
        balance_sufficient: outcome.balance_sufficient,
    }))
}

#[derive(Debug, Deserialize)]
pub struct NormalizeRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct NormalizeResponse {
    pub original_message: String,
    pub normalized_message: String,
    pub original_length: u32,
    pub normalized_length: u32,
    pub original_parts: u32,
    pub normalized_parts: u32,
    pub encoding: Encoding,
    pub savings_percent: f64,
    pub recommendations: Vec<String>,
}

/// Suggest a rewrite of a message that needs fewer parts
///
/// POST /normalize
pub async fn normalize_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(input): ApiJson<NormalizeRequest>,
) -> Result<Json<NormalizeResponse>, ApiError> {
    let result = state
        .gateway
        .normalize(&ctx.account, ctx.client_ip, &input.message)
        .await?;

    Ok(Json(NormalizeResponse {
        original_length: result.original.length,
        normalized_length: result.normalized.length,
        original_parts: result.original.part_count,
        normalized_parts: result.normalized.part_count,
        encoding: result.normalized.encoding,
        original_message: result.original_message,
        normalized_message: result.normalized_message,
        savings_percent: result.savings_percent,
        recommendations: result.recommendations,
    }))
}
