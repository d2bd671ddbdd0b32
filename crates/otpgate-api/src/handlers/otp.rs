//! Send OTP handler

use axum::{extract::State, http::StatusCode, Extension, Json};
use otpgate_core::{BatchRequest, SendRequest};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{AppState, AuthContext};
use crate::error::{ApiError, ApiJson, ErrorResponse};

/// Response after accepting a message
#[derive(Debug, Clone, Serialize)]
pub struct SendResponse {
    pub request_id: String,
    pub message_id: Uuid,
    pub status: String,
    /// Number of SMS parts billed
    pub sms_count: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance_after: Decimal,
}

/// Send a message
///
/// POST /otp/send
///
/// Returns 201 for a new message and 200 when `request_id` was already used.
pub async fn send_otp(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(input): ApiJson<SendRequest>,
) -> Result<(StatusCode, Json<SendResponse>), ApiError> {
    let outcome = state
        .gateway
        .send(&ctx.account, ctx.client_ip, input)
        .await?;

    let status = if outcome.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let message = outcome.message;

    Ok((
        status,
        Json(SendResponse {
            request_id: message.request_id,
            message_id: message.id,
            status: message.status,
            sms_count: message.part_count,
            price: message.price,
            currency: message.currency,
            balance_after: outcome.balance_after,
        }),
    ))
}

/// Result of one batch item; failed items carry `error` instead of a message
#[derive(Debug, Serialize)]
pub struct BatchItemResponse {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<SendResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub dispatch_id: String,
    pub total_messages: usize,
    pub accepted: usize,
    pub rejected: usize,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_price: Decimal,
    pub currency: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub balance_after: Decimal,
    pub messages: Vec<BatchItemResponse>,
}

/// Send one batch under a shared dispatch id
///
/// POST /otp/send-batch
pub async fn send_batch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(input): ApiJson<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let outcome = state
        .gateway
        .send_batch(&ctx.account, ctx.client_ip, input)
        .await?;

    let accepted = outcome.accepted();
    let total_price = outcome.total_price();
    let total_messages = outcome.items.len();
    let messages = outcome
        .items
        .into_iter()
        .map(|item| match item.result {
            Ok(sent) => BatchItemResponse {
                index: item.index,
                replayed: Some(sent.replayed),
                message: Some(SendResponse {
                    request_id: sent.message.request_id,
                    message_id: sent.message.id,
                    status: sent.message.status,
                    sms_count: sent.message.part_count,
                    price: sent.message.price,
                    currency: sent.message.currency,
                    balance_after: sent.balance_after,
                }),
                error: None,
            },
            Err(e) => BatchItemResponse {
                index: item.index,
                message: None,
                replayed: None,
                error: Some(ErrorResponse::from(&e)),
            },
        })
        .collect();

    Ok(Json(BatchResponse {
        dispatch_id: outcome.dispatch_id,
        total_messages,
        accepted,
        rejected: total_messages - accepted,
        total_price,
        currency: outcome.currency,
        balance_after: outcome.balance_after,
        messages,
    }))
}
