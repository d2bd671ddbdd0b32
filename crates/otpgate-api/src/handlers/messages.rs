//! Message status, history and dispatch handlers

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use otpgate_core::HistoryQuery;
use otpgate_storage::models::Message;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::auth::{AppState, AuthContext};
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct CallbackStatus {
    pub attempts: i32,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message_id: Uuid,
    pub request_id: String,
    pub to: String,
    pub sender: String,
    pub status: String,
    pub error_code: Option<String>,
    pub encoding: String,
    pub sms_count: i32,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    pub currency: String,
    pub promotional: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatch_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    /// Present when a DLR callback URL was given
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackStatus>,
}

impl From<Message> for MessageResponse {
    fn from(m: Message) -> Self {
        let callback = m.dlr_callback_url.as_ref().map(|_| CallbackStatus {
            attempts: m.callback_attempts,
            delivered_at: m.callback_delivered_at,
            error: m.callback_error.clone(),
        });

        Self {
            message_id: m.id,
            request_id: m.request_id,
            to: m.mobile_phone,
            sender: m.sender,
            status: m.status,
            error_code: m.error_code,
            encoding: m.encoding,
            sms_count: m.part_count,
            price: m.price,
            currency: m.currency,
            promotional: m.promotional,
            dispatch_id: m.dispatch_id,
            created_at: m.created_at,
            delivered_at: m.delivered_at,
            callback,
        }
    }
}

/// GET /messages/:message_id
pub async fn get_message(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(message_id): Path<Uuid>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = state.gateway.message_status(&ctx.account, message_id).await?;
    Ok(Json(message.into()))
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    /// Messages matching the filters, across all pages
    pub total: u64,
    pub messages: Vec<MessageResponse>,
}

/// GET /messages?from=&to=&status=&promotional=&dispatch_id=&limit=&offset=
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let page = state.gateway.list_messages(&ctx.account, query).await?;
    Ok(Json(HistoryResponse {
        total: page.total,
        messages: page.messages.into_iter().map(MessageResponse::from).collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub dispatch_id: String,
    pub total_messages: u64,
    pub status_breakdown: BTreeMap<String, u64>,
    #[serde(with = "rust_decimal::serde::float")]
    pub total_price: Decimal,
    pub currency: String,
}

/// GET /dispatches/:dispatch_id
pub async fn get_dispatch(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(dispatch_id): Path<String>,
) -> Result<Json<DispatchResponse>, ApiError> {
    let summary = state
        .gateway
        .dispatch_status(&ctx.account, &dispatch_id)
        .await?;
    Ok(Json(DispatchResponse {
        dispatch_id: summary.dispatch_id,
        total_messages: summary.total_messages,
        status_breakdown: summary.status_breakdown,
        total_price: summary.total_price,
        currency: summary.currency,
    }))
}
