//! Operator delivery report ingestion

use axum::{extract::State, http::HeaderMap};
use otpgate_core::DeliveryReport;
use tracing::debug;

use crate::auth::{require_dlr_token, AppState};
use crate::error::{ApiError, ApiJson};

/// Accept a delivery report
///
/// POST /webhooks/dlr
///
/// The report is queued for the tracker; unknown or duplicate reports are
/// still acknowledged so the operator does not resend them.
pub async fn receive_dlr(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(report): ApiJson<DeliveryReport>,
) -> Result<&'static str, ApiError> {
    require_dlr_token(&state, &headers)?;

    debug!(id = %report.id, status = %report.message_status, "Delivery report received");
    state.gateway.ingest_dlr(report).await?;
    Ok("ACK")
}
