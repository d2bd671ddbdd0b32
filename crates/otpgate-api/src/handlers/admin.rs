//! Moderator handlers

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use otpgate_common::types::TemplateStatus;
use otpgate_core::Decision;
use otpgate_storage::models::Template;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::{require_admin, AppState};
use crate::error::{ApiError, ApiJson};

#[derive(Debug, Deserialize)]
pub struct ReviewQuery {
    pub status: Option<String>,
}

/// Templates awaiting review
///
/// GET /admin/templates?status=
pub async fn list_review_queue(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ReviewQuery>,
) -> Result<Json<Vec<Template>>, ApiError> {
    require_admin(&state, &headers)?;

    let status = query
        .status
        .as_deref()
        .map(str::parse::<TemplateStatus>)
        .transpose()?;

    Ok(Json(state.gateway.list_templates_for_review(status).await?))
}

/// Approve or reject a pending template
///
/// POST /admin/templates/:id/decision
pub async fn decide_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(template_id): Path<Uuid>,
    ApiJson(decision): ApiJson<Decision>,
) -> Result<Json<Template>, ApiError> {
    require_admin(&state, &headers)?;

    let template = state.gateway.decide_template(template_id, decision).await?;
    info!(template_id = %template.id, status = %template.status, "Template decided");
    Ok(Json(template))
}
