//! Integrator template handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use otpgate_core::TemplateSubmission;
use otpgate_storage::models::Template;
use uuid::Uuid;

use crate::auth::{AppState, AuthContext};
use crate::error::{ApiError, ApiJson};

/// Submit a template for moderation
///
/// POST /templates
pub async fn create_template(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    ApiJson(input): ApiJson<TemplateSubmission>,
) -> Result<(StatusCode, Json<Template>), ApiError> {
    let template = state.gateway.submit_template(&ctx.account, input).await?;
    Ok((StatusCode::CREATED, Json(template)))
}

/// List the caller's templates
///
/// GET /templates
pub async fn list_templates(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<Template>>, ApiError> {
    Ok(Json(state.gateway.list_templates(&ctx.account).await?))
}

/// Edit a template and send it back to review
///
/// PUT /templates/:id
pub async fn resubmit_template(
    State(state): State<AppState>,
    Extension(ctx): Extension<AuthContext>,
    Path(template_id): Path<Uuid>,
    ApiJson(input): ApiJson<TemplateSubmission>,
) -> Result<Json<Template>, ApiError> {
    let template = state
        .gateway
        .resubmit_template(&ctx.account, template_id, input)
        .await?;
    Ok(Json(template))
}
