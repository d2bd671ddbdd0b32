//! Mapping of domain errors to HTTP responses

use axum::{
    extract::{rejection::JsonRejection, FromRequest},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use otpgate_common::Error;
use serde::Serialize;
use tracing::error;

/// Error body returned by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

/// Domain error carried out of a handler
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::validation("body", rejection.body_text()))
    }
}

impl From<&Error> for ErrorResponse {
    /// Server-side failures are logged and reported without detail
    fn from(err: &Error) -> Self {
        let message = if err.status_code() >= 500 {
            error!("Request failed: {}", err);
            "Internal server error".to_string()
        } else {
            err.to_string()
        };

        Self {
            error: err.code().to_string(),
            message,
            field: err.field().map(str::to_string),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse::from(&err);

        let mut response = (status, Json(body)).into_response();
        if matches!(err, Error::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

/// JSON body extractor whose rejections use the API error format
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);
