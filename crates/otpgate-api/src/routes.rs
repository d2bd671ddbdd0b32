//! API routes

use axum::{
    http::HeaderValue,
    middleware,
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::auth::{auth_middleware, AppState};
use crate::handlers::{account, admin, check, dlr, health, messages, otp, templates};

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    // Integrator routes, authenticated by API key
    let integrator_routes = Router::new()
        .route("/otp/send", post(otp::send_otp))
        .route("/otp/send-batch", post(otp::send_batch))
        .route("/check", post(check::check_message))
        .route("/normalize", post(check::normalize_message))
        .route(
            "/templates",
            get(templates::list_templates).post(templates::create_template),
        )
        .route("/templates/:id", put(templates::resubmit_template))
        .route("/messages", get(messages::list_messages))
        .route("/messages/:message_id", get(messages::get_message))
        .route("/dispatches/:dispatch_id", get(messages::get_dispatch))
        .route("/balance", get(account::get_balance))
        .route("/profile", get(account::get_profile))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Moderator routes, authenticated by admin token
    let admin_routes = Router::new()
        .route("/templates", get(admin::list_review_queue))
        .route("/templates/:id/decision", post(admin::decide_template));

    let cors = cors_layer(&state.config.api.cors_origins);

    Router::new()
        .nest("/health", health_routes)
        .nest("/admin", admin_routes)
        .route("/webhooks/dlr", post(dlr::receive_dlr))
        .merge(integrator_routes)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}
