//! OtpGate API - REST API server
//!
//! HTTP surface for integrators (send, check, templates, account) and for
//! moderators and the operator link (template review, delivery reports).

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
