//! OtpGate Storage - Database abstraction
//!
//! Repositories for accounts, API keys, templates and messages, backed
//! either by PostgreSQL or by process memory.

pub mod db;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
