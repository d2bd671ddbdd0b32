//! API request handlers

pub mod account;
pub mod admin;
pub mod check;
pub mod dlr;
pub mod health;
pub mod messages;
pub mod otp;
pub mod templates;

pub use health::*;
