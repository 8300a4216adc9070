//! Axum route handlers.

pub mod credits;
pub mod generate;
pub mod health;
