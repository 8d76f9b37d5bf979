//! CLI command handlers.

pub mod auth;
