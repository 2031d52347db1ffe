//! # parley-common
//!
//! Shared configuration, error types, and chat domain models for Parley.

pub mod config;
pub mod error;
pub mod models;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
