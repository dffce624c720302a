//! Application configuration
//!
//! This module defines configuration types and default values:
//! - `app_config`: Configuration structure and validation
//! - `defaults`: Default configuration values

pub mod app_config;
pub mod defaults;

pub use app_config::AppConfig;
