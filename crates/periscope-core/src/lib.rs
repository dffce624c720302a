//! Periscope Core Library
//!
//! Core types and utilities for the Periscope live HTTP traffic monitor.
//! This crate holds the pieces that do not depend on any HTTP framework:
//! capture, correlation and fan-out of proxied traffic.
//!
//! # Modules
//!
//! - [`correlation`] - Sortable IDs linking a request to its response
//! - [`body`] - Side-channel body capture and transport encoding
//! - [`snapshot`] - Captured request/response types and the event envelope
//! - [`bus`] - In-process publish/subscribe hub for traffic events
//! - [`config`] - Configuration and defaults
//! - [`error`] - Error types

pub mod body;
pub mod bus;
pub mod config;
pub mod correlation;
pub mod error;
pub mod snapshot;

// Re-export commonly used types
pub use body::{tap, BodyCapture, BodyCollector, CapturedBody, TappedStream};
pub use bus::{SubscriberId, Subscription, TrafficBus};
pub use config::AppConfig;
pub use correlation::{CorrelationId, CorrelationIdGenerator};
pub use error::{AppError, Result};
pub use snapshot::{EventKind, HeaderPair, RequestSnapshot, ResponseSnapshot, TrafficEvent};
