//! debugtap Common Library
//!
//! Shared code for the debugtap services including:
//! - Database models, schema and repository
//! - Session cache, resolution and lifecycle
//! - Capture, redaction and the axum capture middleware
//! - Capture job queue and worker
//! - Error types, configuration and metrics

pub mod cache;
pub mod capture;
pub mod config;
pub mod db;
pub mod errors;
pub mod lifecycle;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod redact;
pub mod resolver;
pub mod sessions;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use errors::{AppError, Result};
pub use lifecycle::{LifecycleManager, LifecycleReport};
pub use pipeline::{capture_middleware, CaptureSink, CaptureState};
pub use resolver::{AuthenticatedUser, SessionResolver};
pub use sessions::{Selector, SessionCache, SessionService};
pub use worker::CaptureWorker;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
