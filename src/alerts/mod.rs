//! Alerting: the active set, dedup, and lifecycle transitions

mod engine;
mod types;

pub use engine::AlertEngine;
pub use types::{Alert, AlertFilter, AlertSeverity, AlertStats, AlertType, NewAlert};
