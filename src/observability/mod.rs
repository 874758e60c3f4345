//! Observability for the log shipper
//!
//! Structured logging through `tracing` and process-wide metrics counters.

pub mod logging;
pub mod metrics;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsSnapshot, ShipperMetrics};

// Span macros for structured logging
pub use logging::{lifecycle_span, mqtt_span};
