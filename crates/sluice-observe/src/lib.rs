//! # Sluice Observability
//!
//! Counters, gauges and histograms with label trees and Prometheus
//! text exposition, plus the data-plane log sinks (named loggers
//! writing through pipelines).
//!
//! Ambient engine logging is `tracing` throughout the workspace; this
//! crate is the *user-visible* metrics and logging surface.

pub mod logging;
pub mod metrics;

pub use logging::{FileTarget, LogFormat, LogTarget, Logger, PipelineTarget};
pub use metrics::{Counter, Gauge, Histogram, Registry};
