//! # Sluice Core
//!
//! The engine half of sluice: a typed event stream flowing through
//! pipelines of filters, with per-layout instance pooling and a session
//! multiplexing subsystem.
//!
//! ## Architecture
//!
//! - [`event`]: the five-kind event stream and the rope-style [`Data`]
//!   byte buffer.
//! - [`pipeline`]: immutable [`PipelineLayout`] templates and pooled
//!   live [`Pipeline`] instances.
//! - [`filter`]: the one-stage transformation contract.
//! - [`filters::mux`]: session clustering, pooling and the FIFO reply
//!   queue.
//! - [`config`]: the fluent configurator that turns declarations into
//!   bound layouts.
//!
//! The crate is deliberately runtime-agnostic: no sockets, no timers of
//! its own. Time-driven maintenance (session recycling) takes `Instant`
//! arguments, and "next tick" work goes through the [`scheduler`]
//! deferred-task queue, which the embedding runtime drains. The whole
//! object graph is `Rc`-based and pinned to one worker thread.

pub mod config;
pub mod context;
pub mod data;
pub mod event;
pub mod filter;
pub mod filters;
pub mod input;
pub mod pipeline;
pub mod scheduler;
pub mod value;

pub use context::Context;
pub use data::Data;
pub use event::{Event, StreamError};
pub use filter::{Filter, FilterContext, FilterDump};
pub use input::{EventTarget, Input};
pub use pipeline::{LayoutType, Pipeline, PipelineLayout};
pub use value::Value;

/// Errors raised while building or binding a configuration.
///
/// These are fatal to worker start; nothing is partially bound.
/// Dataflow errors never use this type, they travel as `StreamEnd`
/// events instead.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A filter was appended while no pipeline declaration was open.
    #[error("filter '{0}' appended with no open pipeline")]
    NoOpenPipeline(String),

    /// A joint filter was not followed by a `to` sub-pipeline.
    #[error("joint filter '{0}' in pipeline '{1}' requires a 'to' sub-pipeline")]
    MissingTo(String, String),

    /// `to` was called without a preceding joint filter.
    #[error("'to' without a preceding joint filter in pipeline '{0}'")]
    DanglingTo(String),

    /// A `to(name)` referenced a pipeline that was never declared.
    #[error("unknown sub-pipeline '{0}' referenced from '{1}'")]
    UnknownPipeline(String, String),

    /// The same variable was exported twice from one namespace.
    #[error("duplicate export '{0}' in namespace '{1}'")]
    DuplicateExport(String, String),

    /// An import could not be resolved against any module's exports.
    #[error("unresolved import '{0}' from namespace '{1}'")]
    UnresolvedImport(String, String),

    /// A listen declaration used an unparseable address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),

    /// A task declaration used an unparseable schedule.
    #[error("invalid task schedule '{0}'")]
    InvalidSchedule(String),
}
