//! # Sluice Engine
//!
//! The facade crate: a [`Worker`] takes a bound module configuration
//! and stands it up on a tokio current-thread runtime: listeners
//! accepting into pipelines, timed tasks, file readers, and the
//! once-per-second maintenance tick that drives session recycling.

pub mod worker;

pub use worker::Worker;

pub use sluice_core::{
    config::{Configuration, ExportRegistry, ListenConfig, ModuleBindings},
    Context, Data, Event, Filter, Input, LayoutType, Pipeline, PipelineLayout, StreamError,
    Value,
};
pub use sluice_net::{Connect, ConnectTarget, Listener, ListenerOptions, OutboundOptions};
pub use sluice_observe::{Logger, Registry};

/// Errors fatal to worker start.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration binding failed.
    #[error(transparent)]
    Config(#[from] sluice_core::ConfigError),

    /// A network endpoint could not be stood up.
    #[error(transparent)]
    Net(#[from] sluice_net::NetError),
}
