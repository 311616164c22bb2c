//! The one-stage transformation contract.
//!
//! A filter consumes events and emits 0..n events through the output it
//! was chained to. Concrete filters are configured once as templates
//! inside a [`crate::pipeline::PipelineLayout`]; every live pipeline
//! gets its own clone, so per-connection state lives in the filter
//! itself and is wiped by `reset`.

use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;
use crate::event::{Event, StreamError};
use crate::input::Input;
use crate::pipeline::PipelineLayout;
use crate::ConfigError;

/// Identification for debug dumps and the configurator's integrity
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDump {
    /// The filter's configurator name, e.g. `"muxQueue"`.
    pub name: &'static str,
    /// True for joint filters (those owning sub-pipelines), which must
    /// be followed by `to(...)` in the configurator.
    pub is_joint: bool,
}

/// What a filter sees while processing one event.
pub struct FilterContext<'a> {
    context: &'a Rc<RefCell<Context>>,
}

impl<'a> FilterContext<'a> {
    /// Wraps the pipeline's context for one `process` call.
    #[must_use]
    pub fn new(context: &'a Rc<RefCell<Context>>) -> Self {
        Self { context }
    }

    /// The owning pipeline's context.
    #[must_use]
    pub fn context(&self) -> &Rc<RefCell<Context>> {
        self.context
    }

    /// Records `err` on the context and emits a terminal
    /// `StreamEnd(err)` downstream. Filters never raise across the
    /// dataflow boundary; this is the failure path.
    pub fn fail(&self, output: &Input, err: StreamError) {
        self.context.borrow_mut().set_error(err);
        output.feed(Event::StreamEnd(Some(err)));
    }
}

/// One pipeline stage.
pub trait Filter {
    /// Name and shape, for dumps and bind-time checks.
    fn dump(&self) -> FilterDump;

    /// Returns an identically configured fresh instance carrying no
    /// per-connection state.
    fn clone_filter(&self) -> Box<dyn Filter>;

    /// Binds this filter's output to the next stage (or the pipeline
    /// output for the tail). Called on every pipeline allocation.
    fn chain(&mut self, output: Input);

    /// Restores initial state and drops all transient references.
    /// Called when the owning pipeline is returned to its pool. Must be
    /// idempotent.
    fn reset(&mut self);

    /// Consumes one event, emitting 0..n events downstream.
    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event);

    /// Resolves sub-pipeline layout references at bind time. Joint
    /// filters receive the layouts their `to(...)` clauses produced, in
    /// order.
    fn bind(&mut self, _subs: &[PipelineLayout]) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Graceful shutdown hint.
    fn shutdown(&mut self) {}
}

impl std::fmt::Debug for dyn Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Filter({})", self.dump().name)
    }
}
