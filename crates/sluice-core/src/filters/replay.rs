//! Replay: capture a stream and reinject it on demand.
//!
//! Every event passing through is recorded and forwarded to a single
//! sub-pipeline. When that sub-pipeline terminates with
//! `StreamEnd(Replay)`, a fresh sub-pipeline is created on the next
//! scheduler tick and the whole recorded sequence is replayed into it,
//! cloned. Any other sub-pipeline output passes through unchanged.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::context::Context;
use crate::event::{Event, StreamError};
use crate::filter::{Filter, FilterContext, FilterDump};
use crate::input::Input;
use crate::pipeline::{Pipeline, PipelineLayout};
use crate::scheduler;
use crate::ConfigError;

pub struct Replay {
    state: Rc<RefCell<State>>,
}

struct State {
    sub_layout: Option<PipelineLayout>,
    output: Input,
    context: Option<Rc<RefCell<Context>>>,
    buffer: Vec<Event>,
    pipeline: Option<Pipeline>,
    scheduled: bool,
}

impl Replay {
    /// Creates an unbound replay filter; the sub-pipeline layout
    /// arrives at bind time from its `to(...)` clause.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(State {
                sub_layout: None,
                output: Input::null(),
                context: None,
                buffer: Vec::new(),
                pipeline: None,
                scheduled: false,
            })),
        }
    }

    /// The input the sub-pipeline's output is wired to: intercepts the
    /// replay signal, passes everything else through.
    fn receiver(state: &Rc<RefCell<State>>) -> Input {
        let weak = Rc::downgrade(state);
        Input::from_fn(move |evt| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            if evt.stream_error() == Some(StreamError::Replay) {
                schedule_replay(&state);
                return;
            }
            let output = state.borrow().output.clone();
            output.feed(evt);
        })
    }
}

fn schedule_replay(state: &Rc<RefCell<State>>) {
    let mut s = state.borrow_mut();
    if s.scheduled {
        return;
    }
    s.scheduled = true;
    drop(s);
    let weak = Rc::downgrade(state);
    scheduler::defer(move || replay(&weak));
}

fn replay(state: &Weak<RefCell<State>>) {
    let Some(state) = state.upgrade() else {
        return;
    };
    let (input, events) = {
        let mut s = state.borrow_mut();
        s.scheduled = false;
        let (Some(layout), Some(ctx)) = (s.sub_layout.clone(), s.context.clone()) else {
            return;
        };
        debug!(captured = s.buffer.len(), "replaying captured stream");
        let pipeline = layout.alloc(ctx);
        pipeline.set_output(Replay::receiver(&state));
        let input = pipeline.input();
        s.pipeline = Some(pipeline);
        (input, s.buffer.clone())
    };
    // Fed outside the borrow: replayed events may loop back into the
    // receiver synchronously.
    for evt in events {
        input.feed(evt);
    }
}

impl Default for Replay {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Replay {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "replay", is_joint: true }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        let clone = Replay::new();
        clone.state.borrow_mut().sub_layout = self.state.borrow().sub_layout.clone();
        Box::new(clone)
    }

    fn bind(&mut self, subs: &[PipelineLayout]) -> Result<(), ConfigError> {
        self.state.borrow_mut().sub_layout = subs.first().cloned();
        Ok(())
    }

    fn chain(&mut self, output: Input) {
        self.state.borrow_mut().output = output;
    }

    fn reset(&mut self) {
        let mut s = self.state.borrow_mut();
        s.buffer.clear();
        s.pipeline = None;
        s.context = None;
        s.scheduled = false;
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        let input = {
            let mut s = self.state.borrow_mut();
            if s.pipeline.is_none() {
                let Some(layout) = s.sub_layout.clone() else {
                    return;
                };
                s.context = Some(Rc::clone(cx.context()));
                let pipeline = layout.alloc(Rc::clone(cx.context()));
                pipeline.set_output(Replay::receiver(&self.state));
                s.pipeline = Some(pipeline);
            }
            s.buffer.push(evt.clone());
            s.pipeline.as_ref().map(Pipeline::input)
        };
        if let Some(input) = input {
            input.feed(evt);
        }
    }
}
