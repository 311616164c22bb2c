//! Merge: fold whole messages from many pipelines onto one session.
//!
//! The one-way sibling of the mux family. Upstream events pass through
//! the filter unchanged; complete messages are additionally combined
//! onto the shared session as `[start, data, end]` triples. Replies
//! from the session are discarded; output comes from the filter's own
//! pass-through.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::data::Data;
use crate::event::Event;
use crate::filter::{Filter, FilterContext, FilterDump};
use crate::input::{EventTarget, Input};
use crate::pipeline::PipelineLayout;
use crate::ConfigError;

use super::mux::{
    Mux, ReplyMode, SessionMuxer, SessionOptions, SessionSelector, StreamCtl, StreamHandle,
};

/// The session core for merge-style sharing: forwards whole messages,
/// ignores replies.
#[derive(Clone)]
pub struct MergeMuxer {
    forward: Rc<RefCell<Input>>,
}

impl MergeMuxer {
    /// Creates a merge muxer with no forward target yet.
    #[must_use]
    pub fn new() -> Self {
        Self { forward: Rc::new(RefCell::new(Input::null())) }
    }
}

impl Default for MergeMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMuxer for MergeMuxer {
    fn bind(&self, forward: Input) {
        *self.forward.borrow_mut() = forward;
    }

    fn open_stream(&self, _output: Input) -> StreamHandle {
        let stream = Rc::new(MergeStream {
            forward: Rc::downgrade(&self.forward),
            start: RefCell::new(None),
            buffer: RefCell::new(Data::new()),
        });
        StreamHandle::new(Input::new(Rc::clone(&stream) as Rc<dyn EventTarget>), stream)
    }

    fn on_reply(&self, _evt: Event) {
        // Merge sessions are one-way by construction.
    }

    fn reset(&self) {}
}

/// Buffers one message at a time and flushes it whole.
struct MergeStream {
    forward: Weak<RefCell<Input>>,
    start: RefCell<Option<Event>>,
    buffer: RefCell<Data>,
}

impl MergeStream {
    fn forward(&self, evt: Event) {
        if let Some(forward) = self.forward.upgrade() {
            let input = forward.borrow().clone();
            input.feed(evt);
        }
    }
}

impl EventTarget for MergeStream {
    fn on_event(&self, evt: Event) {
        match evt {
            Event::MessageStart(_) => {
                let mut start = self.start.borrow_mut();
                if start.is_none() {
                    *start = Some(evt);
                }
            }
            Event::Data(data) => {
                if self.start.borrow().is_some() {
                    self.buffer.borrow_mut().push(data);
                }
            }
            Event::MessageEnd(_) | Event::StreamEnd(_) => {
                if self.start.borrow().is_some() {
                    let start = self.start.borrow().clone().expect("start captured");
                    let buffered = std::mem::take(&mut *self.buffer.borrow_mut());
                    self.forward(start);
                    if !buffered.is_empty() {
                        self.forward(Event::Data(buffered));
                    }
                    self.forward(Event::message_end());
                }
            }
            Event::StreamStart => {}
        }
    }
}

impl StreamCtl for MergeStream {
    fn close(&self) {
        *self.start.borrow_mut() = None;
        self.buffer.borrow_mut().clear();
    }
}

/// The merge filter: a [`Mux`] in discard-replies mode under its
/// traditional name.
pub struct Merge {
    inner: Mux,
}

impl Merge {
    /// Creates a merge keyed on the inbound.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Mux::with_reply_mode(None, ReplyMode::Discard) }
    }

    /// Creates a merge with a session selector.
    #[must_use]
    pub fn with_selector(selector: SessionSelector) -> Self {
        Self { inner: Mux::with_reply_mode(Some(selector), ReplyMode::Discard) }
    }

    /// Replaces the per-cluster limits.
    #[must_use]
    pub fn with_options(self, options: SessionOptions) -> Self {
        Self { inner: self.inner.with_options(options) }
    }
}

impl Default for Merge {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Merge {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "merge", is_joint: true }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        let inner = self.inner.clone_filter();
        // Rewrap so the dump name stays "merge".
        Box::new(MergeClone { inner })
    }

    fn bind(&mut self, subs: &[PipelineLayout]) -> Result<(), ConfigError> {
        self.inner.bind(subs)
    }

    fn chain(&mut self, output: Input) {
        self.inner.chain(output);
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        self.inner.process(cx, evt);
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}

struct MergeClone {
    inner: Box<dyn Filter>,
}

impl Filter for MergeClone {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "merge", is_joint: true }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(MergeClone { inner: self.inner.clone_filter() })
    }

    fn bind(&mut self, subs: &[PipelineLayout]) -> Result<(), ConfigError> {
        self.inner.bind(subs)
    }

    fn chain(&mut self, output: Input) {
        self.inner.chain(output);
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        self.inner.process(cx, evt);
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}
