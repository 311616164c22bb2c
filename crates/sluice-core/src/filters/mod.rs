//! Built-in filters.
//!
//! Protocol codecs live outside this crate; what ships here is the
//! generic core: pass-through, user-callback hooks, the tee/buffer file
//! filters, replay, and the mux family.

pub mod buffer;
pub mod merge;
pub mod mux;
pub mod replay;
pub mod tee;

pub use buffer::Buffer;
pub use merge::Merge;
pub use mux::{Mux, MuxQueue};
pub use replay::Replay;
pub use tee::Tee;

use std::rc::Rc;

use crate::context::Context;
use crate::event::{Event, StreamError};
use crate::filter::{Filter, FilterContext, FilterDump};
use crate::input::Input;

/// The identity filter: every event goes through unchanged.
pub struct Pass {
    output: Input,
}

impl Pass {
    /// Creates a pass-through filter.
    #[must_use]
    pub fn new() -> Self {
        Self { output: Input::null() }
    }
}

impl Default for Pass {
    fn default() -> Self {
        Self::new()
    }
}

impl Filter for Pass {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "pass", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Pass::new())
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {}

    fn process(&mut self, _cx: &mut FilterContext<'_>, evt: Event) {
        self.output.feed(evt);
    }
}

/// The user-callback hook the `handle*` configurator family reduces to.
///
/// The callback is an opaque function handle (the scripting runtime is
/// out of scope); it observes each event and may mutate context
/// variables. An error return becomes a terminal `StreamEnd(error)`,
/// after which the filter stays silent until reset.
pub type HandleCallback = Rc<dyn Fn(&mut Context, &Event) -> Result<(), StreamError>>;

pub struct Handle {
    callback: HandleCallback,
    output: Input,
    failed: bool,
}

impl Handle {
    /// Creates a hook filter around `callback`.
    #[must_use]
    pub fn new(callback: HandleCallback) -> Self {
        Self {
            callback,
            output: Input::null(),
            failed: false,
        }
    }
}

impl Filter for Handle {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "handle", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Handle::new(Rc::clone(&self.callback)))
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        self.failed = false;
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        if self.failed {
            return;
        }
        let result = (self.callback)(&mut cx.context().borrow_mut(), &evt);
        match result {
            Ok(()) => self.output.feed(evt),
            Err(err) => {
                self.failed = true;
                cx.fail(&self.output, err);
            }
        }
    }
}
