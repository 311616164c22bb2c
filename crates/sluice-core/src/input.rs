//! Event sinks.
//!
//! An [`Input`] is a shared handle to anything that consumes events: the
//! next filter in a chain, a pipeline's entry point, a mux stream, or a
//! socket writer. Handles are cheap to clone and safe to hold across the
//! target's lifetime; feeding a dead target is a no-op.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::event::Event;

/// Anything that consumes events.
pub trait EventTarget {
    /// Consumes one event. Runs to completion before returning; any
    /// events it emits downstream are delivered synchronously.
    fn on_event(&self, evt: Event);
}

/// A shared, clonable handle to an [`EventTarget`].
#[derive(Clone)]
pub struct Input(Rc<dyn EventTarget>);

impl Input {
    /// Wraps a target.
    #[must_use]
    pub fn new(target: Rc<dyn EventTarget>) -> Self {
        Input(target)
    }

    /// A sink that drops every event.
    #[must_use]
    pub fn null() -> Self {
        struct Null;
        impl EventTarget for Null {
            fn on_event(&self, _evt: Event) {}
        }
        Input(Rc::new(Null))
    }

    /// Builds an input from a plain closure.
    #[must_use]
    pub fn from_fn(f: impl Fn(Event) + 'static) -> Self {
        struct FnTarget<F>(F);
        impl<F: Fn(Event)> EventTarget for FnTarget<F> {
            fn on_event(&self, evt: Event) {
                (self.0)(evt);
            }
        }
        Input(Rc::new(FnTarget(f)))
    }

    /// Delivers one event to the target.
    #[inline]
    pub fn feed(&self, evt: Event) {
        self.0.on_event(evt);
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Input(@{:p})", Rc::as_ptr(&self.0))
    }
}

/// An input that records everything it receives. Test and capture
/// helper; also the backing for the replay filter's capture buffer.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<Event>>>,
}

impl EventLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// An input handle appending into this log.
    #[must_use]
    pub fn input(&self) -> Input {
        let events = Rc::downgrade(&self.events);
        Input::from_fn(move |evt| {
            if let Some(events) = Weak::upgrade(&events) {
                events.borrow_mut().push(evt);
            }
        })
    }

    /// Snapshot of everything logged so far.
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    /// Number of events logged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.borrow().len()
    }

    /// True when nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.borrow().is_empty()
    }

    /// Drops all logged events.
    pub fn clear(&self) {
        self.events.borrow_mut().clear();
    }

    /// Concatenated payload of all logged `Data` events.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for evt in self.events.borrow().iter() {
            if let Event::Data(d) = evt {
                out.extend_from_slice(&d.to_vec());
            }
        }
        out
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EventLog({} events)", self.events.borrow().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_input_drops() {
        let input = Input::null();
        input.feed(Event::data(b"ignored"));
    }

    #[test]
    fn test_event_log_captures_in_order() {
        let log = EventLog::new();
        let input = log.input();
        input.feed(Event::message_start());
        input.feed(Event::data(b"ab"));
        input.feed(Event::message_end());
        assert_eq!(log.len(), 3);
        assert_eq!(log.bytes(), b"ab");
        assert!(matches!(log.events()[0], Event::MessageStart(_)));
    }

    #[test]
    fn test_event_log_input_outlives_log() {
        let input = {
            let log = EventLog::new();
            log.input()
        };
        // The log's storage is gone; feeding must be a no-op.
        input.feed(Event::data(b"late"));
    }
}
