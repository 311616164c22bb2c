//! Per-pipeline mutable state.
//!
//! A [`Context`] travels with one pipeline instance: a monotonic id for
//! logs, a weak handle to the originating connection or task, the last
//! dataflow error, and script-visible variables installed by the module
//! binder.

use std::any::Any;
use std::cell::Cell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::event::StreamError;
use crate::value::Value;

thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Per-pipeline mutable record. Lifetime is bounded by its pipeline.
pub struct Context {
    id: u64,
    inbound: Option<Weak<dyn Any>>,
    error: Option<StreamError>,
    vars: HashMap<Rc<str>, Value>,
}

impl Context {
    /// Creates a context with a fresh monotonic id and no inbound.
    #[must_use]
    pub fn new() -> Self {
        let id = NEXT_ID.with(|n| {
            let id = n.get();
            n.set(id + 1);
            id
        });
        Self {
            id,
            inbound: None,
            error: None,
            vars: HashMap::new(),
        }
    }

    /// Creates a context bound to an originating connection or task.
    /// The handle is held weakly; the context never keeps it alive.
    #[must_use]
    pub fn with_inbound(inbound: &Rc<dyn Any>) -> Self {
        let mut ctx = Self::new();
        ctx.inbound = Some(Rc::downgrade(inbound));
        ctx
    }

    /// Monotonic id, for logs.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The originating connection/task, if it is still alive.
    #[must_use]
    pub fn inbound(&self) -> Option<Rc<dyn Any>> {
        self.inbound.as_ref().and_then(Weak::upgrade)
    }

    /// The inbound as a session-key value; `Undefined` when absent.
    #[must_use]
    pub fn inbound_value(&self) -> Value {
        match self.inbound() {
            Some(o) => Value::Object(o),
            None => Value::Undefined,
        }
    }

    /// Records a dataflow error. First error wins.
    pub fn set_error(&mut self, err: StreamError) {
        self.error.get_or_insert(err);
    }

    /// The first dataflow error recorded, if any.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.error
    }

    /// Reads a script-visible variable.
    #[must_use]
    pub fn var(&self, name: &str) -> Value {
        self.vars.get(name).cloned().unwrap_or_default()
    }

    /// Writes a script-visible variable.
    pub fn set_var(&mut self, name: impl Into<Rc<str>>, value: Value) {
        self.vars.insert(name.into(), value);
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = Context::new();
        let b = Context::new();
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_inbound_is_weak() {
        let conn: Rc<dyn Any> = Rc::new("conn");
        let ctx = Context::with_inbound(&conn);
        assert!(ctx.inbound().is_some());
        drop(conn);
        assert!(ctx.inbound().is_none());
        assert!(ctx.inbound_value().is_undefined());
    }

    #[test]
    fn test_first_error_wins() {
        let mut ctx = Context::new();
        ctx.set_error(StreamError::ReadTimeout);
        ctx.set_error(StreamError::Cancelled);
        assert_eq!(ctx.error(), Some(StreamError::ReadTimeout));
    }

    #[test]
    fn test_vars() {
        let mut ctx = Context::new();
        assert!(ctx.var("missing").is_undefined());
        ctx.set_var("x", Value::from(7i64));
        assert_eq!(ctx.var("x"), Value::from(7i64));
    }
}
