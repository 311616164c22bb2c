//! Tee: append passing bytes to a file.
//!
//! Events pass through unchanged; `Data` payloads are also appended to
//! a file whose path may come from a callback evaluated on first use.
//! This filter is the write engine of the file log target.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

use tracing::warn;

use crate::context::Context;
use crate::event::Event;
use crate::filter::{Filter, FilterContext, FilterDump};
use crate::input::Input;

/// Where the tee file path comes from.
#[derive(Clone)]
pub enum TeePath {
    /// A fixed path.
    Fixed(PathBuf),
    /// Evaluated once per stream from the context.
    Dynamic(Rc<dyn Fn(&Context) -> PathBuf>),
}

pub struct Tee {
    path: TeePath,
    output: Input,
    file: Option<File>,
    resolved: Option<PathBuf>,
}

impl Tee {
    /// Creates a tee writing to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_path(TeePath::Fixed(path.into()))
    }

    /// Creates a tee with a fixed or dynamic path.
    #[must_use]
    pub fn with_path(path: TeePath) -> Self {
        Self {
            path,
            output: Input::null(),
            file: None,
            resolved: None,
        }
    }

    fn open(&mut self, ctx: &Context) -> Option<&mut File> {
        if self.file.is_none() {
            let path = match &self.path {
                TeePath::Fixed(p) => p.clone(),
                TeePath::Dynamic(f) => f(ctx),
            };
            match OpenOptions::new().create(true).append(true).open(&path) {
                Ok(f) => {
                    self.file = Some(f);
                    self.resolved = Some(path);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "tee cannot open file");
                }
            }
        }
        self.file.as_mut()
    }
}

impl Filter for Tee {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "tee", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Tee::with_path(self.path.clone()))
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        self.file = None;
        self.resolved = None;
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        match &evt {
            Event::Data(data) => {
                if let Some(file) = self.open(&cx.context().borrow()) {
                    let mut failed = false;
                    data.iterate(|chunk| {
                        if !failed && file.write_all(chunk).is_err() {
                            failed = true;
                        }
                    });
                    if failed {
                        if let Some(path) = &self.resolved {
                            warn!(path = %path.display(), "tee short write");
                        }
                    }
                }
            }
            Event::StreamEnd(_) => {
                self.file = None;
            }
            _ => {}
        }
        self.output.feed(evt);
    }
}
