//! Buffer: bounded in-memory buffering with disk spill.
//!
//! Payload below the threshold passes through live while being
//! retained in memory; once the threshold is exceeded, further payload
//! is diverted to a spill file instead of flowing downstream. When the
//! upstream stream ends, the spilled remainder is read back and emitted
//! downstream, followed by the stream end.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::context::Context;
use crate::data::Data;
use crate::event::Event;
use crate::filter::{Filter, FilterContext, FilterDump};
use crate::input::Input;

/// Tuning for the buffer filter.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Bytes retained in memory before spilling to disk.
    pub threshold: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self { threshold: 1 << 20 }
    }
}

/// Where the spill file path comes from; evaluated lazily, only when a
/// stream actually overflows.
#[derive(Clone)]
pub enum SpillPath {
    /// A fixed path.
    Fixed(PathBuf),
    /// Evaluated from the context at spill time.
    Dynamic(Rc<dyn Fn(&Context) -> PathBuf>),
}

pub struct Buffer {
    path: SpillPath,
    options: BufferOptions,
    output: Input,
    buffered: usize,
    writer: Option<File>,
    resolved: Option<PathBuf>,
}

impl Buffer {
    /// Creates a buffer filter spilling to `path` past
    /// `options.threshold` bytes.
    #[must_use]
    pub fn new(path: SpillPath, options: BufferOptions) -> Self {
        Self {
            path,
            options,
            output: Input::null(),
            buffered: 0,
            writer: None,
            resolved: None,
        }
    }

    fn spill(&mut self, ctx: &Context, data: &Data) {
        if self.writer.is_none() {
            let path = match &self.path {
                SpillPath::Fixed(p) => p.clone(),
                SpillPath::Dynamic(f) => f(ctx),
            };
            match OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)
            {
                Ok(f) => {
                    debug!(path = %path.display(), "buffer spilling to disk");
                    self.writer = Some(f);
                    self.resolved = Some(path);
                }
                Err(error) => {
                    warn!(path = %path.display(), %error, "buffer cannot open spill file");
                    return;
                }
            }
        }
        if let Some(writer) = self.writer.as_mut() {
            let mut failed = false;
            data.iterate(|chunk| {
                if !failed && writer.write_all(chunk).is_err() {
                    failed = true;
                }
            });
            if failed {
                warn!("buffer spill write failed; data dropped");
            }
        }
    }

    fn read_back(&mut self) -> Option<Data> {
        self.writer = None;
        let path = self.resolved.take()?;
        let mut content = Vec::new();
        match File::open(&path).and_then(|mut f| f.read_to_end(&mut content)) {
            Ok(_) => Some(Data::from_slice(&content)),
            Err(error) => {
                warn!(path = %path.display(), %error, "buffer cannot read spill file");
                None
            }
        }
    }
}

impl Filter for Buffer {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "buffer", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Buffer::new(self.path.clone(), self.options.clone()))
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        self.buffered = 0;
        self.writer = None;
        self.resolved = None;
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        match &evt {
            Event::Data(data) if !data.is_empty() => {
                if self.buffered < self.options.threshold {
                    self.buffered += data.len();
                    self.output.feed(evt);
                } else {
                    self.spill(&cx.context().borrow(), data);
                }
            }
            Event::StreamEnd(_) => {
                if let Some(spilled) = self.read_back() {
                    if !spilled.is_empty() {
                        self.output.feed(Event::Data(spilled));
                    }
                }
                self.buffered = 0;
                self.output.feed(evt);
            }
            _ => self.output.feed(evt),
        }
    }
}
