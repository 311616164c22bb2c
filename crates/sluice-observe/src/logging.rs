//! Data-plane log sinks.
//!
//! A [`Logger`] is a named sink users write records to; each record
//! fans out to the logger's targets. The file target drives a private
//! pipeline containing a tee filter, so log delivery rides the same
//! dataflow machinery as everything else. The pipeline target
//! feeds an arbitrary user-supplied layout (the shape an HTTP batch
//! target plugs into).

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use sluice_core::context::Context;
use sluice_core::data::Data;
use sluice_core::event::Event;
use sluice_core::filters::Tee;
use sluice_core::input::Input;
use sluice_core::pipeline::{LayoutType, Pipeline, PipelineLayout};
use sluice_core::value::Value;

/// Anything that accepts a finished log record.
pub trait LogTarget {
    /// Delivers one record.
    fn write(&self, record: &Data);
}

/// How [`Logger::log`] renders its arguments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Space-joined plain text.
    #[default]
    Text,
    /// One JSON array per record.
    Json,
}

/// A named log sink with pluggable targets.
pub struct Logger {
    name: Rc<str>,
    format: LogFormat,
    targets: Vec<Box<dyn LogTarget>>,
}

impl Logger {
    /// Creates a text logger.
    #[must_use]
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self::with_format(name, LogFormat::Text)
    }

    /// Creates a logger with an explicit record format.
    #[must_use]
    pub fn with_format(name: impl Into<Rc<str>>, format: LogFormat) -> Self {
        Self {
            name: name.into(),
            format,
            targets: Vec::new(),
        }
    }

    /// The logger's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a delivery target.
    pub fn add_target(&mut self, target: Box<dyn LogTarget>) -> &mut Self {
        self.targets.push(target);
        self
    }

    /// Delivers a raw record to every target.
    pub fn write(&self, record: &Data) {
        for target in &self.targets {
            target.write(record);
        }
    }

    /// Formats `values` per the logger's format and delivers the
    /// record, newline-terminated.
    pub fn log(&self, values: &[Value]) {
        let mut line = match self.format {
            LogFormat::Text => values
                .iter()
                .map(render_text)
                .collect::<Vec<_>>()
                .join(" "),
            LogFormat::Json => {
                let array: Vec<serde_json::Value> = values.iter().map(render_json).collect();
                serde_json::Value::Array(array).to_string()
            }
        };
        line.push('\n');
        self.write(&Data::from_slice(line.as_bytes()));
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("targets", &self.targets.len())
            .finish()
    }
}

fn render_text(value: &Value) -> String {
    match value {
        Value::Undefined => "undefined".into(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.to_string(),
        Value::Object(_) => "[object]".into(),
    }
}

fn render_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Undefined => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        Value::Object(_) => serde_json::Value::Null,
    }
}

/// Appends records to a file through a private tee pipeline.
pub struct FileTarget {
    pipeline: PipelineTarget,
}

impl FileTarget {
    /// Creates a file target appending to `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let layout = PipelineLayout::new(LayoutType::Named, "log-file");
        layout.append(Box::new(Tee::new(path)));
        Self { pipeline: PipelineTarget::new(&layout) }
    }
}

impl LogTarget for FileTarget {
    fn write(&self, record: &Data) {
        self.pipeline.write(record);
    }
}

/// Feeds records into a pipeline of any layout. Batch-shipping targets
/// (an HTTP poster, say) are this plus a codec layout.
pub struct PipelineTarget {
    pipeline: Pipeline,
    input: Input,
}

impl PipelineTarget {
    /// Allocates one long-lived pipeline of `layout`.
    #[must_use]
    pub fn new(layout: &PipelineLayout) -> Self {
        let pipeline = layout.alloc(Rc::new(RefCell::new(Context::new())));
        let input = pipeline.input();
        Self { pipeline, input }
    }
}

impl PipelineTarget {
    /// The backing pipeline, e.g. to rewire its output.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl LogTarget for PipelineTarget {
    fn write(&self, record: &Data) {
        self.input.feed(Event::Data(record.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::input::EventLog;
    use sluice_core::scheduler;

    struct CaptureTarget(Rc<RefCell<Vec<u8>>>);

    impl LogTarget for CaptureTarget {
        fn write(&self, record: &Data) {
            self.0.borrow_mut().extend_from_slice(&record.to_vec());
        }
    }

    #[test]
    fn test_text_format_joins_values() {
        let captured = Rc::new(RefCell::new(Vec::new()));
        let mut logger = Logger::new("access");
        logger.add_target(Box::new(CaptureTarget(Rc::clone(&captured))));
        logger.log(&[Value::from("GET"), Value::Int(200), Value::Bool(true)]);
        assert_eq!(&*captured.borrow(), b"GET 200 true\n");
    }

    #[test]
    fn test_json_format_renders_array() {
        let captured = Rc::new(RefCell::new(Vec::new()));
        let mut logger = Logger::with_format("events", LogFormat::Json);
        logger.add_target(Box::new(CaptureTarget(Rc::clone(&captured))));
        logger.log(&[Value::from("x"), Value::Int(1)]);
        assert_eq!(&*captured.borrow(), b"[\"x\",1]\n");
    }

    #[test]
    fn test_fan_out_to_multiple_targets() {
        let a = Rc::new(RefCell::new(Vec::new()));
        let b = Rc::new(RefCell::new(Vec::new()));
        let mut logger = Logger::new("dual");
        logger.add_target(Box::new(CaptureTarget(Rc::clone(&a))));
        logger.add_target(Box::new(CaptureTarget(Rc::clone(&b))));
        logger.write(&Data::from_slice(b"rec"));
        assert_eq!(&*a.borrow(), b"rec");
        assert_eq!(&*b.borrow(), b"rec");
    }

    #[test]
    fn test_file_target_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut logger = Logger::new("file");
        logger.add_target(Box::new(FileTarget::new(&path)));
        logger.log(&[Value::from("one")]);
        logger.log(&[Value::from("two")]);
        assert_eq!(std::fs::read(&path).unwrap(), b"one\ntwo\n");
        scheduler::drain();
    }

    #[test]
    fn test_pipeline_target_feeds_layout() {
        let layout = PipelineLayout::new(LayoutType::Named, "sink");
        layout.append(Box::new(sluice_core::filters::Pass::new()));
        let target = PipelineTarget::new(&layout);
        let log = EventLog::new();
        target.pipeline().set_output(log.input());
        target.write(&Data::from_slice(b"payload"));
        assert_eq!(log.bytes(), b"payload");
        scheduler::drain();
    }
}
