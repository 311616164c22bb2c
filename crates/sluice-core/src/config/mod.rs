//! Configuration binder.
//!
//! A [`Configuration`] collects a module's declarations (`listen`,
//! `read`, `task`, `pipeline`, plus `import`/`export`) and the filter
//! chains under them, then [`Configuration::bind`] runs the integrity
//! checks and turns everything into immutable
//! [`PipelineLayout`]s grouped in a [`ModuleBindings`]. Binding errors
//! are fatal to worker start; nothing is partially bound.

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::context::Context;
use crate::filter::Filter;
use crate::filters::{Handle, HandleCallback, Pass};
use crate::pipeline::{LayoutType, PipelineLayout};
use crate::value::Value;
use crate::ConfigError;

/// Listener options as they appear in a `listen` declaration. The net
/// crate maps these onto its runtime listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Max simultaneous connections; zero means unlimited.
    pub max_connections: usize,
    /// Per-read timeout in seconds; zero disables.
    pub read_timeout: f64,
    /// Per-write timeout in seconds; zero disables.
    pub write_timeout: f64,
    /// Whole-connection idle timeout in seconds; zero disables.
    pub idle_timeout: f64,
    /// Transparent proxying (Linux `IP_TRANSPARENT`).
    pub transparent: bool,
    /// Close the connection as soon as the peer half-closes.
    pub close_eof: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            max_connections: 0,
            read_timeout: 0.0,
            write_timeout: 0.0,
            idle_timeout: 0.0,
            transparent: false,
            close_eof: false,
        }
    }
}

/// One bound `listen` declaration.
#[derive(Debug)]
pub struct ListenBinding {
    /// Bind address.
    pub addr: SocketAddr,
    /// Listener options.
    pub config: ListenConfig,
    /// Per-connection pipeline template.
    pub layout: PipelineLayout,
}

/// One bound `read` declaration.
#[derive(Debug)]
pub struct ReadBinding {
    /// File to stream through the pipeline.
    pub path: std::path::PathBuf,
    /// Pipeline template.
    pub layout: PipelineLayout,
}

/// One bound `task` declaration.
#[derive(Debug)]
pub struct TaskBinding {
    /// Firing interval; `None` fires once at startup.
    pub interval: Option<Duration>,
    /// Pipeline template.
    pub layout: PipelineLayout,
}

/// Everything a worker needs to run one bound module.
#[derive(Debug)]
pub struct ModuleBindings {
    /// Listeners to start.
    pub listens: Vec<ListenBinding>,
    /// File readers to start.
    pub reads: Vec<ReadBinding>,
    /// Timed tasks to start.
    pub tasks: Vec<TaskBinding>,
    /// Named pipelines, addressable by `to(...)` and log targets.
    pub named: HashMap<String, PipelineLayout>,
    variables: Vec<(Rc<str>, Value)>,
}

impl ModuleBindings {
    /// A context pre-populated with the module's imported variables.
    #[must_use]
    pub fn new_context(&self, inbound: Option<&Rc<dyn std::any::Any>>) -> Context {
        let mut ctx = match inbound {
            Some(o) => Context::with_inbound(o),
            None => Context::new(),
        };
        for (name, value) in &self.variables {
            ctx.set_var(Rc::clone(name), value.clone());
        }
        ctx
    }
}

/// Cross-module export table: `(namespace, name) -> value`.
#[derive(Default)]
pub struct ExportRegistry {
    entries: HashMap<(String, String), Value>,
}

impl ExportRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one export. Duplicates are a bind error.
    pub fn add(
        &mut self,
        namespace: &str,
        name: &str,
        value: Value,
    ) -> Result<(), ConfigError> {
        let key = (namespace.to_string(), name.to_string());
        if self.entries.contains_key(&key) {
            return Err(ConfigError::DuplicateExport(
                name.to_string(),
                namespace.to_string(),
            ));
        }
        self.entries.insert(key, value);
        Ok(())
    }

    /// Looks an export up.
    #[must_use]
    pub fn get(&self, namespace: &str, name: &str) -> Option<&Value> {
        self.entries
            .get(&(namespace.to_string(), name.to_string()))
    }
}

enum Decl {
    Listen { addr: String, config: ListenConfig },
    Read { path: std::path::PathBuf },
    Task { when: String },
    Named { name: String },
}

enum ToTarget {
    Name(String),
    Inline(usize),
}

struct FilterSpec {
    filter: Box<dyn Filter>,
    to: Vec<ToTarget>,
}

struct PipelineSpec {
    decl: Decl,
    filters: Vec<FilterSpec>,
}

/// A module under construction.
pub struct Configuration {
    name: String,
    pipelines: Rc<RefCell<Vec<PipelineSpec>>>,
    exports: Vec<(String, String, Value)>,
    imports: Vec<(String, String)>,
    errors: Rc<RefCell<Vec<ConfigError>>>,
}

impl Configuration {
    /// Starts an empty module configuration.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pipelines: Rc::new(RefCell::new(Vec::new())),
            exports: Vec::new(),
            imports: Vec::new(),
            errors: Rc::new(RefCell::new(Vec::new())),
        }
    }

    /// Declares variables exported under `namespace`.
    pub fn export(&mut self, namespace: &str, vars: Vec<(&str, Value)>) -> &mut Self {
        for (name, value) in vars {
            self.exports
                .push((namespace.to_string(), name.to_string(), value));
        }
        self
    }

    /// Declares an import of `name` from another module's `namespace`.
    pub fn import(&mut self, name: &str, namespace: &str) -> &mut Self {
        self.imports.push((name.to_string(), namespace.to_string()));
        self
    }

    /// Opens a `listen` pipeline on `addr` (`"ip:port"` or a bare
    /// port).
    pub fn listen(&mut self, addr: impl ToString, config: ListenConfig) -> FilterConfigurator<'_> {
        self.open(Decl::Listen { addr: addr.to_string(), config })
    }

    /// Opens a `read` pipeline streaming `path`.
    pub fn read(&mut self, path: impl Into<std::path::PathBuf>) -> FilterConfigurator<'_> {
        self.open(Decl::Read { path: path.into() })
    }

    /// Opens a `task` pipeline firing per `when` (`"5s"`, `"2m"`,
    /// `"1h"`, or `""` for once at startup).
    pub fn task(&mut self, when: &str) -> FilterConfigurator<'_> {
        self.open(Decl::Task { when: when.to_string() })
    }

    /// Opens a named pipeline.
    pub fn pipeline(&mut self, name: &str) -> FilterConfigurator<'_> {
        self.open(Decl::Named { name: name.to_string() })
    }

    fn open(&mut self, decl: Decl) -> FilterConfigurator<'_> {
        let index = {
            let mut pipelines = self.pipelines.borrow_mut();
            pipelines.push(PipelineSpec { decl, filters: Vec::new() });
            pipelines.len() - 1
        };
        FilterConfigurator { config: self, pipeline: index }
    }

    /// Appends a filter to the most recently opened pipeline; the
    /// low-level entry the fluent handle delegates to.
    pub fn append_filter(&mut self, filter: Box<dyn Filter>) {
        let name = filter.dump().name.to_string();
        let mut pipelines = self.pipelines.borrow_mut();
        match pipelines.last_mut() {
            Some(spec) => spec.filters.push(FilterSpec { filter, to: Vec::new() }),
            None => self
                .errors
                .borrow_mut()
                .push(ConfigError::NoOpenPipeline(name)),
        }
    }

    fn pipeline_name(&self, decl: &Decl) -> String {
        match decl {
            Decl::Listen { addr, .. } => format!("listen({addr})"),
            Decl::Read { path } => format!("read({})", path.display()),
            Decl::Task { when } => format!("task({when})"),
            Decl::Named { name } => name.clone(),
        }
    }

    /// Runs the integrity checks and produces bound layouts.
    ///
    /// # Errors
    ///
    /// Any recorded construction error, a joint filter without `to`, an
    /// unknown `to` target, an unresolved import, a duplicate export,
    /// or an unparseable address/schedule.
    pub fn bind(self, registry: &mut ExportRegistry) -> Result<ModuleBindings, ConfigError> {
        if let Some(err) = self.errors.borrow_mut().drain(..).next() {
            return Err(err);
        }

        for (namespace, name, value) in &self.exports {
            registry.add(namespace, name, value.clone())?;
        }

        let mut variables = Vec::new();
        for (name, namespace) in &self.imports {
            match registry.get(namespace, name) {
                Some(value) => variables.push((Rc::from(name.as_str()), value.clone())),
                None => {
                    return Err(ConfigError::UnresolvedImport(
                        name.clone(),
                        namespace.clone(),
                    ))
                }
            }
        }

        let mut pipelines = std::mem::take(&mut *self.pipelines.borrow_mut());

        // Pass one: a layout per spec, so `to(name)` can resolve
        // forward references.
        let mut layouts = Vec::with_capacity(pipelines.len());
        let mut named = HashMap::new();
        for spec in &pipelines {
            let name = self.pipeline_name(&spec.decl);
            let layout_type = match &spec.decl {
                Decl::Listen { .. } => LayoutType::Listen,
                Decl::Read { .. } => LayoutType::Read,
                Decl::Task { .. } => LayoutType::Task,
                Decl::Named { .. } => LayoutType::Named,
            };
            let layout = PipelineLayout::new(layout_type, name);
            if let Decl::Named { name } = &spec.decl {
                named.insert(name.clone(), layout.clone());
            }
            layouts.push(layout);
        }

        // Pass two: run the joint-filter check, resolve `to` targets,
        // bind and install filters.
        for (index, spec) in pipelines.iter_mut().enumerate() {
            let pipeline_name = layouts[index].name().to_string();
            for mut fs in std::mem::take(&mut spec.filters) {
                let dump = fs.filter.dump();
                if dump.is_joint && fs.to.is_empty() {
                    return Err(ConfigError::MissingTo(
                        dump.name.to_string(),
                        pipeline_name,
                    ));
                }
                let mut subs = Vec::with_capacity(fs.to.len());
                for target in &fs.to {
                    match target {
                        ToTarget::Name(name) => match named.get(name) {
                            Some(layout) => subs.push(layout.clone()),
                            None => {
                                return Err(ConfigError::UnknownPipeline(
                                    name.clone(),
                                    pipeline_name,
                                ))
                            }
                        },
                        ToTarget::Inline(i) => subs.push(layouts[*i].clone()),
                    }
                }
                fs.filter.bind(&subs)?;
                layouts[index].append(fs.filter);
            }
        }

        // Pass three: sort declarations into runtime bindings.
        let mut listens = Vec::new();
        let mut reads = Vec::new();
        let mut tasks = Vec::new();
        for (spec, layout) in pipelines.iter().zip(&layouts) {
            match &spec.decl {
                Decl::Listen { addr, config } => listens.push(ListenBinding {
                    addr: parse_listen_addr(addr)?,
                    config: config.clone(),
                    layout: layout.clone(),
                }),
                Decl::Read { path } => reads.push(ReadBinding {
                    path: path.clone(),
                    layout: layout.clone(),
                }),
                Decl::Task { when } => tasks.push(TaskBinding {
                    interval: parse_schedule(when)?,
                    layout: layout.clone(),
                }),
                Decl::Named { .. } => {}
            }
        }

        info!(module = %self.name, pipelines = layouts.len(), "module bound");
        Ok(ModuleBindings { listens, reads, tasks, named, variables })
    }
}

/// Fluent handle appending filters to one open pipeline.
pub struct FilterConfigurator<'a> {
    config: &'a mut Configuration,
    pipeline: usize,
}

impl FilterConfigurator<'_> {
    /// Appends any filter.
    pub fn append(&mut self, filter: Box<dyn Filter>) -> &mut Self {
        self.config.pipelines.borrow_mut()[self.pipeline]
            .filters
            .push(FilterSpec { filter, to: Vec::new() });
        self
    }

    /// Attaches a named sub-pipeline to the last appended filter.
    /// Joint filters require exactly this; `to` without a preceding
    /// joint filter is a bind error.
    pub fn to(&mut self, name: &str) -> &mut Self {
        self.attach(ToTarget::Name(name.to_string()));
        self
    }

    /// Attaches an inline sub-pipeline built by `build`.
    pub fn to_inline(&mut self, build: impl FnOnce(&mut FilterConfigurator<'_>)) -> &mut Self {
        let parent = self.pipeline;
        let sub_name = format!(
            "{}#{}",
            self.config.pipeline_name(&self.config.pipelines.borrow()[parent].decl),
            self.config.pipelines.borrow().len(),
        );
        let index = {
            let mut pipelines = self.config.pipelines.borrow_mut();
            pipelines.push(PipelineSpec {
                decl: Decl::Named { name: sub_name },
                filters: Vec::new(),
            });
            pipelines.len() - 1
        };
        {
            let mut sub = FilterConfigurator { config: &mut *self.config, pipeline: index };
            build(&mut sub);
        }
        self.attach(ToTarget::Inline(index));
        self
    }

    fn attach(&mut self, target: ToTarget) {
        let mut pipelines = self.config.pipelines.borrow_mut();
        let spec = &mut pipelines[self.pipeline];
        match spec.filters.last_mut() {
            Some(fs) if fs.filter.dump().is_joint => fs.to.push(target),
            _ => {
                let name = self.config.pipeline_name(&spec.decl);
                self.config
                    .errors
                    .borrow_mut()
                    .push(ConfigError::DanglingTo(name));
            }
        }
    }

    /// Appends the identity filter.
    pub fn pass(&mut self) -> &mut Self {
        self.append(Box::new(Pass::new()))
    }

    /// Appends a user-callback hook.
    pub fn handle(&mut self, callback: HandleCallback) -> &mut Self {
        self.append(Box::new(Handle::new(callback)))
    }
}

/// Parses a listen address: `"ip:port"` or a bare port (all
/// interfaces).
pub(crate) fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    if let Ok(port) = addr.parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    addr.parse::<SocketAddr>()
        .map_err(|_| ConfigError::InvalidAddress(addr.to_string()))
}

/// Parses a task schedule: `""` (once), `"500ms"`, `"5s"`, `"2m"`,
/// `"1h"`.
pub(crate) fn parse_schedule(when: &str) -> Result<Option<Duration>, ConfigError> {
    if when.is_empty() {
        return Ok(None);
    }
    let (digits, unit): (String, String) = when.chars().partition(|c| c.is_ascii_digit());
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::InvalidSchedule(when.to_string()))?;
    let duration = match unit.as_str() {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 3600),
        _ => return Err(ConfigError::InvalidSchedule(when.to_string())),
    };
    Ok(Some(duration))
}
