//! Pipeline layouts and pooled instances.
//!
//! A [`PipelineLayout`] is the immutable template: an ordered list of
//! filter templates plus a type. A [`Pipeline`] is a live instance, a
//! chain of cloned filters sharing one [`Context`], allocated from the
//! layout's LIFO free list and returned to it when the owning handle
//! drops.
//!
//! Every instance carries a generation counter. Inputs handed out by a
//! pipeline capture the generation at creation time and go inert once
//! the pipeline is recycled, so a stale upstream can never feed events
//! into the instance's next incarnation.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::context::Context;
use crate::event::Event;
use crate::filter::{Filter, FilterContext};
use crate::input::{EventTarget, Input};
use crate::scheduler;

/// What drives a pipeline of this layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutType {
    /// One instance per accepted connection.
    Listen,
    /// One instance per file read.
    Read,
    /// One instance per timer fire.
    Task,
    /// Instantiated on demand by name (sub-pipelines, log targets).
    Named,
}

struct FilterSlot {
    filter: Box<dyn Filter>,
}

pub(crate) struct PipelineInner {
    layout: Weak<LayoutInner>,
    filters: Vec<RefCell<FilterSlot>>,
    context: RefCell<Option<Rc<RefCell<Context>>>>,
    output: RefCell<Input>,
    generation: Cell<u64>,
}

struct LayoutInner {
    layout_type: LayoutType,
    name: Rc<str>,
    filters: RefCell<Vec<Box<dyn Filter>>>,
    pool: RefCell<Vec<Rc<PipelineInner>>>,
    live: RefCell<Vec<Weak<PipelineInner>>>,
    allocated: Cell<u64>,
}

/// Immutable template for pipelines. Clonable shared handle.
#[derive(Clone)]
pub struct PipelineLayout {
    inner: Rc<LayoutInner>,
}

impl PipelineLayout {
    /// Creates an empty layout.
    #[must_use]
    pub fn new(layout_type: LayoutType, name: impl Into<Rc<str>>) -> Self {
        let name = name.into();
        debug!(layout = %name, ?layout_type, "pipeline layout created");
        Self {
            inner: Rc::new(LayoutInner {
                layout_type,
                name,
                filters: RefCell::new(Vec::new()),
                pool: RefCell::new(Vec::new()),
                live: RefCell::new(Vec::new()),
                allocated: Cell::new(0),
            }),
        }
    }

    /// Appends a filter template. Layouts are append-only and must not
    /// change after the first allocation.
    pub fn append(&self, filter: Box<dyn Filter>) -> &Self {
        self.inner.filters.borrow_mut().push(filter);
        self
    }

    /// The layout's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The layout's type.
    #[must_use]
    pub fn layout_type(&self) -> LayoutType {
        self.inner.layout_type
    }

    /// Number of filter templates.
    #[must_use]
    pub fn filter_count(&self) -> usize {
        self.inner.filters.borrow().len()
    }

    /// Total instances ever constructed. Only ever grows.
    #[must_use]
    pub fn allocated(&self) -> u64 {
        self.inner.allocated.get()
    }

    /// Instances currently checked out.
    #[must_use]
    pub fn live(&self) -> usize {
        self.inner.live.borrow().iter().filter(|w| w.upgrade().is_some()).count()
    }

    /// Instances parked on the free list.
    #[must_use]
    pub fn pool_depth(&self) -> usize {
        self.inner.pool.borrow().len()
    }

    /// Allocates an instance: pops the free list or constructs a new
    /// one, cloning each filter template exactly once. The instance is
    /// chained and bound to `ctx`.
    #[must_use]
    pub fn alloc(&self, ctx: Rc<RefCell<Context>>) -> Pipeline {
        let inner = self.inner.pool.borrow_mut().pop().unwrap_or_else(|| {
            self.inner.allocated.set(self.inner.allocated.get() + 1);
            let templates = self.inner.filters.borrow();
            Rc::new(PipelineInner {
                layout: Rc::downgrade(&self.inner),
                filters: templates
                    .iter()
                    .map(|t| RefCell::new(FilterSlot { filter: t.clone_filter() }))
                    .collect(),
                context: RefCell::new(None),
                output: RefCell::new(Input::null()),
                generation: Cell::new(0),
            })
        });

        debug!(layout = %self.inner.name, context = ctx.borrow().id(), "pipeline alloc");
        *inner.context.borrow_mut() = Some(ctx);

        // Chain every filter to its successor (tail to the output
        // proxy), stamping inputs with the current generation.
        let generation = inner.generation.get();
        let n = inner.filters.len();
        for (i, slot) in inner.filters.iter().enumerate() {
            let output = if i + 1 < n {
                Input::new(Rc::new(FilterInput {
                    pipeline: Rc::downgrade(&inner),
                    index: i + 1,
                    generation,
                }))
            } else {
                Input::new(Rc::new(OutputProxy {
                    pipeline: Rc::downgrade(&inner),
                    generation,
                }))
            };
            slot.borrow_mut().filter.chain(output);
        }

        self.inner.live.borrow_mut().push(Rc::downgrade(&inner));
        Pipeline { inner }
    }

    /// Passes the shutdown hint to every live instance's filters.
    pub fn shutdown(&self) {
        for weak in self.inner.live.borrow().iter() {
            if let Some(p) = weak.upgrade() {
                for slot in &p.filters {
                    slot.borrow_mut().filter.shutdown();
                }
            }
        }
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("name", &self.inner.name)
            .field("type", &self.inner.layout_type)
            .field("filters", &self.filter_count())
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// A live pipeline instance. Single-owner handle: dropping it returns
/// the instance to the layout's free list (deferred to the next
/// scheduler drain, so a pipeline may safely drop itself from inside
/// its own filter chain).
pub struct Pipeline {
    inner: Rc<PipelineInner>,
}

impl Pipeline {
    /// The entry input feeding the first filter (or the output for an
    /// empty layout).
    #[must_use]
    pub fn input(&self) -> Input {
        let generation = self.inner.generation.get();
        if self.inner.filters.is_empty() {
            Input::new(Rc::new(OutputProxy {
                pipeline: Rc::downgrade(&self.inner),
                generation,
            }))
        } else {
            Input::new(Rc::new(FilterInput {
                pipeline: Rc::downgrade(&self.inner),
                index: 0,
                generation,
            }))
        }
    }

    /// Rebinds the downstream output all events leave through.
    pub fn set_output(&self, output: Input) {
        *self.inner.output.borrow_mut() = output;
    }

    /// The shared context.
    ///
    /// # Panics
    ///
    /// Panics if called on a recycled instance; the owning handle keeps
    /// the context installed, so this cannot happen through public API.
    #[must_use]
    pub fn context(&self) -> Rc<RefCell<Context>> {
        self.inner
            .context
            .borrow()
            .clone()
            .expect("live pipeline has a context")
    }

    /// Passes the shutdown hint to each filter.
    pub fn shutdown(&self) {
        for slot in &self.inner.filters {
            slot.borrow_mut().filter.shutdown();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        let inner = Rc::clone(&self.inner);
        scheduler::defer(move || recycle(&inner));
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .inner
            .layout
            .upgrade()
            .map_or_else(|| "<detached>".into(), |l| l.name.to_string());
        write!(f, "Pipeline({name})")
    }
}

/// Returns an instance to its layout's free list: bump the generation
/// (stale inputs go inert), reset every filter, drop the context.
fn recycle(inner: &Rc<PipelineInner>) {
    inner.generation.set(inner.generation.get() + 1);
    for slot in &inner.filters {
        slot.borrow_mut().filter.reset();
    }
    let ctx_id = inner
        .context
        .borrow_mut()
        .take()
        .map(|c| c.borrow().id());
    *inner.output.borrow_mut() = Input::null();

    if let Some(layout) = inner.layout.upgrade() {
        debug!(layout = %layout.name, context = ?ctx_id, "pipeline recycled");
        layout
            .live
            .borrow_mut()
            .retain(|w| w.upgrade().is_some_and(|p| !Rc::ptr_eq(&p, inner)));
        layout.pool.borrow_mut().push(Rc::clone(inner));
    }
}

/// Input addressing one filter slot of one pipeline incarnation.
struct FilterInput {
    pipeline: Weak<PipelineInner>,
    index: usize,
    generation: u64,
}

impl EventTarget for FilterInput {
    fn on_event(&self, evt: Event) {
        let Some(inner) = self.pipeline.upgrade() else {
            return;
        };
        if inner.generation.get() != self.generation {
            return;
        }
        let Some(ctx) = inner.context.borrow().clone() else {
            return;
        };
        let borrow_result = inner.filters[self.index].try_borrow_mut();
        match borrow_result {
            Ok(mut slot) => {
                let mut cx = FilterContext::new(&ctx);
                slot.filter.process(&mut cx, evt);
            }
            // The slot is processing already (an event loop fed back
            // into its own stage); deliver after it unwinds.
            Err(_) => {
                let target = FilterInput {
                    pipeline: self.pipeline.clone(),
                    index: self.index,
                    generation: self.generation,
                };
                scheduler::defer(move || target.on_event(evt));
            }
        }
    }
}

/// Input forwarding to the pipeline's current downstream output.
struct OutputProxy {
    pipeline: Weak<PipelineInner>,
    generation: u64,
}

impl EventTarget for OutputProxy {
    fn on_event(&self, evt: Event) {
        let Some(inner) = self.pipeline.upgrade() else {
            return;
        };
        if inner.generation.get() != self.generation {
            return;
        }
        let output = inner.output.borrow().clone();
        output.feed(evt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Pass;
    use crate::input::EventLog;

    fn ctx() -> Rc<RefCell<Context>> {
        Rc::new(RefCell::new(Context::new()))
    }

    fn layout_with_pass() -> PipelineLayout {
        let layout = PipelineLayout::new(LayoutType::Named, "test");
        layout.append(Box::new(Pass::new()));
        layout
    }

    #[test]
    fn test_alloc_feeds_through() {
        let layout = layout_with_pass();
        let log = EventLog::new();
        let p = layout.alloc(ctx());
        p.set_output(log.input());
        p.input().feed(Event::data(b"hi"));
        p.input().feed(Event::stream_end());
        assert_eq!(log.len(), 2);
        assert_eq!(log.bytes(), b"hi");
    }

    #[test]
    fn test_empty_layout_passes_through() {
        let layout = PipelineLayout::new(LayoutType::Named, "empty");
        let log = EventLog::new();
        let p = layout.alloc(ctx());
        p.set_output(log.input());
        p.input().feed(Event::data(b"x"));
        assert_eq!(log.bytes(), b"x");
    }

    #[test]
    fn test_pooling_reuses_instances() {
        let layout = layout_with_pass();
        let p1 = layout.alloc(ctx());
        drop(p1);
        scheduler::drain();
        assert_eq!(layout.allocated(), 1);
        assert_eq!(layout.pool_depth(), 1);

        let p2 = layout.alloc(ctx());
        assert_eq!(layout.allocated(), 1, "free list instance reused");
        assert_eq!(layout.pool_depth(), 0);
        drop(p2);
        scheduler::drain();
        assert_eq!(layout.pool_depth(), 1);
    }

    #[test]
    fn test_allocated_only_grows() {
        let layout = layout_with_pass();
        let a = layout.alloc(ctx());
        let b = layout.alloc(ctx());
        assert_eq!(layout.allocated(), 2);
        drop(a);
        drop(b);
        scheduler::drain();
        assert_eq!(layout.allocated(), 2);
        assert!(layout.allocated() as usize >= layout.live() + layout.pool_depth());
        let c = layout.alloc(ctx());
        assert_eq!(layout.allocated(), 2);
        drop(c);
        scheduler::drain();
    }

    #[test]
    fn test_stale_input_goes_inert_after_recycle() {
        let layout = layout_with_pass();
        let log = EventLog::new();
        let p = layout.alloc(ctx());
        p.set_output(log.input());
        let stale = p.input();
        drop(p);
        scheduler::drain();

        // Re-allocate the same pooled instance with a fresh sink.
        let log2 = EventLog::new();
        let p2 = layout.alloc(ctx());
        p2.set_output(log2.input());

        stale.feed(Event::data(b"ghost"));
        assert!(log2.is_empty(), "stale input must not reach new incarnation");
        assert!(log.is_empty());
        drop(p2);
        scheduler::drain();
    }

    #[test]
    fn test_recycle_is_deferred() {
        let layout = layout_with_pass();
        let p = layout.alloc(ctx());
        drop(p);
        // Not yet recycled: the free list fills only on drain.
        assert_eq!(layout.pool_depth(), 0);
        scheduler::drain();
        assert_eq!(layout.pool_depth(), 1);
    }

    #[test]
    fn test_live_tracking() {
        let layout = layout_with_pass();
        let p = layout.alloc(ctx());
        assert_eq!(layout.live(), 1);
        drop(p);
        scheduler::drain();
        assert_eq!(layout.live(), 0);
    }
}
