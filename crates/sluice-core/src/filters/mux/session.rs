//! Session pooling and clustering.
//!
//! All mux filters with the same selector key share a session cluster;
//! the cluster admits muxers onto its least-loaded session subject to
//! the share/message limits and spins up new sessions when none fits.
//! A per-worker [`SessionPool`] maps keys to clusters (value keys by
//! hash, object keys weakly by identity) and runs the once-per-second
//! recycling scan over clusters whose head session has gone idle.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::event::Event;
use crate::input::Input;
use crate::pipeline::Pipeline;
use crate::value::{KeyValue, Value};

/// Per-cluster limits.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// How long a session may sit at zero shares before recycling.
    pub max_idle: Duration,
    /// Max concurrent shares per session before a new one is allocated.
    /// Zero means unlimited.
    pub max_queue: usize,
    /// Max lifetime streams per session before retirement. Zero means
    /// unlimited.
    pub max_messages: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_idle: Duration::from_secs(10),
            max_queue: 0,
            max_messages: 0,
        }
    }
}

/// The muxing core a session delegates to. [`super::queue::QueueMuxer`]
/// implements the reply-pairing variant; the merge variant discards
/// replies.
pub trait SessionMuxer {
    /// Sets where upstream events leave toward the session pipeline.
    fn bind(&self, forward: Input);
    /// Opens a virtual request channel whose replies go to `output`.
    fn open_stream(&self, output: Input) -> StreamHandle;
    /// Consumes one event coming back from the session pipeline.
    fn on_reply(&self, evt: Event);
    /// Drops all queued streams.
    fn reset(&self);
}

/// Per-stream control surface behind a [`StreamHandle`].
pub trait StreamCtl {
    /// Detaches the stream's upstream consumer.
    fn close(&self);
    /// Marks the stream as not expecting replies.
    fn set_one_way(&self) {}
    /// Announces one more pipelined message awaiting a reply.
    fn increase_queue_count(&self) {}
}

/// A virtual request channel over a session.
#[derive(Clone)]
pub struct StreamHandle {
    input: Input,
    ctl: Rc<dyn StreamCtl>,
}

impl StreamHandle {
    /// Pairs a write input with its control surface.
    #[must_use]
    pub fn new(input: Input, ctl: Rc<dyn StreamCtl>) -> Self {
        Self { input, ctl }
    }

    /// Where the upstream writes its events.
    #[must_use]
    pub fn input(&self) -> Input {
        self.input.clone()
    }

    /// Detaches the upstream consumer.
    pub fn close(&self) {
        self.ctl.close();
    }

    /// Suppresses reply waiting for this stream.
    pub fn set_one_way(&self) {
        self.ctl.set_one_way();
    }

    /// Announces one more pipelined message awaiting a reply.
    pub fn increase_queue_count(&self) {
        self.ctl.increase_queue_count();
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamHandle")
    }
}

/// A muxer parked on a pending session, waiting for it to open.
pub trait PendingWaiter {
    /// The session became ready; open the stream and flush buffered
    /// events.
    fn on_session_open(&self);
}

/// A live, possibly shared endpoint for mux filters.
pub struct Session {
    self_weak: Weak<Session>,
    muxer: Rc<dyn SessionMuxer>,
    cluster: RefCell<Weak<ClusterInner>>,
    pipeline: RefCell<Option<Pipeline>>,
    share_count: Cell<usize>,
    message_count: Cell<usize>,
    free_time: Cell<Instant>,
    pending: Cell<bool>,
    closed: Cell<bool>,
    waiting: RefCell<Vec<Weak<dyn PendingWaiter>>>,
}

impl Session {
    fn new(muxer: Rc<dyn SessionMuxer>, cluster: &Rc<ClusterInner>) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            muxer,
            cluster: RefCell::new(Rc::downgrade(cluster)),
            pipeline: RefCell::new(None),
            share_count: Cell::new(1),
            message_count: Cell::new(1),
            free_time: Cell::new(Instant::now()),
            pending: Cell::new(false),
            closed: Cell::new(false),
            waiting: RefCell::new(Vec::new()),
        })
    }

    /// Current share count: live streams plus waiting muxers.
    #[must_use]
    pub fn share_count(&self) -> usize {
        self.share_count.get()
    }

    /// Total streams ever admitted.
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.message_count.get()
    }

    /// True once the session pipeline emitted its `StreamEnd`.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// True while the session awaits e.g. a handshake; muxers park and
    /// buffer until it clears.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.get()
    }

    /// True when no muxer holds a share.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.share_count.get() == 0
    }

    /// True once a pipeline has been linked.
    #[must_use]
    pub fn has_pipeline(&self) -> bool {
        self.pipeline.borrow().is_some()
    }

    /// Number of sessions in the owning cluster, for diagnostics and
    /// sub-pipeline arguments.
    #[must_use]
    pub fn cluster_size(&self) -> usize {
        self.cluster
            .borrow()
            .upgrade()
            .map_or(0, |c| c.sessions.borrow().len())
    }

    /// Attaches the session pipeline: upstream events forward into it,
    /// its output feeds replies back into the muxer.
    pub fn link(&self, pipeline: Pipeline) {
        self.muxer.bind(pipeline.input());
        pipeline.set_output(self.reply_input());
        *self.pipeline.borrow_mut() = Some(pipeline);
    }

    /// The input the session pipeline's output is wired to.
    #[must_use]
    pub fn reply_input(&self) -> Input {
        let weak = self.self_weak.clone();
        Input::from_fn(move |evt| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let is_end = matches!(evt, Event::StreamEnd(_));
            session.muxer.on_reply(evt);
            if is_end {
                session.closed.set(true);
            }
        })
    }

    /// Flips the pending flag; on clearing it, parked muxers are
    /// drained in FIFO order.
    pub fn set_pending(&self, pending: bool) {
        if pending == self.pending.get() {
            return;
        }
        self.pending.set(pending);
        if !pending {
            let waiters = std::mem::take(&mut *self.waiting.borrow_mut());
            for waiter in waiters {
                if let Some(waiter) = waiter.upgrade() {
                    waiter.on_session_open();
                }
            }
        }
    }

    /// Parks a muxer until the session stops pending.
    pub fn add_waiter(&self, waiter: Weak<dyn PendingWaiter>) {
        self.waiting.borrow_mut().push(waiter);
    }

    /// Unparks a muxer (filter reset while still waiting).
    pub fn remove_waiter(&self, waiter: &Weak<dyn PendingWaiter>) {
        self.waiting.borrow_mut().retain(|w| !w.ptr_eq(waiter));
    }

    /// Opens a virtual request channel.
    #[must_use]
    pub fn open_stream(&self, output: Input) -> StreamHandle {
        self.muxer.open_stream(output)
    }

    /// Closes a channel previously opened.
    pub fn close_stream(&self, stream: &StreamHandle) {
        stream.close();
    }

    /// Releases one share. Detached sessions unlink immediately.
    pub fn free(&self) {
        let cluster = self.cluster.borrow().upgrade();
        match cluster {
            Some(cluster) => cluster.free(self),
            None => self.unlink(),
        }
    }

    /// Tears the pipeline down: clear the muxer queue, signal the
    /// session pipeline with a `StreamEnd`, release the instance.
    fn unlink(&self) {
        if let Some(pipeline) = self.pipeline.borrow_mut().take() {
            self.muxer.reset();
            pipeline.input().feed(Event::stream_end());
            drop(pipeline);
        }
    }

    /// Removes the session from its cluster.
    fn detach(&self) {
        let cluster = std::mem::take(&mut *self.cluster.borrow_mut());
        if let Some(cluster) = cluster.upgrade() {
            cluster.discard(self);
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("share_count", &self.share_count.get())
            .field("message_count", &self.message_count.get())
            .field("pending", &self.pending.get())
            .field("closed", &self.closed.get())
            .finish_non_exhaustive()
    }
}

/// Everything a pool needs to build a cluster the first time a key
/// appears.
pub struct ClusterConfig {
    /// Per-cluster limits.
    pub options: SessionOptions,
    /// Factory for the muxing core of each new session.
    pub muxer: Rc<dyn Fn() -> Rc<dyn SessionMuxer>>,
}

enum ClusterKey {
    Value(KeyValue),
    Object { addr: usize, handle: Weak<dyn Any> },
}

struct ClusterInner {
    self_weak: Weak<ClusterInner>,
    pool: Weak<PoolInner>,
    key: ClusterKey,
    options: SessionOptions,
    /// Ascending by share count; head is least loaded.
    sessions: RefCell<Vec<Rc<Session>>>,
    recycle_scheduled: Cell<bool>,
    muxer_factory: Rc<dyn Fn() -> Rc<dyn SessionMuxer>>,
}

impl ClusterInner {
    fn create(pool: &Rc<PoolInner>, key: ClusterKey, config: ClusterConfig) -> Rc<Self> {
        Rc::new_cyclic(|self_weak| Self {
            self_weak: self_weak.clone(),
            pool: Rc::downgrade(pool),
            key,
            options: config.options,
            sessions: RefCell::new(Vec::new()),
            recycle_scheduled: Cell::new(false),
            muxer_factory: config.muxer,
        })
    }

    /// Walks the session list for the first admissible session, or
    /// creates one. Admission: not closed, under `max_queue` shares
    /// and `max_messages` lifetime streams (zero meaning unlimited).
    fn alloc(&self) -> Rc<Session> {
        let max_share = self.options.max_queue;
        let max_messages = self.options.max_messages;
        let found = self
            .sessions
            .borrow()
            .iter()
            .find(|s| {
                !s.is_closed()
                    && (max_share == 0 || s.share_count.get() < max_share)
                    && (max_messages == 0 || s.message_count.get() < max_messages)
            })
            .cloned();

        if let Some(session) = found {
            session.share_count.set(session.share_count.get() + 1);
            session.message_count.set(session.message_count.get() + 1);
            self.sort();
            return session;
        }

        let this = self.self_weak.upgrade().expect("cluster is alive");
        let session = Session::new((self.muxer_factory)(), &this);
        self.sessions.borrow_mut().insert(0, Rc::clone(&session));
        self.schedule_recycling();
        session
    }

    /// Releases one share and repositions the session.
    fn free(&self, session: &Session) {
        session
            .share_count
            .set(session.share_count.get().saturating_sub(1));
        if session.is_free() {
            session.free_time.set(Instant::now());
        }
        self.sort();
    }

    /// Drops a session from the list entirely.
    fn discard(&self, session: &Session) {
        self.sessions
            .borrow_mut()
            .retain(|s| !std::ptr::eq(&**s, session));
        self.sort();
    }

    /// Restores ascending share-count order, refreshes the recycling
    /// schedule, and removes the cluster from its pool once empty.
    fn sort(&self) {
        self.sessions
            .borrow_mut()
            .sort_by_key(|s| s.share_count.get());

        self.schedule_recycling();

        if self.sessions.borrow().is_empty() {
            if let Some(pool) = self.pool.upgrade() {
                match &self.key {
                    ClusterKey::Value(k) => {
                        pool.clusters.borrow_mut().remove(k);
                    }
                    ClusterKey::Object { addr, .. } => {
                        pool.weak_clusters.borrow_mut().remove(addr);
                    }
                }
                if self.recycle_scheduled.get() {
                    self.recycle_scheduled.set(false);
                    pool.unschedule(self);
                }
            }
        }
    }

    /// Links or unlinks the cluster on the pool's recycle list
    /// according to whether the head session is idle.
    fn schedule_recycling(&self) {
        let head_free = self
            .sessions
            .borrow()
            .first()
            .is_some_and(|s| s.is_free());
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        if head_free {
            if !self.recycle_scheduled.get() {
                self.recycle_scheduled.set(true);
                pool.recycle.borrow_mut().push(self.self_weak.clone());
            }
        } else if self.recycle_scheduled.get() {
            self.recycle_scheduled.set(false);
            pool.unschedule(self);
        }
    }

    /// One recycling pass: retire every leading idle session that is
    /// closed, weak-key-dead, over its message budget, or idle past
    /// `max_idle`. With `force` every idle session goes.
    fn recycle(&self, now: Instant, force: bool) {
        let weak_gone = match &self.key {
            ClusterKey::Object { handle, .. } => handle.upgrade().is_none(),
            ClusterKey::Value(_) => false,
        };
        let max_messages = self.options.max_messages;
        let max_idle = self.options.max_idle;

        let victims: Vec<Rc<Session>> = {
            let sessions = self.sessions.borrow();
            let mut victims = Vec::new();
            for s in sessions.iter() {
                if !s.is_free() {
                    break;
                }
                let expired = now.saturating_duration_since(s.free_time.get()) >= max_idle;
                if force
                    || s.is_closed()
                    || weak_gone
                    || (max_messages > 0 && s.message_count.get() >= max_messages)
                    || expired
                {
                    victims.push(Rc::clone(s));
                }
            }
            victims
        };

        for session in victims {
            debug!(
                shares = session.share_count.get(),
                messages = session.message_count.get(),
                "recycling idle session"
            );
            session.unlink();
            session.detach();
        }
    }
}

struct PoolInner {
    clusters: RefCell<HashMap<KeyValue, Rc<ClusterInner>>>,
    weak_clusters: RefCell<HashMap<usize, Rc<ClusterInner>>>,
    recycle: RefCell<Vec<Weak<ClusterInner>>>,
    has_shutdown: Cell<bool>,
}

impl PoolInner {
    fn unschedule(&self, cluster: &ClusterInner) {
        self.recycle
            .borrow_mut()
            .retain(|w| !w.upgrade().is_some_and(|c| std::ptr::eq(&*c, cluster)));
    }
}

/// Per-worker container of session clusters. Clones share the pool;
/// every mux filter template owns one pool shared by all its clones.
#[derive(Clone)]
pub struct SessionPool {
    inner: Rc<PoolInner>,
}

impl SessionPool {
    /// Creates an empty pool and registers it for worker-driven
    /// recycling ticks.
    #[must_use]
    pub fn new() -> Self {
        let pool = Self {
            inner: Rc::new(PoolInner {
                clusters: RefCell::new(HashMap::new()),
                weak_clusters: RefCell::new(HashMap::new()),
                recycle: RefCell::new(Vec::new()),
                has_shutdown: Cell::new(false),
            }),
        };
        ALL_POOLS.with(|pools| pools.borrow_mut().push(Rc::downgrade(&pool.inner)));
        pool
    }

    /// Finds or creates the cluster for `key` and admits one muxer
    /// onto a session. Object keys cluster weakly by identity;
    /// everything else by value.
    pub fn alloc(
        &self,
        key: &Value,
        make_cluster: impl FnOnce() -> ClusterConfig,
    ) -> Rc<Session> {
        if let Some(object) = key.as_object() {
            let addr = Rc::as_ptr(object).cast::<()>() as usize;
            let existing = self.inner.weak_clusters.borrow().get(&addr).cloned();
            let cluster = existing.unwrap_or_else(|| {
                let cluster = ClusterInner::create(
                    &self.inner,
                    ClusterKey::Object { addr, handle: Rc::downgrade(object) },
                    make_cluster(),
                );
                self.inner
                    .weak_clusters
                    .borrow_mut()
                    .insert(addr, Rc::clone(&cluster));
                cluster
            });
            return cluster.alloc();
        }

        let key = KeyValue::new(key).expect("non-object keys are hashable");
        let existing = self.inner.clusters.borrow().get(&key).cloned();
        let cluster = existing.unwrap_or_else(|| {
            let cluster = ClusterInner::create(
                &self.inner,
                ClusterKey::Value(key.clone()),
                make_cluster(),
            );
            self.inner
                .clusters
                .borrow_mut()
                .insert(key, Rc::clone(&cluster));
            cluster
        });
        cluster.alloc()
    }

    /// Disables idle keep-alive: every idle session recycles on the
    /// next tick.
    pub fn shutdown(&self) {
        self.inner.has_shutdown.set(true);
    }

    /// True when a cluster already exists for `key`.
    #[must_use]
    pub fn has_cluster(&self, key: &Value) -> bool {
        if let Some(object) = key.as_object() {
            let addr = Rc::as_ptr(object).cast::<()>() as usize;
            return self.inner.weak_clusters.borrow().contains_key(&addr);
        }
        KeyValue::new(key).is_some_and(|k| self.inner.clusters.borrow().contains_key(&k))
    }

    /// Total clusters (value-keyed plus weak-keyed).
    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.inner.clusters.borrow().len() + self.inner.weak_clusters.borrow().len()
    }

    /// Session count for `key`'s cluster, zero when absent.
    #[must_use]
    pub fn session_count(&self, key: &Value) -> usize {
        if let Some(object) = key.as_object() {
            let addr = Rc::as_ptr(object).cast::<()>() as usize;
            return self
                .inner
                .weak_clusters
                .borrow()
                .get(&addr)
                .map_or(0, |c| c.sessions.borrow().len());
        }
        KeyValue::new(key)
            .and_then(|k| self.inner.clusters.borrow().get(&k).cloned())
            .map_or(0, |c| c.sessions.borrow().len())
    }

    /// One recycling pass over clusters with idle head sessions.
    /// Called once per second by the worker; tests call it directly
    /// with synthetic `now` values.
    pub fn recycle_tick(&self, now: Instant) {
        let force = self.inner.has_shutdown.get();
        let scheduled: Vec<_> = self.inner.recycle.borrow().clone();
        for weak in scheduled {
            if let Some(cluster) = weak.upgrade() {
                cluster.recycle(now, force);
            }
        }
        self.inner
            .recycle
            .borrow_mut()
            .retain(|w| w.upgrade().is_some());
    }

    /// Ticks every pool on this worker thread.
    pub fn tick_all(now: Instant) {
        let pools: Vec<_> = ALL_POOLS.with(|pools| {
            pools.borrow_mut().retain(|w| w.upgrade().is_some());
            pools.borrow().clone()
        });
        for weak in pools {
            if let Some(inner) = weak.upgrade() {
                SessionPool { inner }.recycle_tick(now);
            }
        }
    }
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("clusters", &self.cluster_count())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static ALL_POOLS: RefCell<Vec<Weak<PoolInner>>> = RefCell::new(Vec::new());
}
