//! TCP listener with connection admission.
//!
//! A [`Listener`] owns one bind address. Giving it a pipeline layout
//! starts the acceptor; taking the layout away stops it. Each accepted
//! connection drives one pipeline instance (see [`crate::inbound`]).
//! Admission control pauses the acceptor while
//! `max_connections` are live and resumes it within one event-loop
//! turn of a connection closing.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tracing::{info, warn};

use sluice_core::config::ListenConfig;
use sluice_core::context::Context;
use sluice_core::pipeline::PipelineLayout;

use crate::inbound::{spawn_inbound, InboundInfo};
use crate::{socket, NetError};

/// Process-wide `SO_REUSEPORT` selector, one flag for every listener.
static REUSE_PORT: AtomicBool = AtomicBool::new(false);

thread_local! {
    static ALL_LISTENERS: RefCell<Vec<Weak<ListenerInner>>> = RefCell::new(Vec::new());
    static RESERVED_PORTS: RefCell<HashSet<u16>> = RefCell::new(HashSet::new());
}

/// Builds the per-connection context; installed by the worker so
/// module-imported variables reach every connection.
pub type ContextFactory = Rc<dyn Fn(&Rc<dyn Any>) -> Context>;

/// Runtime listener options.
#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    /// Max simultaneous connections; zero means unlimited.
    pub max_connections: usize,
    /// Per-read timeout.
    pub read_timeout: Option<Duration>,
    /// Per-write timeout.
    pub write_timeout: Option<Duration>,
    /// Whole-connection inactivity timeout.
    pub idle_timeout: Option<Duration>,
    /// Transparent proxying (Linux `IP_TRANSPARENT`).
    pub transparent: bool,
    /// Close as soon as the peer half-closes.
    pub close_eof: bool,
}

impl From<&ListenConfig> for ListenerOptions {
    fn from(config: &ListenConfig) -> Self {
        let seconds = |s: f64| {
            if s > 0.0 {
                Some(Duration::from_secs_f64(s))
            } else {
                None
            }
        };
        Self {
            max_connections: config.max_connections,
            read_timeout: seconds(config.read_timeout),
            write_timeout: seconds(config.write_timeout),
            idle_timeout: seconds(config.idle_timeout),
            transparent: config.transparent,
            close_eof: config.close_eof,
        }
    }
}

pub(crate) struct ListenerInner {
    addr: SocketAddr,
    bound_addr: Cell<Option<SocketAddr>>,
    options: RefCell<ListenerOptions>,
    layout: RefCell<Option<PipelineLayout>>,
    context_factory: RefCell<Option<ContextFactory>>,
    inbounds: RefCell<Vec<Rc<InboundInfo>>>,
    peak_connections: Cell<usize>,
    paused: Cell<bool>,
    resume: Rc<Notify>,
    stop: RefCell<Option<watch::Sender<bool>>>,
}

impl ListenerInner {
    fn at_capacity(&self) -> bool {
        let max = self.options.borrow().max_connections;
        max > 0 && self.inbounds.borrow().len() >= max
    }

    /// Registers an accepted connection; pauses the acceptor when the
    /// limit is reached.
    pub(crate) fn open_inbound(&self, info: Rc<InboundInfo>) {
        let mut inbounds = self.inbounds.borrow_mut();
        inbounds.push(info);
        self.peak_connections
            .set(self.peak_connections.get().max(inbounds.len()));
        drop(inbounds);
        if self.at_capacity() {
            self.paused.set(true);
        }
    }

    /// Unregisters a closed connection; resumes the acceptor when back
    /// under the limit.
    pub(crate) fn close_inbound(&self, info: &Rc<InboundInfo>) {
        self.inbounds
            .borrow_mut()
            .retain(|i| !Rc::ptr_eq(i, info));
        if self.paused.get() && !self.at_capacity() {
            self.paused.set(false);
            self.resume.notify_one();
        }
    }
}

/// One listening endpoint.
#[derive(Clone)]
pub struct Listener {
    inner: Rc<ListenerInner>,
}

impl Listener {
    /// Creates an idle listener on `addr` and registers it on the
    /// worker's roster.
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        let inner = Rc::new(ListenerInner {
            addr,
            bound_addr: Cell::new(None),
            options: RefCell::new(ListenerOptions::default()),
            layout: RefCell::new(None),
            context_factory: RefCell::new(None),
            inbounds: RefCell::new(Vec::new()),
            peak_connections: Cell::new(0),
            paused: Cell::new(false),
            resume: Rc::new(Notify::new()),
            stop: RefCell::new(None),
        });
        ALL_LISTENERS.with(|all| all.borrow_mut().push(Rc::downgrade(&inner)));
        Self { inner }
    }

    /// Selects `SO_REUSEPORT` for every listener started afterwards.
    pub fn set_reuse_port(reuse: bool) {
        REUSE_PORT.store(reuse, Ordering::Relaxed);
    }

    /// Marks a port as refusing pipeline bindings (admin endpoints).
    pub fn reserve_port(port: u16) {
        RESERVED_PORTS.with(|r| r.borrow_mut().insert(port));
    }

    /// Finds a listener on this worker by address.
    #[must_use]
    pub fn find(addr: SocketAddr) -> Option<Listener> {
        ALL_LISTENERS.with(|all| {
            all.borrow_mut().retain(|w| w.upgrade().is_some());
            all.borrow()
                .iter()
                .filter_map(Weak::upgrade)
                .find(|l| l.addr == addr)
                .map(|inner| Listener { inner })
        })
    }

    /// The bind address as requested.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    /// The actual bound address (resolves port 0), once started.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.inner.bound_addr.get()
    }

    /// Currently live connections.
    #[must_use]
    pub fn live_connections(&self) -> usize {
        self.inner.inbounds.borrow().len()
    }

    /// High-water mark of live connections.
    #[must_use]
    pub fn peak_connections(&self) -> usize {
        self.inner.peak_connections.get()
    }

    /// Installs the per-connection context factory.
    pub fn set_context_factory(&self, factory: ContextFactory) {
        *self.inner.context_factory.borrow_mut() = Some(factory);
    }

    /// Replaces the options. Applies admission immediately: an
    /// over-limit listener pauses, an under-limit one resumes.
    pub fn set_options(&self, options: ListenerOptions) {
        *self.inner.options.borrow_mut() = options;
        if self.inner.layout.borrow().is_some() {
            if self.inner.at_capacity() {
                self.inner.paused.set(true);
            } else if self.inner.paused.get() {
                self.inner.paused.set(false);
                self.inner.resume.notify_one();
            }
        }
    }

    /// Binds a pipeline layout, starting the acceptor if it was idle;
    /// `None` stops it. Must be called on the worker runtime.
    ///
    /// # Errors
    ///
    /// [`NetError::PortReserved`] for reserved ports, otherwise socket
    /// setup failures.
    pub fn pipeline_layout(&self, layout: Option<PipelineLayout>) -> Result<(), NetError> {
        let had = self.inner.layout.borrow().is_some();
        match layout {
            Some(layout) => {
                if RESERVED_PORTS.with(|r| r.borrow().contains(&self.inner.addr.port())) {
                    return Err(NetError::PortReserved(self.inner.addr.port()));
                }
                *self.inner.layout.borrow_mut() = Some(layout);
                if !had {
                    self.start()?;
                }
            }
            None => {
                *self.inner.layout.borrow_mut() = None;
                if had {
                    self.close();
                }
            }
        }
        Ok(())
    }

    fn start(&self) -> Result<(), NetError> {
        let inner = Rc::clone(&self.inner);
        let options = inner.options.borrow().clone();
        let listener = socket::bind_listener(
            inner.addr,
            REUSE_PORT.load(Ordering::Relaxed),
            options.transparent,
        )?;

        if let Ok(bound) = listener.local_addr() {
            inner.bound_addr.set(Some(bound));
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *inner.stop.borrow_mut() = Some(stop_tx);
        info!(addr = %inner.addr, "listening");

        tokio::task::spawn_local(async move {
            loop {
                // Admission gate: while at capacity, accept nothing.
                while inner.paused.get() {
                    let resume = Rc::clone(&inner.resume);
                    tokio::select! {
                        () = resume.notified() => {}
                        _ = stop_rx.changed() => return,
                    }
                }

                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            let layout = inner.layout.borrow().clone();
                            let Some(layout) = layout else { continue };
                            let _ = stream.set_nodelay(true);
                            spawn_inbound(
                                Rc::downgrade(&inner),
                                stream,
                                peer,
                                layout,
                                inner.options.borrow().clone(),
                                inner.context_factory.borrow().clone(),
                            );
                        }
                        Err(error) => warn!(addr = %inner.addr, %error, "accept error"),
                    },
                    _ = stop_rx.changed() => {
                        info!(addr = %inner.addr, "stopped listening");
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        if let Some(stop) = self.inner.stop.borrow_mut().take() {
            let _ = stop.send(true);
        }
        info!(addr = %self.inner.addr, "listener closed");
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.inner.addr)
            .field("live", &self.live_connections())
            .field("peak", &self.peak_connections())
            .field("paused", &self.inner.paused.get())
            .finish()
    }
}
