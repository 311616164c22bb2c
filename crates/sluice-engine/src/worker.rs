//! Worker: one engine per thread.
//!
//! A worker takes [`ModuleBindings`] and stands them up: a listener
//! per `listen` declaration, a timed pipeline per `task`, a one-shot
//! pipeline per `read`. It also runs the maintenance tick that drives
//! session recycling and drains the deferred-task queue once per
//! second. Multiple workers are independent: each has its own event
//! loop, session pools and listeners, sharing traffic only through
//! `SO_REUSEPORT`.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use sluice_core::config::ModuleBindings;
use sluice_core::data::Data;
use sluice_core::event::Event;
use sluice_core::filters::mux::SessionPool;
use sluice_core::scheduler;
use sluice_net::{Listener, ListenerOptions};

use crate::EngineError;

/// A running worker. Dropping it (or calling [`Worker::stop`]) stops
/// its listeners and background tasks.
pub struct Worker {
    bindings: Rc<ModuleBindings>,
    listeners: Vec<Listener>,
    stop: Option<watch::Sender<bool>>,
}

impl Worker {
    /// Stands the bindings up. Must run inside a `LocalSet` on a
    /// current-thread runtime.
    ///
    /// # Errors
    ///
    /// Fails when any listener cannot bind; nothing keeps running on
    /// failure.
    pub fn start(bindings: ModuleBindings) -> Result<Self, EngineError> {
        let bindings = Rc::new(bindings);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut listeners: Vec<Listener> = Vec::with_capacity(bindings.listens.len());
        for listen in &bindings.listens {
            let listener = Listener::new(listen.addr);
            listener.set_options(ListenerOptions::from(&listen.config));
            let for_context = Rc::clone(&bindings);
            listener.set_context_factory(Rc::new(move |inbound| {
                for_context.new_context(Some(inbound))
            }));
            if let Err(err) = listener.pipeline_layout(Some(listen.layout.clone())) {
                for started in &listeners {
                    let _ = started.pipeline_layout(None);
                }
                return Err(err.into());
            }
            listeners.push(listener);
        }

        for task in &bindings.tasks {
            spawn_task(Rc::clone(&bindings), task.layout.clone(), task.interval, stop_rx.clone());
        }

        for read in &bindings.reads {
            spawn_read(Rc::clone(&bindings), read.layout.clone(), read.path.clone());
        }

        spawn_maintenance(stop_rx);

        info!(
            listeners = listeners.len(),
            tasks = bindings.tasks.len(),
            reads = bindings.reads.len(),
            "worker started"
        );
        Ok(Self { bindings, listeners, stop: Some(stop_tx) })
    }

    /// The listeners this worker runs, in declaration order.
    #[must_use]
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    /// The bound module.
    #[must_use]
    pub fn bindings(&self) -> &ModuleBindings {
        &self.bindings
    }

    /// Stops listeners and background tasks.
    pub fn stop(&mut self) {
        for listener in &self.listeners {
            let _ = listener.pipeline_layout(None);
        }
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(true);
        }
        info!("worker stopped");
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.stop.is_some() {
            self.stop();
        }
    }
}

/// Runs a task pipeline once per interval (or once at startup when no
/// interval was declared).
fn spawn_task(
    bindings: Rc<ModuleBindings>,
    layout: sluice_core::pipeline::PipelineLayout,
    interval: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    tokio::task::spawn_local(async move {
        loop {
            let ctx = Rc::new(RefCell::new(bindings.new_context(None)));
            let pipeline = layout.alloc(ctx);
            let input = pipeline.input();
            input.feed(Event::StreamStart);
            input.feed(Event::stream_end());
            drop(pipeline);
            scheduler::drain();

            let Some(every) = interval else { return };
            tokio::select! {
                () = tokio::time::sleep(every) => {}
                _ = stop.changed() => return,
            }
        }
    });
}

/// Streams a file through its pipeline as one `Data` plus `StreamEnd`.
fn spawn_read(
    bindings: Rc<ModuleBindings>,
    layout: sluice_core::pipeline::PipelineLayout,
    path: std::path::PathBuf,
) {
    tokio::task::spawn_local(async move {
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(error) => {
                warn!(path = %path.display(), %error, "read declaration failed");
                return;
            }
        };
        let ctx = Rc::new(RefCell::new(bindings.new_context(None)));
        let pipeline = layout.alloc(ctx);
        let input = pipeline.input();
        input.feed(Event::Data(Data::from_slice(&content)));
        input.feed(Event::stream_end());
        drop(pipeline);
        scheduler::drain();
    });
}

/// Once per second: recycle idle sessions and run deferred work.
fn spawn_maintenance(mut stop: watch::Receiver<bool>) {
    tokio::task::spawn_local(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    SessionPool::tick_all(Instant::now());
                    scheduler::drain();
                }
                _ = stop.changed() => return,
            }
        }
    });
}
