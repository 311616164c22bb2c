//! One accepted connection.
//!
//! An inbound pumps socket bytes into its pipeline as `Data` events
//! and writes whatever the pipeline outputs back to the socket,
//! honoring the listener's read/write/idle timeouts. The peer
//! half-closing produces a clean `StreamEnd`; with `close_eof` set it
//! also tears the connection down immediately.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use sluice_core::context::Context;
use sluice_core::data::Data;
use sluice_core::event::{Event, StreamError};
use sluice_core::input::Input;
use sluice_core::pipeline::PipelineLayout;
use sluice_core::scheduler;

use crate::listener::{ContextFactory, ListenerOptions};

thread_local! {
    static NEXT_ID: Cell<u64> = const { Cell::new(1) };
}

/// Identity and addresses of one accepted connection. An `Rc` of this
/// is the connection's object identity, the default mux session key.
pub struct InboundInfo {
    id: u64,
    peer: SocketAddr,
    local: SocketAddr,
}

impl InboundInfo {
    /// Connection id, monotonic per worker.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer's address.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The local accepted address.
    #[must_use]
    pub fn local(&self) -> SocketAddr {
        self.local
    }
}

impl std::fmt::Debug for InboundInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Inbound#{} {} -> {}", self.id, self.peer, self.local)
    }
}

/// Accepts one connection: builds the pipeline with a fresh context,
/// then pumps both directions until the stream ends.
pub(crate) fn spawn_inbound(
    listener: Weak<crate::listener::ListenerInner>,
    stream: TcpStream,
    peer: SocketAddr,
    layout: PipelineLayout,
    options: ListenerOptions,
    context_factory: Option<ContextFactory>,
) {
    let local = stream.local_addr().unwrap_or(peer);
    let id = NEXT_ID.with(|n| {
        let id = n.get();
        n.set(id + 1);
        id
    });
    let info = Rc::new(InboundInfo { id, peer, local });
    debug!(inbound = info.id, peer = %peer, "connection accepted");

    if let Some(l) = listener.upgrade() {
        l.open_inbound(Rc::clone(&info));
    }

    let identity: Rc<dyn Any> = Rc::clone(&info) as Rc<dyn Any>;
    let context = match context_factory {
        Some(factory) => factory(&identity),
        None => Context::with_inbound(&identity),
    };

    tokio::task::spawn_local(async move {
        let pipeline = layout.alloc(Rc::new(RefCell::new(context)));
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Event>();
        pipeline.set_output(Input::from_fn(move |evt| {
            let _ = out_tx.send(evt);
        }));
        let input = pipeline.input();

        run_connection(stream, &input, out_rx, &options).await;

        drop(pipeline);
        scheduler::drain();
        if let Some(l) = listener.upgrade() {
            l.close_inbound(&info);
        }
        debug!(inbound = info.id, "connection closed");
    });
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

async fn idle_guard(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_lines)]
async fn run_connection(
    stream: TcpStream,
    input: &Input,
    mut output: mpsc::UnboundedReceiver<Event>,
    options: &ListenerOptions,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut read_done = false;
    let mut write_done = false;

    loop {
        tokio::select! {
            // Socket -> pipeline.
            read = with_timeout(options.read_timeout, reader.read_buf(&mut read_buf)),
                if !read_done =>
            {
                match read {
                    Some(Ok(0)) => {
                        read_done = true;
                        input.feed(Event::stream_end());
                        scheduler::drain();
                        if options.close_eof || write_done {
                            break;
                        }
                    }
                    Some(Ok(_)) => {
                        let chunk = read_buf.split().freeze();
                        input.feed(Event::Data(Data::from(chunk)));
                        scheduler::drain();
                    }
                    Some(Err(_)) => {
                        input.feed(Event::StreamEnd(Some(StreamError::ConnectionReset)));
                        scheduler::drain();
                        break;
                    }
                    None => {
                        input.feed(Event::StreamEnd(Some(StreamError::ReadTimeout)));
                        scheduler::drain();
                        break;
                    }
                }
            }

            // Pipeline -> socket.
            evt = output.recv(), if !write_done => {
                match evt {
                    Some(Event::Data(data)) => {
                        let bytes = data.to_bytes();
                        match with_timeout(options.write_timeout, writer.write_all(&bytes)).await {
                            Some(Ok(())) => {}
                            Some(Err(_)) => {
                                input.feed(Event::StreamEnd(Some(StreamError::ConnectionReset)));
                                scheduler::drain();
                                break;
                            }
                            None => {
                                input.feed(Event::StreamEnd(Some(StreamError::WriteTimeout)));
                                scheduler::drain();
                                break;
                            }
                        }
                    }
                    Some(Event::StreamEnd(_)) | None => {
                        write_done = true;
                        let _ = writer.shutdown().await;
                        if read_done {
                            break;
                        }
                    }
                    Some(_) => {}
                }
            }

            // Whole-connection inactivity.
            () = idle_guard(options.idle_timeout) => {
                input.feed(Event::StreamEnd(Some(StreamError::IdleTimeout)));
                scheduler::drain();
                break;
            }
        }

        if read_done && write_done {
            break;
        }
    }
}
