//! Outbound TCP client.
//!
//! An [`Outbound`] dials `host:port` through the lifecycle
//! `Idle -> Resolving -> Connecting -> Connected -> Closed`, retrying
//! transport failures up to `retry_count` times with `retry_delay`
//! between attempts. Writes buffer until the socket is up, bounded by
//! `buffer_limit`; an overflowing write is discarded and counted.
//! Received bytes flow to the owner as `Data` events, terminated by
//! one `StreamEnd`.
//!
//! The [`Connect`] filter is the pipeline face of an outbound: `Data`
//! in becomes socket writes, upstream `StreamEnd` finishes the write
//! side, and socket traffic comes back out of the filter.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, warn};

use sluice_core::context::Context;
use sluice_core::data::Data;
use sluice_core::event::{Event, StreamError};
use sluice_core::filter::{Filter, FilterContext, FilterDump};
use sluice_core::input::Input;
use sluice_core::scheduler;

thread_local! {
    static ALL_OUTBOUNDS: RefCell<Vec<Weak<OutboundInner>>> = RefCell::new(Vec::new());
}

/// Outbound tuning.
#[derive(Debug, Clone)]
pub struct OutboundOptions {
    /// Max bytes buffered ahead of the socket; zero means unlimited.
    pub buffer_limit: usize,
    /// Transport failures tolerated before giving up.
    pub retry_count: usize,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Per-attempt connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Per-read timeout.
    pub read_timeout: Option<Duration>,
    /// Per-write timeout.
    pub write_timeout: Option<Duration>,
}

impl Default for OutboundOptions {
    fn default() -> Self {
        Self {
            buffer_limit: 0,
            retry_count: 0,
            retry_delay: Duration::from_secs(1),
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
        }
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// Not started.
    Idle,
    /// Resolving the host name.
    Resolving,
    /// TCP connect in flight.
    Connecting,
    /// Connected and pumping.
    Connected,
    /// Finished, successfully or not.
    Closed,
}

struct OutboundInner {
    host: RefCell<String>,
    port: Cell<u16>,
    address: RefCell<String>,
    state: Cell<OutboundState>,
    output: Input,
    options: OutboundOptions,
    retries: Cell<usize>,
    buffer: RefCell<Data>,
    overflowed: Cell<bool>,
    discarded_data_size: Cell<usize>,
    ended: Cell<bool>,
    cancelled: Cell<bool>,
    connection_time: Cell<Option<Duration>>,
    wake: Rc<Notify>,
}

/// A client connection handle.
#[derive(Clone)]
pub struct Outbound {
    inner: Rc<OutboundInner>,
}

impl Outbound {
    /// Creates an idle outbound whose received events go to `output`.
    #[must_use]
    pub fn new(output: Input, options: OutboundOptions) -> Self {
        let inner = Rc::new(OutboundInner {
            host: RefCell::new(String::new()),
            port: Cell::new(0),
            address: RefCell::new(String::new()),
            state: Cell::new(OutboundState::Idle),
            output,
            options,
            retries: Cell::new(0),
            buffer: RefCell::new(Data::new()),
            overflowed: Cell::new(false),
            discarded_data_size: Cell::new(0),
            ended: Cell::new(false),
            cancelled: Cell::new(false),
            connection_time: Cell::new(None),
            wake: Rc::new(Notify::new()),
        });
        ALL_OUTBOUNDS.with(|all| all.borrow_mut().push(Rc::downgrade(&inner)));
        Self { inner }
    }

    /// Visits every live outbound on this worker.
    pub fn for_each(mut f: impl FnMut(&Outbound)) {
        let live: Vec<_> = ALL_OUTBOUNDS.with(|all| {
            all.borrow_mut().retain(|w| w.upgrade().is_some());
            all.borrow().iter().filter_map(Weak::upgrade).collect()
        });
        for inner in live {
            f(&Outbound { inner });
        }
    }

    /// The target host.
    #[must_use]
    pub fn host(&self) -> String {
        self.inner.host.borrow().clone()
    }

    /// The target port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port.get()
    }

    /// The resolved remote address, once connected.
    #[must_use]
    pub fn address(&self) -> String {
        self.inner.address.borrow().clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OutboundState {
        self.inner.state.get()
    }

    /// True while connected.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.inner.state.get() == OutboundState::Connected
    }

    /// Bytes awaiting the socket.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.buffer.borrow().len()
    }

    /// True once a write overflowed the buffer limit.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.inner.overflowed.get()
    }

    /// Bytes discarded by overflowing writes.
    #[must_use]
    pub fn discarded_data_size(&self) -> usize {
        self.inner.discarded_data_size.get()
    }

    /// True once the write side finished.
    #[must_use]
    pub fn ended(&self) -> bool {
        self.inner.ended.get()
    }

    /// Connection attempts beyond the first.
    #[must_use]
    pub fn retries(&self) -> usize {
        self.inner.retries.get()
    }

    /// Time from `connect` to the socket opening.
    #[must_use]
    pub fn connection_time(&self) -> Option<Duration> {
        self.inner.connection_time.get()
    }

    /// Starts dialing. Must be called on the worker runtime.
    pub fn connect(&self, host: &str, port: u16) {
        *self.inner.host.borrow_mut() = host.to_string();
        self.inner.port.set(port);
        let inner = Rc::clone(&self.inner);
        tokio::task::spawn_local(run_outbound(inner));
    }

    /// Queues bytes for the socket, subject to the buffer limit.
    pub fn send(&self, data: Data) {
        if self.inner.ended.get() || self.inner.state.get() == OutboundState::Closed {
            return;
        }
        let limit = self.inner.options.buffer_limit;
        let mut buffer = self.inner.buffer.borrow_mut();
        if limit > 0 && buffer.len() + data.len() > limit {
            self.inner.overflowed.set(true);
            self.inner
                .discarded_data_size
                .set(self.inner.discarded_data_size.get() + data.len());
            return;
        }
        buffer.push(data);
        drop(buffer);
        self.inner.wake.notify_one();
    }

    /// Finishes the output side; the socket closes once the buffer has
    /// drained and the peer is done.
    pub fn end(&self) {
        self.inner.ended.set(true);
        self.inner.wake.notify_one();
    }

    /// Abandons the connection without emitting further events.
    pub fn cancel(&self) {
        self.inner.cancelled.set(true);
        self.inner.state.set(OutboundState::Closed);
        self.inner.wake.notify_one();
    }
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("host", &self.host())
            .field("port", &self.port())
            .field("state", &self.state())
            .field("retries", &self.retries())
            .finish_non_exhaustive()
    }
}

impl OutboundInner {
    fn emit(&self, evt: Event) {
        if !self.cancelled.get() {
            self.output.feed(evt);
            scheduler::drain();
        }
    }
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

/// Dial, pump, and retry until the stream finishes or the budget is
/// spent.
async fn run_outbound(inner: Rc<OutboundInner>) {
    let started = Instant::now();
    loop {
        if inner.cancelled.get() {
            return;
        }
        match attempt(&inner, started).await {
            Ok(()) => {
                inner.state.set(OutboundState::Closed);
                inner.emit(Event::stream_end());
                return;
            }
            Err(error) => {
                if inner.cancelled.get() {
                    return;
                }
                let retries = inner.retries.get();
                if retries < inner.options.retry_count {
                    inner.retries.set(retries + 1);
                    warn!(
                        host = %inner.host.borrow(),
                        port = inner.port.get(),
                        attempt = retries + 1,
                        ?error,
                        "outbound failed, scheduling retry"
                    );
                    tokio::time::sleep(inner.options.retry_delay).await;
                } else {
                    inner.state.set(OutboundState::Closed);
                    inner.emit(Event::StreamEnd(Some(error)));
                    return;
                }
            }
        }
    }
}

/// One connection attempt: resolve, connect, pump until end of stream.
async fn attempt(inner: &Rc<OutboundInner>, started: Instant) -> Result<(), StreamError> {
    inner.state.set(OutboundState::Resolving);
    let target = format!("{}:{}", inner.host.borrow(), inner.port.get());
    let mut addrs = tokio::net::lookup_host(&target)
        .await
        .map_err(|_| StreamError::ConnectionRefused)?;
    let addr = addrs.next().ok_or(StreamError::ConnectionRefused)?;

    inner.state.set(OutboundState::Connecting);
    let stream = match with_timeout(inner.options.connect_timeout, TcpStream::connect(addr)).await
    {
        Some(Ok(stream)) => stream,
        Some(Err(_)) => return Err(StreamError::ConnectionRefused),
        None => return Err(StreamError::ConnectionTimeout),
    };
    let _ = stream.set_nodelay(true);

    inner.state.set(OutboundState::Connected);
    if inner.connection_time.get().is_none() {
        inner.connection_time.set(Some(started.elapsed()));
    }
    *inner.address.borrow_mut() = addr.to_string();
    debug!(addr = %addr, "outbound connected");

    let (mut reader, mut writer) = stream.into_split();
    let mut read_buf = BytesMut::with_capacity(16 * 1024);
    let mut write_shut = false;

    loop {
        if inner.cancelled.get() {
            return Ok(());
        }

        // Drain pending writes first.
        let pending = std::mem::take(&mut *inner.buffer.borrow_mut());
        if !pending.is_empty() {
            let bytes = pending.to_bytes();
            match with_timeout(inner.options.write_timeout, writer.write_all(&bytes)).await {
                Some(Ok(())) => {}
                Some(Err(_)) => return Err(StreamError::ConnectionReset),
                None => return Err(StreamError::WriteTimeout),
            }
            continue;
        }
        if inner.ended.get() && !write_shut {
            let _ = writer.shutdown().await;
            write_shut = true;
        }

        let wake = Rc::clone(&inner.wake);
        tokio::select! {
            read = with_timeout(inner.options.read_timeout, reader.read_buf(&mut read_buf)) => {
                match read {
                    Some(Ok(0)) => return Ok(()),
                    Some(Ok(_)) => {
                        let chunk = read_buf.split().freeze();
                        inner.emit(Event::Data(Data::from(chunk)));
                    }
                    Some(Err(_)) => return Err(StreamError::ConnectionReset),
                    None => return Err(StreamError::ReadTimeout),
                }
            }
            () = wake.notified() => {}
        }
    }
}

/// Where the connect filter's target comes from.
#[derive(Clone)]
pub enum ConnectTarget {
    /// A fixed `"host:port"`.
    Static(String),
    /// Evaluated from the context on the first event.
    Dynamic(Rc<dyn Fn(&Context) -> Result<String, StreamError>>),
}

/// Pipeline filter opening an outbound connection.
pub struct Connect {
    target: ConnectTarget,
    options: OutboundOptions,
    output: Input,
    outbound: Option<Outbound>,
}

impl Connect {
    /// Creates a connect filter dialing `target`.
    #[must_use]
    pub fn new(target: ConnectTarget, options: OutboundOptions) -> Self {
        Self {
            target,
            options,
            output: Input::null(),
            outbound: None,
        }
    }

    fn ensure_outbound(&mut self, cx: &FilterContext<'_>) -> Result<(), StreamError> {
        if self.outbound.is_some() {
            return Ok(());
        }
        let target = match &self.target {
            ConnectTarget::Static(t) => t.clone(),
            ConnectTarget::Dynamic(f) => f(&cx.context().borrow())?,
        };
        let (host, port) = target
            .rsplit_once(':')
            .and_then(|(h, p)| p.parse::<u16>().ok().map(|p| (h.to_string(), p)))
            .ok_or(StreamError::ProtocolError)?;
        let outbound = Outbound::new(self.output.clone(), self.options.clone());
        outbound.connect(&host, port);
        self.outbound = Some(outbound);
        Ok(())
    }
}

impl Filter for Connect {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "connect", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(Connect::new(self.target.clone(), self.options.clone()))
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            outbound.cancel();
        }
    }

    fn process(&mut self, cx: &mut FilterContext<'_>, evt: Event) {
        if let Err(err) = self.ensure_outbound(cx) {
            cx.fail(&self.output, err);
            return;
        }
        let Some(outbound) = self.outbound.as_ref() else {
            return;
        };
        match evt {
            Event::Data(data) => outbound.send(data),
            Event::StreamEnd(_) => outbound.end(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_limit_discards_overflow() {
        let outbound = Outbound::new(
            Input::null(),
            OutboundOptions { buffer_limit: 4, ..OutboundOptions::default() },
        );
        outbound.send(Data::from_slice(b"abcd"));
        assert_eq!(outbound.buffered(), 4);
        assert!(!outbound.overflowed());

        outbound.send(Data::from_slice(b"xy"));
        assert!(outbound.overflowed());
        assert_eq!(outbound.discarded_data_size(), 2);
        assert_eq!(outbound.buffered(), 4, "overflowing write dropped whole");
    }

    #[test]
    fn test_send_after_end_is_dropped() {
        let outbound = Outbound::new(Input::null(), OutboundOptions::default());
        outbound.end();
        outbound.send(Data::from_slice(b"late"));
        assert_eq!(outbound.buffered(), 0);
        assert!(outbound.ended());
    }

    #[test]
    fn test_initial_state() {
        let outbound = Outbound::new(Input::null(), OutboundOptions::default());
        assert_eq!(outbound.state(), OutboundState::Idle);
        assert_eq!(outbound.retries(), 0);
        assert_eq!(outbound.connection_time(), None);
    }

    #[tokio::test]
    async fn test_connect_refused_exhausts_retries() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let log = sluice_core::input::EventLog::new();
                let outbound = Outbound::new(
                    log.input(),
                    OutboundOptions {
                        retry_count: 1,
                        retry_delay: Duration::from_millis(10),
                        ..OutboundOptions::default()
                    },
                );
                // A port nothing listens on.
                outbound.connect("127.0.0.1", 1);
                tokio::time::sleep(Duration::from_millis(300)).await;
                assert_eq!(outbound.state(), OutboundState::Closed);
                assert_eq!(outbound.retries(), 1);
                assert_eq!(
                    log.events().last().and_then(Event::stream_error),
                    Some(StreamError::ConnectionRefused)
                );
            })
            .await;
    }

    #[tokio::test]
    async fn test_round_trip_against_local_server() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let server = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
                let addr = server.local_addr().unwrap();
                tokio::task::spawn_local(async move {
                    let (mut sock, _) = server.accept().await.unwrap();
                    let mut buf = [0u8; 64];
                    let n = sock.read(&mut buf).await.unwrap();
                    sock.write_all(&buf[..n]).await.unwrap();
                });

                let log = sluice_core::input::EventLog::new();
                let outbound = Outbound::new(log.input(), OutboundOptions::default());
                outbound.connect(&addr.ip().to_string(), addr.port());
                outbound.send(Data::from_slice(b"ping"));
                outbound.end();

                tokio::time::sleep(Duration::from_millis(300)).await;
                assert_eq!(log.bytes(), b"ping");
                assert!(matches!(
                    log.events().last(),
                    Some(Event::StreamEnd(None))
                ));
                assert_eq!(outbound.state(), OutboundState::Closed);
                assert!(outbound.connection_time().is_some());
            })
            .await;
    }
}
