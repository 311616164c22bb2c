//! Ordered multiplexing core.
//!
//! A [`QueueMuxer`] funnels many upstream logical streams onto one
//! shared session with strict FIFO response matching: replies coming
//! back from the session are dispatched to the head of the queue until
//! its message count is satisfied, then the next stream takes over. No
//! stream starts replying before all earlier streams have finished.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::data::Data;
use crate::event::Event;
use crate::input::{EventTarget, Input};

use super::session::{SessionMuxer, StreamCtl, StreamHandle};

/// The FIFO reply-matching muxer living inside a queue session.
#[derive(Clone)]
pub struct QueueMuxer {
    inner: Rc<QueueInner>,
}

struct QueueInner {
    /// Toward the session pipeline.
    forward: RefCell<Input>,
    /// Streams awaiting replies; head is currently replying.
    streams: RefCell<VecDeque<Rc<StreamInner>>>,
    /// Once set, queue semantics stop and everything pipes to the head.
    dedicated: Cell<bool>,
}

impl QueueMuxer {
    /// Creates a muxer with no forward target yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(QueueInner {
                forward: RefCell::new(Input::null()),
                streams: RefCell::new(VecDeque::new()),
                dedicated: Cell::new(false),
            }),
        }
    }

    /// Streams currently queued for replies.
    #[must_use]
    pub fn queued_len(&self) -> usize {
        self.inner.streams.borrow().len()
    }

    /// Abandons queue semantics: every subsequent event in either
    /// direction pipes straight between the head stream and the
    /// session. Used by protocol filters after an upgrade.
    pub fn dedicate(&self) {
        self.inner.dedicated.set(true);
    }
}

impl Default for QueueMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMuxer for QueueMuxer {
    fn bind(&self, forward: Input) {
        *self.inner.forward.borrow_mut() = forward;
    }

    fn open_stream(&self, output: Input) -> StreamHandle {
        let stream = Rc::new(StreamInner {
            muxer: Rc::downgrade(&self.inner),
            output: RefCell::new(output),
            start: RefCell::new(None),
            buffer: RefCell::new(Data::new()),
            queued: Cell::new(0),
            one_way: Cell::new(false),
            started: Cell::new(false),
            dedicated: Cell::new(false),
        });
        StreamHandle::new(
            Input::new(Rc::new(StreamTarget(Rc::clone(&stream)))),
            stream,
        )
    }

    fn on_reply(&self, evt: Event) {
        let inner = &self.inner;

        if inner.dedicated.get() {
            let head = inner.streams.borrow().front().cloned();
            if let Some(s) = head {
                s.dedicated.set(true);
                s.emit(evt);
            }
            return;
        }

        match evt {
            Event::MessageStart(_) => {
                let head = inner.streams.borrow().front().cloned();
                if let Some(s) = head {
                    if !s.started.get() {
                        s.started.set(true);
                        s.emit(evt);
                    }
                }
            }
            Event::Data(_) => {
                let head = inner.streams.borrow().front().cloned();
                if let Some(s) = head {
                    if s.started.get() {
                        s.emit(evt);
                    }
                }
            }
            Event::MessageEnd(_) => {
                let head = inner.streams.borrow().front().cloned();
                if let Some(s) = head {
                    if s.started.get() {
                        let queued = s.queued.get() - 1;
                        s.queued.set(queued);
                        if queued == 0 {
                            inner.streams.borrow_mut().pop_front();
                        } else {
                            // More pipelined messages follow for the
                            // same upstream.
                            s.started.set(false);
                        }
                        s.emit(evt);
                    }
                }
            }
            Event::StreamEnd(_) => {
                // The session died: every queued stream gets the end,
                // preceded by a synthesized start if none was relayed.
                loop {
                    let next = inner.streams.borrow_mut().pop_front();
                    let Some(s) = next else { break };
                    if !s.started.get() {
                        s.emit(Event::MessageStart(None));
                    }
                    s.emit(evt.clone());
                }
            }
            Event::StreamStart => {}
        }
    }

    fn reset(&self) {
        self.inner.streams.borrow_mut().clear();
        self.inner.dedicated.set(false);
    }
}

/// One virtual request channel over a queue session.
struct StreamInner {
    muxer: Weak<QueueInner>,
    output: RefCell<Input>,
    /// The first `MessageStart` seen; repeats before the end are
    /// discarded.
    start: RefCell<Option<Event>>,
    buffer: RefCell<Data>,
    /// Message boundaries still expected from replies. Zero means the
    /// message has not been flushed to the session yet.
    queued: Cell<usize>,
    one_way: Cell<bool>,
    started: Cell<bool>,
    dedicated: Cell<bool>,
}

/// Rc-aware dispatch wrapper: upstream writes land here.
struct StreamTarget(Rc<StreamInner>);

impl EventTarget for StreamTarget {
    fn on_event(&self, evt: Event) {
        StreamInner::on_event(&self.0, evt);
    }
}

impl StreamInner {
    fn emit(&self, evt: Event) {
        let output = self.output.borrow().clone();
        output.feed(evt);
    }

    fn forward(&self, evt: Event) {
        if let Some(muxer) = self.muxer.upgrade() {
            let forward = muxer.forward.borrow().clone();
            forward.feed(evt);
        }
    }

    fn on_event(this: &Rc<Self>, evt: Event) {
        if this.dedicated.get() {
            this.forward(evt);
            return;
        }

        match evt {
            Event::MessageStart(_) => {
                let mut start = this.start.borrow_mut();
                if start.is_none() {
                    *start = Some(evt);
                }
            }
            Event::Data(data) => {
                if this.start.borrow().is_some() && this.queued.get() == 0 {
                    this.buffer.borrow_mut().push(data);
                }
            }
            Event::MessageEnd(_) | Event::StreamEnd(_) => {
                if this.start.borrow().is_some() && this.queued.get() == 0 {
                    this.queued.set(1);
                    if !this.one_way.get() {
                        // Enqueued before flushing so a session that
                        // replies synchronously finds us at head.
                        if let Some(muxer) = this.muxer.upgrade() {
                            muxer.streams.borrow_mut().push_back(Rc::clone(this));
                        }
                    }
                    let start = this.start.borrow().clone().expect("start captured");
                    let buffered = std::mem::take(&mut *this.buffer.borrow_mut());
                    this.forward(start);
                    if !buffered.is_empty() {
                        this.forward(Event::Data(buffered));
                    }
                    let end = match evt {
                        Event::MessageEnd(_) => evt,
                        _ => Event::MessageEnd(None),
                    };
                    this.forward(end);
                }
            }
            Event::StreamStart => {}
        }
    }
}

impl StreamCtl for StreamInner {
    fn close(&self) {
        // Detach the upstream consumer; a queued entry keeps the
        // stream alive until its replies are matched, they just go
        // nowhere.
        *self.output.borrow_mut() = Input::null();
    }

    fn set_one_way(&self) {
        self.one_way.set(true);
    }

    fn increase_queue_count(&self) {
        self.queued.set(self.queued.get() + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::EventLog;

    fn message(payload: &[u8]) -> Vec<Event> {
        vec![
            Event::message_start(),
            Event::data(payload),
            Event::message_end(),
        ]
    }

    fn reply(muxer: &QueueMuxer, payload: &[u8]) {
        muxer.on_reply(Event::message_start());
        muxer.on_reply(Event::data(payload));
        muxer.on_reply(Event::message_end());
    }

    #[test]
    fn test_request_flushed_on_message_end() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());

        let s = muxer.open_stream(Input::null());
        s.input().feed(Event::message_start());
        s.input().feed(Event::data(b"req"));
        assert!(session.is_empty(), "buffered until the end marker");
        s.input().feed(Event::message_end());
        assert_eq!(session.bytes(), b"req");
        assert_eq!(muxer.queued_len(), 1);
    }

    #[test]
    fn test_stream_end_upstream_becomes_message_end() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());

        let s = muxer.open_stream(Input::null());
        s.input().feed(Event::message_start());
        s.input().feed(Event::stream_end());
        let kinds: Vec<_> = session.events().iter().map(Event::kind).collect();
        assert_eq!(kinds, vec!["MessageStart", "MessageEnd"]);
    }

    #[test]
    fn test_replies_in_enqueue_order() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());

        let log1 = EventLog::new();
        let log2 = EventLog::new();
        let s1 = muxer.open_stream(log1.input());
        let s2 = muxer.open_stream(log2.input());

        for evt in message(b"a") {
            s1.input().feed(evt);
        }
        for evt in message(b"b") {
            s2.input().feed(evt);
        }
        assert_eq!(muxer.queued_len(), 2);

        reply(&muxer, b"ra");
        assert_eq!(log1.bytes(), b"ra");
        assert!(log2.is_empty(), "second stream silent until first done");
        assert_eq!(muxer.queued_len(), 1);

        reply(&muxer, b"rb");
        assert_eq!(log2.bytes(), b"rb");
        assert_eq!(muxer.queued_len(), 0);
    }

    #[test]
    fn test_no_cross_stream_data() {
        let muxer = QueueMuxer::new();
        muxer.bind(Input::null());
        let log1 = EventLog::new();
        let log2 = EventLog::new();
        let s1 = muxer.open_stream(log1.input());
        let s2 = muxer.open_stream(log2.input());
        for evt in message(b"one") {
            s1.input().feed(evt);
        }
        for evt in message(b"two") {
            s2.input().feed(evt);
        }
        reply(&muxer, b"first");
        reply(&muxer, b"second");
        assert_eq!(log1.bytes(), b"first");
        assert_eq!(log2.bytes(), b"second");
    }

    #[test]
    fn test_at_most_one_pending_start() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());
        let s = muxer.open_stream(Input::null());
        s.input().feed(Event::message_start());
        s.input().feed(Event::message_start());
        s.input().feed(Event::data(b"x"));
        s.input().feed(Event::message_end());
        let starts = session
            .events()
            .iter()
            .filter(|e| matches!(e, Event::MessageStart(_)))
            .count();
        assert_eq!(starts, 1);
        assert_eq!(session.bytes(), b"x");
    }

    #[test]
    fn test_one_way_stream_never_queued() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());
        let log = EventLog::new();
        let s = muxer.open_stream(log.input());
        s.set_one_way();
        for evt in message(b"fire-and-forget") {
            s.input().feed(evt);
        }
        assert_eq!(session.bytes(), b"fire-and-forget");
        assert_eq!(muxer.queued_len(), 0);
        reply(&muxer, b"nobody-home");
        assert!(log.is_empty(), "one-way streams never receive replies");
    }

    #[test]
    fn test_session_stream_end_fans_out_with_synthesized_starts() {
        let muxer = QueueMuxer::new();
        muxer.bind(Input::null());
        let log1 = EventLog::new();
        let log2 = EventLog::new();
        let s1 = muxer.open_stream(log1.input());
        let s2 = muxer.open_stream(log2.input());
        for evt in message(b"a") {
            s1.input().feed(evt);
        }
        for evt in message(b"b") {
            s2.input().feed(evt);
        }

        // Reply preamble reaches stream 1 only; then the session dies.
        muxer.on_reply(Event::message_start());
        muxer.on_reply(Event::StreamEnd(Some(crate::event::StreamError::ConnectionReset)));

        let kinds1: Vec<_> = log1.events().iter().map(Event::kind).collect();
        assert_eq!(kinds1, vec!["MessageStart", "StreamEnd"]);
        let kinds2: Vec<_> = log2.events().iter().map(Event::kind).collect();
        assert_eq!(kinds2, vec!["MessageStart", "StreamEnd"], "start synthesized");
        assert_eq!(muxer.queued_len(), 0);
    }

    #[test]
    fn test_increase_queue_count_pipelines_replies() {
        let muxer = QueueMuxer::new();
        muxer.bind(Input::null());
        let log = EventLog::new();
        let s = muxer.open_stream(log.input());
        for evt in message(b"a") {
            s.input().feed(evt);
        }
        // The caller pipelines a second request on the wire and
        // announces it explicitly.
        s.increase_queue_count();

        reply(&muxer, b"r1");
        assert_eq!(muxer.queued_len(), 1, "still waiting for second reply");
        reply(&muxer, b"r2");
        assert_eq!(muxer.queued_len(), 0);
        assert_eq!(log.bytes(), b"r1r2");
    }

    #[test]
    fn test_dedicated_pipes_everything_to_head() {
        let muxer = QueueMuxer::new();
        let session = EventLog::new();
        muxer.bind(session.input());
        let log = EventLog::new();
        let s = muxer.open_stream(log.input());
        for evt in message(b"upgrade") {
            s.input().feed(evt);
        }
        muxer.dedicate();

        muxer.on_reply(Event::data(b"raw-reply"));
        assert_eq!(log.bytes(), b"raw-reply");

        // Upstream side of a dedicated stream pipes raw as well.
        s.input().feed(Event::data(b"raw-send"));
        assert!(session.bytes().ends_with(b"raw-send"));
    }

    #[test]
    fn test_closed_stream_keeps_queue_order() {
        let muxer = QueueMuxer::new();
        muxer.bind(Input::null());
        let log1 = EventLog::new();
        let log2 = EventLog::new();
        let s1 = muxer.open_stream(log1.input());
        let s2 = muxer.open_stream(log2.input());
        for evt in message(b"a") {
            s1.input().feed(evt);
        }
        for evt in message(b"b") {
            s2.input().feed(evt);
        }
        // Upstream 1 goes away before its reply arrives.
        s1.close();
        drop(s1);

        reply(&muxer, b"r1");
        assert!(log1.is_empty(), "closed stream output is detached");
        assert!(log2.is_empty(), "stream 2 must still wait its turn");
        reply(&muxer, b"r2");
        assert_eq!(log2.bytes(), b"r2");
    }
}
