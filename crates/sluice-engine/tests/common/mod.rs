//! Shared test filters: a newline framer and an echoing session
//! pipeline stage.

use std::rc::Rc;

use sluice_core::event::Event;
use sluice_core::filter::{Filter, FilterContext, FilterDump};
use sluice_core::input::Input;

/// Frames raw bytes into one message per newline-terminated line.
pub struct LineDecoder {
    output: Input,
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self { output: Input::null(), pending: Vec::new() }
    }
}

impl Filter for LineDecoder {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "decodeLines", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(LineDecoder::new())
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        self.pending.clear();
    }

    fn process(&mut self, _cx: &mut FilterContext<'_>, evt: Event) {
        match evt {
            Event::Data(data) => {
                self.pending.extend_from_slice(&data.to_vec());
                while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.pending.drain(..=pos).take(pos).collect();
                    self.output.feed(Event::message_start());
                    self.output.feed(Event::data(&line));
                    self.output.feed(Event::message_end());
                }
            }
            Event::StreamEnd(_) => self.output.feed(evt),
            _ => {}
        }
    }
}

/// Session-side stage replying to each message with
/// `<prefix><payload>\n`.
pub struct EchoSession {
    prefix: &'static [u8],
    output: Input,
    payload: Vec<u8>,
    pub seen_stream_end: Rc<std::cell::Cell<bool>>,
}

impl EchoSession {
    pub fn new(prefix: &'static [u8]) -> Self {
        Self {
            prefix,
            output: Input::null(),
            payload: Vec::new(),
            seen_stream_end: Rc::new(std::cell::Cell::new(false)),
        }
    }
}

impl Filter for EchoSession {
    fn dump(&self) -> FilterDump {
        FilterDump { name: "echoSession", is_joint: false }
    }

    fn clone_filter(&self) -> Box<dyn Filter> {
        Box::new(EchoSession {
            prefix: self.prefix,
            output: Input::null(),
            payload: Vec::new(),
            seen_stream_end: Rc::clone(&self.seen_stream_end),
        })
    }

    fn chain(&mut self, output: Input) {
        self.output = output;
    }

    fn reset(&mut self) {
        self.payload.clear();
    }

    fn process(&mut self, _cx: &mut FilterContext<'_>, evt: Event) {
        match evt {
            Event::Data(data) => self.payload.extend_from_slice(&data.to_vec()),
            Event::MessageEnd(_) => {
                let mut reply = self.prefix.to_vec();
                reply.append(&mut self.payload);
                reply.push(b'\n');
                self.output.feed(Event::message_start());
                self.output.feed(Event::data(&reply));
                self.output.feed(Event::message_end());
            }
            Event::StreamEnd(_) => self.seen_stream_end.set(true),
            _ => {}
        }
    }
}
