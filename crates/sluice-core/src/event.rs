//! The typed event stream.
//!
//! Everything flowing through a pipeline is one of five event kinds. A
//! well-formed stream is zero or more complete `MessageStart ..
//! MessageEnd` pairs followed by exactly one `StreamEnd`; stray `Data`
//! outside a message is permitted for raw byte streams.

use crate::data::Data;
use crate::value::Value;

/// The closed set of terminal stream errors.
///
/// Filters never panic or return `Err` across the dataflow boundary;
/// they emit a `StreamEnd(Some(error))` and cease producing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The remote refused the connection.
    #[error("connection refused")]
    ConnectionRefused,
    /// The transport was reset by the peer.
    #[error("connection reset")]
    ConnectionReset,
    /// Connecting took longer than allowed.
    #[error("connection timeout")]
    ConnectionTimeout,
    /// No bytes arrived within the read timeout.
    #[error("read timeout")]
    ReadTimeout,
    /// Bytes could not be written within the write timeout.
    #[error("write timeout")]
    WriteTimeout,
    /// No traffic in either direction within the idle timeout.
    #[error("idle timeout")]
    IdleTimeout,
    /// Authentication or authorization failed.
    #[error("unauthorized")]
    Unauthorized,
    /// A bounded buffer overflowed and data was discarded.
    #[error("buffer overflow")]
    BufferOverflow,
    /// The peer never completed its protocol handshake.
    #[error("no handshake")]
    NoHandshake,
    /// The peer violated the protocol.
    #[error("protocol error")]
    ProtocolError,
    /// Internal signal: the upstream should be replayed.
    #[error("replay requested")]
    Replay,
    /// The stream was cancelled by its owner.
    #[error("cancelled")]
    Cancelled,
    /// Anything else.
    #[error("unknown error")]
    UnknownError,
}

/// One unit of dataflow.
///
/// Cloning is cheap by construction: `Data` shares chunk storage and
/// heads/tails are `Rc`-shared values.
#[derive(Debug, Clone, Default)]
pub enum Event {
    /// A new stream begins.
    #[default]
    StreamStart,
    /// A message begins, optionally carrying a protocol head.
    MessageStart(Option<Value>),
    /// Message or raw-stream payload bytes.
    Data(Data),
    /// The current message ends, optionally carrying a protocol tail.
    MessageEnd(Option<Value>),
    /// The stream terminates; `None` is a clean end-of-stream.
    StreamEnd(Option<StreamError>),
}

impl Event {
    /// Shorthand for a payload event.
    #[must_use]
    pub fn data(bytes: &[u8]) -> Self {
        Event::Data(Data::from_slice(bytes))
    }

    /// Shorthand for a headless message start.
    #[must_use]
    pub fn message_start() -> Self {
        Event::MessageStart(None)
    }

    /// Shorthand for a tailless message end.
    #[must_use]
    pub fn message_end() -> Self {
        Event::MessageEnd(None)
    }

    /// Shorthand for a clean stream end.
    #[must_use]
    pub fn stream_end() -> Self {
        Event::StreamEnd(None)
    }

    /// True for either message-boundary or stream-end events, the two
    /// kinds that flush a pending message in the muxer.
    #[must_use]
    pub fn is_end(&self) -> bool {
        matches!(self, Event::MessageEnd(_) | Event::StreamEnd(_))
    }

    /// The terminal error, if this is an erroring `StreamEnd`.
    #[must_use]
    pub fn stream_error(&self) -> Option<StreamError> {
        match self {
            Event::StreamEnd(err) => *err,
            _ => None,
        }
    }

    /// A short name for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::StreamStart => "StreamStart",
            Event::MessageStart(_) => "MessageStart",
            Event::Data(_) => "Data",
            Event::MessageEnd(_) => "MessageEnd",
            Event::StreamEnd(_) => "StreamEnd",
        }
    }
}
