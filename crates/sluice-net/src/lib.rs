//! # Sluice Net
//!
//! The TCP edge of the engine: a [`Listener`] accepts connections and
//! drives one pipeline per inbound connection; an [`Outbound`] dials
//! upstream with retry and timeout handling, surfaced to pipelines as
//! the [`Connect`] filter.
//!
//! Everything here runs on a tokio current-thread runtime inside a
//! `LocalSet`: the engine's object graph is `Rc`-based and pinned to
//! its worker thread.

pub mod inbound;
pub mod listener;
pub mod outbound;
mod socket;

pub use inbound::InboundInfo;
pub use listener::{Listener, ListenerOptions};
pub use outbound::{Connect, ConnectTarget, Outbound, OutboundOptions};

/// Errors raised while standing up or tearing down network endpoints.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// The port is reserved and refuses pipeline binding.
    #[error("port {0} is reserved")]
    PortReserved(u16),

    /// Binding the listening socket failed.
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        /// The requested address.
        addr: std::net::SocketAddr,
        /// The underlying socket error.
        source: std::io::Error,
    },

    /// A socket option could not be applied.
    #[error("socket option {option}: {source}")]
    SocketOption {
        /// Which option failed.
        option: &'static str,
        /// The underlying socket error.
        source: std::io::Error,
    },
}
