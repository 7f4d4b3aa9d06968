use thiserror::Error;

use crate::net::peer::PeerId;

/// Failures surfaced by the channel, pool, manager and codec layers.
///
/// Callers mainly distinguish between 'this connection is gone, re-resolve it' ([ChannelError::ConnectionClosed]), 'try again later'
///  ([ChannelError::FragmentIdsExhausted]) and 'could not / should not connect'
///  ([ChannelError::TransportsExhausted], [ChannelError::Cancelled]).
#[derive(Debug, Error)]
pub enum ChannelError {
    /// send attempted on a connection that is closing or closed
    #[error("connection closed")]
    ConnectionClosed,

    #[error("concurrent access threshold exceeded: all {0} fragment ids are in use")]
    FragmentIdsExhausted(usize),

    #[error("no more {kind} ids available on this connection (limit {limit})")]
    DictionaryExhausted {
        kind: &'static str,
        limit: usize,
    },

    /// the transfer cannot be expressed on the wire, e.g. because a type string is too long
    #[error("invalid transfer: {0}")]
    InvalidTransfer(String),

    /// The peer sent something that desynchronizes framing - the connection is closed
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("could not connect to {peer}, exhausted all available transports")]
    TransportsExhausted {
        peer: PeerId,
    },

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error("not initialized: {0}")]
    NotInitialized(&'static str),

    #[error("compression error: {0}")]
    Compression(#[source] anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    pub fn protocol_violation(msg: impl Into<String>) -> ChannelError {
        ChannelError::ProtocolViolation(msg.into())
    }

    /// I/O failures and protocol violations leave the frame stream in an undefined state, so
    ///  the owning connection must not be used afterwards
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(self, ChannelError::Io(_) | ChannelError::ProtocolViolation(_))
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
