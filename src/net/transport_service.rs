use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bitflags::bitflags;
#[cfg(test)] use mockall::automock;

use crate::channel::connection::{BinaryChannelConnection, ConnectionEventHandler};
use crate::net::peer::PeerId;

bitflags! {
    /// Selects the transport services that are used for establishing new connections
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct TransportMask: u8 {
        const DIRECT = 0b01;
        const RELAY = 0b10;
    }
}

/// How a connection's bytes travel to the peer
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum TransferMode {
    /// a socket between the two peers
    Direct,
    /// through an intermediary that forwards the stream
    Relay,
    /// the peer is the local process, nothing goes over the network
    Loopback,
}

impl TransferMode {
    pub fn transport_mask(self) -> TransportMask {
        match self {
            TransferMode::Direct => TransportMask::DIRECT,
            TransferMode::Relay => TransportMask::RELAY,
            TransferMode::Loopback => TransportMask::empty(),
        }
    }
}

/// Lifecycle of the signaling connection that transport services use for negotiating streams
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignalingState {
    Initializing,
    Connected,
    Disconnecting,
    Disconnected,
    Error,
}

/// The part of the signaling layer that transport services need
#[cfg_attr(test, automock)]
pub trait SignalingHandle: Send + Sync + 'static {
    /// the address under which the local peer is known to others
    fn local_peer(&self) -> PeerId;
}

/// A strategy for establishing a raw byte stream to a peer and wrapping it in a
///  [BinaryChannelConnection].
///
/// Connections that a service establishes in `connect` are returned to the caller, who is
///  responsible for registering them. Connections that a service accepts from peers are
///  reported through the handler passed to `initialize`, with `incoming == true`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportService: Send + Sync + 'static {
    fn mode(&self) -> TransferMode;

    async fn connect(&self, connection_id: &str, peer: &PeerId) -> anyhow::Result<Arc<BinaryChannelConnection>>;

    async fn initialize(&self, signaling: Arc<dyn SignalingHandle>, handler: Weak<dyn ConnectionEventHandler>) -> anyhow::Result<()>;

    async fn uninitialize(&self);
}
