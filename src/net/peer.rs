use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

use bytes::{Buf, BufMut};

use crate::util::buf_ext::{BufExt, BufMutExt};

/// The address of a peer as known to the signaling layer, e.g. a full XMPP JID. It is opaque
///  to the transport layer: it is only compared, hashed and sent verbatim during handshakes.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerId(Arc<str>);

impl PeerId {
    pub fn new(addr: impl AsRef<str>) -> PeerId {
        PeerId(Arc::from(addr.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        buf.put_short_string(&self.0)
    }

    pub fn try_deser(buf: &mut impl Buf) -> anyhow::Result<PeerId> {
        Ok(PeerId::new(buf.try_get_short_string()?))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        PeerId::new(value)
    }
}

/// Which side initiated a connection. A peer may have one connection of each direction for the
///  same connection id at the same time, and they are pooled independently.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Direction {
    /// initiated by the peer, accepted locally
    In,
    /// initiated locally
    Out,
}

impl Direction {
    pub fn from_incoming(incoming: bool) -> Direction {
        if incoming { Direction::In } else { Direction::Out }
    }
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

/// Address of one slot in the connection pool: `connectionID:DIRECTION:peer`
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct PoolKey {
    pub connection_id: Arc<str>,
    pub direction: Direction,
    pub peer: PeerId,
}

impl PoolKey {
    pub fn new(connection_id: &str, direction: Direction, peer: &PeerId) -> PoolKey {
        PoolKey {
            connection_id: Arc::from(connection_id),
            direction,
            peer: peer.clone(),
        }
    }

    pub fn with_direction(&self, direction: Direction) -> PoolKey {
        PoolKey {
            connection_id: self.connection_id.clone(),
            direction,
            peer: self.peer.clone(),
        }
    }
}

impl Display for PoolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.direction, self.peer)
    }
}

impl Debug for PoolKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
