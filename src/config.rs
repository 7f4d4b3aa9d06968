use std::time::Duration;

use anyhow::bail;

use crate::channel::wire::CHUNK_SIZE;
use crate::net::transport_service::TransportMask;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    /// Closing a connection waits this long for its receive task to terminate before aborting it
    pub close_join_timeout: Duration,

    /// When the signaling connection goes away, transport services are uninitialized while
    ///  holding the connect lock. If the lock is not available within this timeout (i.e. a
    ///  connect attempt is stuck), services are uninitialized anyway since the session is
    ///  tearing down.
    pub uninitialize_lock_timeout: Duration,

    /// Payloads strictly longer than this are compressed before sending
    pub compression_threshold: usize,
    pub compression_level: i32,

    /// The transports that are used for establishing new connections. Changing this at runtime
    ///  does not affect open connections.
    pub transport_mask: TransportMask,

    /// Upper bound for the size of a single reassembled payload. A peer announcing more chunks
    ///  than fit into this is treated as violating the protocol.
    pub max_payload_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            close_join_timeout: Duration::from_secs(10),
            uninitialize_lock_timeout: Duration::from_secs(5),
            compression_threshold: 32,
            compression_level: 3,
            transport_mask: TransportMask::all(),
            max_payload_size: 64 * 1024 * 1024,
        }
    }
}

impl ChannelConfig {
    pub fn new() -> ChannelConfig {
        ChannelConfig::default()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.close_join_timeout.is_zero() {
            bail!("close join timeout must be positive");
        }
        if self.uninitialize_lock_timeout.is_zero() {
            bail!("uninitialize lock timeout must be positive");
        }
        if self.transport_mask.is_empty() {
            bail!("at least one transport must be enabled");
        }
        if self.max_payload_size < CHUNK_SIZE {
            bail!("max payload size of {} is smaller than a single chunk ({} bytes)", self.max_payload_size, CHUNK_SIZE);
        }
        Ok(())
    }
}
