use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::channel::transfer_description::TransferDescription;
use crate::codec::compression::PayloadCompression;
use crate::codec::message::{Message, TransferStatisticsListener};
use crate::codec::receiver::Receiver;
use crate::error::{ChannelError, ChannelResult};
use crate::net::manager::DataTransferManager;
use crate::net::peer::PeerId;
use crate::net::transport_service::TransferMode;
use crate::util::listeners::Listeners;

/// Serializes application messages and sends them to peers, compressing payloads above the
///  configured threshold.
///
/// Messages addressed to the local peer do not touch the network: they are handed to the
///  [Receiver] directly, and are dispatched in order with messages received from peers.
pub struct Transmitter {
    manager: Arc<DataTransferManager>,
    receiver: Arc<Receiver>,
    compression: Arc<dyn PayloadCompression>,
    compression_threshold: usize,
    statistics_listeners: Listeners<dyn TransferStatisticsListener>,
}

impl Transmitter {
    pub fn new(manager: Arc<DataTransferManager>, receiver: Arc<Receiver>, compression: Arc<dyn PayloadCompression>) -> Transmitter {
        let compression_threshold = manager.config().compression_threshold;
        Transmitter {
            manager,
            receiver,
            compression,
            compression_threshold,
            statistics_listeners: Default::default(),
        }
    }

    pub fn add_statistics_listener(&self, listener: Arc<dyn TransferStatisticsListener>) {
        self.statistics_listeners.add(listener);
    }

    pub async fn send(&self, connection_id: &str, recipient: &PeerId, message: &dyn Message) -> ChannelResult<()> {
        let local_peer = self.manager.local_peer()
            .ok_or(ChannelError::NotInitialized("no local peer id before the signaling connection is up"))?;

        let message_type = message.message_type();
        let mut buf = BytesMut::new();
        message.ser(&mut buf);
        let payload = buf.freeze();

        let description = TransferDescription::new(&local_peer, recipient, &message_type.namespace, &message_type.element_name)
            .with_size(payload.len());

        if recipient == &local_peer {
            trace!("loopback: {:?}", description);
            self.receiver.process(description, payload, TransferMode::Loopback);
            return Ok(());
        }

        self.send_raw(connection_id, description, payload).await
    }

    /// Sends an already serialized payload, compressing it first if it is above the threshold
    pub async fn send_raw(&self, connection_id: &str, description: TransferDescription, payload: Bytes) -> ChannelResult<()> {
        let started = Instant::now();
        let uncompressed_size = payload.len();

        let (description, payload) = if uncompressed_size > self.compression_threshold {
            let compressed = self.compression.compress(&payload)
                .map_err(ChannelError::Compression)?;
            let compressed = Bytes::from(compressed);
            (description.with_compressed(true).with_size(compressed.len()), compressed)
        }
        else {
            (description.with_compressed(false).with_size(uncompressed_size), payload)
        };
        let compressed_size = payload.len();

        let connection = self.manager.connect(connection_id, &description.recipient).await?;
        connection.send(&description, payload).await?;

        let mode = connection.transfer_mode();
        let elapsed = started.elapsed();
        debug!("sent {:?} using {:?} in {:?}", description, mode, elapsed);
        self.statistics_listeners.notify(|l| l.sent(mode, compressed_size, uncompressed_size, elapsed));
        Ok(())
    }
}
