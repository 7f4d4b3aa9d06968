use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::channel::transfer_description::TransferDescription;
use crate::codec::compression::PayloadCompression;
use crate::codec::dispatcher::SequentialDispatcher;
use crate::codec::message::{MessageModule, MessageType, TransferStatisticsListener};
use crate::net::manager::{DataTransferManager, IncomingTransferListener};
use crate::net::transport_service::TransferMode;
use crate::util::listeners::Listeners;

type ModuleRegistry = Arc<RwLock<FxHashMap<MessageType, Arc<dyn MessageModule>>>>;

/// Turns received payloads into calls of the message module registered for their type.
///
/// Payloads from all connections, and loopback messages, go through a single
///  [SequentialDispatcher], so modules see messages in a global receive order.
pub struct Receiver {
    message_modules: ModuleRegistry,
    compression: Arc<dyn PayloadCompression>,
    statistics_listeners: Arc<Listeners<dyn TransferStatisticsListener>>,
    dispatcher: SequentialDispatcher,
}

impl Receiver {
    /// Creates a receiver that handles all payloads arriving through `manager`
    pub fn new(manager: &DataTransferManager, compression: Arc<dyn PayloadCompression>) -> Arc<Receiver> {
        let receiver = Arc::new(Receiver {
            message_modules: Default::default(),
            compression,
            statistics_listeners: Default::default(),
            dispatcher: SequentialDispatcher::new(),
        });
        manager.add_transfer_listener(receiver.clone());
        receiver
    }

    pub async fn register_module(&self, message_module: Arc<dyn MessageModule>) -> anyhow::Result<()> {
        match self.message_modules.write().await
            .entry(message_module.message_type())
        {
            Entry::Occupied(e) => {
                Err(anyhow!("registering a second message module for message type {}", e.key()))
            }
            Entry::Vacant(e) => {
                e.insert(message_module);
                Ok(())
            }
        }
    }

    pub async fn deregister_module(&self, message_type: &MessageType) -> anyhow::Result<()> {
        let prev = self.message_modules.write().await
            .remove(message_type);
        if prev.is_none() {
            return Err(anyhow!("deregistering a module that was not previously registered: {}", message_type));
        }
        Ok(())
    }

    pub fn add_statistics_listener(&self, listener: Arc<dyn TransferStatisticsListener>) {
        self.statistics_listeners.add(listener);
    }

    /// Queues a payload for decompression and dispatch
    pub fn process(&self, description: TransferDescription, payload: Bytes, mode: TransferMode) {
        let job = handle_payload(
            self.message_modules.clone(),
            self.compression.clone(),
            self.statistics_listeners.clone(),
            description,
            payload,
            mode,
        );
        if !self.dispatcher.dispatch(job) {
            warn!("dispatcher is shut down - dropping received payload");
        }
    }
}

impl IncomingTransferListener for Receiver {
    fn transfer_received(&self, description: TransferDescription, payload: Bytes, mode: TransferMode) {
        self.process(description, payload, mode);
    }
}

async fn handle_payload(
    message_modules: ModuleRegistry,
    compression: Arc<dyn PayloadCompression>,
    statistics_listeners: Arc<Listeners<dyn TransferStatisticsListener>>,
    description: TransferDescription,
    payload: Bytes,
    mode: TransferMode,
) {
    let started = Instant::now();
    let compressed_size = payload.len();

    let buf = if description.compressed {
        match compression.decompress(&payload) {
            Ok(decompressed) => Bytes::from(decompressed),
            Err(e) => {
                warn!("dropping {:?}: error decompressing the payload: {}", description, e);
                return;
            }
        }
    }
    else {
        payload
    };
    let elapsed = started.elapsed();
    statistics_listeners.notify(|l| l.received(mode, compressed_size, buf.len(), elapsed));

    let message_type = MessageType::of(&description);
    let message_module = message_modules.read().await
        .get(&message_type)
        .cloned();

    match message_module {
        Some(message_module) => {
            trace!("dispatching {:?}", description);
            message_module.on_message(&description, &buf).await;
        }
        None => {
            warn!("received message of unknown type {} from {} - dropping it", message_type, description.sender);
        }
    }
}
