use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::channel::connection::{BinaryChannelConnection, ConnectionEventHandler};
use crate::channel::transfer_description::TransferDescription;
use crate::config::ChannelConfig;
use crate::net::peer::{Direction, PeerId, PoolKey};
use crate::net::transport_service::TransferMode;

pub fn td(sender: &str, recipient: &str, namespace: &str, element_name: &str) -> TransferDescription {
    TransferDescription::new(&PeerId::new(sender), &PeerId::new(recipient), namespace, element_name)
}

/// Records everything a connection reports, with helpers for awaiting asynchronous reports
pub struct RecordingHandler {
    received: Mutex<Vec<(TransferDescription, Bytes)>>,
    num_received: watch::Sender<usize>,
    closed: Mutex<Vec<PoolKey>>,
    num_closed: watch::Sender<usize>,
    changed: Mutex<Vec<(String, PeerId, Arc<BinaryChannelConnection>, bool)>>,
    panic_on: Mutex<Option<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler {
            received: Default::default(),
            num_received: watch::channel(0).0,
            closed: Default::default(),
            num_closed: watch::channel(0).0,
            changed: Default::default(),
            panic_on: Default::default(),
        })
    }

    pub fn weak(self: &Arc<Self>) -> Weak<dyn ConnectionEventHandler> {
        let weak: Weak<RecordingHandler> = Arc::downgrade(self);
        weak
    }

    pub fn panic_on_element_name(&self, element_name: &str) {
        *self.panic_on.lock().unwrap() = Some(element_name.to_string());
    }

    pub fn received(&self) -> Vec<(TransferDescription, Bytes)> {
        self.received.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<PoolKey> {
        self.closed.lock().unwrap().clone()
    }

    pub fn changed(&self) -> Vec<(String, PeerId, Arc<BinaryChannelConnection>, bool)> {
        self.changed.lock().unwrap().clone()
    }

    pub async fn wait_for_received(&self, n: usize) -> Vec<(TransferDescription, Bytes)> {
        let mut rx = self.num_received.subscribe();
        timeout(Duration::from_secs(10), rx.wait_for(|&num| num >= n)).await
            .expect("timeout waiting for received payloads")
            .expect("sender is owned by self");
        self.received()
    }

    pub async fn wait_for_closed(&self, n: usize) {
        let mut rx = self.num_closed.subscribe();
        timeout(Duration::from_secs(10), rx.wait_for(|&num| num >= n)).await
            .expect("timeout waiting for closed connections")
            .expect("sender is owned by self");
    }
}

#[async_trait]
impl ConnectionEventHandler for RecordingHandler {
    async fn connection_changed(&self, connection_id: &str, peer: &PeerId, connection: Arc<BinaryChannelConnection>, incoming: bool) {
        self.changed.lock().unwrap().push((connection_id.to_string(), peer.clone(), connection, incoming));
    }

    fn connection_closed(&self, connection: &BinaryChannelConnection) {
        self.closed.lock().unwrap().push(connection.pool_key().clone());
        self.num_closed.send_modify(|n| *n += 1);
    }

    fn transfer_received(&self, description: TransferDescription, payload: Bytes, _mode: TransferMode) {
        if self.panic_on.lock().unwrap().as_deref() == Some(description.element_name.as_str()) {
            panic!("simulated handler failure");
        }
        self.received.lock().unwrap().push((description, payload));
        self.num_received.send_modify(|n| *n += 1);
    }
}

/// Connects two connections back to back: `a` (peer "a", outgoing) and `b` (peer "b",
///  incoming), each with its own recording handler. Neither is initialized.
pub fn connection_pair() -> (Arc<BinaryChannelConnection>, Arc<BinaryChannelConnection>, Arc<RecordingHandler>, Arc<RecordingHandler>) {
    connection_pair_with_config(ChannelConfig::default())
}

pub fn connection_pair_with_config(config: ChannelConfig) -> (Arc<BinaryChannelConnection>, Arc<BinaryChannelConnection>, Arc<RecordingHandler>, Arc<RecordingHandler>) {
    let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
    let handler_a = RecordingHandler::new();
    let handler_b = RecordingHandler::new();
    let config = Arc::new(config);

    let a = connection_over(stream_a, "c", "a", "b", Direction::Out, handler_a.weak(), config.clone());
    let b = connection_over(stream_b, "c", "b", "a", Direction::In, handler_b.weak(), config);
    (a, b, handler_a, handler_b)
}

/// A connection from peer "a" to peer "b" with the raw peer side of its stream exposed
pub fn raw_connection(buffer_size: usize) -> (Arc<BinaryChannelConnection>, DuplexStream, Arc<RecordingHandler>) {
    let (local, remote) = tokio::io::duplex(buffer_size);
    let handler = RecordingHandler::new();
    let conn = connection_over(local, "c", "a", "b", Direction::Out, handler.weak(), Arc::new(ChannelConfig::default()));
    (conn, remote, handler)
}

pub fn connection_over(
    stream: DuplexStream,
    connection_id: &str,
    local: &str,
    remote: &str,
    direction: Direction,
    handler: Weak<dyn ConnectionEventHandler>,
    config: Arc<ChannelConfig>,
) -> Arc<BinaryChannelConnection> {
    let (reader, writer) = tokio::io::split(stream);
    BinaryChannelConnection::new(
        PoolKey::new(connection_id, direction, &PeerId::new(remote)),
        &PeerId::new(local),
        TransferMode::Direct,
        Box::new(reader),
        Box::new(writer),
        handler,
        config,
    )
}
