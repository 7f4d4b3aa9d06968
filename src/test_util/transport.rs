use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::channel::connection::{BinaryChannelConnection, ConnectionEventHandler};
use crate::config::ChannelConfig;
use crate::net::manager::DataTransferManager;
use crate::net::peer::{Direction, PeerId};
use crate::net::transport_service::{SignalingHandle, SignalingState, TransferMode, TransportService};
use crate::test_util::channel::connection_over;

pub struct FixedSignaling(pub PeerId);

impl SignalingHandle for FixedSignaling {
    fn local_peer(&self) -> PeerId {
        self.0.clone()
    }
}

/// Lets [InMemoryTransport]s find each other by peer id
#[derive(Default)]
pub struct InMemoryNetwork {
    endpoints: Mutex<FxHashMap<PeerId, Weak<InMemoryTransport>>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<InMemoryNetwork> {
        Arc::new(InMemoryNetwork::default())
    }

    fn lookup(&self, peer: &PeerId) -> Option<Arc<InMemoryTransport>> {
        self.endpoints.lock().unwrap()
            .get(peer)
            .and_then(|t| t.upgrade())
    }
}

/// A 'direct' transport that connects managers in the same process through in-memory pipes
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    connect_delay: Duration,
    config: Arc<ChannelConfig>,
    registration: Mutex<Option<(PeerId, Weak<dyn ConnectionEventHandler>)>>,
    num_connect_attempts: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new(network: &Arc<InMemoryNetwork>, peer: &PeerId, connect_delay: Duration) -> Arc<InMemoryTransport> {
        let transport = Arc::new(InMemoryTransport {
            network: network.clone(),
            connect_delay,
            config: Arc::new(ChannelConfig::default()),
            registration: Mutex::new(None),
            num_connect_attempts: AtomicUsize::new(0),
        });
        network.endpoints.lock().unwrap()
            .insert(peer.clone(), Arc::downgrade(&transport));
        transport
    }

    pub fn num_connect_attempts(&self) -> usize {
        self.num_connect_attempts.load(Ordering::SeqCst)
    }

    fn registration(&self) -> anyhow::Result<(PeerId, Weak<dyn ConnectionEventHandler>)> {
        self.registration.lock().unwrap()
            .clone()
            .ok_or_else(|| anyhow!("transport is not initialized"))
    }
}

#[async_trait]
impl TransportService for InMemoryTransport {
    fn mode(&self) -> TransferMode {
        TransferMode::Direct
    }

    async fn connect(&self, connection_id: &str, peer: &PeerId) -> anyhow::Result<Arc<BinaryChannelConnection>> {
        self.num_connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }

        let (local_peer, handler) = self.registration()?;
        let remote = self.network.lookup(peer)
            .ok_or_else(|| anyhow!("{} is unreachable", peer))?;
        let (_, remote_handler) = remote.registration()?;

        let (local_stream, remote_stream) = tokio::io::duplex(64 * 1024);
        let local_conn = connection_over(local_stream, connection_id, local_peer.as_str(), peer.as_str(), Direction::Out, handler, self.config.clone());
        let remote_conn = connection_over(remote_stream, connection_id, peer.as_str(), local_peer.as_str(), Direction::In, remote_handler.clone(), remote.config.clone());

        if let Some(remote_handler) = remote_handler.upgrade() {
            remote_handler.connection_changed(connection_id, &local_peer, remote_conn, true).await;
        }
        Ok(local_conn)
    }

    async fn initialize(&self, signaling: Arc<dyn SignalingHandle>, handler: Weak<dyn ConnectionEventHandler>) -> anyhow::Result<()> {
        *self.registration.lock().unwrap() = Some((signaling.local_peer(), handler));
        Ok(())
    }

    async fn uninitialize(&self) {
        *self.registration.lock().unwrap() = None;
    }
}

pub async fn activated_manager(network: &Arc<InMemoryNetwork>, peer: &str, connect_delay: Duration) -> (DataTransferManager, Arc<InMemoryTransport>) {
    let transport = InMemoryTransport::new(network, &PeerId::new(peer), connect_delay);
    let manager = DataTransferManager::new(ChannelConfig::default(), vec![transport.clone() as Arc<dyn TransportService>])
        .expect("default config is valid");

    let signaling: Arc<dyn SignalingHandle> = Arc::new(FixedSignaling(PeerId::new(peer)));
    manager.signaling_state_changed(&signaling, SignalingState::Connected).await;
    (manager, transport)
}

/// Two active managers for peers "alice" and "bob" on the same in-memory network
pub async fn activated_pair(network: &Arc<InMemoryNetwork>, connect_delay: Duration) -> (DataTransferManager, Arc<InMemoryTransport>, DataTransferManager, Arc<InMemoryTransport>) {
    let (alice, alice_transport) = activated_manager(network, "alice", connect_delay).await;
    let (bob, bob_transport) = activated_manager(network, "bob", connect_delay).await;
    (alice, alice_transport, bob, bob_transport)
}
