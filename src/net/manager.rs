use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::connection::{BinaryChannelConnection, ConnectionEventHandler};
use crate::channel::transfer_description::TransferDescription;
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::net::peer::{Direction, PeerId, PoolKey};
use crate::net::pool::ConnectionPool;
use crate::net::transport_service::{SignalingHandle, SignalingState, TransferMode, TransportMask, TransportService};
use crate::util::listeners::Listeners;

/// Notified about connections entering and leaving the pool
pub trait ConnectionListener: Send + Sync + 'static {
    /// Called before the connection is pooled and initialized
    fn connection_changed(&self, connection_id: &str, peer: &PeerId, connection: &Arc<BinaryChannelConnection>, incoming: bool);

    fn connection_closed(&self, connection_id: &str, peer: &PeerId, mode: TransferMode);
}

/// Receives every payload that arrives on any pooled connection, on that connection's receive
///  task
pub trait IncomingTransferListener: Send + Sync + 'static {
    fn transfer_received(&self, description: TransferDescription, payload: Bytes, mode: TransferMode);
}

/// Hands out connections to peers, reusing pooled connections and establishing new ones through
///  an ordered list of transport services.
///
/// The manager is active while the signaling connection is up (see
///  [DataTransferManager::signaling_state_changed]): only then are transport services
///  initialized and the pool open.
pub struct DataTransferManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    myself: Weak<ManagerInner>,
    config: Arc<ChannelConfig>,

    /// in order of preference
    services: Vec<Arc<dyn TransportService>>,
    transport_mask: Mutex<TransportMask>,

    pool: ConnectionPool,
    /// pool keys with a connection attempt in progress
    establishing: Mutex<FxHashSet<PoolKey>>,
    /// NB: serializes all outbound connection attempts, not only those to the same peer
    connect_lock: tokio::sync::Mutex<()>,

    signaling: Mutex<Option<Arc<dyn SignalingHandle>>>,
    /// `false` while the signaling connection is down - connection attempts in progress are
    ///  cancelled when this changes to `false`
    active: watch::Sender<bool>,

    connection_listeners: Listeners<dyn ConnectionListener>,
    transfer_listeners: Listeners<dyn IncomingTransferListener>,
}

impl DataTransferManager {
    pub fn new(config: ChannelConfig, services: Vec<Arc<dyn TransportService>>) -> anyhow::Result<DataTransferManager> {
        config.validate()?;

        let inner = Arc::new_cyclic(|myself| ManagerInner {
            myself: myself.clone(),
            transport_mask: Mutex::new(config.transport_mask),
            config: Arc::new(config),
            services,
            pool: ConnectionPool::new(),
            establishing: Default::default(),
            connect_lock: Default::default(),
            signaling: Default::default(),
            active: watch::channel(false).0,
            connection_listeners: Default::default(),
            transfer_listeners: Default::default(),
        });
        Ok(DataTransferManager { inner })
    }

    pub fn config(&self) -> &Arc<ChannelConfig> {
        &self.inner.config
    }

    /// The handler through which transport services report connections to this manager
    pub fn connection_handler(&self) -> Weak<dyn ConnectionEventHandler> {
        self.inner.handler()
    }

    pub fn local_peer(&self) -> Option<PeerId> {
        self.inner.signaling.lock().unwrap()
            .as_ref()
            .map(|s| s.local_peer())
    }

    /// Returns a connection to `peer` that is ready for sending, establishing one if there is
    ///  none yet.
    pub async fn connect(&self, connection_id: &str, peer: &PeerId) -> ChannelResult<Arc<BinaryChannelConnection>> {
        self.inner.connect(connection_id, peer).await
    }

    /// Sends a payload to the description's recipient, connecting first if necessary
    pub async fn send_data(&self, connection_id: &str, description: &TransferDescription, payload: Bytes) -> ChannelResult<()> {
        let connection = self.connect(connection_id, &description.recipient).await?;
        connection.send(description, payload).await
    }

    pub fn is_connected(&self, connection_id: &str, peer: &PeerId) -> bool {
        self.inner.usable_connection(&PoolKey::new(connection_id, Direction::Out, peer))
            .is_some()
    }

    pub fn transfer_mode(&self, connection_id: &str, peer: &PeerId) -> Option<TransferMode> {
        self.inner.usable_connection(&PoolKey::new(connection_id, Direction::Out, peer))
            .map(|c| c.transfer_mode())
    }

    /// Closes the connections to a peer in both directions, returning `true` if there were any
    pub async fn disconnect(&self, connection_id: &str, peer: &PeerId) -> bool {
        let out_key = PoolKey::new(connection_id, Direction::Out, peer);
        let in_key = out_key.with_direction(Direction::In);

        let mut found = false;
        for key in [out_key, in_key] {
            if let Some(connection) = self.inner.pool.remove(&key) {
                debug!("disconnecting {:?}", key);
                connection.close().await;
                found = true;
            }
        }
        found
    }

    pub fn transport_mask(&self) -> TransportMask {
        *self.inner.transport_mask.lock().unwrap()
    }

    /// Restricts the transports for subsequent connection attempts. Open connections are not
    ///  affected.
    pub fn set_transport_mask(&self, mask: TransportMask) {
        info!("transport mask changed to {:?}", mask);
        *self.inner.transport_mask.lock().unwrap() = mask;
    }

    pub fn add_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        self.inner.connection_listeners.add(listener);
    }

    pub fn remove_connection_listener(&self, listener: &Arc<dyn ConnectionListener>) -> bool {
        self.inner.connection_listeners.remove(listener)
    }

    pub fn add_transfer_listener(&self, listener: Arc<dyn IncomingTransferListener>) {
        self.inner.transfer_listeners.add(listener);
    }

    pub fn remove_transfer_listener(&self, listener: &Arc<dyn IncomingTransferListener>) -> bool {
        self.inner.transfer_listeners.remove(listener)
    }

    /// Activates the manager when the signaling connection is established, and tears down all
    ///  transports and connections when it goes away.
    pub async fn signaling_state_changed(&self, signaling: &Arc<dyn SignalingHandle>, state: SignalingState) {
        if state == SignalingState::Connected {
            self.inner.activate(signaling).await;
        }
        else {
            self.inner.deactivate(state).await;
        }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }
}

/// Clears a mark in the 'establishing' set when the connection attempt is done, even if it is
///  cancelled by dropping its future
struct EstablishingMark<'a> {
    inner: &'a ManagerInner,
    key: Option<PoolKey>,
}

impl Drop for EstablishingMark<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.inner.establishing.lock().unwrap().remove(&key);
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl <T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl ManagerInner {
    fn handler(&self) -> Weak<dyn ConnectionEventHandler> {
        let myself: Weak<ManagerInner> = self.myself.clone();
        myself
    }

    /// a pooled connection that is still connected, preferring the one that was initiated locally
    fn usable_connection(&self, out_key: &PoolKey) -> Option<Arc<BinaryChannelConnection>> {
        [Direction::Out, Direction::In].into_iter()
            .filter_map(|direction| self.pool.get(&out_key.with_direction(direction)))
            .find(|c| c.is_connected())
    }

    async fn connect(&self, connection_id: &str, peer: &PeerId) -> ChannelResult<Arc<BinaryChannelConnection>> {
        if !*self.active.borrow() {
            return Err(ChannelError::NotInitialized("data transfer manager is not connected to the signaling layer"));
        }

        let key = PoolKey::new(connection_id, Direction::Out, peer);

        let mark = {
            let mut establishing = self.establishing.lock().unwrap();
            if establishing.contains(&key) {
                debug!("connection to {:?} is being established concurrently - waiting for it", key);
                EstablishingMark { inner: self, key: None }
            }
            else {
                if let Some(connection) = self.usable_connection(&key) {
                    return Ok(connection);
                }
                establishing.insert(key.clone());
                EstablishingMark { inner: self, key: Some(key.clone()) }
            }
        };

        let _connect_guard = self.connect_lock.lock().await;

        // another task may have finished connecting while this one was waiting
        if let Some(connection) = self.usable_connection(&key) {
            return Ok(connection);
        }

        let connection = self.connect_with_services(connection_id, peer).await?;
        self.connection_changed(connection_id, peer, connection.clone(), false).await;
        drop(mark);

        if !connection.is_connected() {
            return Err(ChannelError::ConnectionClosed);
        }
        Ok(connection)
    }

    async fn connect_with_services(&self, connection_id: &str, peer: &PeerId) -> ChannelResult<Arc<BinaryChannelConnection>> {
        let mask = *self.transport_mask.lock().unwrap();
        let mut active = self.active.subscribe();

        for service in self.services.iter().filter(|s| mask.intersects(s.mode().transport_mask())) {
            let mode = service.mode();
            debug!("connecting to {} with connection id {:?} using {:?}", peer, connection_id, mode);

            let mut attempt = AbortOnDrop(tokio::spawn({
                let service = service.clone();
                let connection_id = connection_id.to_string();
                let peer = peer.clone();
                async move { service.connect(&connection_id, &peer).await }
            }));

            let result = select! {
                result = &mut attempt.0 => result,
                _ = async { active.wait_for(|&active| !active).await.map(|_| ()) } => {
                    info!("connecting to {} was cancelled", peer);
                    return Err(ChannelError::Cancelled);
                }
            };

            match result {
                Ok(Ok(connection)) => {
                    info!("connected to {} using {:?}", peer, mode);
                    return Ok(connection);
                }
                Ok(Err(e)) => {
                    warn!("failed to connect to {} using {:?}, trying the next transport: {}", peer, mode, e);
                }
                Err(e) if e.is_panic() => {
                    warn!("unexpected error connecting to {} using {:?}, trying the next transport", peer, mode);
                }
                Err(_) => {
                    return Err(ChannelError::Cancelled);
                }
            }
        }

        Err(ChannelError::TransportsExhausted { peer: peer.clone() })
    }

    async fn activate(&self, signaling: &Arc<dyn SignalingHandle>) {
        info!("signaling connection is up - activating transports");
        *self.signaling.lock().unwrap() = Some(signaling.clone());
        self.pool.open();
        self.active.send_replace(true);

        for service in &self.services {
            if let Err(e) = service.initialize(signaling.clone(), self.handler()).await {
                warn!("error initializing {:?} transport: {}", service.mode(), e);
            }
        }
    }

    async fn deactivate(&self, state: SignalingState) {
        let prev = self.signaling.lock().unwrap().take();
        if prev.is_none() {
            return;
        }
        info!("signaling connection changed to {:?} - shutting down transports", state);

        self.active.send_replace(false);

        let connect_guard = match timeout(self.config.uninitialize_lock_timeout, self.connect_lock.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                warn!("a connection attempt did not terminate within {:?} - shutting down transports anyway", self.config.uninitialize_lock_timeout);
                None
            }
        };
        for service in &self.services {
            service.uninitialize().await;
        }
        drop(connect_guard);

        self.pool.close().await;
    }
}

#[async_trait]
impl ConnectionEventHandler for ManagerInner {
    async fn connection_changed(&self, connection_id: &str, peer: &PeerId, connection: Arc<BinaryChannelConnection>, incoming: bool) {
        let key = PoolKey::new(connection_id, Direction::from_incoming(incoming), peer);
        debug!("connection changed: {:?} using {:?}", key, connection.transfer_mode());

        self.connection_listeners.notify(|l| l.connection_changed(connection_id, peer, &connection, incoming));

        match self.pool.add(key.clone(), connection.clone()) {
            Some(prev) if Arc::ptr_eq(&prev, &connection) => {
                warn!("connection pool is closed - closing connection {:?}", key);
                connection.close().await;
                return;
            }
            Some(prev) => {
                info!("connection {:?} is superseded by a new connection - closing it", key);
                prev.close().await;
            }
            None => {}
        }

        connection.initialize();
    }

    fn connection_closed(&self, connection: &BinaryChannelConnection) {
        debug!("connection closed: {:?}", connection.pool_key());
        self.pool.remove_if_same(connection.pool_key(), connection);

        self.connection_listeners.notify(|l| l.connection_closed(connection.connection_id(), connection.remote_peer(), connection.transfer_mode()));
    }

    fn transfer_received(&self, description: TransferDescription, payload: Bytes, mode: TransferMode) {
        self.transfer_listeners.notify(|l| l.transfer_received(description.clone(), payload.clone(), mode));
    }
}
