use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use crate::channel::connection::{BinaryChannelConnection, ConnectionEventHandler};
use crate::config::ChannelConfig;
use crate::net::peer::{Direction, PeerId, PoolKey};
use crate::net::transport_service::{SignalingHandle, TransferMode, TransportService};
use crate::util::buf_ext::{BufExt, BufMutExt};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_HANDSHAKE_MSG_LEN: usize = 4 * 1024;

/// Sent by the initiating side right after the TCP connection is established
#[derive(Debug, Eq, PartialEq)]
struct InitMsg {
    connection_id: String,
    initiator: PeerId,
}
impl InitMsg {
    fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        buf.put_short_string(&self.connection_id)?;
        self.initiator.ser(buf)
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<InitMsg> {
        let connection_id = buf.try_get_short_string()?;
        let initiator = PeerId::try_deser(buf)?;
        Ok(InitMsg { connection_id, initiator })
    }
}

/// The accepting side's reply, confirming which peer was actually reached
#[derive(Debug, Eq, PartialEq)]
struct InitResponseMsg {
    acceptor: PeerId,
}
impl InitResponseMsg {
    fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        self.acceptor.ser(buf)
    }

    fn deser(buf: &mut impl Buf) -> anyhow::Result<InitResponseMsg> {
        Ok(InitResponseMsg { acceptor: PeerId::try_deser(buf)? })
    }
}

async fn write_handshake_msg(stream: &mut TcpStream, ser: impl FnOnce(&mut BytesMut) -> anyhow::Result<()>) -> anyhow::Result<()> {
    let mut msg_buf = BytesMut::new();
    ser(&mut msg_buf)?;

    let mut buf = BytesMut::with_capacity(msg_buf.len() + 4);
    buf.put_u32(msg_buf.len().prechecked_cast());
    buf.put_slice(&msg_buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_handshake_msg(stream: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let msg_len: usize = u32::from_be_bytes(len_buf).safe_cast();

    if msg_len > MAX_HANDSHAKE_MSG_LEN {
        bail!("handshake message of {} bytes exceeds the maximum of {}", msg_len, MAX_HANDSHAKE_MSG_LEN);
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(msg_buf)
}

struct Registration {
    local_peer: PeerId,
    handler: Weak<dyn ConnectionEventHandler>,
    local_addr: SocketAddr,
    accept_loop: JoinHandle<()>,
}

/// A 'direct' transport: plain TCP connections between peers.
///
/// While initialized, the service listens on its bind address and reports accepted connections
///  as incoming. Peers' socket addresses must be registered via
///  [TcpTransportService::add_peer_address] before connecting to them.
pub struct TcpTransportService {
    bind_addr: SocketAddr,
    config: Arc<ChannelConfig>,
    peer_addresses: Mutex<FxHashMap<PeerId, SocketAddr>>,
    registration: Mutex<Option<Registration>>,
}

impl TcpTransportService {
    pub fn new(bind_addr: SocketAddr, config: Arc<ChannelConfig>) -> TcpTransportService {
        TcpTransportService {
            bind_addr,
            config,
            peer_addresses: Default::default(),
            registration: Default::default(),
        }
    }

    pub fn add_peer_address(&self, peer: &PeerId, addr: SocketAddr) {
        self.peer_addresses.lock().unwrap()
            .insert(peer.clone(), addr);
    }

    /// The address the service actually listens on, which differs from the bind address when
    ///  binding to port 0. `None` while the service is not initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.registration.lock().unwrap()
            .as_ref()
            .map(|r| r.local_addr)
    }

    fn local_peer_and_handler(&self) -> anyhow::Result<(PeerId, Weak<dyn ConnectionEventHandler>)> {
        self.registration.lock().unwrap()
            .as_ref()
            .map(|r| (r.local_peer.clone(), r.handler.clone()))
            .ok_or_else(|| anyhow!("TCP transport is not initialized"))
    }

    async fn handshake_outgoing(stream: &mut TcpStream, connection_id: &str, local_peer: &PeerId, peer: &PeerId) -> anyhow::Result<()> {
        let init = InitMsg {
            connection_id: connection_id.to_string(),
            initiator: local_peer.clone(),
        };
        write_handshake_msg(stream, |buf| init.ser(buf)).await?;

        let response = InitResponseMsg::deser(&mut read_handshake_msg(stream).await?.as_slice())?;
        if &response.acceptor != peer {
            bail!("expected to reach {} but {} answered", peer, response.acceptor);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportService for TcpTransportService {
    fn mode(&self) -> TransferMode {
        TransferMode::Direct
    }

    async fn connect(&self, connection_id: &str, peer: &PeerId) -> anyhow::Result<Arc<BinaryChannelConnection>> {
        let (local_peer, handler) = self.local_peer_and_handler()?;
        let addr = self.peer_addresses.lock().unwrap()
            .get(peer)
            .copied()
            .ok_or_else(|| anyhow!("no socket address for {}", peer))?;

        debug!("opening TCP connection to {} at {:?}", peer, addr);
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        timeout(HANDSHAKE_TIMEOUT, Self::handshake_outgoing(&mut stream, connection_id, &local_peer, peer)).await
            .map_err(|_| anyhow!("handshake with {} timed out", peer))??;
        debug!("handshake with {} complete", peer);

        let (read, write) = stream.into_split();
        Ok(BinaryChannelConnection::new(
            PoolKey::new(connection_id, Direction::Out, peer),
            &local_peer,
            TransferMode::Direct,
            Box::new(read),
            Box::new(write),
            handler,
            self.config.clone(),
        ))
    }

    async fn initialize(&self, signaling: Arc<dyn SignalingHandle>, handler: Weak<dyn ConnectionEventHandler>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let local_peer = signaling.local_peer();
        info!("TCP transport for {} listening on {:?}", local_peer, local_addr);

        let accept_loop = tokio::spawn(accept_loop(listener, local_peer.clone(), handler.clone(), self.config.clone()));

        let prev = self.registration.lock().unwrap()
            .replace(Registration { local_peer, handler, local_addr, accept_loop });
        if let Some(prev) = prev {
            warn!("TCP transport was initialized twice - stopping the previous listener");
            prev.accept_loop.abort();
        }
        Ok(())
    }

    async fn uninitialize(&self) {
        let registration = self.registration.lock().unwrap().take();
        if let Some(registration) = registration {
            debug!("stopping TCP listener on {:?}", registration.local_addr);
            registration.accept_loop.abort();
            // wait for the listener to be dropped
            let _ = registration.accept_loop.await;
        }
    }
}

async fn accept_loop(listener: TcpListener, local_peer: PeerId, handler: Weak<dyn ConnectionEventHandler>, config: Arc<ChannelConfig>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!("error accepting TCP connection: {}", e);
                continue;
            }
        };

        let local_peer = local_peer.clone();
        let handler = handler.clone();
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection_request(addr, stream, local_peer, handler, config).await {
                warn!("rejected connection from {:?}: {}", addr, e);
            }
        });
    }
}

#[instrument(name="accepted_connection", skip_all, fields(addr = format!("{:?}", _addr)))]
async fn handle_connection_request(
    _addr: SocketAddr,
    mut stream: TcpStream,
    local_peer: PeerId,
    handler: Weak<dyn ConnectionEventHandler>,
    config: Arc<ChannelConfig>,
) -> anyhow::Result<()> {
    debug!("received connection request");
    stream.set_nodelay(true)?;

    let init = timeout(HANDSHAKE_TIMEOUT, async {
        let init = InitMsg::deser(&mut read_handshake_msg(&mut stream).await?.as_slice())?;
        let response = InitResponseMsg { acceptor: local_peer.clone() };
        write_handshake_msg(&mut stream, |buf| response.ser(buf)).await?;
        anyhow::Ok(init)
    })
        .instrument(Span::current())
        .await
        .map_err(|_| anyhow!("handshake timed out"))??;
    debug!("initial handshake with {} complete", init.initiator);

    let Some(handler) = handler.upgrade() else {
        bail!("transport is shutting down");
    };

    let (read, write) = stream.into_split();
    let connection = BinaryChannelConnection::new(
        PoolKey::new(&init.connection_id, Direction::In, &init.initiator),
        &local_peer,
        TransferMode::Direct,
        Box::new(read),
        Box::new(write),
        Arc::downgrade(&handler),
        config,
    );
    handler.connection_changed(&init.connection_id, &init.initiator, connection, true).await;
    Ok(())
}
