use std::fmt::{Debug, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, trace, warn, Instrument};

use crate::channel::dictionary::OutgoingDictionary;
use crate::channel::fragment_id_pool::FragmentIdPool;
use crate::channel::reassembly::ReceiveState;
use crate::channel::transfer_description::TransferDescription;
use crate::channel::wire::{num_chunks, Frame, CHUNK_SIZE};
use crate::config::ChannelConfig;
use crate::error::{ChannelError, ChannelResult};
use crate::net::peer::{Direction, PeerId, PoolKey};
use crate::net::transport_service::TransferMode;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The callback through which transport services and connections report to the owning
///  manager. Transport services report new connections, connections report their own
///  termination and every payload they receive.
#[async_trait]
pub trait ConnectionEventHandler: Send + Sync + 'static {
    /// A transport service established (`incoming == false`) or accepted (`incoming == true`) a
    ///  connection. The connection is not initialized yet.
    async fn connection_changed(&self, connection_id: &str, peer: &PeerId, connection: Arc<BinaryChannelConnection>, incoming: bool);

    /// Called exactly once per connection, after it reached [ConnectionState::Closed]
    fn connection_closed(&self, connection: &BinaryChannelConnection);

    /// Called on the connection's receive task for every completely reassembled payload. This
    ///  holds up reading the next frame, so implementations must hand off non-trivial work.
    fn transfer_received(&self, description: TransferDescription, payload: Bytes, mode: TransferMode);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Created,
    Initializing,
    Connected,
    Closing,
    Closed,
}

struct SendSide {
    /// `None` after the connection was closed
    writer: Option<BoxedWriter>,
    namespaces: OutgoingDictionary<u8>,
    element_names: OutgoingDictionary<u16>,
}

/// A multiplexed, typed message channel over one raw byte stream to exactly one peer.
///
/// Any number of tasks may `send` concurrently, up to [FragmentIdPool::CAPACITY] of them at a
///  time; their DATA frames are interleaved on the wire. Received payloads are reassembled by a
///  single receive task which is started by [BinaryChannelConnection::initialize] and runs
///  until the stream ends, the peer violates the protocol, or the connection is closed locally.
pub struct BinaryChannelConnection {
    key: PoolKey,
    local_peer: PeerId,
    mode: TransferMode,
    config: Arc<ChannelConfig>,

    state: AtomicU8,
    fragment_ids: FragmentIdPool,
    send_side: tokio::sync::Mutex<SendSide>,
    /// handed over to the receive task on initialization
    reader: Mutex<Option<BoxedReader>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,

    handler: Weak<dyn ConnectionEventHandler>,
}

impl Debug for BinaryChannelConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "BinaryChannelConnection{{{:?} {:?} {:?}}}", self.key, self.mode, self.state())
    }
}

impl BinaryChannelConnection {
    pub fn new(
        key: PoolKey,
        local_peer: &PeerId,
        mode: TransferMode,
        reader: BoxedReader,
        writer: BoxedWriter,
        handler: Weak<dyn ConnectionEventHandler>,
        config: Arc<ChannelConfig>,
    ) -> Arc<BinaryChannelConnection> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(BinaryChannelConnection {
            key,
            local_peer: local_peer.clone(),
            mode,
            config,
            state: AtomicU8::new(ConnectionState::Created.into()),
            fragment_ids: FragmentIdPool::new(),
            send_side: tokio::sync::Mutex::new(SendSide {
                writer: Some(writer),
                namespaces: Default::default(),
                element_names: Default::default(),
            }),
            reader: Mutex::new(Some(reader)),
            receive_task: Mutex::new(None),
            shutdown,
            handler,
        })
    }

    pub fn connection_id(&self) -> &str {
        &self.key.connection_id
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.key.peer
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn direction(&self) -> Direction {
        self.key.direction
    }

    pub fn pool_key(&self) -> &PoolKey {
        &self.key
    }

    pub fn transfer_mode(&self) -> TransferMode {
        self.mode
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .expect("this is a bug: only valid states are ever stored")
    }

    /// `true` until the connection starts closing - a connection is usable for sending before
    ///  it is initialized
    pub fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Created | ConnectionState::Initializing | ConnectionState::Connected)
    }

    pub fn num_fragments_in_flight(&self) -> usize {
        self.fragment_ids.num_in_use()
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.compare_exchange(from.into(), to.into(), Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    /// Starts the receive task. Calling this more than once, or on a closed connection, has no
    ///  effect.
    pub fn initialize(self: &Arc<Self>) {
        if !self.transition(ConnectionState::Created, ConnectionState::Initializing) {
            return;
        }

        let Some(reader) = self.reader.lock().unwrap().take() else {
            return;
        };

        let receive_state = ReceiveState::new(&self.local_peer, self.remote_peer(), self.config.max_payload_size);
        let span = tracing::debug_span!("receive", key = %self.key);
        let handle = tokio::spawn(
            receive_loop(Arc::downgrade(self), self.handler.clone(), self.mode, reader, self.shutdown.subscribe(), receive_state)
                .instrument(span)
        );
        *self.receive_task.lock().unwrap() = Some(handle);

        if self.transition(ConnectionState::Initializing, ConnectionState::Connected) {
            debug!("initialized connection {:?}", self.key);
        }
    }

    /// Sends a payload as one fragment, returning once all of its frames are written.
    ///
    /// Fails without touching the stream if the connection is closed, if the payload exceeds
    ///  the maximum payload size or if all fragment ids are in use. I/O errors close the
    ///  connection.
    pub async fn send(&self, description: &TransferDescription, payload: Bytes) -> ChannelResult<()> {
        if !self.is_connected() {
            return Err(ChannelError::ConnectionClosed);
        }
        if payload.len() > self.config.max_payload_size {
            return Err(ChannelError::InvalidTransfer(format!("payload of {} bytes exceeds the maximum payload size of {} bytes", payload.len(), self.config.max_payload_size)));
        }

        let fragment_id = self.fragment_ids.allocate()
            .ok_or(ChannelError::FragmentIdsExhausted(FragmentIdPool::CAPACITY))?;

        let result = self.send_fragment(fragment_id.id(), description, payload).await;
        drop(fragment_id);

        if let Err(e) = &result {
            if e.is_fatal_for_connection() {
                error!("error sending on {:?} - closing the connection: {}", self.key, e);
                self.close().await;
            }
        }
        result
    }

    async fn send_fragment(&self, fragment_id: u16, description: &TransferDescription, payload: Bytes) -> ChannelResult<()> {
        for s in [&description.namespace, &description.element_name] {
            if s.len() > u16::MAX as usize {
                return Err(ChannelError::InvalidTransfer(format!("message type string of {} bytes exceeds the maximum of {}", s.len(), u16::MAX)));
            }
        }
        let chunk_count = u32::try_from(num_chunks(payload.len()))
            .map_err(|_| ChannelError::InvalidTransfer(format!("payload of {} bytes is too large", payload.len())))?;

        trace!("sending fragment {} with {} chunks: {:?}", fragment_id, chunk_count, description);

        let mut buf = BytesMut::new();
        {
            let mut send_side = self.send_side.lock().await;
            let SendSide { writer, namespaces, element_names } = &mut *send_side;
            let writer = writer.as_mut()
                .ok_or(ChannelError::ConnectionClosed)?;

            let (namespace_id, new_namespace) = namespaces.resolve(&description.namespace)?;
            let (element_name_id, new_element_name) = match element_names.resolve(&description.element_name) {
                Ok(resolved) => resolved,
                Err(e) => {
                    if new_namespace {
                        namespaces.forget(&description.namespace);
                    }
                    return Err(e);
                }
            };

            if new_namespace {
                Frame::NamespaceUpdate { id: namespace_id, namespace: description.namespace.clone() }
                    .ser(&mut buf)?;
            }
            if new_element_name {
                Frame::ElementNameUpdate { id: element_name_id, element_name: description.element_name.clone() }
                    .ser(&mut buf)?;
            }
            // NB: updates and the description are written and flushed together, so the peer knows
            //  the ids before anything refers to them
            Frame::TransferDescription {
                fragment_id,
                chunk_count,
                namespace_id,
                element_name_id,
                compressed: description.compressed,
            }
                .ser(&mut buf)?;

            self.write_flushed(&mut **writer, &buf).await?;
        }

        let mut offset = 0;
        while offset < payload.len() {
            let end = usize::min(offset + CHUNK_SIZE, payload.len());
            buf.clear();
            Frame::Data { fragment_id, payload: payload.slice(offset..end) }
                .ser(&mut buf)?;
            offset = end;

            let mut send_side = self.send_side.lock().await;
            let writer = send_side.writer.as_mut()
                .ok_or(ChannelError::ConnectionClosed)?;
            self.write_flushed(&mut **writer, &buf).await?;
        }
        Ok(())
    }

    /// Writes raw frame bytes, giving up if the connection is closed concurrently
    async fn write_flushed(&self, writer: &mut (dyn AsyncWrite + Send + Unpin), buf: &[u8]) -> ChannelResult<()> {
        let mut shutdown = self.shutdown.subscribe();
        select! {
            result = async {
                writer.write_all(buf).await?;
                writer.flush().await
            } => Ok(result?),
            _ = async { shutdown.wait_for(|&closed| closed).await.map(|_| ()) } => Err(ChannelError::ConnectionClosed),
        }
    }

    /// Closes the stream and stops the receive task, then notifies the handler. Idempotent.
    pub async fn close(&self) {
        self.do_close(false).await
    }

    async fn do_close(&self, from_receive_task: bool) {
        let mut current = self.state();
        loop {
            if matches!(current, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            if self.transition(current, ConnectionState::Closing) {
                break;
            }
            current = self.state();
        }
        debug!("closing connection {:?}", self.key);

        self.shutdown.send_replace(true);

        // pending writes were interrupted by the shutdown signal, so the lock becomes available
        let writer = self.send_side.lock().await.writer.take();
        if let Some(mut writer) = writer {
            match timeout(self.config.close_join_timeout, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("error shutting down the stream of {:?}: {}", self.key, e),
                Err(_) => warn!("timeout shutting down the stream of {:?}", self.key),
            }
        }
        drop(self.reader.lock().unwrap().take());

        let receive_task = self.receive_task.lock().unwrap().take();
        if let Some(mut receive_task) = receive_task {
            if !from_receive_task {
                if timeout(self.config.close_join_timeout, &mut receive_task).await.is_err() {
                    warn!("receive task of {:?} did not terminate within {:?} - aborting it", self.key, self.config.close_join_timeout);
                    receive_task.abort();
                }
            }
        }

        self.state.store(ConnectionState::Closed.into(), Ordering::Release);
        debug!("connection {:?} is closed", self.key);

        if let Some(handler) = self.handler.upgrade() {
            handler.connection_closed(self);
        }
    }
}

impl Drop for BinaryChannelConnection {
    fn drop(&mut self) {
        // stop a receive task that outlives all references
        self.shutdown.send_replace(true);
    }
}

async fn receive_loop(
    connection: Weak<BinaryChannelConnection>,
    handler: Weak<dyn ConnectionEventHandler>,
    mode: TransferMode,
    mut reader: BoxedReader,
    mut shutdown: watch::Receiver<bool>,
    mut state: ReceiveState,
) {
    debug!("starting receive loop");

    loop {
        let frame = select! {
            frame = Frame::read_from(&mut reader) => frame,
            _ = async { shutdown.wait_for(|&closed| closed).await.map(|_| ()) } => {
                debug!("receive loop was shut down");
                return;
            }
        };

        match frame {
            Ok(Some(frame)) => {
                trace!("received {:?} frame", frame.opcode());
                match state.on_frame(frame) {
                    Ok(Some((description, payload))) => deliver(&handler, description, payload, mode),
                    Ok(None) => {}
                    Err(e) => {
                        error!("closing connection: {}", e);
                        break;
                    }
                }
            }
            Ok(None) => {
                debug!("end of stream");
                break;
            }
            Err(e) => {
                if *shutdown.borrow() {
                    debug!("receive loop terminated during shutdown: {}", e);
                    return;
                }
                error!("closing connection: {}", e);
                break;
            }
        }
    }

    drop(reader);
    if let Some(connection) = connection.upgrade() {
        connection.do_close(true).await;
    }
}

fn deliver(handler: &Weak<dyn ConnectionEventHandler>, description: TransferDescription, payload: Bytes, mode: TransferMode) {
    let Some(handler) = handler.upgrade() else {
        debug!("no handler - dropping received {:?}", description);
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| handler.transfer_received(description, payload, mode))).is_err() {
        warn!("handler panicked while processing a received payload - continuing");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Buf;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;
    use tokio::time::sleep;

    use super::*;
    use crate::test_util::channel::{connection_over, connection_pair, connection_pair_with_config, raw_connection, RecordingHandler, td};

    fn payload(len: usize) -> Bytes {
        (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
    }

    /// reads frames until the stream has no more data for a while
    async fn read_frames(stream: &mut tokio::io::DuplexStream) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Ok(Some(frame))) = timeout(Duration::from_millis(100), Frame::read_from(stream)).await {
            frames.push(frame);
        }
        frames
    }

    #[rstest]
    #[case::empty(0)]
    #[case::one(1)]
    #[case::small(100)]
    #[case::chunk_minus_one(CHUNK_SIZE - 1)]
    #[case::one_chunk(CHUNK_SIZE)]
    #[case::chunk_plus_one(CHUNK_SIZE + 1)]
    #[case::megabytes(3 * 1024 * 1024 + 17)]
    #[tokio::test]
    async fn test_round_trip(#[case] len: usize) {
        let (a, b, _, handler_b) = connection_pair();
        a.initialize();
        b.initialize();

        let description = td("a", "b", "urn:saros", "activity").with_compressed(true);
        a.send(&description, payload(len)).await.unwrap();

        let received = handler_b.wait_for_received(1).await;
        let (received_description, received_payload) = &received[0];
        assert_eq!(received_payload, &payload(len));
        assert_eq!(received_description.namespace, "urn:saros");
        assert_eq!(received_description.element_name, "activity");
        assert_eq!(received_description.sender, PeerId::new("a"));
        assert_eq!(received_description.recipient, PeerId::new("b"));
        assert!(received_description.compressed);
        assert_eq!(received_description.size, len);
    }

    #[tokio::test]
    async fn test_bidirectional_and_ordered() {
        let (a, b, handler_a, handler_b) = connection_pair();
        a.initialize();
        b.initialize();

        for i in 0..10u8 {
            a.send(&td("a", "b", "ns", "x"), Bytes::from(vec![i; 10])).await.unwrap();
            b.send(&td("b", "a", "ns", "y"), Bytes::from(vec![i; 20])).await.unwrap();
        }

        let at_b = handler_b.wait_for_received(10).await;
        let at_a = handler_a.wait_for_received(10).await;
        for i in 0..10u8 {
            assert_eq!(at_b[i as usize].1, Bytes::from(vec![i; 10]));
            assert_eq!(at_a[i as usize].1, Bytes::from(vec![i; 20]));
            assert_eq!(at_a[i as usize].0.element_name, "y");
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_are_reassembled() {
        let (a, b, _, handler_b) = connection_pair();
        a.initialize();
        b.initialize();

        let mut handles = Vec::new();
        for i in 0..8usize {
            let a = a.clone();
            handles.push(tokio::spawn(async move {
                a.send(&td("a", "b", "ns", &format!("el{}", i)), Bytes::from(vec![i as u8; 3 * CHUNK_SIZE + i])).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let received = handler_b.wait_for_received(8).await;
        for (description, payload) in received {
            let i: usize = description.element_name[2..].parse().unwrap();
            assert_eq!(payload, Bytes::from(vec![i as u8; 3 * CHUNK_SIZE + i]));
        }
    }

    #[rstest]
    #[case(0, 0)]
    #[case(1, 1)]
    #[case(CHUNK_SIZE, 1)]
    #[case(CHUNK_SIZE + 1, 2)]
    #[case(10 * CHUNK_SIZE - 5, 10)]
    #[tokio::test]
    async fn test_chunking(#[case] len: usize, #[case] expected_chunks: usize) {
        let (conn, mut peer_side, _) = raw_connection(1024 * 1024);
        conn.send(&td("a", "b", "ns", "el"), payload(len)).await.unwrap();

        let frames = read_frames(&mut peer_side).await;
        let data_lengths = frames.iter()
            .filter_map(|f| match f {
                Frame::Data { payload, .. } => Some(payload.len()),
                _ => None,
            })
            .collect::<Vec<_>>();

        assert_eq!(data_lengths.len(), expected_chunks);
        assert_eq!(data_lengths.iter().sum::<usize>(), len);
        assert!(data_lengths.iter().all(|&l| l > 0 && l <= CHUNK_SIZE));
        assert!(frames.contains(&Frame::TransferDescription {
            fragment_id: 0,
            chunk_count: expected_chunks as u32,
            namespace_id: 0,
            element_name_id: 0,
            compressed: false,
        }));
    }

    #[tokio::test]
    async fn test_dictionary_updates_are_sent_once() {
        let (conn, mut peer_side, _) = raw_connection(1024 * 1024);

        conn.send(&td("a", "b", "urn:ns", "first"), payload(1)).await.unwrap();
        conn.send(&td("a", "b", "urn:ns", "first"), payload(1)).await.unwrap();
        conn.send(&td("a", "b", "urn:ns", "second"), payload(1)).await.unwrap();

        let updates = read_frames(&mut peer_side).await
            .into_iter()
            .filter(|f| matches!(f, Frame::NamespaceUpdate { .. } | Frame::ElementNameUpdate { .. }))
            .collect::<Vec<_>>();

        assert_eq!(updates, vec![
            Frame::NamespaceUpdate { id: 0, namespace: "urn:ns".to_string() },
            Frame::ElementNameUpdate { id: 0, element_name: "first".to_string() },
            Frame::ElementNameUpdate { id: 1, element_name: "second".to_string() },
        ]);
    }

    #[tokio::test]
    async fn test_updates_precede_their_use() {
        let (conn, mut peer_side, _) = raw_connection(1024 * 1024);
        conn.send(&td("a", "b", "n", "e"), payload(1)).await.unwrap();

        let frames = read_frames(&mut peer_side).await;
        assert!(matches!(frames[0], Frame::NamespaceUpdate { .. }));
        assert!(matches!(frames[1], Frame::ElementNameUpdate { .. }));
        assert!(matches!(frames[2], Frame::TransferDescription { .. }));
        assert!(matches!(frames[3], Frame::Data { .. }));
    }

    #[tokio::test]
    async fn test_fragment_id_exhaustion() {
        let (conn, mut peer_side, _) = raw_connection(1024);

        // nobody reads the peer side yet, so the first send stalls on the stream and the rest on the send lock
        let mut pending = Vec::new();
        for _ in 0..FragmentIdPool::CAPACITY {
            let conn = conn.clone();
            pending.push(tokio::spawn(async move {
                conn.send(&td("a", "b", "ns", "el"), payload(10_000)).await
            }));
        }
        while conn.num_fragments_in_flight() < FragmentIdPool::CAPACITY {
            sleep(Duration::from_millis(1)).await;
        }

        let result = conn.send(&td("a", "b", "ns", "el"), payload(10)).await;
        assert!(matches!(result, Err(ChannelError::FragmentIdsExhausted(32))));

        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match tokio::io::AsyncReadExt::read(&mut peer_side, &mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        for handle in pending {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(conn.num_fragments_in_flight(), 0);
        conn.send(&td("a", "b", "ns", "el"), payload(10)).await.unwrap();

        conn.close().await;
        drain.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_opcode_closes_connection() {
        let (conn, mut peer_side, handler) = raw_connection(1024);
        conn.initialize();
        assert_eq!(conn.state(), ConnectionState::Connected);

        let mut raw = BytesMut::new();
        Frame::NamespaceUpdate { id: 0, namespace: "ns".to_string() }.ser(&mut raw).unwrap();
        Frame::ElementNameUpdate { id: 0, element_name: "el".to_string() }.ser(&mut raw).unwrap();
        raw.extend_from_slice(&[0x01]);
        Frame::TransferDescription { fragment_id: 0, chunk_count: 1, namespace_id: 0, element_name_id: 0, compressed: false }.ser(&mut raw).unwrap();
        Frame::Data { fragment_id: 0, payload: Bytes::from_static(b"x") }.ser(&mut raw).unwrap();
        peer_side.write_all(raw.chunk()).await.unwrap();

        handler.wait_for_closed(1).await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(handler.received().is_empty());

        let result = conn.send(&td("a", "b", "ns", "el"), payload(1)).await;
        assert!(matches!(result, Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_remote_close_closes_connection() {
        let (a, b, handler_a, handler_b) = connection_pair();
        a.initialize();
        b.initialize();

        b.close().await;
        assert_eq!(b.state(), ConnectionState::Closed);
        assert_eq!(handler_b.closed(), vec![b.pool_key().clone()]);

        handler_a.wait_for_closed(1).await;
        assert_eq!(a.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (conn, _peer_side, handler) = raw_connection(1024);
        conn.initialize();

        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(handler.closed().len(), 1);

        // initializing a closed connection has no effect
        conn.initialize();
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (conn, _peer_side, _) = raw_connection(1024);
        assert_eq!(conn.state(), ConnectionState::Created);
        conn.initialize();
        conn.initialize();
        assert_eq!(conn.state(), ConnectionState::Connected);
        conn.close().await;
    }

    #[tokio::test]
    async fn test_close_unblocks_stalled_send() {
        let (conn, _peer_side, _) = raw_connection(1024);

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(&td("a", "b", "ns", "el"), payload(1_000_000)).await })
        };
        while conn.num_fragments_in_flight() == 0 {
            sleep(Duration::from_millis(1)).await;
        }

        conn.close().await;
        assert!(matches!(sender.await.unwrap(), Err(ChannelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_too_long_type_string_is_rejected_without_closing() {
        let (conn, _peer_side, _) = raw_connection(1024);
        let long = "x".repeat(u16::MAX as usize + 1);

        let result = conn.send(&td("a", "b", &long, "el"), payload(1)).await;
        assert!(matches!(result, Err(ChannelError::InvalidTransfer(_))));
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_receiving() {
        let (a, b, _, handler_b) = connection_pair();
        a.initialize();
        b.initialize();
        handler_b.panic_on_element_name("boom");

        a.send(&td("a", "b", "ns", "boom"), payload(5)).await.unwrap();
        a.send(&td("a", "b", "ns", "fine"), payload(5)).await.unwrap();

        let received = handler_b.wait_for_received(1).await;
        assert_eq!(received[0].0.element_name, "fine");
        assert!(b.is_connected());
    }

    #[tokio::test]
    async fn test_payload_of_max_size_with_partial_last_chunk() {
        // 100_000 bytes are four chunks, the last one partial
        let (a, b, _, handler_b) = connection_pair_with_config(ChannelConfig { max_payload_size: 100_000, ..Default::default() });
        a.initialize();
        b.initialize();

        a.send(&td("a", "b", "ns", "el"), payload(100_000)).await.unwrap();

        let received = handler_b.wait_for_received(1).await;
        assert_eq!(received[0].1, payload(100_000));
        assert_eq!(a.state(), ConnectionState::Connected);
        assert_eq!(b.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_payload_above_max_size_is_rejected_without_closing() {
        let (a, b, _, handler_b) = connection_pair_with_config(ChannelConfig { max_payload_size: 100_000, ..Default::default() });
        a.initialize();
        b.initialize();

        let result = a.send(&td("a", "b", "ns", "el"), payload(100_001)).await;
        assert!(matches!(result, Err(ChannelError::InvalidTransfer(_))));
        assert_eq!(a.num_fragments_in_flight(), 0);

        a.send(&td("a", "b", "ns", "el"), payload(10)).await.unwrap();
        let received = handler_b.wait_for_received(1).await;
        assert_eq!(received[0].1, payload(10));
        assert!(a.is_connected());
        assert!(b.is_connected());
    }

    /// blocks the receive task inside `transfer_received` until released
    struct BlockingHandler {
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    #[async_trait]
    impl ConnectionEventHandler for BlockingHandler {
        async fn connection_changed(&self, _: &str, _: &PeerId, _: Arc<BinaryChannelConnection>, _: bool) {
        }

        fn connection_closed(&self, _: &BinaryChannelConnection) {
        }

        fn transfer_received(&self, _: TransferDescription, _: Bytes, _: TransferMode) {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_gives_up_on_blocked_receive_task() {
        let config = Arc::new(ChannelConfig { close_join_timeout: Duration::from_millis(200), ..Default::default() });
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let blocking = Arc::new(BlockingHandler {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let blocking_weak: Weak<dyn ConnectionEventHandler> = {
            let weak: Weak<BlockingHandler> = Arc::downgrade(&blocking);
            weak
        };

        let handler_a = RecordingHandler::new();
        let (stream_a, stream_b) = tokio::io::duplex(64 * 1024);
        let a = connection_over(stream_a, "c", "a", "b", Direction::Out, handler_a.weak(), config.clone());
        let b = connection_over(stream_b, "c", "b", "a", Direction::In, blocking_weak, config);
        a.initialize();
        b.initialize();

        a.send(&td("a", "b", "ns", "el"), payload(5)).await.unwrap();
        tokio::task::spawn_blocking(move || entered_rx.recv()).await.unwrap().unwrap();

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), b.close()).await
            .expect("close must not wait for the blocked receive task indefinitely");
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(b.state(), ConnectionState::Closed);

        release_tx.send(()).unwrap();
        handler_a.wait_for_closed(1).await;
    }
}
