use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::channel::dictionary::IncomingDictionary;
use crate::channel::transfer_description::TransferDescription;
use crate::channel::wire::{num_chunks, Frame};
use crate::error::{ChannelError, ChannelResult};
use crate::net::peer::PeerId;

struct PendingFragment {
    description: TransferDescription,
    chunk_count: u32,
    received_chunks: u32,
    buf: BytesMut,
}

/// Receive-side state of one connection: the incoming dictionaries and the fragments that are
///  announced but not complete yet. It is owned by the connection's receive loop, which feeds
///  it every frame in stream order.
pub struct ReceiveState {
    local: PeerId,
    remote: PeerId,
    max_payload_size: usize,
    namespaces: IncomingDictionary<u8>,
    element_names: IncomingDictionary<u16>,
    pending: FxHashMap<u16, PendingFragment>,
}

impl ReceiveState {
    pub fn new(local: &PeerId, remote: &PeerId, max_payload_size: usize) -> ReceiveState {
        ReceiveState {
            local: local.clone(),
            remote: remote.clone(),
            max_payload_size,
            namespaces: Default::default(),
            element_names: Default::default(),
            pending: Default::default(),
        }
    }

    /// Processes a frame, returning a payload if the frame completed it. Any error is a
    ///  protocol violation that leaves this state unusable.
    pub fn on_frame(&mut self, frame: Frame) -> ChannelResult<Option<(TransferDescription, Bytes)>> {
        match frame {
            Frame::NamespaceUpdate { id, namespace } => {
                trace!("namespace #{} is {:?}", id, namespace);
                self.namespaces.insert(id, namespace);
                Ok(None)
            }
            Frame::ElementNameUpdate { id, element_name } => {
                trace!("element name #{} is {:?}", id, element_name);
                self.element_names.insert(id, element_name);
                Ok(None)
            }
            Frame::TransferDescription { fragment_id, chunk_count, namespace_id, element_name_id, compressed } => {
                self.on_transfer_description(fragment_id, chunk_count, namespace_id, element_name_id, compressed)
            }
            Frame::Data { fragment_id, payload } => {
                self.on_data(fragment_id, payload)
            }
        }
    }

    fn on_transfer_description(&mut self, fragment_id: u16, chunk_count: u32, namespace_id: u8, element_name_id: u16, compressed: bool) -> ChannelResult<Option<(TransferDescription, Bytes)>> {
        if self.pending.contains_key(&fragment_id) {
            return Err(ChannelError::protocol_violation(format!("fragment id {} is announced while a previous fragment with that id is incomplete", fragment_id)));
        }
        if u64::from(chunk_count) > num_chunks(self.max_payload_size) as u64 {
            return Err(ChannelError::protocol_violation(format!("fragment {} announces {} chunks, exceeding the maximum payload size of {} bytes", fragment_id, chunk_count, self.max_payload_size)));
        }

        let description = TransferDescription {
            sender: self.remote.clone(),
            recipient: self.local.clone(),
            namespace: self.namespaces.get(namespace_id)?.to_string(),
            element_name: self.element_names.get(element_name_id)?.to_string(),
            compressed,
            size: 0,
        };
        trace!("fragment {}: expecting {} chunks for {:?}", fragment_id, chunk_count, description);

        if chunk_count == 0 {
            return Ok(Some((description, Bytes::new())));
        }

        self.pending.insert(fragment_id, PendingFragment {
            description,
            chunk_count,
            received_chunks: 0,
            buf: BytesMut::new(),
        });
        Ok(None)
    }

    fn on_data(&mut self, fragment_id: u16, payload: Bytes) -> ChannelResult<Option<(TransferDescription, Bytes)>> {
        let Some(pending) = self.pending.get_mut(&fragment_id) else {
            return Err(ChannelError::protocol_violation(format!("DATA frame for fragment {} which was not announced", fragment_id)));
        };

        if pending.buf.len() + payload.len() > self.max_payload_size {
            return Err(ChannelError::protocol_violation(format!("fragment {} exceeds the maximum payload size of {} bytes", fragment_id, self.max_payload_size)));
        }
        pending.buf.extend_from_slice(&payload);
        pending.received_chunks += 1;

        if pending.received_chunks < pending.chunk_count {
            return Ok(None);
        }

        if let Some(complete) = self.pending.remove(&fragment_id) {
            let payload = complete.buf.freeze();
            let description = complete.description.with_size(payload.len());
            trace!("fragment {} is complete: {:?}", fragment_id, description);
            return Ok(Some((description, payload)));
        }
        Ok(None)
    }

    pub fn num_pending(&self) -> usize {
        self.pending.len()
    }
}
