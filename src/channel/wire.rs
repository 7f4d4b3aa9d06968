//! Frame format of a binary channel. All numbers are in network byte order (BE).
//!
//! ```ascii
//! NAMESPACE_UPDATE    0x64  id: u8,  namespace: u16 length + UTF-8 bytes
//! ELEMENT_NAME_UPDATE 0x65  id: u16, element name: u16 length + UTF-8 bytes
//! TRANSFERDESCRIPTION 0xFA  fragment id: u16, chunk count: u32, namespace id: u8,
//!                           element name id: u16, compressed: u8 (0 or 1)
//! DATA                0xFB  fragment id: u16, length: u32, `length` payload bytes
//! ```
//!
//! NB: Fragment ids never exceed 31, but the wire field is two bytes wide.

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ChannelError, ChannelResult};
use crate::util::buf_ext::BufMutExt;
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// Maximum payload length of a single DATA frame
pub const CHUNK_SIZE: usize = 32767;

#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Opcode {
    NamespaceUpdate = 0x64,
    ElementNameUpdate = 0x65,
    TransferDescription = 0xFA,
    Data = 0xFB,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    NamespaceUpdate {
        id: u8,
        namespace: String,
    },
    ElementNameUpdate {
        id: u16,
        element_name: String,
    },
    TransferDescription {
        fragment_id: u16,
        chunk_count: u32,
        namespace_id: u8,
        element_name_id: u16,
        compressed: bool,
    },
    Data {
        fragment_id: u16,
        payload: Bytes,
    },
}

impl Frame {
    pub fn opcode(&self) -> Opcode {
        match self {
            Frame::NamespaceUpdate { .. } => Opcode::NamespaceUpdate,
            Frame::ElementNameUpdate { .. } => Opcode::ElementNameUpdate,
            Frame::TransferDescription { .. } => Opcode::TransferDescription,
            Frame::Data { .. } => Opcode::Data,
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) -> ChannelResult<()> {
        buf.put_u8(self.opcode().into());
        match self {
            Frame::NamespaceUpdate { id, namespace } => {
                buf.put_u8(*id);
                buf.put_short_string(namespace)
                    .map_err(|e| ChannelError::InvalidTransfer(format!("namespace: {}", e)))?;
            }
            Frame::ElementNameUpdate { id, element_name } => {
                buf.put_u16(*id);
                buf.put_short_string(element_name)
                    .map_err(|e| ChannelError::InvalidTransfer(format!("element name: {}", e)))?;
            }
            Frame::TransferDescription { fragment_id, chunk_count, namespace_id, element_name_id, compressed } => {
                buf.put_u16(*fragment_id);
                buf.put_u32(*chunk_count);
                buf.put_u8(*namespace_id);
                buf.put_u16(*element_name_id);
                buf.put_u8(u8::from(*compressed));
            }
            Frame::Data { fragment_id, payload } => {
                assert!(!payload.is_empty() && payload.len() <= CHUNK_SIZE, "this is a bug: chunking should have ensured the DATA frame length range");
                buf.put_u16(*fragment_id);
                buf.put_u32(payload.len().prechecked_cast());
                buf.put_slice(payload);
            }
        }
        Ok(())
    }

    /// Reads the next frame from a stream. Returns `Ok(None)` if the stream ends cleanly at a
    ///  frame boundary; EOF inside a frame is an I/O error.
    pub async fn read_from<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> ChannelResult<Option<Frame>> {
        let mut opcode_buf = [0u8; 1];
        if reader.read(&mut opcode_buf).await? == 0 {
            return Ok(None);
        }

        let opcode = Opcode::try_from(opcode_buf[0])
            .map_err(|_| ChannelError::protocol_violation(format!("unknown opcode 0x{:02X}", opcode_buf[0])))?;

        let frame = match opcode {
            Opcode::NamespaceUpdate => {
                let id = reader.read_u8().await?;
                let namespace = read_short_string(reader).await?;
                Frame::NamespaceUpdate { id, namespace }
            }
            Opcode::ElementNameUpdate => {
                let id = reader.read_u16().await?;
                let element_name = read_short_string(reader).await?;
                Frame::ElementNameUpdate { id, element_name }
            }
            Opcode::TransferDescription => {
                let fragment_id = reader.read_u16().await?;
                let chunk_count = reader.read_u32().await?;
                let namespace_id = reader.read_u8().await?;
                let element_name_id = reader.read_u16().await?;
                let compressed = match reader.read_u8().await? {
                    0 => false,
                    1 => true,
                    n => return Err(ChannelError::protocol_violation(format!("invalid compressed flag {}", n))),
                };
                Frame::TransferDescription { fragment_id, chunk_count, namespace_id, element_name_id, compressed }
            }
            Opcode::Data => {
                let fragment_id = reader.read_u16().await?;
                let len: usize = reader.read_u32().await?.safe_cast();
                if len == 0 || len > CHUNK_SIZE {
                    return Err(ChannelError::protocol_violation(format!("corrupted DATA frame: length {} is outside of 1..={}", len, CHUNK_SIZE)));
                }
                let mut payload = vec![0u8; len];
                reader.read_exact(&mut payload).await?;
                Frame::Data { fragment_id, payload: payload.into() }
            }
        };
        Ok(Some(frame))
    }
}

async fn read_short_string<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> ChannelResult<String> {
    let len: usize = reader.read_u16().await?.safe_cast();
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw).await?;
    String::from_utf8(raw)
        .map_err(|_| ChannelError::protocol_violation("string is not valid UTF-8"))
}

/// number of DATA frames needed for a payload of `len` bytes
pub fn num_chunks(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}
