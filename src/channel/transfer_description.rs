use std::fmt::{Debug, Formatter};

use crate::net::peer::PeerId;

/// Metadata of one application payload: who sends it to whom, the message type as a
///  (namespace, element name) pair, and whether the payload bytes are compressed.
///
/// On the wire only the type and the compressed flag are carried (the type as dictionary ids);
///  sender and recipient are implied by the connection, and the size by the DATA frames.
#[derive(Clone, Eq, PartialEq)]
pub struct TransferDescription {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub namespace: String,
    pub element_name: String,
    pub compressed: bool,
    /// length of the payload as it is transmitted, i.e. after compression
    pub size: usize,
}

impl TransferDescription {
    pub fn new(sender: &PeerId, recipient: &PeerId, namespace: &str, element_name: &str) -> TransferDescription {
        TransferDescription {
            sender: sender.clone(),
            recipient: recipient.clone(),
            namespace: namespace.to_string(),
            element_name: element_name.to_string(),
            compressed: false,
            size: 0,
        }
    }

    pub fn with_compressed(mut self, compressed: bool) -> TransferDescription {
        self.compressed = compressed;
        self
    }

    pub fn with_size(mut self, size: usize) -> TransferDescription {
        self.size = size;
        self
    }
}

impl Debug for TransferDescription {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "TD{{{:?}->{:?} {}:{} compressed:{} size:{}}}",
               self.sender, self.recipient, self.namespace, self.element_name, self.compressed, self.size)
    }
}
