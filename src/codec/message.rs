use std::fmt::{Debug, Display, Formatter};
use std::time::Duration;

use bytes::BytesMut;
#[cfg(test)] use mockall::automock;

use crate::channel::transfer_description::TransferDescription;
use crate::net::transport_service::TransferMode;

/// Identifies an application message's schema. It is transmitted as part of each transfer
///  (as dictionary ids), and the receiving side dispatches on it.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct MessageType {
    pub namespace: String,
    pub element_name: String,
}

impl MessageType {
    pub fn new(namespace: &str, element_name: &str) -> MessageType {
        MessageType {
            namespace: namespace.to_string(),
            element_name: element_name.to_string(),
        }
    }

    pub fn of(description: &TransferDescription) -> MessageType {
        MessageType::new(&description.namespace, &description.element_name)
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.element_name)
    }
}

impl Debug for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self)
    }
}

pub trait Message: Debug + Send + Sync + 'static {
    fn message_type(&self) -> MessageType;

    fn ser(&self, buf: &mut BytesMut);
}

/// Deserializes and handles received messages of one [MessageType]
#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait MessageModule: Send + Sync + 'static {
    fn message_type(&self) -> MessageType;

    /// Called with the (decompressed) payload of a received message.
    ///
    /// Calls are sequential across all modules, in the order messages were received, so this
    ///  holds up all other message handling. Non-trivial work should be offloaded.
    async fn on_message(&self, description: &TransferDescription, buf: &[u8]);
}

/// Instrumentation callbacks. Sizes are payload sizes on the wire (`compressed_size`) and as
///  seen by the application (`uncompressed_size`), which are the same for uncompressed
///  payloads.
pub trait TransferStatisticsListener: Send + Sync + 'static {
    fn sent(&self, mode: TransferMode, compressed_size: usize, uncompressed_size: usize, duration: Duration);

    fn received(&self, mode: TransferMode, compressed_size: usize, uncompressed_size: usize, duration: Duration);
}
