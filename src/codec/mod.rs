//! Application messages on top of the transfer manager: serialization, compression and
//!  sequential dispatch of received messages to message modules.

pub mod compression;
pub mod dispatcher;
pub mod message;
pub mod receiver;
pub mod transmitter;
