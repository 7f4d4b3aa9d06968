//! Fixtures for testing connections, the manager and the codec layer without sockets: streams
//!  are `tokio::io::duplex` pipes, and managers in the same process reach each other through an
//!  in-memory transport service.

pub mod channel;
pub mod transport;
