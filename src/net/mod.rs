pub mod manager;
pub mod peer;
pub mod pool;
pub mod tcp_service;
pub mod transport_service;
