pub mod connection;
pub mod dictionary;
pub mod fragment_id_pool;
pub mod reassembly;
pub mod transfer_description;
pub mod wire;
