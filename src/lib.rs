pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod net;
pub mod util;

#[cfg(test)]
pub mod test_util;
