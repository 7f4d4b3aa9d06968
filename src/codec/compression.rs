use std::io::Read;

use anyhow::bail;

use crate::config::ChannelConfig;

/// A byte-array transform applied to payloads above the compression threshold
pub trait PayloadCompression: Send + Sync + 'static {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;
}

/// zstd in place of the deflate transform of earlier protocol versions. Both peers of a session
///  must use the same codec: the wire carries only a 'compressed' flag, not the algorithm, so
///  interoperating with deflate peers needs a deflate [PayloadCompression] instead.
pub struct ZstdCompression {
    level: i32,
    /// upper bound for decompressed data, protecting against decompression bombs
    max_decompressed_size: usize,
}

impl ZstdCompression {
    pub fn new(level: i32, max_decompressed_size: usize) -> ZstdCompression {
        ZstdCompression {
            level: level.clamp(1, 22),
            max_decompressed_size,
        }
    }

    /// Uses the configured compression level, and bounds decompressed payloads by the maximum
    ///  payload size
    pub fn from_config(config: &ChannelConfig) -> ZstdCompression {
        ZstdCompression::new(config.compression_level, config.max_payload_size)
    }
}

impl PayloadCompression for ZstdCompression {
    fn compress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(zstd::encode_all(data, self.level)?)
    }

    fn decompress(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        let decoder = zstd::Decoder::new(data)?;

        let mut output = Vec::new();
        decoder
            .take(self.max_decompressed_size as u64 + 1)
            .read_to_end(&mut output)?;

        if output.len() > self.max_decompressed_size {
            bail!("decompressed payload exceeds the limit of {} bytes", self.max_decompressed_size);
        }
        Ok(output)
    }
}
