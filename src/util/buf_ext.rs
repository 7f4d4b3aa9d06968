use anyhow::bail;

/// Strings on the wire are a u16 length prefix (BE) followed by that many UTF-8 bytes
pub trait BufExt: bytes::Buf {
    fn try_get_short_string(&mut self) -> anyhow::Result<String> {
        let len = self.try_get_u16()? as usize;
        if self.remaining() < len {
            bail!("string length {} exceeds remaining buffer of {} bytes", len, self.remaining());
        }
        let mut raw = vec![0u8; len];
        self.copy_to_slice(&mut raw);
        Ok(String::from_utf8(raw)?)
    }
}

pub trait BufMutExt: bytes::BufMut {
    /// NB: Nothing is written if the string is too long
    fn put_short_string(&mut self, s: &str) -> anyhow::Result<()> {
        let len: u16 = match s.len().try_into() {
            Ok(len) => len,
            Err(_) => bail!("string of {} bytes exceeds the maximum length of {}", s.len(), u16::MAX),
        };
        self.put_u16(len);
        self.put_slice(s.as_bytes());
        Ok(())
    }
}

impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
