//! Table-driven reflected CRC32 (polynomial 0xEDB88320).
//!
//! Exposed as a streaming state so payloads can be hashed byte by byte
//! while they are copied, and so the whole-image pass can skip the fields
//! it is about to patch.

use std::io;

/// Reflected CRC32 polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

pub const TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { POLYNOMIAL ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
};

/// Running CRC32 state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32(u32);

impl Crc32 {
    /// Fresh state seeded with `0xFFFFFFFF`.
    pub fn begin() -> Self {
        Self(0xFFFF_FFFF)
    }

    pub fn update(&mut self, byte: u8) {
        self.0 = (self.0 >> 8) ^ TABLE[((self.0 ^ byte as u32) & 0xFF) as usize];
    }

    pub fn update_slice(&mut self, bytes: &[u8]) {
        bytes.iter().for_each(|&b| self.update(b));
    }

    /// Final complemented value.
    pub fn finish(self) -> u32 {
        !self.0
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::begin()
    }
}

/// Lets `io::copy` feed a reader straight into the checksum.
impl io::Write for Crc32 {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// CRC32 of a whole buffer.
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = Crc32::begin();
    crc.update_slice(bytes);
    crc.finish()
}
