//! Useful types used across multiple Kestrel modules.

use serde::{Deserialize, Serialize};

/// The endianness of the program under analysis.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn is_big(self) -> bool {
        self == Endian::Big
    }

    /// Decode a `u16` from the first two bytes of `bytes`.
    pub fn decode_u16(self, bytes: &[u8]) -> u16 {
        let mut buf = [0u8; 2];
        buf.copy_from_slice(&bytes[..2]);
        match self {
            Endian::Big => u16::from_be_bytes(buf),
            Endian::Little => u16::from_le_bytes(buf),
        }
    }

    /// Decode a `u32` from the first four bytes of `bytes`.
    pub fn decode_u32(self, bytes: &[u8]) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        match self {
            Endian::Big => u32::from_be_bytes(buf),
            Endian::Little => u32::from_le_bytes(buf),
        }
    }

    /// Decode a `u64` from the first eight bytes of `bytes`.
    pub fn decode_u64(self, bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[..8]);
        match self {
            Endian::Big => u64::from_be_bytes(buf),
            Endian::Little => u64::from_le_bytes(buf),
        }
    }

    /// Encode `value` into the first two bytes of `dst`.
    pub fn encode_u16(self, value: u16, dst: &mut [u8]) {
        let bytes = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        dst[..2].copy_from_slice(&bytes);
    }

    /// Encode `value` into the first four bytes of `dst`.
    pub fn encode_u32(self, value: u32, dst: &mut [u8]) {
        let bytes = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        dst[..4].copy_from_slice(&bytes);
    }

    /// Encode `value` into the first eight bytes of `dst`.
    pub fn encode_u64(self, value: u64, dst: &mut [u8]) {
        let bytes = match self {
            Endian::Big => value.to_be_bytes(),
            Endian::Little => value.to_le_bytes(),
        };
        dst[..8].copy_from_slice(&bytes);
    }

    /// Decode as many whole `u16` values from `src` into `dst` as both
    /// buffers allow, and return the number of values decoded.
    pub fn decode_u16s(self, src: &[u8], dst: &mut [u16]) -> usize {
        let count = (src.len() / 2).min(dst.len());
        for (i, value) in dst.iter_mut().enumerate().take(count) {
            *value = self.decode_u16(&src[i * 2..]);
        }
        count
    }

    /// Decode as many whole `u32` values from `src` into `dst` as both
    /// buffers allow, and return the number of values decoded.
    pub fn decode_u32s(self, src: &[u8], dst: &mut [u32]) -> usize {
        let count = (src.len() / 4).min(dst.len());
        for (i, value) in dst.iter_mut().enumerate().take(count) {
            *value = self.decode_u32(&src[i * 4..]);
        }
        count
    }

    /// Decode as many whole `u64` values from `src` into `dst` as both
    /// buffers allow, and return the number of values decoded.
    pub fn decode_u64s(self, src: &[u8], dst: &mut [u64]) -> usize {
        let count = (src.len() / 8).min(dst.len());
        for (i, value) in dst.iter_mut().enumerate().take(count) {
            *value = self.decode_u64(&src[i * 8..]);
        }
        count
    }
}
