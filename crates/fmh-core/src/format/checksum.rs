//! Modulo-100 structural checksum.
//!
//! Despite the historical name the arithmetic is modulo 256: a record is
//! valid when the wrapping byte-sum of all its bytes is zero.

/// Wrapping 8-bit sum of all bytes.
pub fn byte_sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Checksum byte that brings the total sum of `bytes` plus itself to zero.
///
/// The checksum slot inside `bytes` must be zero when this is computed.
pub fn module100(bytes: &[u8]) -> u8 {
    (!byte_sum(bytes)).wrapping_add(1)
}

/// True when the record sums to zero.
pub fn is_valid_module100(bytes: &[u8]) -> bool {
    byte_sum(bytes) == 0
}
