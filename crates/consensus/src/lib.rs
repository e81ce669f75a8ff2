//! Network parameters and protocol-wide constants.

pub mod constants;
pub mod params;

pub use params::{chain_params, Checkpoint, ChainParams, Network};

/// A 256-bit hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];

/// The all-zero hash, used as the open-ended stop hash in locator requests.
pub const ZERO_HASH: Hash256 = [0u8; 32];

pub fn hash256_from_hex(hex: &str) -> Result<Hash256, String> {
    if hex.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex.len()));
    }
    let mut out = [0u8; 32];
    let bytes = hex.as_bytes();
    for (index, chunk) in bytes.chunks(2).enumerate() {
        let high = (chunk[0] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex char {}", chunk[0] as char))?;
        let low = (chunk[1] as char)
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex char {}", chunk[1] as char))?;
        // Display order is byte-reversed relative to internal order.
        out[31 - index] = (high as u8) << 4 | low as u8;
    }
    Ok(out)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0'));
        out.push(char::from_digit((byte & 0x0f) as u32, 16).unwrap_or('0'));
    }
    out
}
