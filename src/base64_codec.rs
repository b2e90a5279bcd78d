// Base64 for graphics payloads: standard alphabet, `=` padded
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::TryReserveError;

/// Length of the encoding of `n` input bytes: `4 * ceil(n / 3)`
pub fn encoded_len(n: usize) -> usize {
    4 * n.div_ceil(3)
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Encode into a buffer reserved up front, so a payload too large for
/// memory fails for this input instead of aborting the process
pub fn try_encode(bytes: &[u8]) -> Result<String, TryReserveError> {
    let mut encoded = String::new();
    encoded.try_reserve_exact(encoded_len(bytes.len()))?;
    STANDARD.encode_string(bytes, &mut encoded);
    Ok(encoded)
}
