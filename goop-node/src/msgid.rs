//! ULID-based id generation for messages, envelopes, and groups.
//!
//! 26 Crockford base32 characters: 48 bits of milliseconds-since-epoch
//! followed by 80 bits of randomness, so ids sort chronologically and ack
//! matching never collides within a session.
//!
//! Ids are best-effort: unique enough for logging, duplicate detection, and
//! ack matching, never used for cross-process equality.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Bits of entropy below the timestamp.
const ENTROPY_BITS: u32 = 80;
/// 26 base32 digits cover 130 bits; the top two are always zero.
const DIGITS: u32 = 26;

/// Generate a new ULID string.
pub fn generate() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u128
        & 0xFFFF_FFFF_FFFF; // 48-bit timestamp field

    let entropy = rand::thread_rng().r#gen::<u128>() >> (128 - ENTROPY_BITS);
    let word = (millis << ENTROPY_BITS) | entropy;

    let mut id = String::with_capacity(DIGITS as usize);
    for digit in (0..DIGITS).rev() {
        let index = ((word >> (digit * 5)) & 0x1F) as usize;
        id.push(ALPHABET[index] as char);
    }
    id
}
