//! Time-sortable frame identifiers.
//!
//! A frame id is a 26-character ULID-style string: 10 characters of
//! Crockford base32 encoding the unix millisecond timestamp, followed by
//! 16 random characters. Lexicographic order matches creation order at
//! millisecond resolution.

use chrono::Utc;
use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate a new frame id.
pub fn frame_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let mut out = String::with_capacity(26);

    // 10 chars of 5 bits each cover 50 bits, enough for the 48-bit
    // millisecond range until the year 10889.
    for shift in (0..10).rev() {
        let idx = ((millis >> (shift * 5)) & 0x1f) as usize;
        out.push(ALPHABET[idx] as char);
    }

    let mut rng = rand::thread_rng();
    for _ in 0..16 {
        let idx = rng.gen_range(0..32);
        out.push(ALPHABET[idx] as char);
    }

    out
}

/// Prompt ids are uuid-based and carry the `perm-` prefix checked by
/// `is_permission_prompt`.
pub fn prompt_id() -> String {
    format!("perm-{}", uuid::Uuid::new_v4())
}

/// Whether an element id belongs to a permission prompt.
pub fn is_permission_prompt(id: &str) -> bool {
    id.starts_with("perm-")
}
