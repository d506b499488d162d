//! Contains a collection of useful utility functions.

use rand::RngCore;

/// Encodes bytes as a lowercase hex string.
pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// Checks whether the string is non-empty and made of lowercase hex digits
/// only.
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Generates a random identifier of `len` bytes, hex encoded.
pub fn random_id(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    to_hex(&bytes)
}

#[test]
fn random_ids_are_hex() {
    let id = random_id(8);
    assert_eq!(id.len(), 16);
    assert!(is_hex(&id));
    assert!(!is_hex("A0"));
    assert!(!is_hex(""));
    assert_ne!(random_id(8), id);
}
