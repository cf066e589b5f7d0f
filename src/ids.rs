use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

static NONCE: AtomicU64 = AtomicU64::new(0);

/// Derives a content-addressed ID: a hex-encoded, truncated SHA-256 digest
/// of the given parts plus a process-local nonce. The nonce keeps IDs
/// unique even when two saves share byte-identical content at the same
/// timestamp, while keeping the digest itself deterministic given inputs.
pub fn content_id(parts: &[&str]) -> String {
    let nonce = NONCE.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"\0");
    }
    hasher.update(nonce.to_le_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len / 2 + 1)
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(len)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_for_identical_content() {
        let a = content_id(&["same content", "source"]);
        let b = content_id(&["same content", "source"]);
        assert_ne!(a, b);
        assert_eq!(a.len(), 16);
    }
}
