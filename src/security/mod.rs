use sha2::{Digest, Sha256};

pub mod publish;

/// Length of the hex digests used for routing hashes and member tags
pub const SHORT_HASH_LEN: usize = 8;

/// One-way short identifier: SHA-256 of the input, hex encoded and truncated.
///
/// Used both for routing hashes of stream keys and for anonymized realtime
/// member tags, so the two share a single scheme.
pub fn short_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut encoded = hex::encode(digest);
    encoded.truncate(SHORT_HASH_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_deterministic() {
        assert_eq!(short_hash("my-secret-key"), short_hash("my-secret-key"));
        assert_eq!(short_hash("my-secret-key").len(), SHORT_HASH_LEN);
    }

    #[test]
    fn short_hash_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(short_hash("abc"), "ba7816bf");
    }

    #[test]
    fn distinct_inputs_give_distinct_hashes() {
        assert_ne!(short_hash("stream-a"), short_hash("stream-b"));
        assert!(short_hash("127.0.0.1")
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
