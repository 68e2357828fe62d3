//! 64-bit SimHash fingerprinting, used by the semantic cache (Tier 2) and as
//! a fallback similarity signal in the rerank tier (Tier 4) when a
//! candidate has no embedding.

use sha2::{Digest, Sha256};

/// Tokenizes on whitespace, lowercases, hashes each token into a 64-bit
/// lane, then bit-votes across tokens — the textbook SimHash construction.
pub fn simhash64(text: &str) -> u64 {
    let mut bit_votes = [0i32; 64];
    let mut token_count = 0u32;

    for token in text.split_whitespace() {
        let lower = token.to_lowercase();
        if lower.is_empty() {
            continue;
        }
        token_count += 1;
        let hash = token_hash(&lower);
        for (bit, vote) in bit_votes.iter_mut().enumerate() {
            if (hash >> bit) & 1 == 1 {
                *vote += 1;
            } else {
                *vote -= 1;
            }
        }
    }

    if token_count == 0 {
        return 0;
    }

    let mut fingerprint = 0u64;
    for (bit, vote) in bit_votes.iter().enumerate() {
        if *vote > 0 {
            fingerprint |= 1 << bit;
        }
    }
    fingerprint
}

fn token_hash(token: &str) -> u64 {
    let digest = Sha256::digest(token.as_bytes());
    u64::from_le_bytes(digest[0..8].try_into().unwrap())
}

pub fn hamming_distance(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// Normalized similarity in `[0, 1]`; used as the Tier 4 fallback score for
/// candidates without an embedding (`similarity * 0.7`, per §4.4).
pub fn similarity(a: u64, b: u64) -> f64 {
    1.0 - (hamming_distance(a, b) as f64 / 64.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_text_has_zero_distance() {
        let a = simhash64("llama breeding guide");
        let b = simhash64("llama breeding guide");
        assert_eq!(hamming_distance(a, b), 0);
    }

    #[test]
    fn similar_text_is_within_default_hamming_max() {
        let a = simhash64("llama breeding and camelid husbandry");
        let b = simhash64("llama breeding camelid husbandry guide");
        assert!(hamming_distance(a, b) <= 6, "distance was too large for near-duplicate text");
    }

    #[test]
    fn unrelated_text_is_far_with_high_probability() {
        let a = simhash64("llama breeding and camelid husbandry");
        let b = simhash64("deep sea fishing equipment maintenance");
        assert!(hamming_distance(a, b) > 3);
    }

    #[test]
    fn empty_text_hashes_to_zero() {
        assert_eq!(simhash64(""), 0);
        assert_eq!(simhash64("   "), 0);
    }
}
