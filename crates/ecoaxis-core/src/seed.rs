//! Per-(species, requirement) seed derivation.
//!
//! Seeds depend only on the global seed and the two identifiers, never on
//! thread scheduling or batch position.

use sha2::{Digest, Sha256};

/// SHA-256 of `global || species || requirement`, first 8 bytes little-endian.
pub fn derive_seed(global: u64, species_id: &str, requirement_id: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(global.to_le_bytes());
    // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
    hasher.update((species_id.len() as u64).to_le_bytes());
    hasher.update(species_id.as_bytes());
    hasher.update((requirement_id.len() as u64).to_le_bytes());
    hasher.update(requirement_id.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic() {
        assert_eq!(derive_seed(1, "sp", "req"), derive_seed(1, "sp", "req"));
    }

    #[test]
    fn test_inputs_change_seed() {
        let base = derive_seed(1, "sp", "req");
        assert_ne!(base, derive_seed(2, "sp", "req"));
        assert_ne!(base, derive_seed(1, "sp2", "req"));
        assert_ne!(base, derive_seed(1, "sp", "req2"));
        assert_ne!(derive_seed(1, "ab", "c"), derive_seed(1, "a", "bc"));
    }
}
