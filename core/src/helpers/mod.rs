use std::time::{SystemTime, UNIX_EPOCH};

use starknet_types_core::felt::Felt;

/// Halve a block range while always making at least one block of forward
/// progress, so a stuck provider can never pin the engine to an empty window.
pub fn halved_block_number(to_block: u64, from_block: u64) -> u64 {
    let diff = to_block.saturating_sub(from_block);
    let half = diff / 2;
    std::cmp::max(from_block + half, from_block)
}

/// Render a felt as the canonical 0x-prefixed 64-hex-digit lowercase string.
///
/// Every identifier persisted through the sync store goes through this, which
/// makes equality comparisons on stored values byte-exact.
pub fn padded_hex(value: &Felt) -> String {
    format!("0x{}", hex::encode(value.to_bytes_be()))
}

/// The starknet variant of keccak: keccak256 truncated to 250 bits.
pub fn starknet_keccak(data: &[u8]) -> Felt {
    use sha3::{Digest, Keccak256};

    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut hash: [u8; 32] = hasher.finalize().into();
    // Clear the top 6 bits so the result fits in a felt252.
    hash[0] &= 0x03;
    Felt::from_bytes_be(&hash)
}

/// Selector for an event or entry point, derived from its name.
pub fn selector_from_name(name: &str) -> Felt {
    starknet_keccak(name.as_bytes())
}

pub fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halved_block_number() {
        assert_eq!(halved_block_number(100, 0), 50);
        assert_eq!(halved_block_number(101, 100), 100);
        assert_eq!(halved_block_number(100, 100), 100);
        assert_eq!(halved_block_number(103, 100), 101);
    }

    #[test]
    fn test_padded_hex_is_64_digits() {
        let one = Felt::ONE;
        let rendered = padded_hex(&one);
        assert_eq!(rendered.len(), 66);
        assert_eq!(
            rendered,
            "0x0000000000000000000000000000000000000000000000000000000000000001"
        );
    }

    #[test]
    fn test_padded_hex_idempotent_through_parse() {
        let value = Felt::from_hex("0xabc123").unwrap();
        let rendered = padded_hex(&value);
        let reparsed = Felt::from_hex(&rendered).unwrap();
        assert_eq!(value, reparsed);
        assert_eq!(rendered, padded_hex(&reparsed));
    }

    #[test]
    fn test_selector_from_name_transfer() {
        // starknet_keccak("Transfer"), the ERC-20 transfer event key.
        let selector = selector_from_name("Transfer");
        assert_eq!(
            padded_hex(&selector),
            "0x0099cd8bde557814842a3121e8ddfd433a539b8c9f14bf31ebf108d12e6196e9"
        );
    }

    #[test]
    fn test_selector_fits_in_250_bits() {
        let selector = selector_from_name("PairCreated");
        let top = selector.to_bytes_be()[0];
        assert!(top <= 0x03);
    }
}
