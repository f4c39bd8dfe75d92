//! Conditional Token Framework position ids.
//!
//! Outcome tokens minted directly by the CTF are identified by
//! `keccak256(parentCollectionId ++ conditionId ++ indexSet)` where the parent
//! collection is zero for markets split straight from collateral and the
//! index set for a single outcome is `1 << outcomeIndex`.

use std::str::FromStr;

use alloy_primitives::{B256, U256};
use sha3::{Digest, Keccak256};

/// Derives the decimal token id of one outcome of a condition.
pub trait PositionIdDeriver {
    /// Returns `None` when the condition id is not a 32-byte hex string.
    fn position_id(&self, condition_id: &str, outcome_index: u32) -> Option<String>;
}

/// Keccak-based derivation used by the CTF contracts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CtfPositionIds;

impl CtfPositionIds {
    /// Collection id for a single outcome under the empty parent collection.
    pub fn collection_id(condition_id: &B256, outcome_index: u32) -> Option<B256> {
        if outcome_index >= 256 {
            return None;
        }
        let index_set = U256::from(1u8) << (outcome_index as usize);

        let mut hasher = Keccak256::new();
        hasher.update(B256::ZERO);
        hasher.update(condition_id);
        hasher.update(index_set.to_be_bytes::<32>());
        Some(B256::from_slice(&hasher.finalize()))
    }
}

impl PositionIdDeriver for CtfPositionIds {
    fn position_id(&self, condition_id: &str, outcome_index: u32) -> Option<String> {
        let condition = B256::from_str(condition_id.trim()).ok()?;
        let collection = Self::collection_id(&condition, outcome_index)?;
        Some(U256::from_be_bytes(collection.0).to_string())
    }
}

/// The other common encoding of a token id: decimal becomes `0x` hex and vice versa.
pub fn alternate_encoding(token_id: &str) -> Option<String> {
    let trimmed = token_id.trim();
    match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => U256::from_str_radix(hex, 16).ok().map(|v| v.to_string()),
        None => U256::from_str_radix(trimmed, 10)
            .ok()
            .map(|v| format!("0x{v:x}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONDITION: &str = "0x5f65177b394277fd294cd75650044e32ba009a95022d88a0c1d565897d72f8f1";

    #[test]
    fn test_position_id_is_deterministic_decimal() {
        let first = CtfPositionIds.position_id(CONDITION, 0).unwrap();
        let second = CtfPositionIds.position_id(CONDITION, 0).unwrap();
        assert_eq!(first, second);
        assert!(first.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn test_position_ids_differ_per_outcome() {
        let yes = CtfPositionIds.position_id(CONDITION, 0).unwrap();
        let no = CtfPositionIds.position_id(CONDITION, 1).unwrap();
        assert_ne!(yes, no);
    }

    #[test]
    fn test_position_id_matches_manual_hash() {
        let condition = B256::from_str(CONDITION).unwrap();
        let mut packed = Vec::with_capacity(96);
        packed.extend_from_slice(&[0u8; 32]);
        packed.extend_from_slice(condition.as_slice());
        let mut index_set = [0u8; 32];
        index_set[31] = 2;
        packed.extend_from_slice(&index_set);

        let digest = Keccak256::digest(&packed);
        let expected = U256::from_be_slice(&digest).to_string();
        assert_eq!(CtfPositionIds.position_id(CONDITION, 1).unwrap(), expected);
    }

    #[test]
    fn test_invalid_condition_is_not_derivable() {
        assert!(CtfPositionIds.position_id("0x1234", 0).is_none());
        assert!(CtfPositionIds.position_id("not-hex", 0).is_none());
        assert!(CtfPositionIds.position_id(CONDITION, 256).is_none());
    }

    #[test]
    fn test_alternate_encoding_both_ways() {
        assert_eq!(alternate_encoding("255").as_deref(), Some("0xff"));
        assert_eq!(alternate_encoding("0xff").as_deref(), Some("255"));
        assert_eq!(alternate_encoding("0").as_deref(), Some("0x0"));
        assert!(alternate_encoding("zz").is_none());
    }
}
