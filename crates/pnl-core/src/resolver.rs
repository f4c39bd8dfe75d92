//! Token id to market/outcome lookup.
//!
//! A single outcome may trade under two ids: the wrapped token id the CLOB
//! lists for the market, and the position id the CTF derives from the
//! condition. The resolver indexes both so fills resolve whichever id they carry.

use std::collections::{BTreeMap, HashMap};

use pnl_common::Market;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::position::{alternate_encoding, PositionIdDeriver};

/// The market and outcome a token id belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedAsset {
    pub title: String,
    pub slug: String,
    pub outcome_label: String,
    pub condition_id: String,
    pub outcome_index: u32,
}

/// Immutable token id lookup table. Built once, read concurrently.
#[derive(Debug, Clone, Default)]
pub struct AssetResolver {
    table: HashMap<String, ResolvedAsset>,
}

impl AssetResolver {
    /// Index every market's outcome tokens.
    ///
    /// Wrapped ids are registered only when the token and outcome lists line up.
    /// Derived ids are registered for every outcome label when a deriver is given.
    /// A token id seen twice keeps the later registration.
    pub fn build(markets: &[Market], deriver: Option<&dyn PositionIdDeriver>) -> Self {
        let mut table = HashMap::new();
        let mut wrapped = 0usize;
        let mut derived = 0usize;
        let mut misaligned = 0usize;

        for market in markets {
            let condition_id = market.condition_id.to_lowercase();
            let asset = |index: usize, label: &str| ResolvedAsset {
                title: market.question.clone(),
                slug: market.slug.clone(),
                outcome_label: label.to_string(),
                condition_id: condition_id.clone(),
                outcome_index: index as u32,
            };

            if market.has_aligned_tokens() {
                for (index, (token_id, label)) in
                    market.token_ids.iter().zip(&market.outcomes).enumerate()
                {
                    table.insert(token_id.trim().to_string(), asset(index, label));
                    wrapped += 1;
                }
            } else if !market.token_ids.is_empty() {
                misaligned += 1;
            }

            if let Some(deriver) = deriver {
                for (index, label) in market.outcomes.iter().enumerate() {
                    if let Some(position_id) = deriver.position_id(&condition_id, index as u32) {
                        table.insert(position_id, asset(index, label));
                        derived += 1;
                    }
                }
            }
        }

        if misaligned > 0 {
            warn!(
                misaligned,
                "Markets with mismatched token/outcome lists skipped for wrapped ids"
            );
        }
        debug!(
            markets = markets.len(),
            wrapped,
            derived,
            entries = table.len(),
            "Built asset resolver"
        );

        Self { table }
    }

    /// Restore a resolver from a previously exported table.
    pub fn from_entries(entries: BTreeMap<String, ResolvedAsset>) -> Self {
        Self {
            table: entries.into_iter().collect(),
        }
    }

    /// Look up a token id, trying its alternate decimal/hex encoding on a miss.
    pub fn resolve(&self, token_id: &str) -> Option<&ResolvedAsset> {
        let token_id = token_id.trim();
        if let Some(asset) = self.table.get(token_id) {
            return Some(asset);
        }
        alternate_encoding(token_id).and_then(|alt| self.table.get(&alt))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Sorted copy of the table, for persisting as `asset_map.json`.
    pub fn to_entries(&self) -> BTreeMap<String, ResolvedAsset> {
        self.table
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::CtfPositionIds;

    const CONDITION: &str = "0x5f65177b394277fd294cd75650044e32ba009a95022d88a0c1d565897d72f8f1";

    fn market(tokens: &[&str], outcomes: &[&str]) -> Market {
        Market {
            condition_id: CONDITION.to_string(),
            question: "Bitcoin Up or Down - January 5, 9AM ET".to_string(),
            slug: "btc-updown-jan-5-9am".to_string(),
            closed: true,
            token_ids: tokens.iter().map(|s| s.to_string()).collect(),
            outcomes: outcomes.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_resolves_wrapped_ids() {
        let resolver = AssetResolver::build(&[market(&["111", "222"], &["Up", "Down"])], None);
        let down = resolver.resolve("222").unwrap();
        assert_eq!(down.outcome_label, "Down");
        assert_eq!(down.outcome_index, 1);
        assert_eq!(down.condition_id, CONDITION);
        assert!(resolver.resolve("333").is_none());
    }

    #[test]
    fn test_misaligned_market_skips_wrapped_ids() {
        let resolver = AssetResolver::build(&[market(&["111", "222"], &["Up"])], None);
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_derived_ids_registered_even_when_misaligned() {
        let deriver = CtfPositionIds;
        let resolver =
            AssetResolver::build(&[market(&["111"], &["Up", "Down"])], Some(&deriver));
        let derived = deriver.position_id(CONDITION, 1).unwrap();
        let asset = resolver.resolve(&derived).unwrap();
        assert_eq!(asset.outcome_label, "Down");
        assert!(resolver.resolve("111").is_none());
    }

    #[test]
    fn test_both_paths_agree() {
        let deriver = CtfPositionIds;
        let resolver =
            AssetResolver::build(&[market(&["111", "222"], &["Up", "Down"])], Some(&deriver));
        for (index, wrapped) in ["111", "222"].iter().enumerate() {
            let derived = deriver.position_id(CONDITION, index as u32).unwrap();
            assert_eq!(resolver.resolve(wrapped), resolver.resolve(&derived));
        }
    }

    #[test]
    fn test_resolves_alternate_encoding() {
        let resolver = AssetResolver::build(&[market(&["255", "256"], &["Up", "Down"])], None);
        assert_eq!(resolver.resolve("0xff").unwrap().outcome_label, "Up");
        assert_eq!(resolver.resolve("0x100").unwrap().outcome_label, "Down");
    }

    #[test]
    fn test_later_registration_wins() {
        let mut other = market(&["111", "999"], &["Yes", "No"]);
        other.condition_id = "0xother".to_string();
        let resolver =
            AssetResolver::build(&[market(&["111", "222"], &["Up", "Down"]), other], None);
        assert_eq!(resolver.resolve("111").unwrap().outcome_label, "Yes");
    }

    #[test]
    fn test_entries_roundtrip() {
        let resolver = AssetResolver::build(&[market(&["111", "222"], &["Up", "Down"])], None);
        let restored = AssetResolver::from_entries(resolver.to_entries());
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.resolve("111"), resolver.resolve("111"));
    }
}
