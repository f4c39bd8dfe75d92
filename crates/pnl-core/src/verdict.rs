//! Outcome verdicts inferred from redemptions.
//!
//! A redemption with a positive payout marks every redeemed outcome as a winner;
//! a zero payout marks them as losers. Markets nobody redeemed stay unknown.

use std::collections::HashMap;

use pnl_common::Redemption;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Winner,
    Loser,
}

impl Verdict {
    /// Settlement value of one outcome token under this verdict.
    pub fn settlement_price(&self) -> Decimal {
        match self {
            Verdict::Winner => Decimal::ONE,
            Verdict::Loser => Decimal::ZERO,
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Winner => write!(f, "winner"),
            Verdict::Loser => write!(f, "loser"),
        }
    }
}

/// `(condition_id, outcome_index) -> Verdict`.
#[derive(Debug, Clone, Default)]
pub struct VerdictTable {
    verdicts: HashMap<(String, u32), Verdict>,
    conflicts: usize,
}

impl VerdictTable {
    /// Process redemptions in order; a later redemption overwrites an earlier verdict.
    pub fn build(redemptions: &[Redemption]) -> Self {
        let mut table = Self::default();
        for redemption in redemptions {
            table.record(redemption);
        }
        debug!(
            redemptions = redemptions.len(),
            verdicts = table.verdicts.len(),
            conflicts = table.conflicts,
            "Built verdict table"
        );
        table
    }

    fn record(&mut self, redemption: &Redemption) {
        let verdict = if redemption.is_winning() {
            Verdict::Winner
        } else {
            Verdict::Loser
        };
        let condition_id = redemption.condition_id.to_lowercase();
        for &index in &redemption.outcome_indices {
            let previous = self.verdicts.insert((condition_id.clone(), index), verdict);
            if previous.is_some_and(|p| p != verdict) {
                self.conflicts += 1;
            }
        }
    }

    pub fn lookup(&self, condition_id: &str, outcome_index: u32) -> Option<Verdict> {
        self.verdicts
            .get(&(condition_id.to_lowercase(), outcome_index))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    /// Number of times a later redemption flipped an existing verdict.
    pub fn conflicts(&self) -> usize {
        self.conflicts
    }
}
