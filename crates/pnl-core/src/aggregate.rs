//! Per-fill PnL estimation.
//!
//! Each classified fill is settled against a price that depends on what is
//! known about its market:
//! - a redemption verdict gives 1 (winner) or 0 (loser)
//! - a closed market nobody redeemed is priced by [`UnredeemedPolicy`]
//! - an open market is marked at the fill's own execution price
//! - an unknown asset is priced at 0, so a BUY loses its collateral
//!
//! PnL is `size * settlement - collateral` for a BUY and the mirror for a SELL.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use pnl_common::Market;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::classify::{Classification, ClassifiedFill, FillSide};
use crate::verdict::{Verdict, VerdictTable};

/// Settlement state of the market a fill traded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    ResolvedWinner,
    ResolvedLoser,
    ClosedNoRedemption,
    Open,
    Unmapped,
}

impl MarketStatus {
    /// Figures for these statuses are estimates rather than settled outcomes.
    pub fn is_estimate(&self) -> bool {
        !matches!(self, MarketStatus::ResolvedWinner | MarketStatus::ResolvedLoser)
    }
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MarketStatus::ResolvedWinner => "RESOLVED_WINNER",
            MarketStatus::ResolvedLoser => "RESOLVED_LOSER",
            MarketStatus::ClosedNoRedemption => "CLOSED_NO_REDEMPTION",
            MarketStatus::Open => "OPEN",
            MarketStatus::Unmapped => "UNMAPPED",
        };
        f.write_str(label)
    }
}

impl From<Verdict> for MarketStatus {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Winner => MarketStatus::ResolvedWinner,
            Verdict::Loser => MarketStatus::ResolvedLoser,
        }
    }
}

/// How to price positions in closed markets that have no redemption on record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnredeemedPolicy {
    /// Nobody redeemed, so the outcome most likely lost.
    #[default]
    #[serde(rename = "worthless")]
    AssumeWorthless,
    /// Hold the position at the price it traded at.
    #[serde(rename = "execution_price")]
    MarkAtExecutionPrice,
}

impl UnredeemedPolicy {
    pub fn settlement_price(&self, execution_price: Decimal) -> Decimal {
        match self {
            UnredeemedPolicy::AssumeWorthless => Decimal::ZERO,
            UnredeemedPolicy::MarkAtExecutionPrice => execution_price,
        }
    }
}

impl FromStr for UnredeemedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "worthless" => Ok(UnredeemedPolicy::AssumeWorthless),
            "execution_price" | "execution-price" => Ok(UnredeemedPolicy::MarkAtExecutionPrice),
            other => Err(format!(
                "unknown closed-unredeemed policy '{other}' (expected worthless or execution_price)"
            )),
        }
    }
}

impl std::fmt::Display for UnredeemedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnredeemedPolicy::AssumeWorthless => write!(f, "worthless"),
            UnredeemedPolicy::MarkAtExecutionPrice => write!(f, "execution_price"),
        }
    }
}

/// Why a fill's PnL was forced to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exclusion {
    SelfMatch,
    Ambiguous,
}

/// Market metadata indexed by condition id.
#[derive(Debug, Clone, Default)]
pub struct MarketTable {
    by_condition: HashMap<String, Market>,
}

impl MarketTable {
    pub fn new(markets: impl IntoIterator<Item = Market>) -> Self {
        Self {
            by_condition: markets
                .into_iter()
                .map(|m| (m.condition_id.to_lowercase(), m))
                .collect(),
        }
    }

    pub fn get(&self, condition_id: &str) -> Option<&Market> {
        self.by_condition.get(&condition_id.to_lowercase())
    }

    pub fn is_closed(&self, condition_id: &str) -> Option<bool> {
        self.get(condition_id).map(|m| m.closed)
    }

    pub fn len(&self) -> usize {
        self.by_condition.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_condition.is_empty()
    }
}

/// One output row per classified fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlRecord {
    pub fill_id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub transaction_hash: String,
    pub market: String,
    pub outcome: String,
    pub asset_id: String,
    pub side: FillSide,
    pub size: Decimal,
    pub price: Decimal,
    pub collateral: Decimal,
    pub status: MarketStatus,
    /// Value of one outcome token used to settle this fill.
    pub settlement_price: Decimal,
    pub estimated_pnl: Decimal,
    pub excluded: Option<Exclusion>,
}

/// Fill count and PnL for one market status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBreakdown {
    pub fills: usize,
    pub pnl: Decimal,
}

/// Totals over all records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnlSummary {
    pub total: Decimal,
    pub by_status: BTreeMap<MarketStatus, StatusBreakdown>,
    pub self_matched: usize,
    pub ambiguous: usize,
    /// Zero-size fills, priced at zero.
    pub degenerate: usize,
}

impl PnlSummary {
    fn add(&mut self, record: &PnlRecord) {
        self.total += record.estimated_pnl;
        let entry = self.by_status.entry(record.status).or_default();
        entry.fills += 1;
        entry.pnl += record.estimated_pnl;
        match record.excluded {
            Some(Exclusion::SelfMatch) => self.self_matched += 1,
            Some(Exclusion::Ambiguous) => self.ambiguous += 1,
            None => {}
        }
    }

    pub fn fills(&self) -> usize {
        self.by_status.values().map(|b| b.fills).sum()
    }

    /// PnL from markets with a redemption verdict.
    pub fn resolved_pnl(&self) -> Decimal {
        self.by_status
            .iter()
            .filter(|(status, _)| !status.is_estimate())
            .map(|(_, b)| b.pnl)
            .sum()
    }

    pub fn status(&self, status: MarketStatus) -> StatusBreakdown {
        self.by_status.get(&status).copied().unwrap_or_default()
    }
}

impl std::fmt::Display for PnlSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Estimated PnL: {} over {} fills", self.total.round_dp(2), self.fills())?;
        for (status, breakdown) in &self.by_status {
            writeln!(
                f,
                "  {:<22} {:>6} fills  {:>12}",
                status.to_string(),
                breakdown.fills,
                breakdown.pnl.round_dp(2)
            )?;
        }
        write!(
            f,
            "  excluded: {} self-matched, {} ambiguous; {} zero-size",
            self.self_matched, self.ambiguous, self.degenerate
        )
    }
}

/// Settles classified fills against verdicts and market state.
pub struct PnlAggregator<'a> {
    verdicts: &'a VerdictTable,
    markets: &'a MarketTable,
    policy: UnredeemedPolicy,
}

impl<'a> PnlAggregator<'a> {
    pub fn new(verdicts: &'a VerdictTable, markets: &'a MarketTable) -> Self {
        Self {
            verdicts,
            markets,
            policy: UnredeemedPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: UnredeemedPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Status and settlement price for a classified fill.
    pub fn settle(&self, fill: &ClassifiedFill) -> (MarketStatus, Decimal) {
        let execution_price = fill.leg().map(|l| l.price).unwrap_or_default();
        let Some(asset) = &fill.asset else {
            return (MarketStatus::Unmapped, Decimal::ZERO);
        };

        if let Some(verdict) = self.verdicts.lookup(&asset.condition_id, asset.outcome_index) {
            return (verdict.into(), verdict.settlement_price());
        }

        match self.markets.is_closed(&asset.condition_id) {
            Some(true) => (
                MarketStatus::ClosedNoRedemption,
                self.policy.settlement_price(execution_price),
            ),
            Some(false) => (MarketStatus::Open, execution_price),
            None => (MarketStatus::Unmapped, Decimal::ZERO),
        }
    }

    pub fn record(&self, fill: &ClassifiedFill) -> PnlRecord {
        let (status, settlement_price) = self.settle(fill);

        let excluded = if fill.self_matched {
            Some(Exclusion::SelfMatch)
        } else if matches!(fill.classification, Classification::Ambiguous { .. }) {
            Some(Exclusion::Ambiguous)
        } else {
            None
        };

        let estimated_pnl = match (&fill.classification, excluded) {
            (_, Some(_)) => Decimal::ZERO,
            (Classification::Buy(leg), None) => leg.size * settlement_price - leg.collateral,
            (Classification::Sell(leg), None) => leg.collateral - leg.size * settlement_price,
            (Classification::Ambiguous { .. }, None) => Decimal::ZERO,
        };

        let leg = fill.leg();
        PnlRecord {
            fill_id: fill.fill.id.clone(),
            timestamp: fill.fill.timestamp,
            transaction_hash: fill.fill.transaction_hash.clone(),
            market: fill.asset.as_ref().map(|a| a.title.clone()).unwrap_or_default(),
            outcome: fill
                .asset
                .as_ref()
                .map(|a| a.outcome_label.clone())
                .unwrap_or_default(),
            asset_id: fill.resolution_asset_id().to_string(),
            side: fill.side(),
            size: leg.map(|l| l.size).unwrap_or_default(),
            price: leg.map(|l| l.price).unwrap_or_default(),
            collateral: leg.map(|l| l.collateral).unwrap_or_default(),
            status,
            settlement_price,
            estimated_pnl,
            excluded,
        }
    }

    /// One record per fill, in input order, plus totals.
    pub fn aggregate(&self, fills: &[ClassifiedFill]) -> (Vec<PnlRecord>, PnlSummary) {
        let mut summary = PnlSummary::default();
        let mut records = Vec::with_capacity(fills.len());

        for fill in fills {
            if fill.leg().is_some_and(|l| l.is_degenerate()) {
                summary.degenerate += 1;
            }
            let record = self.record(fill);
            summary.add(&record);
            records.push(record);
        }

        debug!(
            fills = fills.len(),
            total = %summary.total,
            self_matched = summary.self_matched,
            ambiguous = summary.ambiguous,
            "Aggregated PnL"
        );
        (records, summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_all;
    use crate::resolver::AssetResolver;
    use pnl_common::{Fill, Redemption};
    use rust_decimal_macros::dec;

    const USER: &str = "0xuser";

    fn market(condition: &str, closed: bool, tokens: [&str; 2]) -> Market {
        Market {
            condition_id: condition.to_string(),
            question: format!("Market {condition}"),
            slug: condition.trim_start_matches("0x").to_string(),
            closed,
            token_ids: tokens.iter().map(|s| s.to_string()).collect(),
            outcomes: vec!["Yes".to_string(), "No".to_string()],
        }
    }

    fn buy(id: &str, asset: &str, usdc: Decimal, size: Decimal) -> Fill {
        Fill {
            id: id.to_string(),
            timestamp: 1_767_600_000,
            transaction_hash: format!("0x{id}"),
            maker: USER.to_string(),
            taker: "0xother".to_string(),
            maker_asset_id: "0".to_string(),
            taker_asset_id: asset.to_string(),
            maker_amount: usdc * dec!(1000000),
            taker_amount: size * dec!(1000000),
        }
    }

    fn sell(id: &str, asset: &str, usdc: Decimal, size: Decimal) -> Fill {
        Fill {
            maker_asset_id: asset.to_string(),
            taker_asset_id: "0".to_string(),
            maker_amount: size * dec!(1000000),
            taker_amount: usdc * dec!(1000000),
            ..buy(id, asset, usdc, size)
        }
    }

    fn run(
        markets: Vec<Market>,
        redemptions: &[Redemption],
        fills: &[Fill],
        policy: UnredeemedPolicy,
    ) -> (Vec<PnlRecord>, PnlSummary) {
        let resolver = AssetResolver::build(&markets, None);
        let verdicts = VerdictTable::build(redemptions);
        let table = MarketTable::new(markets);
        let classified = classify_all(fills, USER, &resolver);
        PnlAggregator::new(&verdicts, &table)
            .with_policy(policy)
            .aggregate(&classified)
    }

    fn redeem(condition: &str, index: u32, payout: Decimal) -> Redemption {
        Redemption {
            id: format!("r-{condition}-{index}"),
            timestamp: 1_767_700_000,
            redeemer: USER.to_string(),
            payout,
            condition_id: condition.to_string(),
            outcome_indices: [index].into_iter().collect(),
        }
    }

    #[test]
    fn test_open_market_marks_at_execution_price() {
        let (records, summary) = run(
            vec![market("0xc1", false, ["11", "12"])],
            &[],
            &[buy("f1", "11", dec!(4), dec!(10))],
            UnredeemedPolicy::default(),
        );
        assert_eq!(records[0].status, MarketStatus::Open);
        assert_eq!(records[0].estimated_pnl, dec!(0));
        assert_eq!(summary.total, dec!(0));
    }

    #[test]
    fn test_closed_unredeemed_policies() {
        let markets = vec![market("0xc1", true, ["11", "12"])];
        let fills = [buy("f1", "11", dec!(4), dec!(10))];

        let (records, _) = run(markets.clone(), &[], &fills, UnredeemedPolicy::AssumeWorthless);
        assert_eq!(records[0].status, MarketStatus::ClosedNoRedemption);
        assert_eq!(records[0].estimated_pnl, dec!(-4));

        let (records, _) = run(markets, &[], &fills, UnredeemedPolicy::MarkAtExecutionPrice);
        assert_eq!(records[0].settlement_price, dec!(0.4));
        assert_eq!(records[0].estimated_pnl, dec!(0));
    }

    #[test]
    fn test_sell_of_loser_is_profit() {
        let (records, _) = run(
            vec![market("0xc1", true, ["11", "12"])],
            &[redeem("0xc1", 1, dec!(0))],
            &[sell("f1", "12", dec!(3), dec!(10))],
            UnredeemedPolicy::default(),
        );
        assert_eq!(records[0].status, MarketStatus::ResolvedLoser);
        assert_eq!(records[0].estimated_pnl, dec!(3));
    }

    #[test]
    fn test_unmapped_buy_loses_collateral() {
        let (records, summary) = run(
            vec![market("0xc1", true, ["11", "12"])],
            &[],
            &[buy("f1", "99", dec!(4), dec!(10))],
            UnredeemedPolicy::default(),
        );
        assert_eq!(records[0].status, MarketStatus::Unmapped);
        assert_eq!(records[0].settlement_price, dec!(0));
        assert_eq!(records[0].estimated_pnl, dec!(-4));
        assert_eq!(summary.status(MarketStatus::Unmapped).fills, 1);
    }

    #[test]
    fn test_self_match_excluded() {
        let mut fill = buy("f1", "11", dec!(4), dec!(10));
        fill.taker = USER.to_string();
        let (records, summary) = run(
            vec![market("0xc1", true, ["11", "12"])],
            &[redeem("0xc1", 0, dec!(10000000))],
            &[fill],
            UnredeemedPolicy::default(),
        );
        assert_eq!(records[0].excluded, Some(Exclusion::SelfMatch));
        assert_eq!(records[0].estimated_pnl, dec!(0));
        assert_eq!(summary.self_matched, 1);
    }

    #[test]
    fn test_degenerate_fill_counted() {
        let (records, summary) = run(
            vec![market("0xc1", false, ["11", "12"])],
            &[],
            &[buy("f1", "11", dec!(1), dec!(0))],
            UnredeemedPolicy::default(),
        );
        assert_eq!(records[0].price, dec!(0));
        assert_eq!(summary.degenerate, 1);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!(
            "worthless".parse::<UnredeemedPolicy>().unwrap(),
            UnredeemedPolicy::AssumeWorthless
        );
        assert_eq!(
            "execution_price".parse::<UnredeemedPolicy>().unwrap(),
            UnredeemedPolicy::MarkAtExecutionPrice
        );
        assert!("coinflip".parse::<UnredeemedPolicy>().is_err());
    }
}
