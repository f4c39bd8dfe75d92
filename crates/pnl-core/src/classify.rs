//! Fill classification.
//!
//! Exactly one side of a normal fill carries collateral (asset id `"0"`). That
//! side's amount is the USDC paid; the other side's amount is the outcome size.
//! Whether the tracked user bought or sold depends on which side they sat on:
//!
//! | collateral side | tracked is maker | tracked is taker |
//! |-----------------|------------------|------------------|
//! | maker asset     | BUY              | SELL             |
//! | taker asset     | SELL             | BUY              |

use pnl_common::{from_atomic, normalize_address, Fill, COLLATERAL_ASSET_ID};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::resolver::{AssetResolver, ResolvedAsset};

/// Trade direction written to PnL records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FillSide {
    Buy,
    Sell,
    Ambiguous,
}

impl std::fmt::Display for FillSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FillSide::Buy => write!(f, "BUY"),
            FillSide::Sell => write!(f, "SELL"),
            FillSide::Ambiguous => write!(f, "AMBIGUOUS"),
        }
    }
}

/// The outcome-token side of a fill, in whole units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Leg {
    pub outcome_asset_id: String,
    /// Outcome tokens exchanged.
    pub size: Decimal,
    /// USDC per outcome token; zero when `size` is zero.
    pub price: Decimal,
    /// USDC exchanged.
    pub collateral: Decimal,
}

impl Leg {
    fn new(outcome_asset_id: &str, outcome_amount: Decimal, collateral_amount: Decimal) -> Self {
        let size = from_atomic(outcome_amount);
        let collateral = from_atomic(collateral_amount);
        let price = if size.is_zero() {
            Decimal::ZERO
        } else {
            collateral / size
        };
        Self {
            outcome_asset_id: outcome_asset_id.to_string(),
            size,
            price,
            collateral,
        }
    }

    /// A zero-size leg has no meaningful price.
    pub fn is_degenerate(&self) -> bool {
        self.size.is_zero()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Buy(Leg),
    Sell(Leg),
    /// Neither or both sides carried collateral.
    Ambiguous {
        maker_asset_id: String,
        taker_asset_id: String,
    },
}

impl Classification {
    pub fn side(&self) -> FillSide {
        match self {
            Classification::Buy(_) => FillSide::Buy,
            Classification::Sell(_) => FillSide::Sell,
            Classification::Ambiguous { .. } => FillSide::Ambiguous,
        }
    }

    pub fn leg(&self) -> Option<&Leg> {
        match self {
            Classification::Buy(leg) | Classification::Sell(leg) => Some(leg),
            Classification::Ambiguous { .. } => None,
        }
    }
}

/// A fill with its direction, and the market outcome it traded once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedFill {
    pub fill: Fill,
    pub classification: Classification,
    /// The tracked user was both maker and taker.
    pub self_matched: bool,
    pub asset: Option<ResolvedAsset>,
}

impl ClassifiedFill {
    pub fn side(&self) -> FillSide {
        self.classification.side()
    }

    pub fn leg(&self) -> Option<&Leg> {
        self.classification.leg()
    }

    /// Token id used for market resolution. Ambiguous fills fall back to the maker asset.
    pub fn resolution_asset_id(&self) -> &str {
        match &self.classification {
            Classification::Buy(leg) | Classification::Sell(leg) => &leg.outcome_asset_id,
            Classification::Ambiguous { maker_asset_id, .. } => maker_asset_id,
        }
    }

    /// Fills that move the tracked user's cash and position.
    pub fn counts_toward_pnl(&self) -> bool {
        !self.self_matched && self.leg().is_some()
    }

    /// USDC into (+) or out of (-) the tracked user's wallet.
    pub fn net_collateral_flow(&self) -> Decimal {
        if self.self_matched {
            return Decimal::ZERO;
        }
        match &self.classification {
            Classification::Buy(leg) => -leg.collateral,
            Classification::Sell(leg) => leg.collateral,
            Classification::Ambiguous { .. } => Decimal::ZERO,
        }
    }

    /// Attach the resolved market outcome.
    pub fn resolve_with(mut self, resolver: &AssetResolver) -> Self {
        self.asset = resolver.resolve(self.resolution_asset_id()).cloned();
        self
    }
}

/// Classify a fill from the perspective of `tracked_address`.
pub fn classify(fill: &Fill, tracked_address: &str) -> ClassifiedFill {
    let tracked = normalize_address(tracked_address);
    let is_maker = fill.maker == tracked;
    let maker_pays = fill.maker_asset_id.trim() == COLLATERAL_ASSET_ID;
    let taker_pays = fill.taker_asset_id.trim() == COLLATERAL_ASSET_ID;

    let classification = match (maker_pays, taker_pays) {
        (true, false) => {
            let leg = Leg::new(&fill.taker_asset_id, fill.taker_amount, fill.maker_amount);
            if is_maker {
                Classification::Buy(leg)
            } else {
                Classification::Sell(leg)
            }
        }
        (false, true) => {
            let leg = Leg::new(&fill.maker_asset_id, fill.maker_amount, fill.taker_amount);
            if is_maker {
                Classification::Sell(leg)
            } else {
                Classification::Buy(leg)
            }
        }
        _ => Classification::Ambiguous {
            maker_asset_id: fill.maker_asset_id.clone(),
            taker_asset_id: fill.taker_asset_id.clone(),
        },
    };

    ClassifiedFill {
        fill: fill.clone(),
        classification,
        self_matched: fill.is_self_match(&tracked),
        asset: None,
    }
}

/// Classify and resolve every fill in input order.
pub fn classify_all(
    fills: &[Fill],
    tracked_address: &str,
    resolver: &AssetResolver,
) -> Vec<ClassifiedFill> {
    fills
        .iter()
        .map(|fill| classify(fill, tracked_address).resolve_with(resolver))
        .collect()
}
