//! Shared record types for PnL extraction.
//!
//! CRITICAL: All amounts and prices use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved asset id of the collateral (USDC) side of a fill.
pub const COLLATERAL_ASSET_ID: &str = "0";

/// Decimals shared by USDC and the conditional outcome tokens.
pub const TOKEN_DECIMALS: u32 = 6;

/// 10^TOKEN_DECIMALS as a Decimal.
pub const ATOMIC_SCALE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

/// Convert an atomic (6-decimal) amount into whole units.
pub fn from_atomic(amount: Decimal) -> Decimal {
    amount / ATOMIC_SCALE
}

/// Lowercase and trim an address so comparisons are encoding-independent.
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Errors raised while turning a raw source payload into a record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("empty index set")]
    EmptyIndexSet,
}

impl ParseError {
    pub fn invalid(field: &'static str, value: impl Into<String>) -> Self {
        ParseError::InvalidValue {
            field,
            value: value.into(),
        }
    }
}

/// Parse an unsigned integer string (atomic amount) into a Decimal.
pub fn parse_atomic(field: &'static str, value: &str) -> Result<Decimal, ParseError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ParseError::MissingField(field));
    }
    let amount: Decimal = trimmed
        .parse()
        .map_err(|_| ParseError::invalid(field, trimmed))?;
    if amount.is_sign_negative() {
        return Err(ParseError::invalid(field, trimmed));
    }
    Ok(amount)
}

/// Records with a globally unique identifier.
pub trait Identified {
    fn id(&self) -> Cow<'_, str>;
}

/// Records ordered by a unix-seconds timestamp.
pub trait Timestamped {
    fn timestamp(&self) -> i64;
}

/// Drop records whose identifier was already seen, keeping the first occurrence.
///
/// Returns the surviving records in input order and the number dropped.
pub fn dedup_by_id<T: Identified>(records: impl IntoIterator<Item = T>) -> (Vec<T>, usize) {
    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut dropped = 0;
    for record in records {
        if seen.insert(record.id().into_owned()) {
            kept.push(record);
        } else {
            dropped += 1;
        }
    }
    (kept, dropped)
}

/// One matched order from the orderbook subgraph.
///
/// Amounts are atomic units (6 decimals). Addresses are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fill {
    /// Sortable identifier (`{txHash}_{orderHash}` on the orderbook subgraph).
    pub id: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub transaction_hash: String,
    pub maker: String,
    pub taker: String,
    pub maker_asset_id: String,
    pub taker_asset_id: String,
    pub maker_amount: Decimal,
    pub taker_amount: Decimal,
}

impl Fill {
    /// True when `address` sits on both sides of the match.
    pub fn is_self_match(&self, address: &str) -> bool {
        let address = normalize_address(address);
        self.maker == address && self.taker == address
    }
}

impl Identified for Fill {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }
}

impl Timestamped for Fill {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// A payout claim for a resolved condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub redeemer: String,
    /// Atomic units (6 decimals).
    pub payout: Decimal,
    /// Lowercase 0x-prefixed condition id.
    pub condition_id: String,
    /// Outcome indices redeemed, decoded from the on-chain index sets.
    #[serde(with = "index_list")]
    pub outcome_indices: BTreeSet<u32>,
}

impl Redemption {
    /// A non-zero payout means every redeemed outcome won.
    pub fn is_winning(&self) -> bool {
        self.payout > Decimal::ZERO
    }

    pub fn payout_usdc(&self) -> Decimal {
        from_atomic(self.payout)
    }
}

impl Identified for Redemption {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.id)
    }
}

impl Timestamped for Redemption {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Decode CTF index sets (bitmasks) into outcome indices.
///
/// Index set `1` is outcome 0, `2` is outcome 1, `3` is both.
pub fn decode_index_sets<S: AsRef<str>>(index_sets: &[S]) -> Result<BTreeSet<u32>, ParseError> {
    let mut indices = BTreeSet::new();
    for raw in index_sets {
        let raw = raw.as_ref().trim();
        let mask: u128 = raw
            .parse()
            .map_err(|_| ParseError::invalid("indexSets", raw))?;
        if mask == 0 {
            return Err(ParseError::EmptyIndexSet);
        }
        for bit in 0..u128::BITS {
            if mask & (1u128 << bit) != 0 {
                indices.insert(bit);
            }
        }
    }
    if indices.is_empty() {
        return Err(ParseError::EmptyIndexSet);
    }
    Ok(indices)
}

/// Market metadata from the Gamma API, keyed by condition id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    /// Lowercase 0x-prefixed condition id.
    pub condition_id: String,
    pub question: String,
    pub slug: String,
    pub closed: bool,
    /// Wrapped (CLOB) token ids; position i is outcome index i.
    pub token_ids: Vec<String>,
    /// Outcome labels; same order as `token_ids`.
    pub outcomes: Vec<String>,
}

impl Market {
    /// Token and outcome lists line up and are non-empty.
    pub fn has_aligned_tokens(&self) -> bool {
        !self.token_ids.is_empty() && self.token_ids.len() == self.outcomes.len()
    }
}

impl Identified for Market {
    fn id(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.condition_id)
    }
}

/// One point of a cumulative PnL series scraped from the profile page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotPoint {
    /// Unix seconds of the data point.
    pub timestamp: i64,
    /// Cumulative PnL in USD.
    pub value: Decimal,
    /// Requested timeframe the series belongs to (`ALL`, `1M`, `1W`, `1D`).
    pub timeframe: String,
    pub user: String,
}

impl Identified for SnapshotPoint {
    fn id(&self) -> Cow<'_, str> {
        Cow::Owned(format!("{}:{}:{}", self.user, self.timeframe, self.timestamp))
    }
}

impl Timestamped for SnapshotPoint {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// A TRADE row from the data-api activity feed.
///
/// Unlike [`Fill`], amounts are whole units as the feed reports them and the
/// side is already from the trader's perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiTrade {
    /// Unix seconds.
    pub timestamp: i64,
    pub transaction_hash: String,
    pub asset_id: String,
    pub condition_id: String,
    /// `BUY` or `SELL`.
    pub side: String,
    pub outcome: String,
    pub title: String,
    pub slug: String,
    pub price: Decimal,
    pub size: Decimal,
    pub usdc_size: Decimal,
    /// Filled in only when receipts are looked up.
    #[serde(default)]
    pub block_number: Option<u64>,
}

impl Identified for ApiTrade {
    fn id(&self) -> Cow<'_, str> {
        Cow::Owned(format!(
            "{}:{}:{}:{}:{}",
            self.transaction_hash, self.asset_id, self.side, self.size, self.price
        ))
    }
}

impl Timestamped for ApiTrade {
    fn timestamp(&self) -> i64 {
        self.timestamp
    }
}

/// Stores an index set as a compact JSON list inside a single CSV cell.
mod index_list {
    use std::collections::BTreeSet;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(set: &BTreeSet<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        let text = serde_json::to_string(set).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&text)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeSet<u32>, D::Error> {
        let text = String::deserialize(deserializer)?;
        serde_json::from_str(&text).map_err(serde::de::Error::custom)
    }
}
