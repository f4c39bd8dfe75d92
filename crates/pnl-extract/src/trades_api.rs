//! TRADE rows from the data-api `/activity` feed.
//!
//! The feed lists newest first and pages by offset. A pass stops at the first
//! row older than the window, at a short page, or when the page cap is hit.
//! Offsets shift as new activity arrives, so every run starts from offset 0
//! and relies on the seen identifiers to skip what is already stored.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use pnl_common::{normalize_address, ApiTrade, Fill, ParseError, TimeWindow};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::activity::Numeric;
use crate::http::{HttpSource, SourceError};
use crate::ingest::{Advance, Cursor, Page, PagedSource};

/// Rows per `/activity` request.
pub const ACTIVITY_PAGE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawActivity {
    #[serde(rename = "type")]
    kind: Option<String>,
    timestamp: Option<Numeric>,
    transaction_hash: Option<String>,
    asset: Option<String>,
    condition_id: Option<String>,
    side: Option<String>,
    outcome: Option<String>,
    title: Option<String>,
    slug: Option<String>,
    price: Option<Numeric>,
    size: Option<Numeric>,
    usdc_size: Option<Numeric>,
}

fn decimal(field: &'static str, value: Option<Numeric>) -> Result<Decimal, ParseError> {
    let text = value.ok_or(ParseError::MissingField(field))?.into_string();
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .map_err(|_| ParseError::invalid(field, text))
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ParseError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField(field))
}

impl RawActivity {
    fn is_trade(&self) -> bool {
        self.kind.as_deref() == Some("TRADE")
    }

    fn timestamp(&self) -> Option<i64> {
        match self.timestamp.as_ref()? {
            Numeric::Text(text) => text.trim().parse().ok(),
            Numeric::Number(n) => n.as_i64(),
        }
    }

    fn into_trade(self) -> Result<ApiTrade, ParseError> {
        let timestamp = self.timestamp().ok_or(ParseError::MissingField("timestamp"))?;
        let side = required(self.side, "side")?.to_uppercase();
        if side != "BUY" && side != "SELL" {
            return Err(ParseError::invalid("side", side));
        }
        Ok(ApiTrade {
            timestamp,
            transaction_hash: required(self.transaction_hash, "transactionHash")?.to_lowercase(),
            asset_id: required(self.asset, "asset")?,
            condition_id: self.condition_id.unwrap_or_default().to_lowercase(),
            side,
            outcome: self.outcome.unwrap_or_default(),
            title: self.title.unwrap_or_default(),
            slug: self.slug.unwrap_or_default(),
            price: decimal("price", self.price)?,
            size: decimal("size", self.size)?,
            usdc_size: decimal("usdcSize", self.usdc_size)?,
            block_number: None,
        })
    }
}

/// One parsed `/activity` page.
#[derive(Debug)]
struct ParsedPage {
    results: Vec<Result<ApiTrade, ParseError>>,
    /// A row older than the window was seen; later pages are older still.
    reached_start: bool,
}

/// Keep TRADE rows inside `window`. Other activity types are not records.
fn parse_activity(body: Vec<serde_json::Value>, window: &TimeWindow) -> ParsedPage {
    let mut results = Vec::new();
    let mut reached_start = false;
    for value in body {
        let raw = match serde_json::from_value::<RawActivity>(value) {
            Ok(raw) => raw,
            Err(e) => {
                results.push(Err(ParseError::invalid("activity", e.to_string())));
                continue;
            }
        };
        if let Some(ts) = raw.timestamp() {
            if ts < window.start_ts() {
                reached_start = true;
                continue;
            }
            if ts >= window.end_ts() {
                continue;
            }
        }
        if raw.is_trade() {
            results.push(raw.into_trade());
        }
    }
    ParsedPage {
        results,
        reached_start,
    }
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Receipt>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    block_number: String,
}

fn parse_hex_u64(text: &str) -> Option<u64> {
    let digits = text.trim().trim_start_matches("0x");
    u64::from_str_radix(digits, 16).ok()
}

/// A trader's TRADE activity inside a window.
pub struct ActivityApiTrades {
    http: HttpSource,
    base_url: String,
    user: String,
    window: TimeWindow,
    /// JSON-RPC endpoint for receipt lookups; no block numbers when unset.
    rpc_url: Option<String>,
}

impl ActivityApiTrades {
    pub fn new(
        http: HttpSource,
        base_url: impl Into<String>,
        user: &str,
        window: TimeWindow,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            user: normalize_address(user),
            window,
            rpc_url: None,
        }
    }

    /// Look up each trade's block with `eth_getTransactionReceipt`. One call per transaction.
    pub fn with_block_lookup(mut self, rpc_url: impl Into<String>) -> Self {
        self.rpc_url = Some(rpc_url.into());
        self
    }

    fn query(&self, offset: usize) -> Vec<(&'static str, String)> {
        vec![
            ("user", self.user.clone()),
            ("limit", ACTIVITY_PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
        ]
    }

    async fn block_number(&self, rpc_url: &str, tx_hash: &str) -> Option<u64> {
        let request = json!({
            "jsonrpc": "2.0",
            "method": "eth_getTransactionReceipt",
            "params": [tx_hash],
            "id": 1,
        });
        match self.http.post_json::<RpcResponse>(rpc_url, &request).await {
            Ok(response) => response
                .result
                .and_then(|receipt| parse_hex_u64(&receipt.block_number)),
            Err(e) => {
                debug!("Receipt lookup failed for {}: {}", tx_hash, e);
                None
            }
        }
    }

    async fn attach_blocks(&self, results: &mut [Result<ApiTrade, ParseError>]) {
        let Some(rpc_url) = &self.rpc_url else {
            return;
        };
        let mut blocks: HashMap<String, Option<u64>> = HashMap::new();
        for trade in results.iter_mut().filter_map(|r| r.as_mut().ok()) {
            if !blocks.contains_key(&trade.transaction_hash) {
                let block = self.block_number(rpc_url, &trade.transaction_hash).await;
                blocks.insert(trade.transaction_hash.clone(), block);
            }
            trade.block_number = blocks.get(&trade.transaction_hash).copied().flatten();
        }
    }
}

#[async_trait]
impl PagedSource for ActivityApiTrades {
    type Record = ApiTrade;

    fn name(&self) -> &str {
        "activity-trades"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<ApiTrade>, SourceError> {
        let offset = match cursor {
            Cursor::Offset(offset) => *offset,
            other => {
                return Err(SourceError::InvalidResponse(format!(
                    "activity feed pages by offset, got {other}"
                )))
            }
        };
        let url = format!("{}/activity", self.base_url);
        debug!("Fetching activity: {} offset={}", url, offset);

        let body: Vec<serde_json::Value> = self.http.get_json(&url, &self.query(offset)).await?;
        let raw_len = body.len();
        let mut parsed = parse_activity(body, &self.window);
        self.attach_blocks(&mut parsed.results).await;

        let mut page = Page::from_results(self.name(), parsed.results, None);
        page.raw_len = raw_len;
        if !parsed.reached_start {
            page.last = Some(Cursor::Offset(offset + raw_len));
        }
        Ok(page)
    }

    fn next_cursor(&self, _current: &Cursor, page: &Page<ApiTrade>) -> Advance {
        if page.raw_len < ACTIVITY_PAGE_LIMIT {
            return Advance::Stop;
        }
        match &page.last {
            Some(next) => Advance::To(next.clone()),
            None => {
                debug!("Reached activity older than the window");
                Advance::Stop
            }
        }
    }
}

/// Pages needed to read at most `max_items` rows; `None` when unlimited.
pub fn max_pages(max_items: usize) -> Option<usize> {
    (max_items > 0).then(|| max_items.div_ceil(ACTIVITY_PAGE_LIMIT))
}

/// Trades inside `window` whose transaction has no stored fill.
pub fn unmatched_trades<'a>(
    trades: &'a [ApiTrade],
    fills: &[Fill],
    window: &TimeWindow,
) -> Vec<&'a ApiTrade> {
    let hashes: HashSet<String> = fills
        .iter()
        .map(|f| f.transaction_hash.to_lowercase())
        .collect();
    trades
        .iter()
        .filter(|t| window.contains(t.timestamp))
        .filter(|t| !hashes.contains(&t.transaction_hash))
        .collect()
}
