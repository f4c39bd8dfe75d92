//! Block-indexed realized PnL from the PnL subgraph.

use std::str::FromStr;

use pnl_common::{normalize_address, TimeWindow};
use pnl_core::SubgraphFigure;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ReconcileConfig;
use crate::http::{HttpSource, SourceError};

const BLOCK_QUERY: &str = r#"query Block($ts: BigInt!) {
  orderFilledEvents(first: 1, orderBy: timestamp, orderDirection: asc, where: { timestamp_gte: $ts }) {
    timestamp
    block { number }
  }
}"#;

const POSITIONS_QUERY: &str = r#"query Positions($user: String!, $block: Int!, $lastId: String!, $first: Int!) {
  userPositions(
    first: $first
    orderBy: id
    orderDirection: asc
    block: { number: $block }
    where: { user: $user, id_gt: $lastId }
  ) {
    id
    realizedPnl
  }
}"#;

const POSITIONS_PAGE_SIZE: usize = 1000;

/// Block resolved for a timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockLookup {
    pub timestamp: i64,
    pub block: u64,
    /// The block is the configured estimate because the lookup failed.
    pub estimated: bool,
}

#[derive(Debug, Deserialize)]
struct BlockData {
    #[serde(rename = "orderFilledEvents", default)]
    events: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct PositionsData {
    #[serde(rename = "userPositions", default)]
    positions: Vec<RawPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPosition {
    id: String,
    realized_pnl: serde_json::Value,
}

fn as_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Block number of the first event, from `block.number` or `blockNumber`.
fn block_number(events: &[serde_json::Value]) -> Option<u64> {
    let event = events.first()?;
    event
        .get("block")
        .and_then(|b| b.get("number"))
        .and_then(as_u64)
        .or_else(|| event.get("blockNumber").and_then(as_u64))
}

/// Sum atomic `realizedPnl` values and scale them to USD.
fn sum_realized(positions: &[RawPosition], decimals: u32) -> Result<Decimal, SourceError> {
    let mut total = Decimal::ZERO;
    for position in positions {
        let text = match &position.realized_pnl {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(SourceError::InvalidResponse(format!(
                    "realizedPnl for {}: {}",
                    position.id, other
                )))
            }
        };
        let value = Decimal::from_str(&text).map_err(|_| {
            SourceError::InvalidResponse(format!("realizedPnl for {}: {}", position.id, text))
        })?;
        total += value;
    }
    Ok(total * Decimal::new(1, decimals))
}

/// Reads realized PnL at the blocks bounding a window.
pub struct PnlSubgraph {
    http: HttpSource,
    pnl_url: String,
    blocks_url: String,
    settings: ReconcileConfig,
}

impl PnlSubgraph {
    /// `blocks_url` is any subgraph whose `orderFilledEvents` carry block numbers.
    pub fn new(
        http: HttpSource,
        pnl_url: impl Into<String>,
        blocks_url: impl Into<String>,
        settings: ReconcileConfig,
    ) -> Self {
        Self {
            http,
            pnl_url: pnl_url.into(),
            blocks_url: blocks_url.into(),
            settings,
        }
    }

    /// First block at or after `timestamp`, or the configured estimate.
    pub async fn block_for_timestamp(&self, timestamp: i64) -> BlockLookup {
        let looked_up = self
            .http
            .graphql::<BlockData>(
                &self.blocks_url,
                BLOCK_QUERY,
                json!({ "ts": timestamp.to_string() }),
            )
            .await;

        match looked_up.map(|data| block_number(&data.events)) {
            Ok(Some(block)) => {
                debug!("Timestamp {} -> block {}", timestamp, block);
                BlockLookup {
                    timestamp,
                    block,
                    estimated: false,
                }
            }
            Ok(None) => self.fallback(timestamp, "no event at or after timestamp"),
            Err(e) => self.fallback(timestamp, &e.to_string()),
        }
    }

    fn fallback(&self, timestamp: i64, reason: &str) -> BlockLookup {
        let block = self.settings.fallback_block(timestamp);
        warn!(
            "Block lookup for {} failed ({}); using estimated block {}",
            timestamp, reason, block
        );
        BlockLookup {
            timestamp,
            block,
            estimated: true,
        }
    }

    /// Total realized PnL across the user's positions as of `block`.
    pub async fn realized_pnl_at_block(
        &self,
        user: &str,
        block: u64,
    ) -> Result<Decimal, SourceError> {
        let user = normalize_address(user);
        let mut positions = Vec::new();
        let mut last_id = String::new();

        loop {
            let variables = json!({
                "user": user,
                "block": block,
                "lastId": last_id,
                "first": POSITIONS_PAGE_SIZE,
            });
            let data: PositionsData = self
                .http
                .graphql(&self.pnl_url, POSITIONS_QUERY, variables)
                .await?;
            let fetched = data.positions.len();
            if let Some(last) = data.positions.last() {
                last_id = last.id.clone();
            }
            positions.extend(data.positions);
            if fetched < POSITIONS_PAGE_SIZE {
                break;
            }
        }

        let total = sum_realized(&positions, self.settings.pnl_subgraph_decimals)?;
        debug!("Block {}: {} positions, realized PnL {}", block, positions.len(), total);
        Ok(total)
    }

    /// Realized PnL at the window's start and end blocks.
    pub async fn figure(
        &self,
        user: &str,
        window: &TimeWindow,
    ) -> Result<SubgraphFigure, SourceError> {
        let start = self.block_for_timestamp(window.start_ts()).await;
        let end = self.block_for_timestamp(window.end_ts()).await;
        info!("Window blocks: {} -> {}", start.block, end.block);

        let pnl_start = self.realized_pnl_at_block(user, start.block).await?;
        let pnl_end = self.realized_pnl_at_block(user, end.block).await?;

        Ok(SubgraphFigure {
            start_block: start.block,
            end_block: end.block,
            start_block_estimated: start.estimated,
            end_block_estimated: end.estimated,
            pnl_start,
            pnl_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_block_number_shapes() {
        let nested: Vec<serde_json::Value> =
            serde_json::from_str(r#"[{"timestamp": "1", "block": {"number": "81139400"}}]"#)
                .unwrap();
        assert_eq!(block_number(&nested), Some(81_139_400));

        let flat: Vec<serde_json::Value> =
            serde_json::from_str(r#"[{"timestamp": "1", "blockNumber": 81213222}]"#).unwrap();
        assert_eq!(block_number(&flat), Some(81_213_222));

        assert_eq!(block_number(&[]), None);
    }

    #[test]
    fn test_sum_realized_scales_atomic_units() {
        let positions: Vec<RawPosition> = serde_json::from_str(
            r#"[
                {"id": "a", "realizedPnl": "6000000"},
                {"id": "b", "realizedPnl": "-1500000"},
                {"id": "c", "realizedPnl": 250000}
            ]"#,
        )
        .unwrap();
        assert_eq!(sum_realized(&positions, 6).unwrap(), dec!(4.75));
        assert_eq!(sum_realized(&[], 6).unwrap(), Decimal::ZERO);
    }

    #[test]
    fn test_sum_realized_rejects_garbage() {
        let positions: Vec<RawPosition> =
            serde_json::from_str(r#"[{"id": "a", "realizedPnl": null}]"#).unwrap();
        assert!(sum_realized(&positions, 6).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_lookup_falls_back_to_estimate() {
        let http = HttpSource::new(crate::http::HttpConfig {
            timeout: std::time::Duration::from_millis(200),
            max_retries: 0,
            initial_backoff: std::time::Duration::ZERO,
        })
        .unwrap();
        let subgraph = PnlSubgraph::new(
            http,
            "http://127.0.0.1:9/pnl",
            "http://127.0.0.1:9/orderbook",
            ReconcileConfig::default(),
        );

        let early = subgraph.block_for_timestamp(1_767_571_200).await;
        assert!(early.estimated);
        assert_eq!(early.block, 81_139_400);

        let late = subgraph.block_for_timestamp(1_767_744_000).await;
        assert_eq!(late.block, 81_213_222);
    }
}
