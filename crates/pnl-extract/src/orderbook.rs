//! Order fills from the orderbook subgraph.
//!
//! The subgraph filters on one side of the match at a time, so a trader's
//! fills are read twice: once as maker, once as taker. Both passes land in the
//! same table and share one set of seen identifiers.

use async_trait::async_trait;
use pnl_common::{normalize_address, parse_atomic, Fill, ParseError, TimeWindow};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::http::{HttpSource, SourceError};
use crate::ingest::{Advance, Cursor, Page, PagedSource};

/// Which side of the match the tracked address is filtered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Maker,
    Taker,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Maker, Role::Taker];

    fn field(&self) -> &'static str {
        match self {
            Role::Maker => "maker",
            Role::Taker => "taker",
        }
    }

    /// The address on this side of `fill`.
    pub fn address<'a>(&self, fill: &'a Fill) -> &'a str {
        match self {
            Role::Maker => &fill.maker,
            Role::Taker => &fill.taker,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field())
    }
}

/// Identifier to resume a role's pass from: the greatest id already stored
/// for fills inside `window` where `user` sits on that side only.
///
/// Self-matches are written by whichever pass sees them first, so they say
/// nothing about how far the other pass got.
pub fn resume_cursor(fills: &[Fill], role: Role, user: &str, window: &TimeWindow) -> Cursor {
    let user = normalize_address(user);
    let last = fills
        .iter()
        .filter(|f| role.address(f) == user && !f.is_self_match(&user))
        .filter(|f| window.contains(f.timestamp))
        .map(|f| f.id.as_str())
        .max()
        .unwrap_or_default();
    Cursor::After(last.to_string())
}

#[derive(Debug, Deserialize)]
struct FillsData {
    #[serde(rename = "orderFilledEvents", default)]
    events: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFill {
    id: Option<String>,
    transaction_hash: Option<String>,
    timestamp: Option<String>,
    maker: Option<String>,
    taker: Option<String>,
    maker_asset_id: Option<String>,
    taker_asset_id: Option<String>,
    maker_amount_filled: Option<String>,
    taker_amount_filled: Option<String>,
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ParseError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ParseError::MissingField(field))
}

impl RawFill {
    fn into_fill(self) -> Result<Fill, ParseError> {
        let timestamp = required(self.timestamp, "timestamp")?;
        let timestamp: i64 = timestamp
            .parse()
            .map_err(|_| ParseError::invalid("timestamp", timestamp))?;
        Ok(Fill {
            id: required(self.id, "id")?,
            timestamp,
            transaction_hash: self.transaction_hash.unwrap_or_default(),
            maker: normalize_address(&required(self.maker, "maker")?),
            taker: normalize_address(&required(self.taker, "taker")?),
            maker_asset_id: required(self.maker_asset_id, "makerAssetId")?,
            taker_asset_id: required(self.taker_asset_id, "takerAssetId")?,
            maker_amount: parse_atomic(
                "makerAmountFilled",
                &required(self.maker_amount_filled, "makerAmountFilled")?,
            )?,
            taker_amount: parse_atomic(
                "takerAmountFilled",
                &required(self.taker_amount_filled, "takerAmountFilled")?,
            )?,
        })
    }
}

/// Parse raw events, keeping the id of the last raw item for paging.
fn parse_fills(events: Vec<serde_json::Value>) -> (Vec<Result<Fill, ParseError>>, Option<String>) {
    let last_id = events
        .last()
        .and_then(|e| e.get("id"))
        .and_then(|id| id.as_str())
        .map(str::to_string);
    let results = events
        .into_iter()
        .map(|value| {
            serde_json::from_value::<RawFill>(value)
                .map_err(|e| ParseError::invalid("orderFilledEvent", e.to_string()))
                .and_then(RawFill::into_fill)
        })
        .collect();
    (results, last_id)
}

fn fills_query(role: Role) -> String {
    format!(
        r#"query Fills($user: String!, $minTs: BigInt!, $maxTs: BigInt!, $lastId: String!, $first: Int!) {{
  orderFilledEvents(
    first: $first
    orderBy: id
    orderDirection: asc
    where: {{ {field}: $user, timestamp_gte: $minTs, timestamp_lt: $maxTs, id_gt: $lastId }}
  ) {{
    id
    transactionHash
    timestamp
    maker
    taker
    makerAssetId
    takerAssetId
    makerAmountFilled
    takerAmountFilled
  }}
}}"#,
        field = role.field()
    )
}

/// One role's pass over a trader's fills inside a window.
pub struct OrderbookFills {
    http: HttpSource,
    url: String,
    user: String,
    window: TimeWindow,
    page_size: usize,
    name: String,
    query: String,
}

impl OrderbookFills {
    pub fn new(
        http: HttpSource,
        url: impl Into<String>,
        user: &str,
        role: Role,
        window: TimeWindow,
        page_size: usize,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            user: normalize_address(user),
            window,
            page_size,
            name: format!("fills-{role}"),
            query: fills_query(role),
        }
    }
}

#[async_trait]
impl PagedSource for OrderbookFills {
    type Record = Fill;

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Fill>, SourceError> {
        let last_id = match cursor {
            Cursor::After(id) => id.clone(),
            other => {
                return Err(SourceError::InvalidResponse(format!(
                    "orderbook fills page by id, got {other}"
                )))
            }
        };
        let variables = json!({
            "user": self.user,
            "minTs": self.window.start_ts().to_string(),
            "maxTs": self.window.end_ts().to_string(),
            "lastId": last_id,
            "first": self.page_size,
        });
        debug!("[{}] Querying fills {}", self.name, cursor);

        let data: FillsData = self.http.graphql(&self.url, &self.query, variables).await?;
        let (results, last_id) = parse_fills(data.events);
        Ok(Page::from_results(&self.name, results, last_id.map(Cursor::After)))
    }

    fn next_cursor(&self, _current: &Cursor, page: &Page<Fill>) -> Advance {
        if page.raw_len < self.page_size {
            return Advance::Stop;
        }
        match &page.last {
            Some(last) => Advance::To(last.clone()),
            None => Advance::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn events() -> Vec<serde_json::Value> {
        serde_json::from_str(
            r#"[
                {
                    "id": "0xaa_0x01",
                    "transactionHash": "0xaa",
                    "timestamp": "1767600000",
                    "maker": "0xUSER",
                    "taker": "0xother",
                    "makerAssetId": "0",
                    "takerAssetId": "123",
                    "makerAmountFilled": "4000000",
                    "takerAmountFilled": "10000000"
                },
                {
                    "id": "0xbb_0x02",
                    "timestamp": "1767600060",
                    "maker": "0xuser",
                    "taker": "0xother",
                    "makerAssetId": "0",
                    "takerAssetId": "123",
                    "makerAmountFilled": "-1",
                    "takerAmountFilled": "10"
                }
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_fills_normalizes_addresses() {
        let (results, last_id) = parse_fills(events());
        let fill = results[0].as_ref().unwrap();
        assert_eq!(fill.maker, "0xuser");
        assert_eq!(fill.maker_amount, dec!(4000000));
        assert_eq!(fill.timestamp, 1_767_600_000);
        assert!(results[1].is_err());
        assert_eq!(last_id.as_deref(), Some("0xbb_0x02"));
    }

    #[test]
    fn test_query_filters_on_role() {
        assert!(fills_query(Role::Maker).contains("maker: $user"));
        assert!(fills_query(Role::Taker).contains("taker: $user"));
        assert!(fills_query(Role::Taker).contains("id_gt: $lastId"));
    }

    #[test]
    fn test_resume_cursor_per_role() {
        let (results, _) = parse_fills(events());
        let mut fills: Vec<Fill> = results.into_iter().filter_map(Result::ok).collect();
        let mut as_taker = fills[0].clone();
        as_taker.id = "0xcc_0x03".to_string();
        as_taker.maker = "0xother".to_string();
        as_taker.taker = "0xuser".to_string();
        fills.push(as_taker);
        let window = TimeWindow::parse("2026-01-05", "2026-01-06").unwrap();

        assert_eq!(
            resume_cursor(&fills, Role::Maker, "0xUser", &window),
            Cursor::After("0xaa_0x01".to_string())
        );
        assert_eq!(
            resume_cursor(&fills, Role::Taker, "0xuser", &window),
            Cursor::After("0xcc_0x03".to_string())
        );
        assert_eq!(
            resume_cursor(&[], Role::Maker, "0xuser", &window),
            Cursor::After(String::new())
        );

        let later = TimeWindow::parse("2026-02-01", "2026-02-02").unwrap();
        assert_eq!(
            resume_cursor(&fills, Role::Taker, "0xuser", &later),
            Cursor::After(String::new())
        );
    }

    #[test]
    fn test_self_match_does_not_advance_taker_pass() {
        let (results, _) = parse_fills(events());
        let mut self_match = results[0].as_ref().unwrap().clone();
        self_match.id = "0xff_0x01".to_string();
        self_match.taker = "0xuser".to_string();
        let window = TimeWindow::parse("2026-01-05", "2026-01-06").unwrap();

        // Only the maker pass ran, and it stored a self-match.
        let stored = vec![self_match.clone()];
        assert_eq!(
            resume_cursor(&stored, Role::Taker, "0xuser", &window),
            Cursor::After(String::new())
        );

        let mut taker_only = self_match.clone();
        taker_only.id = "0x10_0x02".to_string();
        taker_only.maker = "0xother".to_string();
        let stored = vec![self_match, taker_only];
        assert_eq!(
            resume_cursor(&stored, Role::Taker, "0xuser", &window),
            Cursor::After("0x10_0x02".to_string())
        );
        assert_eq!(
            resume_cursor(&stored, Role::Maker, "0xuser", &window),
            Cursor::After(String::new())
        );
    }
}
