//! Redemptions from the activity subgraph.

use async_trait::async_trait;
use pnl_common::{
    decode_index_sets, normalize_address, parse_atomic, ParseError, Redemption, TimeWindow,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::http::{HttpSource, SourceError};
use crate::ingest::{Advance, Cursor, Page, PagedSource};

const REDEMPTIONS_QUERY: &str = r#"query Redemptions($user: String!, $minTs: BigInt!, $maxTs: BigInt!, $first: Int!) {
  redemptions(
    first: $first
    orderBy: timestamp
    orderDirection: asc
    where: { redeemer: $user, timestamp_gte: $minTs, timestamp_lt: $maxTs }
  ) {
    id
    timestamp
    redeemer
    payout
    indexSets
    condition { id }
  }
}"#;

/// Where to resume: the latest stored timestamp, or the window start.
pub fn resume_cursor(redemptions: &[Redemption], window: &TimeWindow) -> Cursor {
    let since = redemptions
        .iter()
        .map(|r| r.timestamp)
        .filter(|ts| window.contains(*ts))
        .max()
        .unwrap_or_else(|| window.start_ts());
    Cursor::Since(since)
}

#[derive(Debug, Deserialize)]
struct RedemptionsData {
    #[serde(default)]
    redemptions: Vec<serde_json::Value>,
}

/// `condition` arrives as `{ "id": ... }` from the subgraph, a bare string from some mirrors.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ConditionRef {
    Entity { id: String },
    Id(String),
}

impl ConditionRef {
    fn into_id(self) -> String {
        match self {
            ConditionRef::Entity { id } | ConditionRef::Id(id) => id,
        }
    }
}

/// Numbers or numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum Numeric {
    Text(String),
    Number(serde_json::Number),
}

impl Numeric {
    pub(crate) fn into_string(self) -> String {
        match self {
            Numeric::Text(text) => text,
            Numeric::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRedemption {
    id: Option<String>,
    timestamp: Option<Numeric>,
    redeemer: Option<String>,
    payout: Option<Numeric>,
    #[serde(default)]
    index_sets: Vec<Numeric>,
    condition: Option<ConditionRef>,
}

impl RawRedemption {
    fn into_redemption(self) -> Result<Redemption, ParseError> {
        let id = self
            .id
            .filter(|id| !id.is_empty())
            .ok_or(ParseError::MissingField("id"))?;
        let timestamp = self
            .timestamp
            .ok_or(ParseError::MissingField("timestamp"))?
            .into_string();
        let timestamp: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| ParseError::invalid("timestamp", timestamp))?;
        let condition_id = self
            .condition
            .map(ConditionRef::into_id)
            .filter(|c| !c.is_empty())
            .ok_or(ParseError::MissingField("condition"))?;
        let payout = self.payout.ok_or(ParseError::MissingField("payout"))?;
        let index_sets: Vec<String> = self
            .index_sets
            .into_iter()
            .map(Numeric::into_string)
            .collect();

        Ok(Redemption {
            id,
            timestamp,
            redeemer: normalize_address(
                &self.redeemer.ok_or(ParseError::MissingField("redeemer"))?,
            ),
            payout: parse_atomic("payout", &payout.into_string())?,
            condition_id: normalize_address(&condition_id),
            outcome_indices: decode_index_sets(&index_sets)?,
        })
    }
}

/// Parse raw redemptions, keeping the timestamp of the last raw item for paging.
fn parse_redemptions(
    items: Vec<serde_json::Value>,
) -> (Vec<Result<Redemption, ParseError>>, Option<i64>) {
    let last_ts = items.last().and_then(|item| match item.get("timestamp")? {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    });
    let results = items
        .into_iter()
        .map(|value| {
            serde_json::from_value::<RawRedemption>(value)
                .map_err(|e| ParseError::invalid("redemption", e.to_string()))
                .and_then(RawRedemption::into_redemption)
        })
        .collect();
    (results, last_ts)
}

/// A trader's redemptions inside a window, paged by timestamp.
///
/// Timestamps are not unique, so each page restarts at the last timestamp
/// seen and overlapping records are dropped by identifier. A full page that
/// never leaves one second can only move on by skipping ahead one second.
pub struct ActivityRedemptions {
    http: HttpSource,
    url: String,
    user: String,
    window: TimeWindow,
    page_size: usize,
}

impl ActivityRedemptions {
    pub fn new(
        http: HttpSource,
        url: impl Into<String>,
        user: &str,
        window: TimeWindow,
        page_size: usize,
    ) -> Self {
        Self {
            http,
            url: url.into(),
            user: normalize_address(user),
            window,
            page_size,
        }
    }
}

#[async_trait]
impl PagedSource for ActivityRedemptions {
    type Record = Redemption;

    fn name(&self) -> &str {
        "redemptions"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Redemption>, SourceError> {
        let since = match cursor {
            Cursor::Since(ts) => *ts,
            other => {
                return Err(SourceError::InvalidResponse(format!(
                    "redemptions page by timestamp, got {other}"
                )))
            }
        };
        let variables = json!({
            "user": self.user,
            "minTs": since.to_string(),
            "maxTs": self.window.end_ts().to_string(),
            "first": self.page_size,
        });
        debug!("[redemptions] Querying {}", cursor);

        let data: RedemptionsData = self
            .http
            .graphql(&self.url, REDEMPTIONS_QUERY, variables)
            .await?;
        let (results, last_ts) = parse_redemptions(data.redemptions);
        Ok(Page::from_results(self.name(), results, last_ts.map(Cursor::Since)))
    }

    fn next_cursor(&self, current: &Cursor, page: &Page<Redemption>) -> Advance {
        if page.raw_len < self.page_size {
            return Advance::Stop;
        }
        match (current, &page.last) {
            (Cursor::Since(current), Some(Cursor::Since(last))) if last <= current => {
                Advance::Lossy(Cursor::Since(current + 1))
            }
            (_, Some(last)) => Advance::To(last.clone()),
            (_, None) => Advance::Stop,
        }
    }
}
