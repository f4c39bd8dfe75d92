//! Market metadata from the Gamma API.
//!
//! Open and closed markets are both listed: the open/closed flag decides how
//! an unredeemed position is priced.

use async_trait::async_trait;
use chrono::Duration;
use pnl_common::{Market, ParseError, TimeWindow};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::{HttpSource, SourceError};
use crate::ingest::{Advance, Cursor, Page, PagedSource};

/// Gamma caps `limit` well below the subgraph page size.
const GAMMA_PAGE_LIMIT: usize = 100;

/// Safety limit - don't paginate forever.
const MAX_OFFSET: usize = 50_000;

/// Token ids per lookup request.
const TOKEN_LOOKUP_BATCH: usize = 20;

const GAMMA_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// A list Gamma sometimes encodes as a JSON string: `"[\"Yes\", \"No\"]"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum JsonList {
    Encoded(String),
    List(Vec<String>),
}

impl JsonList {
    fn decode(self, field: &'static str) -> Result<Vec<String>, ParseError> {
        match self {
            JsonList::List(items) => Ok(items),
            JsonList::Encoded(text) if text.trim().is_empty() => Ok(Vec::new()),
            JsonList::Encoded(text) => {
                serde_json::from_str(&text).map_err(|_| ParseError::invalid(field, text))
            }
        }
    }
}

/// Market data from Gamma API response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    question: Option<String>,
    condition_id: Option<String>,
    slug: Option<String>,
    clob_token_ids: Option<JsonList>,
    outcomes: Option<JsonList>,
    closed: Option<bool>,
}

impl GammaMarket {
    fn into_market(self) -> Result<Market, ParseError> {
        let condition_id = self
            .condition_id
            .filter(|c| !c.trim().is_empty())
            .ok_or(ParseError::MissingField("conditionId"))?;
        let token_ids = match self.clob_token_ids {
            Some(list) => list.decode("clobTokenIds")?,
            None => Vec::new(),
        };
        let outcomes = match self.outcomes {
            Some(list) => list.decode("outcomes")?,
            None => Vec::new(),
        };
        Ok(Market {
            condition_id: condition_id.trim().to_lowercase(),
            question: self.question.unwrap_or_else(|| "Unknown".to_string()),
            slug: self.slug.unwrap_or_default(),
            closed: self.closed.unwrap_or(false),
            token_ids,
            outcomes,
        })
    }
}

/// Parse one `/markets` page, keeping per-record failures.
fn parse_markets(body: Vec<serde_json::Value>) -> Vec<Result<Market, ParseError>> {
    body.into_iter()
        .map(|value| {
            serde_json::from_value::<GammaMarket>(value)
                .map_err(|e| ParseError::invalid("market", e.to_string()))
                .and_then(GammaMarket::into_market)
        })
        .collect()
}

/// Paginated `/markets` listing for markets ending inside a window, widened
/// by `horizon` on both sides.
pub struct GammaMarkets {
    http: HttpSource,
    base_url: String,
    window: TimeWindow,
    horizon: Duration,
}

impl GammaMarkets {
    pub fn new(
        http: HttpSource,
        base_url: impl Into<String>,
        window: TimeWindow,
        horizon: Duration,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            window,
            horizon,
        }
    }

    fn query(&self, offset: usize) -> Vec<(&'static str, String)> {
        let end_min = self.window.start - self.horizon;
        let end_max = self.window.end + self.horizon;
        vec![
            ("limit", GAMMA_PAGE_LIMIT.to_string()),
            ("offset", offset.to_string()),
            ("order", "endDate".to_string()),
            ("ascending", "true".to_string()),
            ("end_date_min", end_min.format(GAMMA_DATE_FORMAT).to_string()),
            ("end_date_max", end_max.format(GAMMA_DATE_FORMAT).to_string()),
        ]
    }

    /// Markets listing any of `token_ids`, whatever their end date or state.
    pub async fn lookup_tokens(&self, token_ids: &[String]) -> Result<Vec<Market>, SourceError> {
        let url = format!("{}/markets", self.base_url);
        let mut markets = Vec::new();
        for batch in token_ids.chunks(TOKEN_LOOKUP_BATCH) {
            debug!("Looking up {} token ids", batch.len());
            let body: Vec<serde_json::Value> =
                self.http.get_json(&url, &token_query(batch)).await?;
            let page = Page::from_results("gamma-tokens", parse_markets(body), None);
            markets.extend(page.records);
        }
        Ok(markets)
    }
}

/// Gamma takes repeated `clob_token_ids` parameters.
fn token_query(token_ids: &[String]) -> Vec<(&'static str, String)> {
    token_ids
        .iter()
        .map(|id| ("clob_token_ids", id.clone()))
        .collect()
}

#[async_trait]
impl PagedSource for GammaMarkets {
    type Record = Market;

    fn name(&self) -> &str {
        "gamma-markets"
    }

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Market>, SourceError> {
        let offset = match cursor {
            Cursor::Offset(offset) => *offset,
            other => {
                return Err(SourceError::InvalidResponse(format!(
                    "gamma markets page by offset, got {other}"
                )))
            }
        };
        let url = format!("{}/markets", self.base_url);
        debug!("Fetching markets: {} offset={}", url, offset);

        let body: Vec<serde_json::Value> = self.http.get_json(&url, &self.query(offset)).await?;
        let raw_len = body.len();
        Ok(Page::from_results(
            self.name(),
            parse_markets(body),
            Some(Cursor::Offset(offset + raw_len)),
        ))
    }

    fn next_cursor(&self, _current: &Cursor, page: &Page<Market>) -> Advance {
        if page.raw_len < GAMMA_PAGE_LIMIT {
            return Advance::Stop;
        }
        match &page.last {
            Some(Cursor::Offset(next)) if *next >= MAX_OFFSET => {
                warn!("Hit pagination limit of {} markets", MAX_OFFSET);
                Advance::Stop
            }
            Some(next) => Advance::To(next.clone()),
            None => Advance::Stop,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_string_lists() {
        let body: Vec<serde_json::Value> = serde_json::from_str(
            r#"[{
                "question": "Bitcoin Up or Down - January 5, 9AM ET",
                "conditionId": "0xABC",
                "slug": "btc-updown",
                "clobTokenIds": "[\"111\", \"222\"]",
                "outcomes": "[\"Up\", \"Down\"]",
                "closed": true
            }]"#,
        )
        .unwrap();
        let markets = parse_markets(body);
        let market = markets[0].as_ref().unwrap();
        assert_eq!(market.condition_id, "0xabc");
        assert_eq!(market.token_ids, vec!["111", "222"]);
        assert_eq!(market.outcomes, vec!["Up", "Down"]);
        assert!(market.closed);
    }

    #[test]
    fn test_parse_plain_lists() {
        let body: Vec<serde_json::Value> = serde_json::from_str(
            r#"[{"conditionId": "0x1", "clobTokenIds": ["1", "2"], "outcomes": ["Yes", "No"]}]"#,
        )
        .unwrap();
        let market = parse_markets(body).remove(0).unwrap();
        assert_eq!(market.token_ids.len(), 2);
        assert_eq!(market.question, "Unknown");
        assert!(!market.closed);
    }

    fn source(horizon_days: i64) -> GammaMarkets {
        let http = HttpSource::new(Default::default()).unwrap();
        let window = TimeWindow::parse("2026-01-05", "2026-01-06").unwrap();
        GammaMarkets::new(http, "http://localhost", window, Duration::days(horizon_days))
    }

    #[test]
    fn test_query_lists_open_and_closed_markets() {
        let query = source(1).query(200);
        assert!(query.iter().all(|(key, _)| *key != "closed"));
        assert!(query.contains(&("offset", "200".to_string())));
        assert!(query.contains(&("end_date_min", "2026-01-04T00:00:00Z".to_string())));
        assert!(query.contains(&("end_date_max", "2026-01-08T00:00:00Z".to_string())));

        let exact = source(0).query(0);
        assert!(exact.contains(&("end_date_max", "2026-01-07T00:00:00Z".to_string())));
    }

    #[test]
    fn test_token_query_repeats_parameter() {
        let query = token_query(&["1".to_string(), "2".to_string()]);
        assert_eq!(
            query,
            vec![
                ("clob_token_ids", "1".to_string()),
                ("clob_token_ids", "2".to_string())
            ]
        );
    }

    #[test]
    fn test_malformed_market_is_an_error() {
        let body: Vec<serde_json::Value> = serde_json::from_str(
            r#"[
                {"question": "no condition"},
                {"conditionId": "0x1", "clobTokenIds": "not json"},
                {"conditionId": "0x2"}
            ]"#,
        )
        .unwrap();
        let results = parse_markets(body);
        assert_eq!(results[0], Err(ParseError::MissingField("conditionId")));
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
