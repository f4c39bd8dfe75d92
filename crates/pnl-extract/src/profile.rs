//! Cumulative PnL series scraped from the public profile page.
//!
//! The page is server-rendered by Next.js; its dehydrated react-query cache
//! sits in a `<script id="__NEXT_DATA__">` tag. Every `portfolio-pnl` query in
//! that cache is one timeframe of the series.

use std::str::FromStr;

use async_trait::async_trait;
use pnl_common::{normalize_address, ParseError, SnapshotPoint};
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, info};

use crate::http::{HttpSource, SourceError};
use crate::ingest::{Advance, Cursor, Page, PagedSource};

const NEXT_DATA_MARKER: &str = "id=\"__NEXT_DATA__\"";
const PNL_QUERY_KEY: &str = "portfolio-pnl";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NextData {
    props: Props,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Props {
    page_props: PageProps,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageProps {
    dehydrated_state: Option<DehydratedState>,
}

#[derive(Debug, Default, Deserialize)]
struct DehydratedState {
    #[serde(default)]
    queries: Vec<CachedQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedQuery {
    #[serde(default)]
    query_key: Vec<serde_json::Value>,
    state: Option<QueryState>,
}

#[derive(Debug, Deserialize)]
struct QueryState {
    data: Option<serde_json::Value>,
}

impl CachedQuery {
    fn is_pnl(&self) -> bool {
        self.query_key.first().and_then(|k| k.as_str()) == Some(PNL_QUERY_KEY)
    }

    fn timeframe(&self) -> String {
        self.query_key
            .get(3)
            .and_then(|k| k.as_str())
            .unwrap_or("UNKNOWN")
            .to_string()
    }
}

/// Extract the JSON payload of the `__NEXT_DATA__` script tag.
pub fn extract_next_data(html: &str) -> Option<&str> {
    let marker = html.find(NEXT_DATA_MARKER)?;
    let rest = &html[marker..];
    let open_end = rest.find('>')? + 1;
    let body = &rest[open_end..];
    let close = body.find("</script>")?;
    Some(body[..close].trim())
}

fn decimal_from_json(value: &serde_json::Value) -> Result<Decimal, ParseError> {
    let text = match value {
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.trim().to_string(),
        other => return Err(ParseError::invalid("p", other.to_string())),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| ParseError::invalid("p", text))
}

fn point(
    raw: &serde_json::Value,
    timeframe: &str,
    user: &str,
) -> Result<SnapshotPoint, ParseError> {
    let timestamp = raw
        .get("t")
        .ok_or(ParseError::MissingField("t"))
        .and_then(|t| match t {
            serde_json::Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| ParseError::invalid("t", n.to_string())),
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| ParseError::invalid("t", s.clone())),
            other => Err(ParseError::invalid("t", other.to_string())),
        })?;
    let value = decimal_from_json(raw.get("p").ok_or(ParseError::MissingField("p"))?)?;
    Ok(SnapshotPoint {
        timestamp,
        value,
        timeframe: timeframe.to_string(),
        user: user.to_string(),
    })
}

/// Parse every PnL series embedded in a profile page.
///
/// Errors only when the page carries no readable `__NEXT_DATA__` payload;
/// individual bad points come back as `Err` entries.
pub fn parse_profile_page(
    html: &str,
    user: &str,
) -> Result<Vec<Result<SnapshotPoint, ParseError>>, SourceError> {
    let payload = extract_next_data(html)
        .ok_or_else(|| {
            SourceError::InvalidResponse("profile page has no __NEXT_DATA__".to_string())
        })?;
    let next: NextData = serde_json::from_str(payload)?;
    let queries = next.props.page_props.dehydrated_state.unwrap_or_default().queries;

    let mut results = Vec::new();
    for query in queries.iter().filter(|q| q.is_pnl()) {
        let timeframe = query.timeframe();
        let Some(data) = query.state.as_ref().and_then(|s| s.data.as_ref()) else {
            debug!("PnL query {} has no data", timeframe);
            continue;
        };
        let Some(points) = data.as_array() else {
            results.push(Err(ParseError::invalid("data", "not a list")));
            continue;
        };
        debug!("PnL series {}: {} points", timeframe, points.len());
        results.extend(points.iter().map(|raw| point(raw, &timeframe, user)));
    }
    Ok(results)
}

/// The profile page as a one-page source.
pub struct ProfileSnapshots {
    http: HttpSource,
    url: String,
    user: String,
}

impl ProfileSnapshots {
    /// `handle` selects the page; points are tagged with `user`.
    pub fn new(http: HttpSource, data_url: &str, handle: &str, user: &str) -> Self {
        Self {
            http,
            url: format!("{}/profile/{}", data_url.trim_end_matches('/'), handle),
            user: normalize_address(user),
        }
    }
}

#[async_trait]
impl PagedSource for ProfileSnapshots {
    type Record = SnapshotPoint;

    fn name(&self) -> &str {
        "profile-snapshots"
    }

    async fn fetch_page(&self, _cursor: &Cursor) -> Result<Page<SnapshotPoint>, SourceError> {
        info!("Fetching profile page {}", self.url);
        let html = self.http.get_text(&self.url).await?;
        let results = parse_profile_page(&html, &self.user)?;
        Ok(Page::from_results(self.name(), results, Some(Cursor::Offset(0))))
    }

    fn next_cursor(&self, _current: &Cursor, _page: &Page<SnapshotPoint>) -> Advance {
        Advance::Stop
    }
}
