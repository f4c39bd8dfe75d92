//! Sequential paged ingestion.
//!
//! One loop drives every source: check cancellation, fetch a page, drop
//! identifiers already seen, write and flush the fresh records, advance the
//! cursor, then pause before the next request.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use pnl_common::{Identified, ParseError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::http::SourceError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Position in a paged stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    /// Identifier strictly greater than this one. Exact.
    After(String),
    /// Timestamp greater than or equal to this one. Re-fetches the boundary second.
    Since(i64),
    /// Plain row offset.
    Offset(usize),
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::After(id) if id.is_empty() => write!(f, "start"),
            Cursor::After(id) => write!(f, "id>{id}"),
            Cursor::Since(ts) => write!(f, "ts>={ts}"),
            Cursor::Offset(n) => write!(f, "offset={n}"),
        }
    }
}

/// What to do after a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    To(Cursor),
    /// Move on, possibly skipping records that share the boundary position.
    Lossy(Cursor),
    Stop,
}

/// One page of parsed records.
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub records: Vec<R>,
    /// Raw items that failed to parse.
    pub malformed: usize,
    /// Raw items returned, parsed or not.
    pub raw_len: usize,
    /// Cursor position of the last raw item.
    pub last: Option<Cursor>,
}

impl<R> Page<R> {
    pub fn empty() -> Self {
        Self {
            records: Vec::new(),
            malformed: 0,
            raw_len: 0,
            last: None,
        }
    }

    /// Collect parse results, logging and counting the failures.
    pub fn from_results(
        source: &str,
        results: Vec<Result<R, ParseError>>,
        last: Option<Cursor>,
    ) -> Self {
        let raw_len = results.len();
        let mut records = Vec::with_capacity(raw_len);
        let mut malformed = 0;
        for result in results {
            match result {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!("[{}] Skipping malformed record: {}", source, e);
                    malformed += 1;
                }
            }
        }
        Self {
            records,
            malformed,
            raw_len,
            last,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_len == 0
    }
}

/// A remote stream read one page at a time.
#[async_trait]
pub trait PagedSource: Send + Sync {
    type Record: Identified + Send;

    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Self::Record>, SourceError>;

    /// Cursor for the request after `page`, which was fetched at `current`.
    fn next_cursor(&self, current: &Cursor, page: &Page<Self::Record>) -> Advance;
}

/// Destination for fresh records. Each batch is flushed before the next page.
pub trait RecordSink<R> {
    fn write_batch(&mut self, records: &[R]) -> Result<(), StoreError>;

    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl<R: Clone> RecordSink<R> for Vec<R> {
    fn write_batch(&mut self, records: &[R]) -> Result<(), StoreError> {
        self.extend_from_slice(records);
        Ok(())
    }
}

/// Statistics from one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub source: String,
    pub pages: usize,
    pub fetched: usize,
    pub written: usize,
    pub duplicates: usize,
    pub malformed: usize,
    /// Cursor moves that may have skipped same-position records.
    pub lossy_bumps: usize,
    pub cancelled: bool,
    pub last_cursor: Option<Cursor>,
}

impl std::fmt::Display for IngestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Ingest Statistics ({}):", self.source)?;
        writeln!(f, "  Pages: {}", self.pages)?;
        writeln!(f, "  Records fetched: {}", self.fetched)?;
        writeln!(f, "  Records written: {}", self.written)?;
        writeln!(f, "  Duplicates dropped: {}", self.duplicates)?;
        writeln!(f, "  Malformed skipped: {}", self.malformed)?;
        if self.lossy_bumps > 0 {
            writeln!(f, "  Lossy cursor bumps: {}", self.lossy_bumps)?;
        }
        if let Some(cursor) = &self.last_cursor {
            writeln!(f, "  Last cursor: {}", cursor)?;
        }
        if self.cancelled {
            writeln!(f, "  Cancelled before completion")?;
        }
        Ok(())
    }
}

/// Drives a [`PagedSource`] into a [`RecordSink`].
#[derive(Debug, Clone)]
pub struct Ingestor {
    page_delay: Duration,
    cancel: CancelToken,
    max_pages: Option<usize>,
}

impl Ingestor {
    pub fn new(page_delay: Duration, cancel: CancelToken) -> Self {
        Self {
            page_delay,
            cancel,
            max_pages: None,
        }
    }

    /// Stop after this many pages even if the source has more.
    pub fn with_max_pages(mut self, max_pages: usize) -> Self {
        self.max_pages = Some(max_pages);
        self
    }

    /// Ingest from `start` until the source is exhausted or the run is cancelled.
    ///
    /// `seen` holds identifiers already persisted; it is updated with every record written.
    pub async fn run<S, K>(
        &self,
        source: &S,
        start: Cursor,
        seen: &mut HashSet<String>,
        sink: &mut K,
    ) -> Result<IngestStats, IngestError>
    where
        S: PagedSource,
        K: RecordSink<S::Record> + Send,
    {
        let mut stats = IngestStats {
            source: source.name().to_string(),
            ..Default::default()
        };
        let mut cursor = start;
        info!("[{}] Starting ingestion from {}", source.name(), cursor);

        loop {
            if self.cancel.is_cancelled() {
                info!("[{}] Cancelled at {}", source.name(), cursor);
                stats.cancelled = true;
                break;
            }
            if self.max_pages.is_some_and(|max| stats.pages >= max) {
                warn!("[{}] Hit page limit of {}", source.name(), stats.pages);
                break;
            }

            let page = source.fetch_page(&cursor).await?;
            stats.pages += 1;

            if page.is_empty() {
                debug!("[{}] Empty page at {}", source.name(), cursor);
                break;
            }

            let advance = source.next_cursor(&cursor, &page);
            stats.fetched += page.raw_len;
            stats.malformed += page.malformed;

            let parsed = page.records.len();
            let fresh: Vec<S::Record> = page
                .records
                .into_iter()
                .filter(|r| seen.insert(r.id().into_owned()))
                .collect();
            stats.duplicates += parsed - fresh.len();

            if !fresh.is_empty() {
                sink.write_batch(&fresh)?;
                sink.flush()?;
                stats.written += fresh.len();
            }

            info!(
                "[{}] Fetched {} records ({} new), total {}, cursor={}",
                source.name(),
                page.raw_len,
                fresh.len(),
                stats.written,
                cursor
            );

            cursor = match advance {
                Advance::To(next) if next == cursor => {
                    warn!("[{}] Cursor did not advance past {}, stopping", source.name(), cursor);
                    break;
                }
                Advance::To(next) => next,
                Advance::Lossy(next) => {
                    warn!(
                        "[{}] Full page shares one position at {}; moving to {} may skip records",
                        source.name(),
                        cursor,
                        next
                    );
                    stats.lossy_bumps += 1;
                    next
                }
                Advance::Stop => break,
            };
            stats.last_cursor = Some(cursor.clone());

            tokio::time::sleep(self.page_delay).await;
        }

        Ok(stats)
    }
}
