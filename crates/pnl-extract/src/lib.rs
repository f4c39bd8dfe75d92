//! pnl-extract: Multi-source PnL extraction for a single Polymarket trader.
//!
//! Ingests market metadata, order fills, redemptions and cumulative PnL
//! snapshots into a local data directory, enriches the fills with
//! per-trade PnL estimates and reconciles the result across sources.

pub mod activity;
pub mod cancel;
pub mod config;
pub mod gamma;
pub mod http;
pub mod ingest;
pub mod orderbook;
pub mod pipeline;
pub mod pnl_subgraph;
pub mod profile;
pub mod store;
pub mod trades_api;

pub use cancel::CancelToken;
pub use config::{ConfigError, ConfigOverrides, ExtractConfig};
pub use http::{HttpConfig, HttpSource, SourceError};
pub use ingest::{
    Advance, Cursor, IngestError, IngestStats, Ingestor, Page, PagedSource, RecordSink,
};
pub use pipeline::{Pipeline, Stage};
pub use store::{DataStore, StoreError};
