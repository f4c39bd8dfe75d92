//! Extraction stages over one data directory.
//!
//! Ingestion stages append to their CSV tables and can be re-run or resumed.
//! `enrich` and `reconcile` only read what earlier stages stored.

use std::collections::{BTreeSet, HashSet};

use anyhow::{bail, Context, Result};
use pnl_common::{
    ApiTrade, Fill, Identified, Market, Redemption, SnapshotPoint, TimeWindow, COLLATERAL_ASSET_ID,
};
use pnl_core::{
    classify_all, computed_figure, scraped_figure, AssetResolver, ComputedFigure, CtfPositionIds,
    MarketTable, PnlAggregator, PnlSummary, Reconciler, ReconciliationReport, ScrapedFigure,
    SubgraphFigure, VerdictTable,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::activity::{self, ActivityRedemptions};
use crate::cancel::CancelToken;
use crate::config::ExtractConfig;
use crate::gamma::GammaMarkets;
use crate::http::HttpSource;
use crate::ingest::{Cursor, IngestStats, Ingestor};
use crate::orderbook::{self, OrderbookFills, Role};
use crate::pnl_subgraph::PnlSubgraph;
use crate::profile::ProfileSnapshots;
use crate::store::{
    DataStore, ASSET_MAP_FILE, FILLS_FILE, MARKETS_FILE, PNL_RECORDS_FILE, RECONCILIATION_FILE,
    REDEMPTIONS_FILE, SNAPSHOTS_FILE, SUBGRAPH_PNL_FILE, TRADES_FILE,
};
use crate::trades_api::{self, ActivityApiTrades};

/// One step of the extraction, in run order.
///
/// `Markets` runs after the fills so it can look up markets the trader
/// touched outside the end-date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fills,
    Trades,
    Redemptions,
    Markets,
    Snapshots,
    Blocks,
    Enrich,
    Reconcile,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Fills,
        Stage::Trades,
        Stage::Redemptions,
        Stage::Markets,
        Stage::Snapshots,
        Stage::Blocks,
        Stage::Enrich,
        Stage::Reconcile,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Fills => "fills",
            Stage::Trades => "trades",
            Stage::Redemptions => "redemptions",
            Stage::Markets => "markets",
            Stage::Snapshots => "snapshots",
            Stage::Blocks => "blocks",
            Stage::Enrich => "enrich",
            Stage::Reconcile => "reconcile",
        };
        f.write_str(name)
    }
}

/// Outcome token ids of stored fills that `resolver` cannot place, sorted.
pub fn unresolved_token_ids(fills: &[Fill], user: &str, resolver: &AssetResolver) -> Vec<String> {
    let ids: BTreeSet<String> = classify_all(fills, user, resolver)
        .iter()
        .filter(|f| f.asset.is_none())
        .map(|f| f.resolution_asset_id().trim())
        .filter(|id| !id.is_empty() && *id != COLLATERAL_ASSET_ID)
        .map(str::to_string)
        .collect();
    ids.into_iter().collect()
}

/// Everything the reconcile stage persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationOutput {
    pub user: String,
    pub window: TimeWindow,
    pub computed: ComputedFigure,
    pub scraped: Option<ScrapedFigure>,
    pub subgraph: Option<SubgraphFigure>,
    pub report: ReconciliationReport,
}

pub struct Pipeline {
    config: ExtractConfig,
    window: TimeWindow,
    store: DataStore,
    http: HttpSource,
    ingestor: Ingestor,
    cancel: CancelToken,
}

impl Pipeline {
    /// Validates the configuration and opens the data directory.
    pub fn new(config: ExtractConfig, cancel: CancelToken) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let window = config.window()?;
        let store = DataStore::open(&config.data_dir)
            .with_context(|| format!("Failed to open data directory {:?}", config.data_dir))?;
        let http = HttpSource::new(config.sources.http.clone())?;
        let ingestor = Ingestor::new(config.sources.page_delay, cancel.clone());

        info!("Tracking {} over {}", config.user, window);
        Ok(Self {
            config,
            window,
            store,
            http,
            ingestor,
            cancel,
        })
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn window(&self) -> &TimeWindow {
        &self.window
    }

    /// Run every stage in order, stopping early on cancellation.
    pub async fn run_all(&self) -> Result<()> {
        for stage in Stage::ALL {
            if self.cancel.is_cancelled() {
                warn!("Cancelled before stage {}", stage);
                break;
            }
            self.run_stage(stage).await?;
        }
        Ok(())
    }

    pub async fn run_stage(&self, stage: Stage) -> Result<()> {
        info!("=== Stage: {} ===", stage);
        match stage {
            Stage::Fills => self.fills().await.map(|_| ()),
            Stage::Trades => self.trades().await.map(|_| ()),
            Stage::Redemptions => self.redemptions().await.map(|_| ()),
            Stage::Markets => self.markets().await.map(|_| ()),
            Stage::Snapshots => self.snapshots().await.map(|_| ()),
            Stage::Blocks => self.blocks().await.map(|_| ()),
            Stage::Enrich => self.enrich().map(|_| ()),
            Stage::Reconcile => self.reconcile().map(|_| ()),
        }
        .with_context(|| format!("Stage {} failed", stage))
    }

    /// Markets ending around the window plus any market a stored fill traded,
    /// and the token id table built from them.
    pub async fn markets(&self) -> Result<AssetResolver> {
        let source = GammaMarkets::new(
            self.http.clone(),
            self.config.sources.gamma_url.clone(),
            self.window,
            self.config.sources.market_horizon,
        );
        let mut markets: Vec<Market> = Vec::new();
        let mut seen = HashSet::new();
        let stats = self
            .ingestor
            .run(&source, Cursor::Offset(0), &mut seen, &mut markets)
            .await?;
        info!("Market fetch complete:\n{}", stats);

        let mut resolver = AssetResolver::build(&markets, Some(&CtfPositionIds));
        let fills = self.store.load_fills()?;
        let missing = unresolved_token_ids(&fills.records, &self.config.user, &resolver);
        if !missing.is_empty() && !self.cancel.is_cancelled() {
            info!("Looking up {} token ids traded outside the end-date range", missing.len());
            match source.lookup_tokens(&missing).await {
                Ok(found) => {
                    let before = markets.len();
                    let fresh = found.into_iter().filter(|m| seen.insert(m.id().into_owned()));
                    markets.extend(fresh);
                    info!("Token lookup added {} markets", markets.len() - before);
                    resolver = AssetResolver::build(&markets, Some(&CtfPositionIds));
                }
                Err(e) => warn!("Token lookup failed, those fills stay unmapped: {}", e),
            }
        }

        self.store.write_json(MARKETS_FILE, &markets)?;
        self.store.write_json(ASSET_MAP_FILE, &resolver.to_entries())?;
        info!(
            "Saved {} markets and {} token ids",
            markets.len(),
            resolver.len()
        );
        Ok(resolver)
    }

    /// Maker and taker passes into the shared fills table.
    pub async fn fills(&self) -> Result<Vec<IngestStats>> {
        let stored = self.store.load_fills()?;
        let mut seen: HashSet<String> = stored.records.iter().map(|f| f.id.clone()).collect();
        let mut sink = self.store.csv_sink::<Fill>(FILLS_FILE)?;
        let mut all_stats = Vec::new();

        for role in Role::ALL {
            if self.cancel.is_cancelled() {
                break;
            }
            let source = OrderbookFills::new(
                self.http.clone(),
                self.config.sources.orderbook_subgraph_url.clone(),
                &self.config.user,
                role,
                self.window,
                self.config.sources.page_size,
            );
            let start =
                orderbook::resume_cursor(&stored.records, role, &self.config.user, &self.window);
            let stats = self.ingestor.run(&source, start, &mut seen, &mut sink).await?;
            info!("Fill ingestion complete:\n{}", stats);
            all_stats.push(stats);
        }
        Ok(all_stats)
    }

    /// TRADE rows from the REST activity feed, checked against the stored fills.
    pub async fn trades(&self) -> Result<IngestStats> {
        let stored = self.store.load_trades()?;
        let mut seen: HashSet<String> =
            stored.records.iter().map(|t| t.id().into_owned()).collect();
        let mut sink = self.store.csv_sink::<ApiTrade>(TRADES_FILE)?;

        let mut source = ActivityApiTrades::new(
            self.http.clone(),
            self.config.sources.data_api_url.clone(),
            &self.config.user,
            self.window,
        );
        if let Some(rpc_url) = &self.config.sources.polygon_rpc_url {
            source = source.with_block_lookup(rpc_url.clone());
        }
        let ingestor = match trades_api::max_pages(self.config.sources.activity_max_items) {
            Some(pages) => self.ingestor.clone().with_max_pages(pages),
            None => self.ingestor.clone(),
        };
        let stats = ingestor.run(&source, Cursor::Offset(0), &mut seen, &mut sink).await?;
        info!("Activity trade ingestion complete:\n{}", stats);

        let trades = self.store.load_trades()?;
        let fills = self.store.load_fills()?;
        let unmatched =
            trades_api::unmatched_trades(&trades.records, &fills.records, &self.window);
        if !unmatched.is_empty() {
            warn!(
                "{} of {} activity trades have no stored fill; run the fills stage",
                unmatched.len(),
                trades.records.len()
            );
        }
        Ok(stats)
    }

    pub async fn redemptions(&self) -> Result<IngestStats> {
        let stored = self.store.load_redemptions()?;
        let mut seen: HashSet<String> = stored.records.iter().map(|r| r.id.clone()).collect();
        let mut sink = self.store.csv_sink::<Redemption>(REDEMPTIONS_FILE)?;

        let source = ActivityRedemptions::new(
            self.http.clone(),
            self.config.sources.activity_subgraph_url.clone(),
            &self.config.user,
            self.window,
            self.config.sources.page_size,
        );
        let start = activity::resume_cursor(&stored.records, &self.window);
        let stats = self.ingestor.run(&source, start, &mut seen, &mut sink).await?;
        info!("Redemption ingestion complete:\n{}", stats);
        Ok(stats)
    }

    pub async fn snapshots(&self) -> Result<IngestStats> {
        let stored = self.store.load_snapshots()?;
        let mut seen: HashSet<String> =
            stored.records.iter().map(|p| p.id().into_owned()).collect();
        let mut sink = self.store.csv_sink::<SnapshotPoint>(SNAPSHOTS_FILE)?;

        let source = ProfileSnapshots::new(
            self.http.clone(),
            &self.config.sources.data_url,
            self.config.profile_handle(),
            &self.config.user,
        );
        let stats = self
            .ingestor
            .run(&source, Cursor::Offset(0), &mut seen, &mut sink)
            .await?;
        info!("Snapshot scrape complete:\n{}", stats);
        Ok(stats)
    }

    /// Realized PnL at the blocks bounding the window.
    pub async fn blocks(&self) -> Result<SubgraphFigure> {
        let subgraph = PnlSubgraph::new(
            self.http.clone(),
            self.config.sources.pnl_subgraph_url.clone(),
            self.config.sources.orderbook_subgraph_url.clone(),
            self.config.reconcile.clone(),
        );
        let figure = subgraph.figure(&self.config.user, &self.window).await?;
        self.store.write_json(SUBGRAPH_PNL_FILE, &figure)?;
        info!(
            "Subgraph PnL: {} at block {} -> {} at block {} (delta {})",
            figure.pnl_start.round_dp(2),
            figure.start_block,
            figure.pnl_end.round_dp(2),
            figure.end_block,
            figure.delta().round_dp(2)
        );
        Ok(figure)
    }

    /// Classify and settle every stored fill, rewriting `pnl_records.csv`.
    pub fn enrich(&self) -> Result<PnlSummary> {
        let Some(markets) = self.store.read_json::<Vec<Market>>(MARKETS_FILE)? else {
            bail!("{} not found; run the markets stage first", MARKETS_FILE);
        };
        let fills = self.store.load_fills()?;
        let redemptions = self.store.load_redemptions()?;
        if fills.duplicates > 0 || redemptions.duplicates > 0 {
            info!(
                "Dropped {} duplicate fills and {} duplicate redemptions",
                fills.duplicates, redemptions.duplicates
            );
        }

        let resolver = AssetResolver::build(&markets, Some(&CtfPositionIds));
        let verdicts = VerdictTable::build(&redemptions.records);
        if verdicts.conflicts() > 0 {
            warn!("{} redemptions contradicted an earlier verdict", verdicts.conflicts());
        }
        let market_table = MarketTable::new(markets);

        let classified = classify_all(&fills.records, &self.config.user, &resolver);
        let unresolved = classified.iter().filter(|f| f.asset.is_none()).count();
        if unresolved > 0 {
            warn!("{} of {} fills have no known market", unresolved, classified.len());
        }

        let (records, summary) = PnlAggregator::new(&verdicts, &market_table)
            .with_policy(self.config.policy)
            .aggregate(&classified);
        self.store.write_csv(PNL_RECORDS_FILE, &records)?;
        info!("Wrote {} PnL records\n{}", records.len(), summary);
        Ok(summary)
    }

    /// Compare the computed cash flow with the scraped and subgraph figures.
    pub fn reconcile(&self) -> Result<ReconciliationOutput> {
        let fills = self.store.load_fills()?;
        let redemptions = self.store.load_redemptions()?;
        let snapshots = self.store.load_snapshots()?;

        let resolver = self
            .store
            .read_json(ASSET_MAP_FILE)?
            .map(AssetResolver::from_entries)
            .unwrap_or_default();
        let classified = classify_all(&fills.records, &self.config.user, &resolver);

        let computed = computed_figure(&classified, &redemptions.records, &self.window);
        let scraped = scraped_figure(
            &snapshots.records,
            &self.config.reconcile.timeframe,
            &self.window,
        );
        let subgraph: Option<SubgraphFigure> = self.store.read_json(SUBGRAPH_PNL_FILE)?;

        let report = Reconciler::new(self.config.reconcile.tolerance).reconcile(
            computed.net(),
            scraped.as_ref().map(ScrapedFigure::delta),
            subgraph.as_ref().map(SubgraphFigure::delta),
        );
        info!("Reconciliation for {}:\n{}", self.window, report);

        let output = ReconciliationOutput {
            user: self.config.user.clone(),
            window: self.window,
            computed,
            scraped,
            subgraph,
            report,
        };
        self.store.write_json(RECONCILIATION_FILE, &output)?;
        Ok(output)
    }
}
