//! pnl-core: Domain logic for reconciling a single trader's Polymarket PnL.
//!
//! Data flows one way through the build phase into the per-fill phases:
//! - [`resolver`] and [`verdict`] build immutable lookup tables
//! - [`classify`] turns each raw fill into a BUY/SELL/AMBIGUOUS leg
//! - [`aggregate`] settles each classified fill and sums the estimate
//! - [`reconcile`] compares the computed figure against the scraped and subgraph figures
//!
//! Nothing in this crate performs I/O.

pub mod aggregate;
pub mod classify;
pub mod position;
pub mod reconcile;
pub mod resolver;
pub mod verdict;

pub use aggregate::{
    Exclusion, MarketStatus, MarketTable, PnlAggregator, PnlRecord, PnlSummary, StatusBreakdown,
    UnredeemedPolicy,
};
pub use classify::{classify, classify_all, Classification, ClassifiedFill, FillSide, Leg};
pub use position::{alternate_encoding, CtfPositionIds, PositionIdDeriver};
pub use reconcile::{
    computed_figure, nearest_snapshot, scraped_figure, ComputedFigure, ReconcileStatus,
    Reconciler, ReconciliationReport, ScrapedFigure, Source, SourceLine, SubgraphFigure,
};
pub use resolver::{AssetResolver, ResolvedAsset};
pub use verdict::{Verdict, VerdictTable};
