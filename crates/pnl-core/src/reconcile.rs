//! Cross-source PnL reconciliation.
//!
//! Three independently computed figures for the same window are compared with
//! the computed cash flow as basis. Divergence beyond the tolerance is reported
//! and logged, never treated as a failure.

use pnl_common::{Redemption, SnapshotPoint, TimeWindow};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classify::{ClassifiedFill, FillSide};

/// Cash-flow figure from the trade ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputedFigure {
    /// USDC paid on BUY fills.
    pub bought: Decimal,
    /// USDC received on SELL fills.
    pub sold: Decimal,
    /// USDC paid out by redemptions.
    pub redeemed: Decimal,
    pub fills: usize,
    pub redemptions: usize,
    /// Self-matched fills in the window, excluded from the cash flow.
    pub self_matched: usize,
}

impl ComputedFigure {
    pub fn net(&self) -> Decimal {
        self.sold - self.bought + self.redeemed
    }
}

/// Sum sell collateral minus buy collateral plus redemption payouts inside `window`.
pub fn computed_figure(
    fills: &[ClassifiedFill],
    redemptions: &[Redemption],
    window: &TimeWindow,
) -> ComputedFigure {
    let mut figure = ComputedFigure::default();

    for fill in fills.iter().filter(|f| window.contains(f.fill.timestamp)) {
        if fill.self_matched {
            figure.self_matched += 1;
            continue;
        }
        let Some(leg) = fill.leg() else { continue };
        match fill.side() {
            FillSide::Buy => figure.bought += leg.collateral,
            FillSide::Sell => figure.sold += leg.collateral,
            FillSide::Ambiguous => continue,
        }
        figure.fills += 1;
    }

    for redemption in redemptions.iter().filter(|r| window.contains(r.timestamp)) {
        figure.redeemed += redemption.payout_usdc();
        figure.redemptions += 1;
    }

    figure
}

/// The point closest in time to `target`; ties go to the earlier point.
pub fn nearest_snapshot(series: &[SnapshotPoint], target: i64) -> Option<&SnapshotPoint> {
    series
        .iter()
        .min_by_key(|p| ((p.timestamp - target).abs(), p.timestamp))
}

/// Scraped cumulative PnL at both ends of the window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedFigure {
    pub timeframe: String,
    pub start: SnapshotPoint,
    pub end: SnapshotPoint,
}

impl ScrapedFigure {
    pub fn delta(&self) -> Decimal {
        self.end.value - self.start.value
    }
}

/// Difference of the `timeframe` series between the points nearest each window edge.
pub fn scraped_figure(
    series: &[SnapshotPoint],
    timeframe: &str,
    window: &TimeWindow,
) -> Option<ScrapedFigure> {
    let points: Vec<SnapshotPoint> = series
        .iter()
        .filter(|p| p.timeframe.eq_ignore_ascii_case(timeframe))
        .cloned()
        .collect();
    let start = nearest_snapshot(&points, window.start_ts())?.clone();
    let end = nearest_snapshot(&points, window.end_ts())?.clone();
    Some(ScrapedFigure {
        timeframe: timeframe.to_string(),
        start,
        end,
    })
}

/// Realized PnL read from the PnL subgraph at the blocks bounding the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubgraphFigure {
    pub start_block: u64,
    pub end_block: u64,
    /// The block came from the configured estimate, not a lookup.
    pub start_block_estimated: bool,
    pub end_block_estimated: bool,
    pub pnl_start: Decimal,
    pub pnl_end: Decimal,
}

impl SubgraphFigure {
    pub fn delta(&self) -> Decimal {
        self.pnl_end - self.pnl_start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Computed,
    Scraped,
    Subgraph,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Computed => write!(f, "Computed (fills + redemptions)"),
            Source::Scraped => write!(f, "Scraped (profile snapshot)"),
            Source::Subgraph => write!(f, "Subgraph (realized pnl)"),
        }
    }
}

/// One row of the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLine {
    pub source: Source,
    /// `None` when the source could not produce a figure.
    pub value: Option<Decimal>,
    /// `value - basis`; zero for the basis itself.
    pub delta: Option<Decimal>,
    pub within_tolerance: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileStatus {
    /// Every available figure is within tolerance of the basis.
    Consistent,
    /// At least one figure is beyond tolerance.
    Divergent,
    /// No figure besides the basis was available.
    Unverified,
}

impl std::fmt::Display for ReconcileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileStatus::Consistent => write!(f, "consistent"),
            ReconcileStatus::Divergent => write!(f, "divergent"),
            ReconcileStatus::Unverified => write!(f, "unverified"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub basis: Source,
    pub tolerance: Decimal,
    pub lines: Vec<SourceLine>,
    pub status: ReconcileStatus,
}

impl ReconciliationReport {
    pub fn line(&self, source: Source) -> Option<&SourceLine> {
        self.lines.iter().find(|l| l.source == source)
    }

    /// Lines whose delta exceeds the tolerance.
    pub fn warnings(&self) -> impl Iterator<Item = &SourceLine> {
        self.lines
            .iter()
            .filter(|l| l.within_tolerance == Some(false))
    }
}

impl std::fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:<32} | {:>14} | {:>14}", "Source", "Net profit", "Delta")?;
        writeln!(f, "{}", "-".repeat(66))?;
        for line in &self.lines {
            let value = line
                .value
                .map(|v| format!("${}", v.round_dp(2)))
                .unwrap_or_else(|| "unavailable".to_string());
            let delta = match (line.source == self.basis, line.delta) {
                (true, _) => "basis".to_string(),
                (false, Some(d)) => format!("${}", d.round_dp(2)),
                (false, None) => "-".to_string(),
            };
            writeln!(f, "{:<32} | {:>14} | {:>14}", line.source.to_string(), value, delta)?;
        }
        write!(
            f,
            "Status: {} (tolerance ${})",
            self.status,
            self.tolerance.round_dp(2)
        )
    }
}

/// Compares figures against the computed basis with an absolute tolerance.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    tolerance: Decimal,
}

impl Reconciler {
    pub fn new(tolerance: Decimal) -> Self {
        Self {
            tolerance: tolerance.abs(),
        }
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    pub fn reconcile(
        &self,
        computed: Decimal,
        scraped: Option<Decimal>,
        subgraph: Option<Decimal>,
    ) -> ReconciliationReport {
        let mut lines = vec![SourceLine {
            source: Source::Computed,
            value: Some(computed),
            delta: Some(Decimal::ZERO),
            within_tolerance: Some(true),
        }];

        for (source, value) in [(Source::Scraped, scraped), (Source::Subgraph, subgraph)] {
            let delta = value.map(|v| v - computed);
            let within_tolerance = delta.map(|d| d.abs() <= self.tolerance);
            match (delta, within_tolerance) {
                (Some(d), Some(false)) => warn!(
                    source = %source,
                    delta = %d.round_dp(2),
                    tolerance = %self.tolerance,
                    "PnL figure diverges from computed basis"
                ),
                (None, _) => info!(source = %source, "PnL figure unavailable"),
                _ => {}
            }
            lines.push(SourceLine {
                source,
                value,
                delta,
                within_tolerance,
            });
        }

        let compared: Vec<bool> = lines[1..]
            .iter()
            .filter_map(|l| l.within_tolerance)
            .collect();
        let status = if compared.is_empty() {
            ReconcileStatus::Unverified
        } else if compared.iter().all(|ok| *ok) {
            ReconcileStatus::Consistent
        } else {
            ReconcileStatus::Divergent
        };

        ReconciliationReport {
            basis: Source::Computed,
            tolerance: self.tolerance,
            lines,
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn point(timestamp: i64, value: Decimal, timeframe: &str) -> SnapshotPoint {
        SnapshotPoint {
            timestamp,
            value,
            timeframe: timeframe.to_string(),
            user: "trader".to_string(),
        }
    }

    #[test]
    fn test_nearest_snapshot_by_distance() {
        let series = vec![
            point(100, dec!(1), "ALL"),
            point(200, dec!(2), "ALL"),
            point(330, dec!(3), "ALL"),
        ];
        assert_eq!(nearest_snapshot(&series, 160).unwrap().timestamp, 200);
        assert_eq!(nearest_snapshot(&series, 10).unwrap().timestamp, 100);
        assert_eq!(nearest_snapshot(&series, 1000).unwrap().timestamp, 330);
        assert!(nearest_snapshot(&[], 5).is_none());
    }

    #[test]
    fn test_nearest_snapshot_tie_prefers_earlier() {
        let series = vec![point(200, dec!(2), "ALL"), point(100, dec!(1), "ALL")];
        assert_eq!(nearest_snapshot(&series, 150).unwrap().timestamp, 100);
    }

    #[test]
    fn test_scraped_figure_filters_timeframe() {
        let window = TimeWindow::parse("2026-01-05", "2026-01-06").unwrap();
        let series = vec![
            point(window.start_ts() - 60, dec!(100), "ALL"),
            point(window.start_ts(), dec!(0), "1D"),
            point(window.end_ts() + 30, dec!(118.5), "ALL"),
            point(window.end_ts(), dec!(999), "1D"),
        ];
        let figure = scraped_figure(&series, "ALL", &window).unwrap();
        assert_eq!(figure.delta(), dec!(18.5));
        assert!(scraped_figure(&series, "1M", &window).is_none());
    }

    #[test]
    fn test_tolerance_boundary_is_inclusive() {
        let report =
            Reconciler::new(dec!(5)).reconcile(dec!(100), Some(dec!(105)), Some(dec!(94.99)));
        assert_eq!(report.line(Source::Scraped).unwrap().within_tolerance, Some(true));
        assert_eq!(report.line(Source::Subgraph).unwrap().within_tolerance, Some(false));
        assert_eq!(report.status, ReconcileStatus::Divergent);
        assert_eq!(report.warnings().count(), 1);
    }

    #[test]
    fn test_missing_figures_are_unavailable() {
        let report = Reconciler::new(dec!(5)).reconcile(dec!(100), None, None);
        assert_eq!(report.status, ReconcileStatus::Unverified);
        let scraped = report.line(Source::Scraped).unwrap();
        assert_eq!(scraped.value, None);
        assert_eq!(scraped.delta, None);
        assert!(report.to_string().contains("unavailable"));
    }

    #[test]
    fn test_one_missing_figure_still_compares() {
        let report = Reconciler::new(dec!(1)).reconcile(dec!(10), Some(dec!(10.5)), None);
        assert_eq!(report.status, ReconcileStatus::Consistent);
    }

    #[test]
    fn test_subgraph_delta() {
        let figure = SubgraphFigure {
            start_block: 81_139_400,
            end_block: 81_213_222,
            start_block_estimated: false,
            end_block_estimated: true,
            pnl_start: dec!(50),
            pnl_end: dec!(169.8),
        };
        assert_eq!(figure.delta(), dec!(119.8));
    }
}
