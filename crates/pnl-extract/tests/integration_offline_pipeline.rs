//! Offline pipeline tests: seed the data directory as the ingestion stages
//! would, then run the enrich and reconcile stages over it.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use pnl_common::{Fill, Market, Redemption, SnapshotPoint};
use pnl_core::{MarketStatus, PnlRecord, ReconcileStatus, Source, SubgraphFigure};
use pnl_extract::store::{
    DataStore, FILLS_FILE, MARKETS_FILE, PNL_RECORDS_FILE, REDEMPTIONS_FILE, SNAPSHOTS_FILE,
    SUBGRAPH_PNL_FILE,
};
use pnl_extract::{CancelToken, Cursor, ExtractConfig, Ingestor, Pipeline, RecordSink};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const USER: &str = "0x63ce342161250d705dc0b16df89036c8e5f9ba9a";
const OTHER: &str = "0x1111111111111111111111111111111111111111";
const WINNER_CONDITION: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const UNREDEEMED_CONDITION: &str =
    "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
const OPEN_CONDITION: &str = "0xcccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

// 2026-01-05 00:00 UTC .. 2026-01-07 00:00 UTC
const WINDOW_START: i64 = 1_767_571_200;
const WINDOW_END: i64 = 1_767_744_000;

// =============================================================================
// Fixtures
// =============================================================================

fn market(condition_id: &str, tokens: [&str; 2], closed: bool) -> Market {
    Market {
        condition_id: condition_id.to_string(),
        question: format!("Market {}", &condition_id[..6]),
        slug: "btc-updown".to_string(),
        closed,
        token_ids: tokens.iter().map(|t| t.to_string()).collect(),
        outcomes: vec!["Up".to_string(), "Down".to_string()],
    }
}

/// The user pays `usdc` for `tokens` of `asset` as maker.
fn buy(id: &str, asset: &str, usdc: Decimal, tokens: Decimal, timestamp: i64) -> Fill {
    Fill {
        id: id.to_string(),
        timestamp,
        transaction_hash: format!("0xtx{id}"),
        maker: USER.to_string(),
        taker: OTHER.to_string(),
        maker_asset_id: "0".to_string(),
        taker_asset_id: asset.to_string(),
        maker_amount: usdc * dec!(1000000),
        taker_amount: tokens * dec!(1000000),
    }
}

fn redemption(id: &str, condition_id: &str, outcome: u32, payout: Decimal) -> Redemption {
    Redemption {
        id: id.to_string(),
        timestamp: 1_767_700_000,
        redeemer: USER.to_string(),
        payout: payout * dec!(1000000),
        condition_id: condition_id.to_string(),
        outcome_indices: BTreeSet::from([outcome]),
    }
}

fn snapshot(timestamp: i64, value: Decimal) -> SnapshotPoint {
    SnapshotPoint {
        timestamp,
        value,
        timeframe: "ALL".to_string(),
        user: USER.to_string(),
    }
}

/// Winner bought at 0.40 and redeemed (+6), loser bought at 0.80 and never redeemed (-4).
fn seed(store: &DataStore) {
    store
        .write_json(
            MARKETS_FILE,
            &vec![
                market(WINNER_CONDITION, ["111", "112"], true),
                market(UNREDEEMED_CONDITION, ["221", "222"], true),
            ],
        )
        .unwrap();

    let mut fills = store.csv_sink::<Fill>(FILLS_FILE).unwrap();
    fills
        .write_batch(&[
            buy("a1", "111", dec!(4), dec!(10), 1_767_600_000),
            buy("b1", "222", dec!(4), dec!(5), 1_767_600_100),
        ])
        .unwrap();
    fills.flush().unwrap();

    store
        .write_csv(
            REDEMPTIONS_FILE,
            &[redemption("r1", WINNER_CONDITION, 0, dec!(10))],
        )
        .unwrap();
}

fn pipeline(dir: &std::path::Path) -> Pipeline {
    let mut config = ExtractConfig::default();
    config.data_dir = dir.to_path_buf();
    Pipeline::new(config, CancelToken::new()).unwrap()
}

// =============================================================================
// Enrich
// =============================================================================

#[test]
fn test_enrich_writes_one_record_per_fill() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    seed(pipeline.store());

    let summary = pipeline.enrich().unwrap();
    assert_eq!(summary.total, dec!(2));
    assert_eq!(summary.status(MarketStatus::ResolvedWinner).pnl, dec!(6));
    assert_eq!(summary.status(MarketStatus::ClosedNoRedemption).pnl, dec!(-4));
    assert_eq!(summary.resolved_pnl(), dec!(6));

    let (records, malformed) = pipeline
        .store()
        .read_csv::<PnlRecord>(PNL_RECORDS_FILE)
        .unwrap();
    assert_eq!(malformed, 0);
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].outcome, "Up");
    assert_eq!(records[0].price, dec!(0.4));
    assert_eq!(records[1].status, MarketStatus::ClosedNoRedemption);
}

#[test]
fn test_enrich_is_repeatable() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    seed(pipeline.store());

    let first = pipeline.enrich().unwrap();
    let second = pipeline.enrich().unwrap();
    assert_eq!(first, second);

    let (records, _) = pipeline
        .store()
        .read_csv::<PnlRecord>(PNL_RECORDS_FILE)
        .unwrap();
    assert_eq!(records.len(), 2);
}

#[test]
fn test_enrich_ignores_duplicated_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    seed(pipeline.store());

    // An interrupted run re-appended the first fill.
    let mut fills = pipeline.store().csv_sink::<Fill>(FILLS_FILE).unwrap();
    fills
        .write_batch(&[buy("a1", "111", dec!(4), dec!(10), 1_767_600_000)])
        .unwrap();
    fills.flush().unwrap();

    assert_eq!(pipeline.enrich().unwrap().total, dec!(2));
}

#[test]
fn test_enrich_marks_open_market_at_execution_price() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    let store = pipeline.store();
    seed(store);

    // The market ends after the window and is still trading.
    store
        .write_json(
            MARKETS_FILE,
            &vec![
                market(WINNER_CONDITION, ["111", "112"], true),
                market(UNREDEEMED_CONDITION, ["221", "222"], true),
                market(OPEN_CONDITION, ["331", "332"], false),
            ],
        )
        .unwrap();
    let mut fills = store.csv_sink::<Fill>(FILLS_FILE).unwrap();
    fills
        .write_batch(&[buy("c1", "331", dec!(2), dec!(4), 1_767_650_000)])
        .unwrap();
    fills.flush().unwrap();

    let summary = pipeline.enrich().unwrap();
    assert_eq!(summary.status(MarketStatus::Open).fills, 1);
    assert_eq!(summary.status(MarketStatus::Unmapped).fills, 0);
    assert_eq!(summary.total, dec!(2));

    let (records, _) = store.read_csv::<PnlRecord>(PNL_RECORDS_FILE).unwrap();
    let open = records.iter().find(|r| r.fill_id == "c1").unwrap();
    assert_eq!(open.status, MarketStatus::Open);
    assert_eq!(open.settlement_price, dec!(0.5));
    assert_eq!(open.estimated_pnl, dec!(0));
}

// =============================================================================
// Reconcile
// =============================================================================

#[test]
fn test_reconcile_three_sources_within_tolerance() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    let store = pipeline.store();
    seed(store);

    store
        .write_csv(
            SNAPSHOTS_FILE,
            &[
                snapshot(WINDOW_START - 60, dec!(100)),
                snapshot(WINDOW_START + 3_600, dec!(250)),
                snapshot(WINDOW_END + 120, dec!(101.5)),
            ],
        )
        .unwrap();
    store
        .write_json(
            SUBGRAPH_PNL_FILE,
            &SubgraphFigure {
                start_block: 81_139_400,
                end_block: 81_213_222,
                start_block_estimated: false,
                end_block_estimated: true,
                pnl_start: dec!(10),
                pnl_end: dec!(12.2),
            },
        )
        .unwrap();

    let output = pipeline.reconcile().unwrap();
    assert_eq!(output.computed.net(), dec!(2));
    assert_eq!(output.computed.bought, dec!(8));
    assert_eq!(output.computed.redeemed, dec!(10));

    let scraped = output.report.line(Source::Scraped).unwrap();
    assert_eq!(scraped.value, Some(dec!(1.5)));
    assert_eq!(scraped.delta, Some(dec!(-0.5)));

    let subgraph = output.report.line(Source::Subgraph).unwrap();
    assert_eq!(subgraph.delta, Some(dec!(0.2)));
    assert_eq!(output.report.status, ReconcileStatus::Consistent);
}

#[test]
fn test_reconcile_flags_divergence_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = pipeline(dir.path());
    let store = pipeline.store();
    seed(store);

    store
        .write_csv(
            SNAPSHOTS_FILE,
            &[snapshot(WINDOW_START, dec!(0)), snapshot(WINDOW_END, dec!(40))],
        )
        .unwrap();

    let output = pipeline.reconcile().unwrap();
    assert_eq!(output.report.status, ReconcileStatus::Divergent);
    assert_eq!(output.report.warnings().count(), 1);
    assert!(output.subgraph.is_none());
    assert_eq!(output.report.line(Source::Subgraph).unwrap().value, None);
}

// =============================================================================
// Ingestion into the store
// =============================================================================

#[tokio::test]
async fn test_ingested_ids_survive_restart() {
    use async_trait::async_trait;
    use pnl_extract::{Advance, Page, PagedSource, SourceError};

    struct TwoPages;

    #[async_trait]
    impl PagedSource for TwoPages {
        type Record = Fill;

        fn name(&self) -> &str {
            "two-pages"
        }

        async fn fetch_page(&self, cursor: &Cursor) -> Result<Page<Fill>, SourceError> {
            let ids: &[&str] = match cursor {
                Cursor::After(id) if id.is_empty() => &["a1", "a2"],
                Cursor::After(id) if id == "a2" => &["a2", "a3"],
                _ => &[],
            };
            let fills = ids
                .iter()
                .map(|id| Ok(buy(id, "111", dec!(1), dec!(2), 1_767_600_000)))
                .collect();
            let last = ids.last().map(|id| Cursor::After(id.to_string()));
            Ok(Page::from_results("two-pages", fills, last))
        }

        fn next_cursor(&self, _current: &Cursor, page: &Page<Fill>) -> Advance {
            match &page.last {
                Some(last) => Advance::To(last.clone()),
                None => Advance::Stop,
            }
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let store = DataStore::open(dir.path()).unwrap();
    let ingestor = Ingestor::new(Duration::ZERO, CancelToken::new());

    for _ in 0..2 {
        let mut seen: HashSet<String> = store.seen_ids::<Fill>(FILLS_FILE).unwrap();
        let mut sink = store.csv_sink::<Fill>(FILLS_FILE).unwrap();
        ingestor
            .run(&TwoPages, Cursor::After(String::new()), &mut seen, &mut sink)
            .await
            .unwrap();
    }

    let loaded = store.load_fills().unwrap();
    let ids: Vec<&str> = loaded.records.iter().map(|f| f.id.as_str()).collect();
    assert_eq!(ids, vec!["a1", "a2", "a3"]);
    assert_eq!(loaded.duplicates, 0);
}
