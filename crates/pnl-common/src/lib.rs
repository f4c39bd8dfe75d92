//! Shared types for Polymarket PnL extraction and reconciliation.
//!
//! This crate contains:
//! - Record types ingested from the data sources (Fill, Redemption, Market, SnapshotPoint)
//! - Fixed-point helpers for 6-decimal collateral and outcome token amounts
//! - The reconciliation time window
//!
//! CRITICAL: All amounts, prices and PnL values use `rust_decimal::Decimal`.
//! NEVER use f64 for financial math.

pub mod types;
pub mod window;

pub use types::*;
pub use window::{parse_date, TimeWindow, WindowError};
