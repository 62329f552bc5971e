// =============================================================================
// Market-data provider capability
// =============================================================================
//
// The updater only needs one thing from the outside world: minute bars for a
// ticker over an inclusive date range.  `BarSource` is that seam; the Yahoo
// client implements it for production and tests script their own.

pub mod rate_limit;
pub mod yahoo;

use std::future::Future;

use chrono::NaiveDate;

use crate::error::FetchError;
use crate::types::RawBar;

pub use rate_limit::{RateLimitSnapshot, RateLimiter};
pub use yahoo::YahooProvider;

/// Source of one-minute bars.
///
/// Implementations return bars whose `date` lies in `[start, end]`, in
/// market-local time.  A range with no sessions yields `Ok(vec![])`; ranges
/// older than the provider's history window yield empty or truncated results
/// rather than an error.
pub trait BarSource: Send + Sync {
    /// Human-readable provider name for logs.
    fn name(&self) -> &str;

    /// Longest inclusive date span a single request may cover.
    fn max_request_days(&self) -> u32 {
        7
    }

    fn fetch_minute_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = Result<Vec<RawBar>, FetchError>> + Send;
}
