// =============================================================================
// Incremental Updater — fetch, annotate, merge, persist
// =============================================================================
//
// One ticker update:
//   1. pick the fetch window: [today - max_history_days, today] for a fresh or
//      re-initialised store, otherwise [latest persisted date, today]
//   2. fetch it in provider-sized chunks, every request gated by the shared
//      rate limiter and retried with exponential backoff on transient errors
//   3. group the bars by trading date (invalid and duplicate bars dropped)
//   4. annotate the fetched days using the persisted sessions just before
//      them as indicator lookback
//   5. merge whole dates into the store and save atomically
//
// A cycle runs its tickers one after another; a failed ticker is recorded
// and the rest still run.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::error::{FetchError, StoreError, UpdateError};
use crate::indicators::{self, MIN_LOOKBACK_SESSIONS};
use crate::provider::{BarSource, RateLimiter};
use crate::status::CycleGuard;
use crate::store::{self, RecordStore};
use crate::types::{RawBar, TickerStore, TradingDaySeries};

/// Backoff schedule for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles on every further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2_000),
        }
    }
}

/// Tunables of the update algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdaterSettings {
    pub max_history_days: u32,
    pub lookback_sessions: usize,
    pub retry: RetryPolicy,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            max_history_days: 30,
            lookback_sessions: MIN_LOOKBACK_SESSIONS,
            retry: RetryPolicy::default(),
        }
    }
}

/// What a single ticker update did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerReport {
    pub ticker: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub initialized: bool,
    pub requests: usize,
    pub days_fetched: usize,
    pub bars_fetched: usize,
    pub bars_dropped: usize,
    pub days_stored: usize,
    /// False when the provider had nothing and the store was left as is.
    pub written: bool,
}

/// Result of a whole update cycle.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    pub reports: Vec<TickerReport>,
    /// `(ticker, error message)` for every ticker that failed.
    pub failures: Vec<(String, String)>,
}

impl CycleOutcome {
    /// `TICKER: error` entries joined by `; `, or `None` when all succeeded.
    pub fn error_message(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(
            self.failures
                .iter()
                .map(|(ticker, err)| format!("{ticker}: {err}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Uppercase and de-duplicate `requested`, falling back to `defaults` when
/// nothing usable was asked for.
pub fn resolve_tickers(requested: &[String], defaults: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in requested.iter().map(|t| t.trim().to_uppercase()) {
        if !raw.is_empty() && !out.contains(&raw) {
            out.push(raw);
        }
    }
    if out.is_empty() {
        return resolve_tickers(defaults, &[]);
    }
    out
}

pub struct Updater<S> {
    store: RecordStore,
    source: S,
    limiter: Arc<RateLimiter>,
    settings: UpdaterSettings,
}

impl<S: BarSource> Updater<S> {
    pub fn new(
        store: RecordStore,
        source: S,
        limiter: Arc<RateLimiter>,
        mut settings: UpdaterSettings,
    ) -> Self {
        settings.lookback_sessions = settings.lookback_sessions.max(MIN_LOOKBACK_SESSIONS);
        settings.retry.max_attempts = settings.retry.max_attempts.max(1);
        Self {
            store,
            source,
            limiter,
            settings,
        }
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    // -------------------------------------------------------------------------
    // Cycle
    // -------------------------------------------------------------------------

    /// Run a cycle owned by `guard`, completing it with the joined per-ticker
    /// errors once every ticker has been attempted.
    pub async fn run_cycle(
        &self,
        guard: CycleGuard,
        tickers: &[String],
        init: bool,
        today: NaiveDate,
    ) -> CycleOutcome {
        let span = info_span!("update_cycle", cycle_id = %guard.cycle_id());
        let outcome = self.run_batch(tickers, init, today).instrument(span).await;
        guard.complete(outcome.error_message());
        outcome
    }

    /// Update every ticker in turn; one failure does not stop the others.
    pub async fn run_batch(&self, tickers: &[String], init: bool, today: NaiveDate) -> CycleOutcome {
        let mut outcome = CycleOutcome::default();
        for ticker in tickers {
            match self.update_ticker(ticker, init, today).await {
                Ok(report) => outcome.reports.push(report),
                Err(e) => {
                    warn!(%ticker, error = %e, "ticker update failed");
                    outcome.failures.push((ticker.clone(), e.to_string()));
                }
            }
        }
        info!(
            succeeded = outcome.reports.len(),
            failed = outcome.failures.len(),
            "update batch finished"
        );
        outcome
    }

    // -------------------------------------------------------------------------
    // Single ticker
    // -------------------------------------------------------------------------

    #[instrument(skip(self), fields(provider = self.source.name()))]
    pub async fn update_ticker(
        &self,
        ticker: &str,
        init: bool,
        today: NaiveDate,
    ) -> Result<TickerReport, UpdateError> {
        let ticker = RecordStore::normalize_ticker(ticker)?;

        let existing = if init {
            self.store.remove(&ticker)?;
            None
        } else {
            match self.store.load(&ticker) {
                Ok(store) => Some(store),
                Err(StoreError::NotFound { .. }) => None,
                Err(e) => return Err(e.into()),
            }
        };
        let existing = existing.unwrap_or_else(|| TickerStore::new(ticker.clone()));

        let history_start = today
            .checked_sub_days(Days::new(u64::from(self.settings.max_history_days)))
            .unwrap_or(NaiveDate::MIN);
        let initialized = existing.is_empty();
        let window_start = match existing.latest_date() {
            Some(latest) => latest.max(history_start).min(today),
            None => history_start,
        };
        info!(%ticker, %window_start, window_end = %today, initialized, "fetching");

        let chunks = chunk_window(window_start, today, self.source.max_request_days());
        let mut raw = Vec::new();
        for &(start, end) in &chunks {
            let bars = self.fetch_with_retry(&ticker, start, end).await?;
            debug!(%ticker, %start, %end, bars = bars.len(), "chunk fetched");
            raw.extend(bars);
        }

        let received = raw.len();
        let mut fetched = group_by_day(raw, window_start, today);
        let bars_fetched: usize = fetched.values().map(Vec::len).sum();
        let bars_dropped = received - bars_fetched;
        if bars_dropped > 0 {
            warn!(%ticker, dropped = bars_dropped, "dropped invalid or duplicate bars");
        }

        let mut report = TickerReport {
            ticker: ticker.clone(),
            window_start,
            window_end: today,
            initialized,
            requests: chunks.len(),
            days_fetched: fetched.len(),
            bars_fetched,
            bars_dropped,
            days_stored: existing.days.len(),
            written: false,
        };

        let Some(&first_fetched) = fetched.keys().next() else {
            info!(%ticker, "no new bars, store left unchanged");
            return Ok(report);
        };

        let lookback = lookback_closes(&existing.days, first_fetched, self.settings.lookback_sessions);
        indicators::annotate(&lookback, &mut fetched);

        let merged = TickerStore {
            ticker: ticker.clone(),
            days: store::merge(existing.days, fetched),
        };
        self.store.save(&merged)?;

        report.days_stored = merged.days.len();
        report.written = true;
        info!(
            %ticker,
            days_fetched = report.days_fetched,
            bars_fetched = report.bars_fetched,
            days_stored = report.days_stored,
            "ticker updated"
        );
        Ok(report)
    }

    /// One rate-limited request, retried while the error is transient and
    /// attempts remain.
    async fn fetch_with_retry(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawBar>, UpdateError> {
        let policy = self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let err = match self.source.fetch_minute_bars(ticker, start, end).await {
                Ok(bars) => return Ok(bars),
                Err(e) => e,
            };

            let delay = policy.delay_for(attempt);
            // A 429 pauses every ticker, even when this one has no attempts left.
            if let FetchError::RateLimited { retry_after } = &err {
                self.limiter.penalize(retry_after.unwrap_or(delay));
            }
            if !err.is_transient() || attempt >= policy.max_attempts {
                return Err(UpdateError::Fetch {
                    ticker: ticker.to_string(),
                    source: err,
                });
            }

            warn!(
                %ticker,
                attempt,
                max_attempts = policy.max_attempts,
                error = %err,
                "fetch failed, retrying"
            );
            // After a 429 the next acquire() waits out the cooldown instead.
            if !matches!(err, FetchError::RateLimited { .. }) {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Split the inclusive range `[start, end]` into consecutive inclusive chunks
/// of at most `max_days` days.  Empty when `start > end`.
pub fn chunk_window(start: NaiveDate, end: NaiveDate, max_days: u32) -> Vec<(NaiveDate, NaiveDate)> {
    let span = u64::from(max_days.max(1) - 1);
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let chunk_end = cursor
            .checked_add_days(Days::new(span))
            .map_or(end, |d| d.min(end));
        chunks.push((cursor, chunk_end));
        match chunk_end.succ_opt() {
            Some(next) => cursor = next,
            None => break,
        }
    }
    chunks
}

/// Group provider bars by trading date.
///
/// Bars dated outside `[start, end]` or with non-finite / inconsistent OHLC
/// are dropped.  Within a day bars are sorted by time and the first bar seen
/// for a given minute wins.
pub fn group_by_day(raw: Vec<RawBar>, start: NaiveDate, end: NaiveDate) -> TradingDaySeries {
    let mut days = TradingDaySeries::new();
    for raw in raw {
        if raw.date < start || raw.date > end {
            continue;
        }
        let date = raw.date;
        let bar = raw.into_bar();
        if !bar.is_consistent() {
            continue;
        }
        days.entry(date).or_default().push(bar);
    }
    for bars in days.values_mut() {
        bars.sort_by_key(|bar| bar.time);
        bars.dedup_by_key(|bar| bar.time);
    }
    days.retain(|_, bars| !bars.is_empty());
    days
}

/// Closes of the last `sessions` persisted days strictly before `before`,
/// oldest first.
pub fn lookback_closes(days: &TradingDaySeries, before: NaiveDate, sessions: usize) -> Vec<f64> {
    let mut prior: Vec<_> = days.range(..before).rev().take(sessions).collect();
    prior.reverse();
    prior
        .into_iter()
        .flat_map(|(_, bars)| bars.iter().map(|bar| bar.close))
        .collect()
}
