// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the record store, the updater and the status tracker together for the
// HTTP handlers and the CLI.  Handlers hold an `Arc<AppState<S>>`; the parts
// that background update tasks need are themselves `Arc`s so a spawned cycle
// can outlive the request that started it.
//
// Thread safety:
//   - `UpdateStatusTracker` serialises every status transition behind one lock.
//   - `RateLimiter` is shared by every fetch through the updater.
//   - The record store is plain file I/O; atomic renames keep readers safe.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::info;
use uuid::Uuid;

use crate::error::UpdateError;
use crate::provider::{BarSource, RateLimiter};
use crate::runtime_config::{today_in, ServiceConfig};
use crate::status::UpdateStatusTracker;
use crate::store::RecordStore;
use crate::updater::{resolve_tickers, CycleOutcome, Updater};

pub struct AppState<S> {
    pub config: ServiceConfig,
    pub market_tz: Tz,
    pub status: Arc<UpdateStatusTracker>,
    pub updater: Arc<Updater<S>>,
    pub started_at: DateTime<Utc>,
}

impl<S: BarSource + 'static> AppState<S> {
    pub fn new(config: ServiceConfig, source: S) -> Result<Self> {
        let market_tz = config.market_tz()?;
        let store = RecordStore::new(config.data_dir.clone());
        let limiter = Arc::new(RateLimiter::new(
            config.max_requests_per_window,
            config.rate_window(),
        ));
        let updater = Updater::new(store, source, limiter, config.updater_settings());

        Ok(Self {
            config,
            market_tz,
            status: Arc::new(UpdateStatusTracker::new()),
            updater: Arc::new(updater),
            started_at: Utc::now(),
        })
    }

    pub fn store(&self) -> &RecordStore {
        self.updater.store()
    }

    /// Current date in the market timezone.
    pub fn today(&self) -> NaiveDate {
        today_in(self.market_tz)
    }

    pub fn resolve_tickers(&self, requested: &[String]) -> Vec<String> {
        resolve_tickers(requested, &self.config.default_tickers)
    }

    /// Claim the update slot and run the cycle in the background.
    ///
    /// Fails with [`UpdateError::ConcurrentUpdateRejected`] when a cycle is
    /// already running; otherwise returns the new cycle's id immediately.
    pub fn start_update(&self, requested: &[String], init: bool) -> Result<Uuid, UpdateError> {
        let tickers = self.resolve_tickers(requested);
        let guard = self.status.begin(&tickers)?;
        let cycle_id = guard.cycle_id();
        let today = self.today();
        let updater = Arc::clone(&self.updater);

        tokio::spawn(async move {
            updater.run_cycle(guard, &tickers, init, today).await;
        });

        info!(%cycle_id, "update cycle spawned");
        Ok(cycle_id)
    }

    /// Claim the update slot and run the cycle to completion on the caller's
    /// task.
    pub async fn run_update(&self, requested: &[String], init: bool) -> Result<CycleOutcome, UpdateError> {
        let tickers = self.resolve_tickers(requested);
        let guard = self.status.begin(&tickers)?;
        Ok(self.updater.run_cycle(guard, &tickers, init, self.today()).await)
    }
}
