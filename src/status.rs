// =============================================================================
// Update Status Tracker — process-wide single-flight guard
// =============================================================================
//
// Exactly one update cycle may run at a time.  `begin()` performs the
// Idle -> Running check-and-set under the same lock that `snapshot()` reads,
// so a reader always sees a consistent record: never `running == false`
// paired with a half-updated `last_run` / `error`.
//
// `begin()` hands back a `CycleGuard`.  Completing the guard records the
// outcome; dropping it without completing (panic, early return) records the
// cycle as aborted, so `running` cannot stay stuck at `true`.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::UpdateError;

/// Error recorded when a cycle's guard is dropped without completing.
pub const ABORTED_MESSAGE: &str = "update cycle aborted";

/// Serialisable status of the update machinery.
#[derive(Debug, Clone, PartialEq, Serialize, Default)]
pub struct UpdateStatus {
    pub running: bool,
    /// When the most recent cycle finished.
    pub last_run: Option<DateTime<Utc>>,
    /// Terminal error of the most recent cycle (cleared when a new one starts).
    pub error: Option<String>,
    /// Identifier of the current or most recent cycle.
    pub cycle_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    /// Tickers of the current or most recent cycle.
    pub tickers: Vec<String>,
}

#[derive(Debug, Default)]
pub struct UpdateStatusTracker {
    inner: Mutex<UpdateStatus>,
}

impl UpdateStatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a cycle, or fail with [`UpdateError::ConcurrentUpdateRejected`]
    /// if one is already running.
    pub fn begin(self: &Arc<Self>, tickers: &[String]) -> Result<CycleGuard, UpdateError> {
        let cycle_id = Uuid::new_v4();
        {
            let mut status = self.inner.lock();
            if status.running {
                return Err(UpdateError::ConcurrentUpdateRejected);
            }
            status.running = true;
            status.error = None;
            status.cycle_id = Some(cycle_id);
            status.started_at = Some(Utc::now());
            status.tickers = tickers.to_vec();
        }
        info!(%cycle_id, ?tickers, "update cycle started");

        Ok(CycleGuard {
            tracker: Arc::clone(self),
            cycle_id,
            finished: false,
        })
    }

    pub fn snapshot(&self) -> UpdateStatus {
        self.inner.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn complete(&self, cycle_id: Uuid, error: Option<String>) {
        let mut status = self.inner.lock();
        if status.cycle_id != Some(cycle_id) || !status.running {
            return;
        }
        status.running = false;
        status.last_run = Some(Utc::now());
        status.error = error;
    }
}

/// Proof of ownership of the running cycle.
#[derive(Debug)]
pub struct CycleGuard {
    tracker: Arc<UpdateStatusTracker>,
    cycle_id: Uuid,
    finished: bool,
}

impl CycleGuard {
    pub fn cycle_id(&self) -> Uuid {
        self.cycle_id
    }

    /// Finish the cycle, recording `error` (or success when `None`).
    pub fn complete(mut self, error: Option<String>) {
        self.finished = true;
        match &error {
            None => info!(cycle_id = %self.cycle_id, "update cycle succeeded"),
            Some(e) => warn!(cycle_id = %self.cycle_id, error = %e, "update cycle failed"),
        }
        self.tracker.complete(self.cycle_id, error);
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.finished {
            warn!(cycle_id = %self.cycle_id, "update cycle dropped before completion");
            self.tracker
                .complete(self.cycle_id, Some(ABORTED_MESSAGE.to_string()));
        }
    }
}
