use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::domain::RemoteItem;
use crate::error::SyncError;
use crate::http::CancelToken;
use crate::integrity::{IntegrityVerifier, QuarantineManager};
use crate::planner::TransferPlanner;

/// Planning passes per synchronization. The last one may only observe convergence.
pub const MAX_PASSES: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Planning,
    Fetching,
    Verifying,
    Converged,
    Exhausted,
}

/// Pass bound and the pause inserted before every pass after the first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassSchedule {
    pub max_passes: u32,
    pub unit: Duration,
}

impl PassSchedule {
    pub const fn standard() -> Self {
        Self {
            max_passes: MAX_PASSES,
            unit: Duration::from_secs(1),
        }
    }

    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit = unit;
        self
    }

    /// `pass^2 + 5` units for passes after the first.
    pub fn delay_before(&self, pass: u32) -> Duration {
        if pass <= 1 {
            return Duration::ZERO;
        }
        self.unit * (pass.pow(2) + 5)
    }
}

impl Default for PassSchedule {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    pub passes: u32,
    pub fetched: usize,
    pub quarantined: usize,
}

/// Drives fetch, verify and quarantine passes over one staging directory until nothing is
/// missing or the pass bound is reached.
pub struct RetryOrchestrator<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
    cancel: &'a CancelToken,
    schedule: PassSchedule,
}

impl<'a, C: Catalog + ?Sized> RetryOrchestrator<'a, C> {
    pub fn new(catalog: &'a C, cancel: &'a CancelToken, schedule: PassSchedule) -> Self {
        Self {
            catalog,
            cancel,
            schedule,
        }
    }

    pub fn run(
        &self,
        dataset: &str,
        items: &[RemoteItem],
        staging_dir: &Path,
    ) -> Result<PassReport, SyncError> {
        let mut report = PassReport::default();
        let mut state = PassState::Planning;
        let mut pass = 1u32;
        let mut missing = Vec::new();

        loop {
            self.cancel.check()?;
            debug!(dataset, pass, state = ?state, "orchestrator step");
            state = match state {
                PassState::Planning => {
                    missing = TransferPlanner::missing(items, staging_dir);
                    if missing.is_empty() {
                        PassState::Converged
                    } else if pass >= self.schedule.max_passes {
                        PassState::Exhausted
                    } else {
                        PassState::Fetching
                    }
                }
                PassState::Fetching => {
                    if pass > 1 {
                        let delay = self.schedule.delay_before(pass);
                        warn!(
                            dataset,
                            pass,
                            missing = missing.len(),
                            delay_secs = delay.as_secs_f64(),
                            "not all series downloaded; retrying after a pause"
                        );
                        self.cancel.sleep(delay)?;
                    }
                    report.fetched += self.fetch_all(&missing, staging_dir)?;
                    report.passes = pass;
                    PassState::Verifying
                }
                PassState::Verifying => {
                    let verification = IntegrityVerifier::verify(staging_dir, items, self.catalog)?;
                    report.quarantined += QuarantineManager::quarantine(&verification)?;
                    pass += 1;
                    PassState::Planning
                }
                PassState::Converged => {
                    info!(dataset, passes = report.passes, fetched = report.fetched, "all series downloaded");
                    return Ok(report);
                }
                PassState::Exhausted => {
                    return Err(SyncError::TransferIncomplete {
                        dataset: dataset.to_string(),
                        remaining: missing.len(),
                    });
                }
            };
        }
    }

    fn fetch_all(&self, missing: &[RemoteItem], staging_dir: &Path) -> Result<usize, SyncError> {
        info!(count = missing.len(), "downloading missing series");
        let mut fetched = 0usize;
        for (index, item) in missing.iter().enumerate() {
            self.cancel.check()?;
            debug!(item = %item.id, position = index + 1, total = missing.len(), "fetching series");
            match self.catalog.fetch(&item.id, staging_dir) {
                Ok(()) => fetched += 1,
                Err(err) if is_recoverable(&err) => {
                    warn!(item = %item.id, error = %err, "unusable download; will retry next pass");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(fetched)
    }
}

/// A body that arrived but could not be unpacked is local corruption; exhausted retries,
/// auth and IO failures end the run.
fn is_recoverable(err: &SyncError) -> bool {
    matches!(err, SyncError::InvalidResponse(_))
}
