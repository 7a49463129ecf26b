use std::time::Duration;

use chrono::Utc;
use log::{error, info, warn, Level};
use logging_timer::timer;
use rusqlite::{Connection, ErrorCode};
use serde::Serialize;

use crate::config::Config;
use crate::db::Database;
use crate::error::EngineError;
use crate::progress::{ProgressAggregator, ProgressSnapshot, UserProgress, UserRollup};
use crate::recommendations::{NewRecommendation, Recommendation, RecordStore, UnlockState, ValidationStatus};
use crate::replacement::{CandidatePool, Replacement, ReplacementScheduler, ReplacementSource};
use crate::scan_locks::ScanLocks;
use crate::unlock::{BatchUnlockScheduler, UnlockOutcome};
use crate::validate::{ElementMatch, LiveFindings, ValidationEngine, ValidationHistoryEntry, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecommendationList {
    pub recommendations: Vec<Recommendation>,
    pub progress: UserProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub scan_id: i64,
    pub user_id: i64,
    pub inserted: i64,
    pub active: i64,
    pub locked: i64,
    pub total_batches: i64,
    pub next_replacement_date: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scans_due: usize,
    pub replacements: Vec<Replacement>,
    /// Scans that failed this run. They stay due and are retried next sweep.
    pub failed_scans: Vec<i64>,
}

impl SweepReport {
    pub fn replaced_ids(&self) -> Vec<i64> {
        self.replacements.iter().map(|r| r.old_id).collect()
    }
}

/// The unlock engine as seen by the API layer.
///
/// Each mutating call holds the affected scan's lock for the whole
/// read-check-write sequence and commits it as one immediate transaction.
/// The `_at` variants take the clock reading explicitly.
pub struct Engine {
    db: Database,
    locks: ScanLocks,
    lock_timeout: Duration,
    target_active_count: i64,
    unlock: BatchUnlockScheduler,
    replacement: ReplacementScheduler,
}

impl Engine {
    pub fn new(db: Database, config: &Config) -> Self {
        Engine {
            db,
            locks: ScanLocks::new(),
            lock_timeout: Duration::from_millis(config.locking.timeout_ms),
            target_active_count: config.replacement.target_active_count,
            unlock: BatchUnlockScheduler::new(config.unlock.clone()),
            replacement: ReplacementScheduler::new(config.replacement.clone()),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Store a freshly generated recommendation set for a new scan
    pub fn ingest(
        &self,
        scan_id: i64,
        user_id: i64,
        recommendations: &[NewRecommendation],
    ) -> Result<IngestSummary, EngineError> {
        self.ingest_at(scan_id, user_id, recommendations, Self::now())
    }

    pub fn ingest_at(
        &self,
        scan_id: i64,
        user_id: i64,
        recommendations: &[NewRecommendation],
        now: i64,
    ) -> Result<IngestSummary, EngineError> {
        if recommendations.is_empty() {
            return Err(EngineError::Error(format!(
                "Scan {}: no recommendations to store",
                scan_id
            )));
        }
        if let Some(bad) = recommendations.iter().find(|r| r.batch_number < 1) {
            return Err(EngineError::Error(format!(
                "Scan {}: batch numbers start at 1, got {}",
                scan_id, bad.batch_number
            )));
        }
        if recommendations.iter().any(|r| r.recommendation_text.trim().is_empty()) {
            return Err(EngineError::Error(format!(
                "Scan {}: recommendation text must not be empty",
                scan_id
            )));
        }

        let total_batches = recommendations
            .iter()
            .map(|r| r.batch_number)
            .max()
            .unwrap_or(1);
        let next_replacement_date = self.replacement.first_due_date(now);

        let summary = self.with_scan_locked(scan_id, |c| {
            UserProgress::create(
                c,
                scan_id,
                user_id,
                total_batches,
                self.target_active_count,
                next_replacement_date,
                now,
            )?;

            let mut active = 0;
            for rec in recommendations {
                let state = if rec.batch_number == 1 {
                    active += 1;
                    UnlockState::Active
                } else {
                    UnlockState::Locked
                };
                RecordStore::insert(c, scan_id, user_id, rec, state, None, now)?;
            }

            if active > 0 {
                UserProgress::record_batch_unlock(c, scan_id, 1, active, true, now)?;
            }

            let snapshot = ProgressAggregator::recompute(c, scan_id, now)?;

            Ok(IngestSummary {
                scan_id,
                user_id,
                inserted: snapshot.total,
                active: snapshot.active,
                locked: snapshot.locked,
                total_batches,
                next_replacement_date,
            })
        })?;

        info!(
            "Scan {}: stored {} recommendation(s) in {} batch(es)",
            scan_id, summary.inserted, summary.total_batches
        );

        Ok(summary)
    }

    /// Every recommendation of the scan, superseded ones included, with its progress row
    pub fn list_recommendations(&self, scan_id: i64) -> Result<RecommendationList, EngineError> {
        let conn = self.db.get_connection()?;
        let progress = UserProgress::get_existing(&conn, scan_id)?;
        let recommendations = RecordStore::list_by_scan(&conn, scan_id)?;
        Ok(RecommendationList {
            recommendations,
            progress,
        })
    }

    /// Recommendations the user can currently work on
    pub fn list_active(&self, scan_id: i64) -> Result<Vec<Recommendation>, EngineError> {
        let conn = self.db.get_connection()?;
        if !UserProgress::exists(&conn, scan_id)? {
            return Err(EngineError::scan_not_found(scan_id));
        }
        RecordStore::list_by_scan_in_states(&conn, scan_id, &[UnlockState::Active, UnlockState::InProgress])
    }

    pub fn mark_complete(&self, recommendation_id: i64) -> Result<ProgressSnapshot, EngineError> {
        self.mark_complete_at(recommendation_id, Self::now())
    }

    pub fn mark_complete_at(&self, recommendation_id: i64, now: i64) -> Result<ProgressSnapshot, EngineError> {
        let scan_id = self.scan_of(recommendation_id)?;

        self.with_scan_locked(scan_id, |c| {
            RecordStore::update_state(c, recommendation_id, UnlockState::Completed, now)?;
            RecordStore::set_validation(c, recommendation_id, ValidationStatus::PendingValidation, None, now)?;
            ProgressAggregator::recompute(c, scan_id, now)
        })
    }

    /// Opt a recommendation out. Skipped records are kept but no longer counted.
    pub fn skip(&self, recommendation_id: i64) -> Result<ProgressSnapshot, EngineError> {
        self.skip_at(recommendation_id, Self::now())
    }

    pub fn skip_at(&self, recommendation_id: i64, now: i64) -> Result<ProgressSnapshot, EngineError> {
        let scan_id = self.scan_of(recommendation_id)?;

        self.with_scan_locked(scan_id, |c| {
            RecordStore::update_state(c, recommendation_id, UnlockState::Skipped, now)?;
            ProgressAggregator::recompute(c, scan_id, now)
        })
    }

    pub fn set_progress(&self, recommendation_id: i64, percentage: i64) -> Result<Recommendation, EngineError> {
        self.set_progress_at(recommendation_id, percentage, Self::now())
    }

    pub fn set_progress_at(
        &self,
        recommendation_id: i64,
        percentage: i64,
        now: i64,
    ) -> Result<Recommendation, EngineError> {
        let scan_id = self.scan_of(recommendation_id)?;

        self.with_scan_locked(scan_id, |c| {
            RecordStore::set_progress(c, recommendation_id, percentage, now)?;
            RecordStore::get_existing(c, recommendation_id)
        })
    }

    pub fn unlock_next(&self, scan_id: i64) -> Result<UnlockOutcome, EngineError> {
        self.unlock_next_at(scan_id, Self::now())
    }

    pub fn unlock_next_at(&self, scan_id: i64, now: i64) -> Result<UnlockOutcome, EngineError> {
        self.with_scan_locked(scan_id, |c| self.unlock.attempt_unlock(c, scan_id, now))
    }

    pub fn validate_recommendation(
        &self,
        recommendation_id: i64,
        findings: &LiveFindings,
    ) -> Result<ValidationOutcome, EngineError> {
        self.validate_recommendation_at(recommendation_id, findings, Self::now())
    }

    /// Element matching happens before the scan lock is taken; only the
    /// classification, history append and transition run under it.
    pub fn validate_recommendation_at(
        &self,
        recommendation_id: i64,
        findings: &LiveFindings,
        now: i64,
    ) -> Result<ValidationOutcome, EngineError> {
        let rec = {
            let conn = self.db.get_connection()?;
            RecordStore::get_existing(&conn, recommendation_id)?
        };
        let elements = ElementMatch::compute(rec.required_elements(), findings);
        let scan_id = rec.scan_id();

        self.with_scan_locked(scan_id, |c| {
            let outcome = ValidationEngine::record(c, recommendation_id, elements, now)?;
            if outcome.state_after != outcome.state_before {
                ProgressAggregator::recompute(c, scan_id, now)?;
            }
            Ok(outcome)
        })
    }

    /// Queue content for future replacements of this scan's stale recommendations
    pub fn add_replacement_candidates(
        &self,
        scan_id: i64,
        candidates: &[NewRecommendation],
    ) -> Result<usize, EngineError> {
        let now = Self::now();
        self.with_scan_locked(scan_id, |c| CandidatePool::add(c, scan_id, candidates, now))
    }

    pub fn run_replacement_sweep(&self, now: i64) -> Result<SweepReport, EngineError> {
        self.run_replacement_sweep_with(now, &CandidatePool)
    }

    /// Process every scan whose replacement date has arrived.
    ///
    /// Each scan commits on its own. A scan that fails is logged and stays
    /// due, so rerunning the sweep picks up where this one stopped.
    pub fn run_replacement_sweep_with(
        &self,
        now: i64,
        source: &dyn ReplacementSource,
    ) -> Result<SweepReport, EngineError> {
        let _tmr = timer!(Level::Trace; "Engine::run_replacement_sweep");

        let due = {
            let conn = self.db.get_connection()?;
            self.replacement.due_scans(&conn, now)?
        };

        let mut report = SweepReport {
            scans_due: due.len(),
            ..SweepReport::default()
        };

        for scan_id in due {
            match self.with_scan_locked(scan_id, |c| {
                self.replacement.replace_for_scan(c, scan_id, now, source)
            }) {
                Ok(replaced) => report.replacements.extend(replaced),
                Err(e @ EngineError::ConcurrencyConflict { .. }) => {
                    warn!("Replacement sweep skipped scan {}: {}", scan_id, e);
                    report.failed_scans.push(scan_id);
                }
                Err(e) => {
                    error!("Replacement sweep failed for scan {}: {}", scan_id, e);
                    report.failed_scans.push(scan_id);
                }
            }
        }

        if report.scans_due > 0 {
            info!(
                "Replacement sweep: {} scan(s) due, {} replacement(s), {} failed",
                report.scans_due,
                report.replacements.len(),
                report.failed_scans.len()
            );
        }

        Ok(report)
    }

    pub fn validation_history(&self, recommendation_id: i64) -> Result<Vec<ValidationHistoryEntry>, EngineError> {
        let conn = self.db.get_connection()?;
        RecordStore::get_existing(&conn, recommendation_id)?;
        ValidationHistoryEntry::list_for_recommendation(&conn, recommendation_id)
    }

    pub fn replacement_chain(&self, recommendation_id: i64) -> Result<Vec<Recommendation>, EngineError> {
        let conn = self.db.get_connection()?;
        RecordStore::replacement_chain(&conn, recommendation_id)
    }

    pub fn progress(&self, scan_id: i64) -> Result<UserProgress, EngineError> {
        let conn = self.db.get_connection()?;
        UserProgress::get_existing(&conn, scan_id)
    }

    pub fn user_rollup(&self, user_id: i64) -> Result<UserRollup, EngineError> {
        let conn = self.db.get_connection()?;
        ProgressAggregator::user_rollup(&conn, user_id)
    }

    fn scan_of(&self, recommendation_id: i64) -> Result<i64, EngineError> {
        let conn = self.db.get_connection()?;
        Ok(RecordStore::get_existing(&conn, recommendation_id)?.scan_id())
    }

    fn with_scan_locked<T, F>(&self, scan_id: i64, func: F) -> Result<T, EngineError>
    where
        F: FnOnce(&Connection) -> Result<T, EngineError>,
    {
        let _guard = self.locks.acquire(scan_id, self.lock_timeout)?;
        let conn = self.db.get_connection()?;
        Database::immediate_transaction(&conn, func).map_err(|e| busy_as_conflict(e, scan_id))
    }
}

/// SQLite reporting the database busy means another writer held it past the busy timeout
fn busy_as_conflict(err: EngineError, scan_id: i64) -> EngineError {
    if let EngineError::DatabaseError(rusqlite::Error::SqliteFailure(sqlite_err, _)) = &err {
        if matches!(sqlite_err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) {
            return EngineError::ConcurrencyConflict { scan_id };
        }
    }
    err
}
