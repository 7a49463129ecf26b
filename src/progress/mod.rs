mod user_progress;

use log::{debug, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::EngineError;
use crate::recommendations::{Recommendation, RecordStore, Scope, UnlockState};

pub use user_progress::{BatchUnlock, UserProgress};

/// Counts for one scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScopeCounts {
    pub total: i64,
    pub active: i64,
    pub completed: i64,
}

/// Aggregate state of a scan's recommendation set.
///
/// Every live recommendation lands in exactly one of `locked`, `active`
/// (active or in progress) or `completed` (completed or verified), so
/// `locked + active + completed == total`. Skipped records have been
/// replaced; they are counted in `skipped` and nowhere else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub total: i64,
    pub active: i64,
    pub completed: i64,
    pub locked: i64,
    pub skipped: i64,
    pub site_wide: ScopeCounts,
    pub page_specific: ScopeCounts,
}

impl ProgressSnapshot {
    pub fn from_records(records: &[Recommendation]) -> Self {
        Self::from_states(records.iter().map(|r| (r.unlock_state(), r.scope())))
    }

    pub fn from_states<I>(states: I) -> Self
    where
        I: IntoIterator<Item = (UnlockState, Scope)>,
    {
        let mut snapshot = ProgressSnapshot::default();

        for (state, scope) in states {
            if state == UnlockState::Skipped {
                snapshot.skipped += 1;
                continue;
            }

            let scope_counts = match scope {
                Scope::SiteWide => &mut snapshot.site_wide,
                Scope::PageSpecific => &mut snapshot.page_specific,
            };

            snapshot.total += 1;
            scope_counts.total += 1;

            if state.is_done() {
                snapshot.completed += 1;
                scope_counts.completed += 1;
            } else if state.is_open() {
                snapshot.active += 1;
                scope_counts.active += 1;
            } else {
                snapshot.locked += 1;
            }
        }

        snapshot
    }

    /// All site-wide work done. Vacuously true when there is none.
    pub fn site_wide_complete(&self) -> bool {
        self.site_wide.completed == self.site_wide.total
    }

    fn accumulate(&mut self, other: &ProgressSnapshot) {
        self.total += other.total;
        self.active += other.active;
        self.completed += other.completed;
        self.locked += other.locked;
        self.skipped += other.skipped;
        for (mine, theirs) in [
            (&mut self.site_wide, &other.site_wide),
            (&mut self.page_specific, &other.page_specific),
        ] {
            mine.total += theirs.total;
            mine.active += theirs.active;
            mine.completed += theirs.completed;
        }
    }
}

/// Progress across every scan a user owns
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserRollup {
    pub user_id: i64,
    pub scan_count: i64,
    pub progress: ProgressSnapshot,
}

pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Recount a scan's recommendations and overwrite its cached counters.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction so the counts
    /// are taken from the same state the caller just wrote.
    pub fn recompute(conn: &Connection, scan_id: i64, now: i64) -> Result<ProgressSnapshot, EngineError> {
        let _tmr = timer!(Level::Trace; "ProgressAggregator::recompute", "scan {}", scan_id);

        if !UserProgress::exists(conn, scan_id)? {
            return Err(EngineError::scan_not_found(scan_id));
        }

        let records = RecordStore::list_by_scan(conn, scan_id)?;
        let snapshot = ProgressSnapshot::from_records(&records);

        UserProgress::store_snapshot(conn, scan_id, &snapshot, now)?;

        debug!(
            "Scan {}: {} total, {} active, {} completed, {} locked",
            scan_id, snapshot.total, snapshot.active, snapshot.completed, snapshot.locked
        );

        Ok(snapshot)
    }

    /// Read-only recount, used to report progress without touching the cache
    pub fn snapshot(conn: &Connection, scan_id: i64) -> Result<ProgressSnapshot, EngineError> {
        if !UserProgress::exists(conn, scan_id)? {
            return Err(EngineError::scan_not_found(scan_id));
        }
        let records = RecordStore::list_by_scan(conn, scan_id)?;
        Ok(ProgressSnapshot::from_records(&records))
    }

    pub fn user_rollup(conn: &Connection, user_id: i64) -> Result<UserRollup, EngineError> {
        let scans = UserProgress::list_for_user(conn, user_id)?;

        let mut progress = ProgressSnapshot::default();
        for scan in &scans {
            progress.accumulate(&Self::snapshot(conn, scan.scan_id)?);
        }

        Ok(UserRollup {
            user_id,
            scan_count: scans.len() as i64,
            progress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::recommendations::test_support::{new_rec, page_rec, seed_scan};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn state_strategy() -> impl Strategy<Value = UnlockState> {
        prop::sample::select(UnlockState::ALL.to_vec())
    }

    fn scope_strategy() -> impl Strategy<Value = Scope> {
        prop_oneof![Just(Scope::SiteWide), Just(Scope::PageSpecific)]
    }

    proptest! {
        #[test]
        fn prop_buckets_partition_total(
            states in prop::collection::vec((state_strategy(), scope_strategy()), 0..60)
        ) {
            let snapshot = ProgressSnapshot::from_states(states.clone());

            prop_assert_eq!(snapshot.active + snapshot.completed + snapshot.locked, snapshot.total);
            prop_assert_eq!(snapshot.site_wide.total + snapshot.page_specific.total, snapshot.total);
            prop_assert_eq!(snapshot.total + snapshot.skipped, states.len() as i64);
            prop_assert!(snapshot.completed <= snapshot.total);
            prop_assert!(snapshot.site_wide.completed <= snapshot.site_wide.total);
            prop_assert!(snapshot.page_specific.completed <= snapshot.page_specific.total);
        }
    }

    #[test]
    fn test_buckets() {
        let snapshot = ProgressSnapshot::from_states([
            (UnlockState::Locked, Scope::SiteWide),
            (UnlockState::Active, Scope::SiteWide),
            (UnlockState::InProgress, Scope::PageSpecific),
            (UnlockState::Completed, Scope::SiteWide),
            (UnlockState::Verified, Scope::PageSpecific),
            (UnlockState::Skipped, Scope::SiteWide),
        ]);

        assert_eq!(
            snapshot,
            ProgressSnapshot {
                total: 5,
                active: 2,
                completed: 2,
                locked: 1,
                skipped: 1,
                site_wide: ScopeCounts { total: 3, active: 1, completed: 1 },
                page_specific: ScopeCounts { total: 2, active: 1, completed: 1 },
            }
        );
        assert!(!snapshot.site_wide_complete());
    }

    #[test]
    fn test_site_wide_complete_without_site_wide_work() {
        let snapshot = ProgressSnapshot::from_states([(UnlockState::Active, Scope::PageSpecific)]);
        assert!(snapshot.site_wide_complete());
    }

    #[test]
    fn test_recompute_writes_cache_and_is_idempotent() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 10);

        RecordStore::insert(&conn, 1, 10, &new_rec("Add a title", 1), UnlockState::Active, None, 100).unwrap();
        let id = RecordStore::insert(&conn, 1, 10, &new_rec("Add alt text", 1), UnlockState::Active, None, 100)
            .unwrap();
        RecordStore::insert(&conn, 1, 10, &page_rec("Fix heading", 2, "/about"), UnlockState::Locked, None, 100)
            .unwrap();
        RecordStore::update_state(&conn, id, UnlockState::Completed, 200).unwrap();

        let first = ProgressAggregator::recompute(&conn, 1, 300).unwrap();
        let second = ProgressAggregator::recompute(&conn, 1, 400).unwrap();
        assert_eq!(first, second);

        let progress = UserProgress::get_existing(&conn, 1).unwrap();
        assert_eq!(progress.total_recommendations, 3);
        assert_eq!(progress.active_recommendations, 1);
        assert_eq!(progress.completed_recommendations, 1);
        assert_eq!(progress.locked_recommendations, 1);
        assert_eq!(progress.site_wide_total, 2);
        assert_eq!(progress.site_wide_completed, 1);
        assert_eq!(progress.page_specific_total, 1);
        assert!(!progress.site_wide_complete);
        assert_eq!(progress.updated_at, 400);
    }

    #[test]
    fn test_recompute_unknown_scan() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        assert!(matches!(
            ProgressAggregator::recompute(&conn, 99, 0),
            Err(EngineError::NotFound { entity: "Scan", id: 99 })
        ));
    }

    #[test]
    fn test_user_rollup_sums_scans() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 10);
        seed_scan(&conn, 2, 10);
        seed_scan(&conn, 3, 11);

        RecordStore::insert(&conn, 1, 10, &new_rec("a", 1), UnlockState::Active, None, 0).unwrap();
        RecordStore::insert(&conn, 2, 10, &new_rec("b", 1), UnlockState::Locked, None, 0).unwrap();
        RecordStore::insert(&conn, 3, 11, &new_rec("c", 1), UnlockState::Active, None, 0).unwrap();

        let rollup = ProgressAggregator::user_rollup(&conn, 10).unwrap();
        assert_eq!(rollup.scan_count, 2);
        assert_eq!(rollup.progress.total, 2);
        assert_eq!(rollup.progress.active, 1);
        assert_eq!(rollup.progress.locked, 1);

        let empty = ProgressAggregator::user_rollup(&conn, 77).unwrap();
        assert_eq!(empty.scan_count, 0);
        assert_eq!(empty.progress, ProgressSnapshot::default());
    }
}
