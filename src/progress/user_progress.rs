use rusqlite::{named_params, params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::ProgressSnapshot;
use crate::error::EngineError;

/// One moment a batch became eligible
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchUnlock {
    pub batch_number: i64,
    pub unlocked_at: i64,
    pub unlocked_count: i64,
    /// The grant made when the scan's recommendations were first stored
    pub is_initial: bool,
}

/// Per-scan progress row.
///
/// The counters are a cache of [`ProgressSnapshot`], rewritten by the
/// aggregator after every mutation. The batch unlock dates and the
/// replacement schedule are owned here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserProgress {
    pub scan_id: i64,
    pub user_id: i64,
    pub total_recommendations: i64,
    pub active_recommendations: i64,
    pub completed_recommendations: i64,
    pub locked_recommendations: i64,
    pub skipped_recommendations: i64,
    pub site_wide_total: i64,
    pub site_wide_completed: i64,
    pub site_wide_active: i64,
    pub page_specific_total: i64,
    pub page_specific_completed: i64,
    pub site_wide_complete: bool,
    pub total_batches: i64,
    pub next_replacement_date: Option<i64>,
    pub last_replacement_date: Option<i64>,
    pub recommendations_replaced_count: i64,
    pub target_active_count: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub batch_unlocks: Vec<BatchUnlock>,
}

impl UserProgress {
    const SELECT_COLUMNS: &'static str = "scan_id, user_id, total_recommendations, active_recommendations,
        completed_recommendations, locked_recommendations, skipped_recommendations,
        site_wide_total, site_wide_completed, site_wide_active, page_specific_total,
        page_specific_completed, site_wide_complete, total_batches, next_replacement_date,
        last_replacement_date, recommendations_replaced_count, target_active_count,
        created_at, updated_at";

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(UserProgress {
            scan_id: row.get(0)?,
            user_id: row.get(1)?,
            total_recommendations: row.get(2)?,
            active_recommendations: row.get(3)?,
            completed_recommendations: row.get(4)?,
            locked_recommendations: row.get(5)?,
            skipped_recommendations: row.get(6)?,
            site_wide_total: row.get(7)?,
            site_wide_completed: row.get(8)?,
            site_wide_active: row.get(9)?,
            page_specific_total: row.get(10)?,
            page_specific_completed: row.get(11)?,
            site_wide_complete: row.get(12)?,
            total_batches: row.get(13)?,
            next_replacement_date: row.get(14)?,
            last_replacement_date: row.get(15)?,
            recommendations_replaced_count: row.get(16)?,
            target_active_count: row.get(17)?,
            created_at: row.get(18)?,
            updated_at: row.get(19)?,
            batch_unlocks: Vec::new(),
        })
    }

    /// Create the row for a newly generated scan.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn create(
        conn: &Connection,
        scan_id: i64,
        user_id: i64,
        total_batches: i64,
        target_active_count: i64,
        next_replacement_date: i64,
        now: i64,
    ) -> Result<(), EngineError> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM user_progress WHERE scan_id = ?)",
            [scan_id],
            |row| row.get(0),
        )?;

        if exists {
            return Err(EngineError::Error(format!(
                "Scan {} already has recommendations",
                scan_id
            )));
        }

        conn.execute(
            "INSERT INTO user_progress (
                scan_id, user_id, total_batches, target_active_count,
                next_replacement_date, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                scan_id,
                user_id,
                total_batches,
                target_active_count,
                next_replacement_date,
                now,
                now
            ],
        )?;

        Ok(())
    }

    pub fn get(conn: &Connection, scan_id: i64) -> Result<Option<Self>, EngineError> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE scan_id = ?",
            Self::SELECT_COLUMNS
        );

        let progress = conn.query_row(&sql, [scan_id], Self::from_row).optional()?;

        match progress {
            Some(mut progress) => {
                progress.batch_unlocks = Self::load_batch_unlocks(conn, scan_id)?;
                Ok(Some(progress))
            }
            None => Ok(None),
        }
    }

    pub fn get_existing(conn: &Connection, scan_id: i64) -> Result<Self, EngineError> {
        Self::get(conn, scan_id)?.ok_or_else(|| EngineError::scan_not_found(scan_id))
    }

    pub fn exists(conn: &Connection, scan_id: i64) -> Result<bool, EngineError> {
        let exists = conn.query_row(
            "SELECT EXISTS (SELECT 1 FROM user_progress WHERE scan_id = ?)",
            [scan_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn list_for_user(conn: &Connection, user_id: i64) -> Result<Vec<Self>, EngineError> {
        let sql = format!(
            "SELECT {} FROM user_progress WHERE user_id = ? ORDER BY scan_id ASC",
            Self::SELECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([user_id], Self::from_row)?;

        let mut result = Vec::new();
        for row in rows {
            let mut progress = row?;
            progress.batch_unlocks = Self::load_batch_unlocks(conn, progress.scan_id)?;
            result.push(progress);
        }
        Ok(result)
    }

    /// When batch `batch_number` first became eligible
    pub fn batch_unlock_date(&self, batch_number: i64) -> Option<i64> {
        self.batch_unlocks
            .iter()
            .filter(|u| u.batch_number == batch_number)
            .map(|u| u.unlocked_at)
            .min()
    }

    /// Overwrite the cached counters with a fresh snapshot
    pub fn store_snapshot(
        conn: &Connection,
        scan_id: i64,
        snapshot: &ProgressSnapshot,
        now: i64,
    ) -> Result<(), EngineError> {
        let rows = conn.execute(
            "UPDATE user_progress SET
                total_recommendations = :total,
                active_recommendations = :active,
                completed_recommendations = :completed,
                locked_recommendations = :locked,
                skipped_recommendations = :skipped,
                site_wide_total = :sw_total,
                site_wide_completed = :sw_completed,
                site_wide_active = :sw_active,
                page_specific_total = :ps_total,
                page_specific_completed = :ps_completed,
                site_wide_complete = :sw_complete,
                updated_at = :now
             WHERE scan_id = :scan_id",
            named_params! {
                ":total":        snapshot.total,
                ":active":       snapshot.active,
                ":completed":    snapshot.completed,
                ":locked":       snapshot.locked,
                ":skipped":      snapshot.skipped,
                ":sw_total":     snapshot.site_wide.total,
                ":sw_completed": snapshot.site_wide.completed,
                ":sw_active":    snapshot.site_wide.active,
                ":ps_total":     snapshot.page_specific.total,
                ":ps_completed": snapshot.page_specific.completed,
                ":sw_complete":  snapshot.site_wide_complete(),
                ":now":          now,
                ":scan_id":      scan_id,
            },
        )?;

        if rows == 0 {
            return Err(EngineError::scan_not_found(scan_id));
        }
        Ok(())
    }

    pub fn record_batch_unlock(
        conn: &Connection,
        scan_id: i64,
        batch_number: i64,
        unlocked_count: i64,
        is_initial: bool,
        now: i64,
    ) -> Result<(), EngineError> {
        conn.execute(
            "INSERT INTO batch_unlocks (scan_id, batch_number, unlocked_at, unlocked_count, is_initial)
             VALUES (?, ?, ?, ?, ?)",
            params![scan_id, batch_number, now, unlocked_count, is_initial],
        )?;
        Ok(())
    }

    /// Times of scheduler unlocks (the initial grant excluded) strictly after `cutoff`, oldest first
    pub fn unlocks_since(conn: &Connection, scan_id: i64, cutoff: i64) -> Result<Vec<i64>, EngineError> {
        let mut stmt = conn.prepare(
            "SELECT unlocked_at FROM batch_unlocks
             WHERE scan_id = ? AND is_initial = 0 AND unlocked_at > ?
             ORDER BY unlocked_at ASC",
        )?;
        let times = stmt
            .query_map(params![scan_id, cutoff], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(times)
    }

    /// Scans whose replacement date has arrived, earliest first
    pub fn due_for_replacement(conn: &Connection, now: i64) -> Result<Vec<i64>, EngineError> {
        let mut stmt = conn.prepare(
            "SELECT scan_id FROM user_progress
             WHERE next_replacement_date IS NOT NULL AND next_replacement_date <= ?
             ORDER BY next_replacement_date ASC, scan_id ASC",
        )?;
        let ids = stmt
            .query_map([now], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Advance the replacement schedule after a due scan was processed
    pub fn record_replacement_run(
        conn: &Connection,
        scan_id: i64,
        replaced: i64,
        next_replacement_date: i64,
        now: i64,
    ) -> Result<(), EngineError> {
        conn.execute(
            "UPDATE user_progress SET
                next_replacement_date = :next,
                last_replacement_date = CASE WHEN :replaced > 0 THEN :now ELSE last_replacement_date END,
                recommendations_replaced_count = recommendations_replaced_count + :replaced,
                updated_at = :now
             WHERE scan_id = :scan_id",
            named_params! {
                ":next":     next_replacement_date,
                ":replaced": replaced,
                ":now":      now,
                ":scan_id":  scan_id,
            },
        )?;
        Ok(())
    }

    fn load_batch_unlocks(conn: &Connection, scan_id: i64) -> Result<Vec<BatchUnlock>, EngineError> {
        let mut stmt = conn.prepare(
            "SELECT batch_number, unlocked_at, unlocked_count, is_initial
             FROM batch_unlocks
             WHERE scan_id = ?
             ORDER BY unlock_id ASC",
        )?;

        let unlocks = stmt
            .query_map([scan_id], |row| {
                Ok(BatchUnlock {
                    batch_number: row.get(0)?,
                    unlocked_at: row.get(1)?,
                    unlocked_count: row.get(2)?,
                    is_initial: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(unlocks)
    }
}
