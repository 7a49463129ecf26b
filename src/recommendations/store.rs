use std::collections::HashSet;

use log::debug;
use rusqlite::{named_params, params, params_from_iter, Connection, OptionalExtension};

use super::recommendation::{NewRecommendation, Recommendation, ValidationStatus};
use super::unlock_state::UnlockState;
use crate::error::EngineError;

/// Durable recommendation records.
///
/// Every function takes the connection it should run on. Functions that write
/// more than one row expect the caller to hold an immediate transaction
/// (see `Database::immediate_transaction`) so partial application is never
/// visible to another connection.
pub struct RecordStore;

impl RecordStore {
    pub fn get(conn: &Connection, recommendation_id: i64) -> Result<Option<Recommendation>, EngineError> {
        let sql = format!(
            "SELECT {} FROM recommendations WHERE recommendation_id = ?",
            Recommendation::SELECT_COLUMNS
        );

        conn.query_row(&sql, [recommendation_id], Recommendation::from_row)
            .optional()
            .map_err(EngineError::DatabaseError)
    }

    /// Like [`RecordStore::get`] but a missing id is an error
    pub fn get_existing(conn: &Connection, recommendation_id: i64) -> Result<Recommendation, EngineError> {
        Self::get(conn, recommendation_id)?
            .ok_or_else(|| EngineError::recommendation_not_found(recommendation_id))
    }

    /// All records for a scan, superseded ones included, ordered by id
    pub fn list_by_scan(conn: &Connection, scan_id: i64) -> Result<Vec<Recommendation>, EngineError> {
        let sql = format!(
            "SELECT {} FROM recommendations WHERE scan_id = ? ORDER BY recommendation_id ASC",
            Recommendation::SELECT_COLUMNS
        );
        Self::query_list(conn, &sql, params![scan_id])
    }

    pub fn list_by_scan_and_state(
        conn: &Connection,
        scan_id: i64,
        state: UnlockState,
    ) -> Result<Vec<Recommendation>, EngineError> {
        Self::list_by_scan_in_states(conn, scan_id, &[state])
    }

    pub fn list_by_scan_in_states(
        conn: &Connection,
        scan_id: i64,
        states: &[UnlockState],
    ) -> Result<Vec<Recommendation>, EngineError> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; states.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM recommendations
             WHERE scan_id = ? AND unlock_state IN ({})
             ORDER BY recommendation_id ASC",
            Recommendation::SELECT_COLUMNS,
            placeholders
        );

        let values = std::iter::once(scan_id).chain(states.iter().map(UnlockState::as_i64));
        Self::query_list(conn, &sql, params_from_iter(values))
    }

    pub fn count_by_scan_in_states(
        conn: &Connection,
        scan_id: i64,
        states: &[UnlockState],
    ) -> Result<i64, EngineError> {
        let placeholders = vec!["?"; states.len().max(1)].join(", ");
        let sql = format!(
            "SELECT COUNT(*) FROM recommendations WHERE scan_id = ? AND unlock_state IN ({})",
            placeholders
        );

        let values: Vec<i64> = if states.is_empty() {
            vec![scan_id, -1]
        } else {
            std::iter::once(scan_id)
                .chain(states.iter().map(UnlockState::as_i64))
                .collect()
        };

        let count = conn.query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count)
    }

    /// Insert a freshly generated record. Returns the new id.
    pub fn insert(
        conn: &Connection,
        scan_id: i64,
        user_id: i64,
        new: &NewRecommendation,
        state: UnlockState,
        previous_recommendation_id: Option<i64>,
        now: i64,
    ) -> Result<i64, EngineError> {
        let required_json = serde_json::to_string(&new.required_elements)
            .map_err(|e| EngineError::Error(format!("Failed to serialize required elements: {}", e)))?;

        let unlocked_at = if state == UnlockState::Locked { None } else { Some(now) };

        let recommendation_id: i64 = conn.query_row(
            "INSERT INTO recommendations (
                scan_id, user_id, category, recommendation_text, scope, page_url,
                required_elements, unlock_state, batch_number, progress_percentage,
                previous_recommendation_id, created_at, unlocked_at, updated_at
            ) VALUES (
                :scan_id, :user_id, :category, :text, :scope, :page_url,
                :required, :state, :batch, 0,
                :previous, :now, :unlocked_at, :now
            )
            RETURNING recommendation_id",
            named_params! {
                ":scan_id":     scan_id,
                ":user_id":     user_id,
                ":category":    new.category,
                ":text":        new.recommendation_text,
                ":scope":       new.scope.as_i64(),
                ":page_url":    new.page_url,
                ":required":    required_json,
                ":state":       state.as_i64(),
                ":batch":       new.batch_number,
                ":previous":    previous_recommendation_id,
                ":now":         now,
                ":unlocked_at": unlocked_at,
            },
            |row| row.get(0),
        )?;

        Ok(recommendation_id)
    }

    /// Move a record to `new_state`, enforcing the transition table.
    ///
    /// Stamps `unlocked_at` on entering `active` and `completed_at` on entering
    /// `completed`. Returns the state the record was in before the change.
    pub fn update_state(
        conn: &Connection,
        recommendation_id: i64,
        new_state: UnlockState,
        now: i64,
    ) -> Result<UnlockState, EngineError> {
        let current = Self::current_state(conn, recommendation_id)?;

        if !current.can_transition_to(new_state) {
            return Err(EngineError::InvalidTransition {
                id: recommendation_id,
                from: current,
                to: new_state,
            });
        }

        conn.execute(
            "UPDATE recommendations SET
                unlock_state = :state,
                unlocked_at = CASE WHEN :state = :active THEN :now ELSE unlocked_at END,
                completed_at = CASE WHEN :state = :completed THEN :now ELSE completed_at END,
                updated_at = :now
             WHERE recommendation_id = :id",
            named_params! {
                ":state":     new_state.as_i64(),
                ":active":    UnlockState::Active.as_i64(),
                ":completed": UnlockState::Completed.as_i64(),
                ":now":       now,
                ":id":        recommendation_id,
            },
        )?;

        debug!(
            "Recommendation {}: {} -> {}",
            recommendation_id, current, new_state
        );

        Ok(current)
    }

    /// Supersede `old_id` with fresh content in the same slot.
    ///
    /// The old record becomes `skipped` and the new one links back to it via
    /// `previous_recommendation_id`, inheriting its batch. A locked slot stays
    /// locked; any other slot is re-opened as `active`.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn append_replacement(
        conn: &Connection,
        old_id: i64,
        new: &NewRecommendation,
        now: i64,
    ) -> Result<Recommendation, EngineError> {
        let old = Self::get_existing(conn, old_id)?;

        let new_state = if old.unlock_state() == UnlockState::Locked {
            UnlockState::Locked
        } else {
            UnlockState::Active
        };

        Self::update_state(conn, old_id, UnlockState::Skipped, now)?;

        let slot = NewRecommendation {
            batch_number: old.batch_number(),
            ..new.clone()
        };
        let new_id = Self::insert(
            conn,
            old.scan_id(),
            old.user_id(),
            &slot,
            new_state,
            Some(old_id),
            now,
        )?;

        Self::get_existing(conn, new_id)
    }

    pub fn set_progress(
        conn: &Connection,
        recommendation_id: i64,
        progress_percentage: i64,
        now: i64,
    ) -> Result<(), EngineError> {
        if !(0..=100).contains(&progress_percentage) {
            return Err(EngineError::Error(format!(
                "Progress percentage must be between 0 and 100, got {}",
                progress_percentage
            )));
        }

        let rows = conn.execute(
            "UPDATE recommendations SET progress_percentage = ?, updated_at = ? WHERE recommendation_id = ?",
            params![progress_percentage, now, recommendation_id],
        )?;

        if rows == 0 {
            return Err(EngineError::recommendation_not_found(recommendation_id));
        }
        Ok(())
    }

    /// Record the latest validation result on the record itself
    pub fn set_validation(
        conn: &Connection,
        recommendation_id: i64,
        status: ValidationStatus,
        progress_percentage: Option<i64>,
        now: i64,
    ) -> Result<(), EngineError> {
        let rows = conn.execute(
            "UPDATE recommendations SET
                validation_status = ?1,
                progress_percentage = COALESCE(?2, progress_percentage),
                last_validated_at = ?3,
                updated_at = ?3
             WHERE recommendation_id = ?4",
            params![status.as_i64(), progress_percentage, now, recommendation_id],
        )?;

        if rows == 0 {
            return Err(EngineError::recommendation_not_found(recommendation_id));
        }
        Ok(())
    }

    /// Lowest batch number that still has locked records, with up to `limit`
    /// of its locked ids in ascending order.
    pub fn next_locked_batch(
        conn: &Connection,
        scan_id: i64,
        limit: usize,
    ) -> Result<Option<(i64, Vec<i64>)>, EngineError> {
        let batch_number: Option<i64> = conn.query_row(
            "SELECT MIN(batch_number) FROM recommendations WHERE scan_id = ? AND unlock_state = ?",
            params![scan_id, UnlockState::Locked.as_i64()],
            |row| row.get(0),
        )?;

        let Some(batch_number) = batch_number else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT recommendation_id FROM recommendations
             WHERE scan_id = ? AND batch_number = ? AND unlock_state = ?
             ORDER BY recommendation_id ASC
             LIMIT ?",
        )?;

        let ids = stmt
            .query_map(
                params![
                    scan_id,
                    batch_number,
                    UnlockState::Locked.as_i64(),
                    limit as i64
                ],
                |row| row.get(0),
            )?
            .collect::<Result<Vec<i64>, _>>()?;

        Ok(Some((batch_number, ids)))
    }

    /// Active records with no recorded progress that were unlocked at or before `cutoff`
    pub fn list_stale(
        conn: &Connection,
        scan_id: i64,
        cutoff: i64,
        limit: usize,
    ) -> Result<Vec<Recommendation>, EngineError> {
        let sql = format!(
            "SELECT {} FROM recommendations
             WHERE scan_id = ?
               AND unlock_state = ?
               AND progress_percentage = 0
               AND unlocked_at IS NOT NULL
               AND unlocked_at <= ?
             ORDER BY recommendation_id ASC
             LIMIT ?",
            Recommendation::SELECT_COLUMNS
        );

        Self::query_list(
            conn,
            &sql,
            params![scan_id, UnlockState::Active.as_i64(), cutoff, limit as i64],
        )
    }

    /// Lineage of a record, newest first, ending at the originally generated record
    pub fn replacement_chain(conn: &Connection, recommendation_id: i64) -> Result<Vec<Recommendation>, EngineError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(recommendation_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(EngineError::Error(format!(
                    "Replacement chain for recommendation {} loops at {}",
                    recommendation_id, id
                )));
            }
            let rec = Self::get_existing(conn, id)?;
            next = rec.previous_recommendation_id();
            chain.push(rec);
        }

        Ok(chain)
    }

    /// Id of the record that replaced `recommendation_id`, if any
    pub fn superseded_by(conn: &Connection, recommendation_id: i64) -> Result<Option<i64>, EngineError> {
        conn.query_row(
            "SELECT recommendation_id FROM recommendations WHERE previous_recommendation_id = ?",
            [recommendation_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(EngineError::DatabaseError)
    }

    fn current_state(conn: &Connection, recommendation_id: i64) -> Result<UnlockState, EngineError> {
        let raw: Option<i64> = conn
            .query_row(
                "SELECT unlock_state FROM recommendations WHERE recommendation_id = ?",
                [recommendation_id],
                |row| row.get(0),
            )
            .optional()?;

        let raw = raw.ok_or_else(|| EngineError::recommendation_not_found(recommendation_id))?;
        UnlockState::from_i64(raw).ok_or_else(|| {
            EngineError::Error(format!(
                "Recommendation {} has unknown unlock_state {}",
                recommendation_id, raw
            ))
        })
    }

    fn query_list<P: rusqlite::Params>(
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Recommendation>, EngineError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Recommendation::from_row)?;

        rows.collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::DatabaseError)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::recommendations::Scope;

    pub fn new_rec(text: &str, batch_number: i64) -> NewRecommendation {
        NewRecommendation {
            category: "content".to_string(),
            recommendation_text: text.to_string(),
            scope: Scope::SiteWide,
            page_url: None,
            required_elements: vec!["h1".to_string(), "meta description".to_string()],
            batch_number,
        }
    }

    pub fn page_rec(text: &str, batch_number: i64, page_url: &str) -> NewRecommendation {
        NewRecommendation {
            scope: Scope::PageSpecific,
            page_url: Some(page_url.to_string()),
            ..new_rec(text, batch_number)
        }
    }

    /// Minimal user_progress row so foreign keys are satisfied
    pub fn seed_scan(conn: &Connection, scan_id: i64, user_id: i64) {
        conn.execute(
            "INSERT INTO user_progress (scan_id, user_id, total_batches, created_at, updated_at)
             VALUES (?, ?, 1, 0, 0)",
            params![scan_id, user_id],
        )
        .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::db::test_support::temp_db;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_insert_and_get() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 10, 1);

        let id = RecordStore::insert(&conn, 10, 1, &new_rec("Add alt text", 1), UnlockState::Active, None, 100)
            .unwrap();
        let rec = RecordStore::get_existing(&conn, id).unwrap();

        assert_eq!(rec.scan_id(), 10);
        assert_eq!(rec.unlock_state(), UnlockState::Active);
        assert_eq!(rec.unlocked_at(), Some(100));
        assert_eq!(rec.required_elements(), &["h1".to_string(), "meta description".to_string()]);
        assert_eq!(rec.validation_status(), None);
        assert!(RecordStore::get(&conn, id + 1).unwrap().is_none());
        assert!(matches!(
            RecordStore::get_existing(&conn, id + 1),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_update_state_enforces_transition_table() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let id = RecordStore::insert(&conn, 1, 1, &new_rec("a", 2), UnlockState::Locked, None, 0).unwrap();

        let err = RecordStore::update_state(&conn, id, UnlockState::Completed, 5).unwrap_err();
        match err {
            EngineError::InvalidTransition { id: err_id, from, to } => {
                assert_eq!(err_id, id);
                assert_eq!(from, UnlockState::Locked);
                assert_eq!(to, UnlockState::Completed);
            }
            other => panic!("unexpected error {:?}", other),
        }

        let prev = RecordStore::update_state(&conn, id, UnlockState::Active, 5).unwrap();
        assert_eq!(prev, UnlockState::Locked);
        RecordStore::update_state(&conn, id, UnlockState::Completed, 9).unwrap();

        let rec = RecordStore::get_existing(&conn, id).unwrap();
        assert_eq!(rec.unlocked_at(), Some(5));
        assert_eq!(rec.completed_at(), Some(9));
    }

    #[test]
    fn test_update_state_unknown_id() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        assert!(matches!(
            RecordStore::update_state(&conn, 99, UnlockState::Active, 0),
            Err(EngineError::NotFound { id: 99, .. })
        ));
    }

    #[test]
    fn test_list_by_scan_and_state_orders_by_id() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        seed_scan(&conn, 2, 1);

        let a = RecordStore::insert(&conn, 1, 1, &new_rec("a", 1), UnlockState::Active, None, 0).unwrap();
        RecordStore::insert(&conn, 1, 1, &new_rec("b", 2), UnlockState::Locked, None, 0).unwrap();
        let c = RecordStore::insert(&conn, 1, 1, &new_rec("c", 1), UnlockState::Active, None, 0).unwrap();
        RecordStore::insert(&conn, 2, 1, &new_rec("d", 1), UnlockState::Active, None, 0).unwrap();

        let active: Vec<i64> = RecordStore::list_by_scan_and_state(&conn, 1, UnlockState::Active)
            .unwrap()
            .iter()
            .map(Recommendation::recommendation_id)
            .collect();
        assert_eq!(active, vec![a, c]);

        assert_eq!(
            RecordStore::count_by_scan_in_states(&conn, 1, &[UnlockState::Active, UnlockState::Locked]).unwrap(),
            3
        );
        assert_eq!(RecordStore::count_by_scan_in_states(&conn, 1, &[]).unwrap(), 0);
        assert!(RecordStore::list_by_scan_in_states(&conn, 1, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_next_locked_batch_picks_lowest_batch_and_ids() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);

        let mut batch2 = Vec::new();
        for i in 0..4 {
            batch2.push(
                RecordStore::insert(&conn, 1, 1, &new_rec(&format!("b2-{}", i), 2), UnlockState::Locked, None, 0)
                    .unwrap(),
            );
        }
        RecordStore::insert(&conn, 1, 1, &new_rec("b3", 3), UnlockState::Locked, None, 0).unwrap();

        let (batch, ids) = RecordStore::next_locked_batch(&conn, 1, 3).unwrap().unwrap();
        assert_eq!(batch, 2);
        assert_eq!(ids, batch2[..3].to_vec());

        // Same input state, same answer
        let (_, again) = RecordStore::next_locked_batch(&conn, 1, 3).unwrap().unwrap();
        assert_eq!(again, ids);

        assert!(RecordStore::next_locked_batch(&conn, 2, 3).unwrap().is_none());
    }

    #[test]
    fn test_append_replacement_links_and_skips_old() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let old_id = RecordStore::insert(&conn, 1, 1, &new_rec("old", 2), UnlockState::Locked, None, 0).unwrap();
        RecordStore::update_state(&conn, old_id, UnlockState::Active, 1).unwrap();

        let replacement = Database::immediate_transaction(&conn, |c| {
            RecordStore::append_replacement(c, old_id, &new_rec("fresh", 7), 50)
        })
        .unwrap();

        let old = RecordStore::get_existing(&conn, old_id).unwrap();
        assert_eq!(old.unlock_state(), UnlockState::Skipped);
        assert_eq!(replacement.previous_recommendation_id(), Some(old_id));
        assert_eq!(replacement.unlock_state(), UnlockState::Active);
        assert_eq!(replacement.batch_number(), 2);
        assert_eq!(replacement.recommendation_text(), "fresh");
        assert_eq!(RecordStore::superseded_by(&conn, old_id).unwrap(), Some(replacement.recommendation_id()));

        let chain: Vec<i64> = RecordStore::replacement_chain(&conn, replacement.recommendation_id())
            .unwrap()
            .iter()
            .map(Recommendation::recommendation_id)
            .collect();
        assert_eq!(chain, vec![replacement.recommendation_id(), old_id]);
    }

    #[test]
    fn test_append_replacement_is_all_or_nothing() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let old_id = RecordStore::insert(&conn, 1, 1, &new_rec("old", 1), UnlockState::Active, None, 0).unwrap();

        // The old record is marked first; the insert then fails on the empty text,
        // simulating a crash after the first write.
        let result = Database::immediate_transaction(&conn, |c| {
            RecordStore::append_replacement(c, old_id, &new_rec("   ", 1), 50)
        });
        assert!(result.is_err());

        let old = RecordStore::get_existing(&conn, old_id).unwrap();
        assert_eq!(old.unlock_state(), UnlockState::Active);
        assert_eq!(RecordStore::superseded_by(&conn, old_id).unwrap(), None);
        assert_eq!(RecordStore::list_by_scan(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_append_replacement_rejects_skipped_record() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let old_id = RecordStore::insert(&conn, 1, 1, &new_rec("old", 1), UnlockState::Active, None, 0).unwrap();
        RecordStore::update_state(&conn, old_id, UnlockState::Skipped, 1).unwrap();

        let result = Database::immediate_transaction(&conn, |c| {
            RecordStore::append_replacement(c, old_id, &new_rec("fresh", 1), 50)
        });
        assert!(matches!(
            result,
            Err(EngineError::InvalidTransition {
                from: UnlockState::Skipped,
                ..
            })
        ));
        assert_eq!(RecordStore::list_by_scan(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_set_progress_bounds() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let id = RecordStore::insert(&conn, 1, 1, &new_rec("a", 1), UnlockState::Active, None, 0).unwrap();

        RecordStore::set_progress(&conn, id, 40, 3).unwrap();
        assert_eq!(RecordStore::get_existing(&conn, id).unwrap().progress_percentage(), 40);
        assert!(RecordStore::set_progress(&conn, id, 101, 3).is_err());
        assert!(RecordStore::set_progress(&conn, id, -1, 3).is_err());
        assert!(matches!(
            RecordStore::set_progress(&conn, id + 1, 10, 3),
            Err(EngineError::NotFound { .. })
        ));
    }

    #[test]
    fn test_records_are_never_deleted() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let id = RecordStore::insert(&conn, 1, 1, &new_rec("a", 1), UnlockState::Active, None, 0).unwrap();

        let result = conn.execute("DELETE FROM recommendations WHERE recommendation_id = ?", [id]);
        assert!(result.is_err());
        assert!(RecordStore::get(&conn, id).unwrap().is_some());
    }

    #[test]
    fn test_list_stale() {
        let (_dir, db) = temp_db();
        let conn = db.get_connection().unwrap();
        seed_scan(&conn, 1, 1);
        let old = RecordStore::insert(&conn, 1, 1, &new_rec("old", 1), UnlockState::Active, None, 10).unwrap();
        let started = RecordStore::insert(&conn, 1, 1, &new_rec("started", 1), UnlockState::Active, None, 10).unwrap();
        RecordStore::set_progress(&conn, started, 20, 11).unwrap();
        RecordStore::insert(&conn, 1, 1, &new_rec("recent", 1), UnlockState::Active, None, 500).unwrap();
        RecordStore::insert(&conn, 1, 1, &new_rec("locked", 2), UnlockState::Locked, None, 10).unwrap();

        let stale: Vec<i64> = RecordStore::list_stale(&conn, 1, 100, 10)
            .unwrap()
            .iter()
            .map(Recommendation::recommendation_id)
            .collect();
        assert_eq!(stale, vec![old]);
    }
}
