use log::{debug, info, Level};
use logging_timer::timer;
use rusqlite::{named_params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::ReplacementConfig;
use crate::error::EngineError;
use crate::progress::{ProgressAggregator, UserProgress};
use crate::recommendations::{NewRecommendation, Recommendation, RecordStore, Scope};

/// One stale recommendation swapped for fresh content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Replacement {
    pub scan_id: i64,
    pub old_id: i64,
    pub new_id: i64,
}

/// Supplies fresh content for a slot being replaced.
///
/// Called inside the replacing transaction, so a source backed by the same
/// database consumes its content atomically with the replacement.
pub trait ReplacementSource {
    fn take_replacement(
        &self,
        conn: &Connection,
        stale: &Recommendation,
    ) -> Result<Option<NewRecommendation>, EngineError>;
}

/// Replacement content queued ahead of time by the generation service,
/// handed out oldest first
pub struct CandidatePool;

impl CandidatePool {
    pub fn add(
        conn: &Connection,
        scan_id: i64,
        candidates: &[NewRecommendation],
        now: i64,
    ) -> Result<usize, EngineError> {
        if !UserProgress::exists(conn, scan_id)? {
            return Err(EngineError::scan_not_found(scan_id));
        }

        if candidates
            .iter()
            .any(|c| c.recommendation_text.trim().is_empty())
        {
            return Err(EngineError::Error(
                "Replacement candidate has empty recommendation text".to_string(),
            ));
        }

        let mut stmt = conn.prepare(
            "INSERT INTO replacement_candidates (
                scan_id, category, recommendation_text, scope, page_url, required_elements, created_at
            ) VALUES (:scan_id, :category, :text, :scope, :page_url, :required, :now)",
        )?;

        for candidate in candidates {
            let required = serde_json::to_string(&candidate.required_elements)
                .map_err(|e| EngineError::Error(format!("Failed to serialize required elements: {}", e)))?;

            stmt.execute(named_params! {
                ":scan_id":  scan_id,
                ":category": candidate.category,
                ":text":     candidate.recommendation_text,
                ":scope":    candidate.scope.as_i64(),
                ":page_url": candidate.page_url,
                ":required": required,
                ":now":      now,
            })?;
        }

        Ok(candidates.len())
    }

    pub fn count(conn: &Connection, scan_id: i64) -> Result<i64, EngineError> {
        let count = conn.query_row(
            "SELECT COUNT(*) FROM replacement_candidates WHERE scan_id = ?",
            [scan_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

impl ReplacementSource for CandidatePool {
    fn take_replacement(
        &self,
        conn: &Connection,
        stale: &Recommendation,
    ) -> Result<Option<NewRecommendation>, EngineError> {
        let row = conn
            .query_row(
                "SELECT candidate_id, category, recommendation_text, scope, page_url, required_elements
                 FROM replacement_candidates
                 WHERE scan_id = ?
                 ORDER BY candidate_id ASC
                 LIMIT 1",
                [stale.scan_id()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((candidate_id, category, text, scope, page_url, required)) = row else {
            return Ok(None);
        };

        conn.execute(
            "DELETE FROM replacement_candidates WHERE candidate_id = ?",
            [candidate_id],
        )?;

        let scope = Scope::from_i64(scope).ok_or_else(|| {
            EngineError::Error(format!("Candidate {} has unknown scope {}", candidate_id, scope))
        })?;
        let required_elements = serde_json::from_str(&required).map_err(|e| {
            EngineError::Error(format!(
                "Candidate {} has malformed required elements: {}",
                candidate_id, e
            ))
        })?;

        Ok(Some(NewRecommendation {
            category,
            recommendation_text: text,
            scope,
            page_url,
            required_elements,
            batch_number: stale.batch_number(),
        }))
    }
}

pub struct ReplacementScheduler {
    config: ReplacementConfig,
}

impl ReplacementScheduler {
    pub fn new(config: ReplacementConfig) -> Self {
        ReplacementScheduler { config }
    }

    /// First replacement date for a scan created at `now`
    pub fn first_due_date(&self, now: i64) -> i64 {
        now + self.config.interval_secs()
    }

    pub fn due_scans(&self, conn: &Connection, now: i64) -> Result<Vec<i64>, EngineError> {
        UserProgress::due_for_replacement(conn, now)
    }

    /// Replace the scan's stale recommendations and advance its schedule.
    ///
    /// A scan that is no longer due (another sweep got there first) is left
    /// untouched.
    ///
    /// IMPORTANT: Caller must hold the scan lock and an immediate transaction
    pub fn replace_for_scan(
        &self,
        conn: &Connection,
        scan_id: i64,
        now: i64,
        source: &dyn ReplacementSource,
    ) -> Result<Vec<Replacement>, EngineError> {
        let _tmr = timer!(Level::Trace; "ReplacementScheduler::replace_for_scan", "scan {}", scan_id);

        let progress = UserProgress::get_existing(conn, scan_id)?;
        match progress.next_replacement_date {
            Some(due) if due <= now => {}
            _ => {
                debug!("Scan {}: replacement not due, skipping", scan_id);
                return Ok(Vec::new());
            }
        }

        let limit = progress.target_active_count.max(0) as usize;
        let cutoff = now - self.config.stale_after_secs();
        let stale = RecordStore::list_stale(conn, scan_id, cutoff, limit)?;

        let mut replaced = Vec::new();
        for old in &stale {
            let Some(fresh) = source.take_replacement(conn, old)? else {
                debug!(
                    "Scan {}: no replacement content for recommendation {}",
                    scan_id,
                    old.recommendation_id()
                );
                break;
            };

            let new = RecordStore::append_replacement(conn, old.recommendation_id(), &fresh, now)?;
            replaced.push(Replacement {
                scan_id,
                old_id: old.recommendation_id(),
                new_id: new.recommendation_id(),
            });
        }

        UserProgress::record_replacement_run(
            conn,
            scan_id,
            replaced.len() as i64,
            now + self.config.interval_secs(),
            now,
        )?;

        if !replaced.is_empty() {
            ProgressAggregator::recompute(conn, scan_id, now)?;
            info!(
                "Scan {}: replaced {} stale recommendation(s)",
                scan_id,
                replaced.len()
            );
        }

        Ok(replaced)
    }
}
