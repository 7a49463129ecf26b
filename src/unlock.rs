use log::{debug, info, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::config::UnlockConfig;
use crate::error::EngineError;
use crate::progress::{ProgressAggregator, ProgressSnapshot, UserProgress};
use crate::recommendations::{Recommendation, RecordStore, UnlockState};

/// Why an unlock attempt did not unlock anything.
///
/// These are ordinary answers, not failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectedReason {
    /// Open recommendations must be finished first
    ActiveRemaining { count: i64 },
    /// The rolling window's unlock allowance is used up
    DailyLimit { next_eligible_at: i64 },
    /// Nothing left to unlock
    #[serde(rename = "all_unlocked")]
    AllBatchesUnlocked,
}

impl RejectedReason {
    /// Machine readable reason code
    pub fn code(&self) -> &'static str {
        match self {
            RejectedReason::ActiveRemaining { .. } => "active_remaining",
            RejectedReason::DailyLimit { .. } => "daily_limit",
            RejectedReason::AllBatchesUnlocked => "all_unlocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnlockResult {
    pub scan_id: i64,
    pub batch_number: i64,
    pub unlocked_count: i64,
    pub recommendations: Vec<Recommendation>,
    /// This unlock used the last allowance of the current window
    pub daily_limit_reached: bool,
    pub progress: ProgressSnapshot,
    pub unlocked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnlockOutcome {
    Unlocked(UnlockResult),
    Rejected(RejectedReason),
}

pub struct BatchUnlockScheduler {
    config: UnlockConfig,
}

impl BatchUnlockScheduler {
    pub fn new(config: UnlockConfig) -> Self {
        BatchUnlockScheduler { config }
    }

    /// Check the unlock preconditions in order and, if all pass, open the
    /// next batch.
    ///
    /// IMPORTANT: Caller must hold the scan lock and an immediate transaction
    pub fn attempt_unlock(
        &self,
        conn: &Connection,
        scan_id: i64,
        now: i64,
    ) -> Result<UnlockOutcome, EngineError> {
        let _tmr = timer!(Level::Trace; "BatchUnlockScheduler::attempt_unlock", "scan {}", scan_id);

        if !UserProgress::exists(conn, scan_id)? {
            return Err(EngineError::scan_not_found(scan_id));
        }

        let open = RecordStore::count_by_scan_in_states(
            conn,
            scan_id,
            &[UnlockState::Active, UnlockState::InProgress],
        )?;
        if open > 0 {
            return Ok(self.reject(scan_id, RejectedReason::ActiveRemaining { count: open }));
        }

        let window_start = now - self.config.window_secs();
        let recent = UserProgress::unlocks_since(conn, scan_id, window_start)?;
        if recent.len() as u32 >= self.config.max_unlocks_per_window {
            let oldest_counted = recent.len() - self.config.max_unlocks_per_window as usize;
            let next_eligible_at = recent[oldest_counted] + self.config.window_secs();
            return Ok(self.reject(scan_id, RejectedReason::DailyLimit { next_eligible_at }));
        }

        let Some((batch_number, ids)) = RecordStore::next_locked_batch(conn, scan_id, self.config.batch_size)?
        else {
            return Ok(self.reject(scan_id, RejectedReason::AllBatchesUnlocked));
        };

        for id in &ids {
            RecordStore::update_state(conn, *id, UnlockState::Active, now)?;
        }

        let unlocked_count = ids.len() as i64;
        UserProgress::record_batch_unlock(conn, scan_id, batch_number, unlocked_count, false, now)?;

        let progress = ProgressAggregator::recompute(conn, scan_id, now)?;

        let recommendations = ids
            .iter()
            .map(|id| RecordStore::get_existing(conn, *id))
            .collect::<Result<Vec<_>, _>>()?;

        let daily_limit_reached = recent.len() as u32 + 1 >= self.config.max_unlocks_per_window;

        info!(
            "Scan {}: unlocked {} recommendation(s) from batch {}",
            scan_id, unlocked_count, batch_number
        );

        Ok(UnlockOutcome::Unlocked(UnlockResult {
            scan_id,
            batch_number,
            unlocked_count,
            recommendations,
            daily_limit_reached,
            progress,
            unlocked_at: now,
        }))
    }

    fn reject(&self, scan_id: i64, reason: RejectedReason) -> UnlockOutcome {
        debug!("Scan {}: unlock rejected ({})", scan_id, reason.code());
        UnlockOutcome::Rejected(reason)
    }
}
