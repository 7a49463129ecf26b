mod findings;
mod history;

use log::{debug, Level};
use logging_timer::timer;
use rusqlite::Connection;
use serde::Serialize;

use crate::error::EngineError;
use crate::recommendations::{RecordStore, UnlockState, ValidationStatus};

pub use findings::{ElementMatch, LiveFindings};
pub use history::{NewHistoryEntry, ValidationHistoryEntry};

/// What one validation call observed and did
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    pub recommendation_id: i64,
    pub scan_id: i64,
    pub outcome: ValidationStatus,
    pub completion_percentage: i64,
    pub elements: ElementMatch,
    pub state_before: UnlockState,
    pub state_after: UnlockState,
    /// State the outcome asked for, if any
    pub proposed_state: Option<UnlockState>,
    /// False when the record could not take the result (skipped, or the
    /// proposed transition is not allowed from its current state)
    pub applied: bool,
    pub history_id: i64,
    pub checked_at: i64,
}

/// Classify a match. `ever_completed` separates a regression from work that
/// was never done.
pub fn classify(elements: &ElementMatch, ever_completed: bool) -> (ValidationStatus, i64) {
    if elements.checked.is_empty() {
        return (ValidationStatus::PendingValidation, 0);
    }

    let pct = elements.completion_percentage();

    let status = if elements.missing.is_empty() {
        ValidationStatus::VerifiedComplete
    } else if !elements.found.is_empty() {
        ValidationStatus::PartialProgress
    } else if ever_completed {
        ValidationStatus::Regressed
    } else {
        ValidationStatus::NotImplemented
    };

    (status, pct)
}

/// The state a validation result moves a record toward
pub fn proposed_state(current: UnlockState, outcome: ValidationStatus) -> Option<UnlockState> {
    match outcome {
        ValidationStatus::VerifiedComplete => match current {
            UnlockState::Completed | UnlockState::Verified => Some(UnlockState::Verified),
            _ => Some(UnlockState::Completed),
        },
        ValidationStatus::PartialProgress | ValidationStatus::Regressed => Some(UnlockState::InProgress),
        ValidationStatus::NotImplemented | ValidationStatus::PendingValidation => None,
    }
}

pub struct ValidationEngine;

impl ValidationEngine {
    /// Match, classify and record in one step.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn validate(
        conn: &Connection,
        recommendation_id: i64,
        findings: &LiveFindings,
        now: i64,
    ) -> Result<ValidationOutcome, EngineError> {
        let rec = RecordStore::get_existing(conn, recommendation_id)?;
        let elements = ElementMatch::compute(rec.required_elements(), findings);
        Self::record(conn, recommendation_id, elements, now)
    }

    /// Classify an already computed match against the record's current
    /// state, append history and apply the proposed transition if allowed.
    ///
    /// IMPORTANT: Caller must hold an immediate transaction
    pub fn record(
        conn: &Connection,
        recommendation_id: i64,
        elements: ElementMatch,
        now: i64,
    ) -> Result<ValidationOutcome, EngineError> {
        let _tmr = timer!(Level::Trace; "ValidationEngine::record", "recommendation {}", recommendation_id);

        let rec = RecordStore::get_existing(conn, recommendation_id)?;
        let current = rec.unlock_state();

        // completed_at survives a later regression to in_progress
        let ever_completed = current.is_done() || rec.completed_at().is_some();

        let (outcome, completion_percentage) = classify(&elements, ever_completed);
        let proposal = proposed_state(current, outcome);

        let (applied, state_after) = if current.is_terminal() {
            (false, current)
        } else {
            match proposal {
                None => (true, current),
                Some(next) if next == current => (true, current),
                Some(next) if current.can_transition_to(next) => (true, next),
                Some(_) => (false, current),
            }
        };

        if applied {
            if state_after != current {
                RecordStore::update_state(conn, recommendation_id, state_after, now)?;
            }
            let pct = match outcome {
                ValidationStatus::PendingValidation => None,
                _ => Some(completion_percentage),
            };
            RecordStore::set_validation(conn, recommendation_id, outcome, pct, now)?;
        }

        let history_id = ValidationHistoryEntry::append(
            conn,
            &NewHistoryEntry {
                recommendation_id,
                scan_id: rec.scan_id(),
                elements: &elements,
                outcome,
                completion_percentage,
                state_before: current,
                state_after,
                applied,
                checked_at: now,
            },
        )?;

        debug!(
            "Validated recommendation {}: {} ({}%), {} -> {}{}",
            recommendation_id,
            outcome,
            completion_percentage,
            current,
            state_after,
            if applied { "" } else { " (not applied)" }
        );

        Ok(ValidationOutcome {
            recommendation_id,
            scan_id: rec.scan_id(),
            outcome,
            completion_percentage,
            elements,
            state_before: current,
            state_after,
            proposed_state: proposal,
            applied,
            history_id,
            checked_at: now,
        })
    }
}
