use rusqlite::{named_params, Connection, Row};
use serde::Serialize;

use super::ElementMatch;
use crate::error::EngineError;
use crate::recommendations::{UnlockState, ValidationStatus};

/// One validation check, as recorded. Rows are never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationHistoryEntry {
    pub history_id: i64,
    pub recommendation_id: i64,
    pub scan_id: i64,
    pub checked_elements: Vec<String>,
    pub found_elements: Vec<String>,
    pub missing_elements: Vec<String>,
    pub outcome: ValidationStatus,
    pub completion_percentage: i64,
    pub state_before: UnlockState,
    pub state_after: UnlockState,
    pub applied: bool,
    pub checked_at: i64,
}

/// Fields needed to append an entry
pub struct NewHistoryEntry<'a> {
    pub recommendation_id: i64,
    pub scan_id: i64,
    pub elements: &'a ElementMatch,
    pub outcome: ValidationStatus,
    pub completion_percentage: i64,
    pub state_before: UnlockState,
    pub state_after: UnlockState,
    pub applied: bool,
    pub checked_at: i64,
}

impl ValidationHistoryEntry {
    pub fn append(conn: &Connection, entry: &NewHistoryEntry) -> Result<i64, EngineError> {
        let to_json = |elements: &[String]| {
            serde_json::to_string(elements)
                .map_err(|e| EngineError::Error(format!("Failed to serialize elements: {}", e)))
        };

        let history_id = conn.query_row(
            "INSERT INTO validation_history (
                recommendation_id, scan_id, checked_elements, found_elements, missing_elements,
                outcome, completion_percentage, state_before, state_after, applied, checked_at
            ) VALUES (
                :rec_id, :scan_id, :checked, :found, :missing,
                :outcome, :pct, :before, :after, :applied, :checked_at
            )
            RETURNING history_id",
            named_params! {
                ":rec_id":     entry.recommendation_id,
                ":scan_id":    entry.scan_id,
                ":checked":    to_json(&entry.elements.checked)?,
                ":found":      to_json(&entry.elements.found)?,
                ":missing":    to_json(&entry.elements.missing)?,
                ":outcome":    entry.outcome.as_i64(),
                ":pct":        entry.completion_percentage,
                ":before":     entry.state_before.as_i64(),
                ":after":      entry.state_after.as_i64(),
                ":applied":    entry.applied,
                ":checked_at": entry.checked_at,
            },
            |row| row.get(0),
        )?;

        Ok(history_id)
    }

    /// Full trail for one recommendation, oldest first
    pub fn list_for_recommendation(
        conn: &Connection,
        recommendation_id: i64,
    ) -> Result<Vec<Self>, EngineError> {
        let mut stmt = conn.prepare(
            "SELECT history_id, recommendation_id, scan_id, checked_elements, found_elements,
                    missing_elements, outcome, completion_percentage, state_before, state_after,
                    applied, checked_at
             FROM validation_history
             WHERE recommendation_id = ?
             ORDER BY history_id ASC",
        )?;

        let rows = stmt.query_map([recommendation_id], Self::from_row)?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(EngineError::DatabaseError)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let json_col = |idx: usize| -> rusqlite::Result<Vec<String>> {
            let raw: String = row.get(idx)?;
            serde_json::from_str(&raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })
        };

        let outcome_raw: i64 = row.get(6)?;
        let before_raw: i64 = row.get(8)?;
        let after_raw: i64 = row.get(9)?;

        Ok(ValidationHistoryEntry {
            history_id: row.get(0)?,
            recommendation_id: row.get(1)?,
            scan_id: row.get(2)?,
            checked_elements: json_col(3)?,
            found_elements: json_col(4)?,
            missing_elements: json_col(5)?,
            outcome: ValidationStatus::from_i64(outcome_raw).ok_or_else(|| invalid_enum(6, "outcome"))?,
            completion_percentage: row.get(7)?,
            state_before: UnlockState::from_i64(before_raw).ok_or_else(|| invalid_enum(8, "state_before"))?,
            state_after: UnlockState::from_i64(after_raw).ok_or_else(|| invalid_enum(9, "state_after"))?,
            applied: row.get(10)?,
            checked_at: row.get(11)?,
        })
    }
}

fn invalid_enum(idx: usize, column: &str) -> rusqlite::Error {
    rusqlite::Error::InvalidColumnType(idx, column.to_string(), rusqlite::types::Type::Integer)
}
