use std::fmt;

use log::warn;
use rusqlite::types::Type;
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use super::unlock_state::UnlockState;

/// Whether a recommendation applies to the whole domain or to one scanned page.
/// Decided at generation time; a recommendation belongs to exactly one scope.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    SiteWide = 0,
    PageSpecific = 1,
}

impl Scope {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Scope::SiteWide),
            1 => Some(Scope::PageSpecific),
            _ => None,
        }
    }
}

/// Result of the most recent validation of a recommendation.
/// Stored as integer in `recommendations.validation_status` and `validation_history.outcome`.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    PendingValidation = 0,
    VerifiedComplete = 1,
    PartialProgress = 2,
    NotImplemented = 3,
    Regressed = 4,
}

impl ValidationStatus {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(ValidationStatus::PendingValidation),
            1 => Some(ValidationStatus::VerifiedComplete),
            2 => Some(ValidationStatus::PartialProgress),
            3 => Some(ValidationStatus::NotImplemented),
            4 => Some(ValidationStatus::Regressed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::PendingValidation => "pending_validation",
            ValidationStatus::VerifiedComplete => "verified_complete",
            ValidationStatus::PartialProgress => "partial_progress",
            ValidationStatus::NotImplemented => "not_implemented",
            ValidationStatus::Regressed => "regressed",
        }
    }
}

impl fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_batch_number() -> i64 {
    1
}

/// Recommendation content as delivered by the generation service.
///
/// Used both for the initial bulk insert of a scan and for queued replacement
/// candidates. `batch_number` is ignored for replacements, which inherit the
/// slot of the record they supersede.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecommendation {
    pub category: String,
    pub recommendation_text: String,
    pub scope: Scope,
    #[serde(default)]
    pub page_url: Option<String>,
    #[serde(default)]
    pub required_elements: Vec<String>,
    #[serde(default = "default_batch_number")]
    pub batch_number: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    recommendation_id: i64,
    scan_id: i64,
    user_id: i64,
    category: String,
    recommendation_text: String,
    scope: Scope,
    page_url: Option<String>,
    required_elements: Vec<String>,
    unlock_state: UnlockState,
    batch_number: i64,
    progress_percentage: i64,
    validation_status: Option<ValidationStatus>,
    previous_recommendation_id: Option<i64>,
    created_at: i64,
    unlocked_at: Option<i64>,
    completed_at: Option<i64>,
    last_validated_at: Option<i64>,
    updated_at: i64,
}

impl Recommendation {
    pub(crate) const SELECT_COLUMNS: &'static str = "recommendation_id, scan_id, user_id, category, recommendation_text,
        scope, page_url, required_elements, unlock_state, batch_number, progress_percentage,
        validation_status, previous_recommendation_id, created_at, unlocked_at, completed_at,
        last_validated_at, updated_at";

    /// Map a row selected with [`Recommendation::SELECT_COLUMNS`]
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let required_json: String = row.get(7)?;
        let required_elements: Vec<String> = serde_json::from_str(&required_json)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

        Ok(Recommendation {
            recommendation_id: row.get(0)?,
            scan_id: row.get(1)?,
            user_id: row.get(2)?,
            category: row.get(3)?,
            recommendation_text: row.get(4)?,
            scope: Scope::from_i64(row.get(5)?).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(5, "scope".to_string(), Type::Integer)
            })?,
            page_url: row.get(6)?,
            required_elements,
            unlock_state: UnlockState::from_i64(row.get(8)?).ok_or_else(|| {
                rusqlite::Error::InvalidColumnType(8, "unlock_state".to_string(), Type::Integer)
            })?,
            batch_number: row.get(9)?,
            progress_percentage: row.get(10)?,
            validation_status: row.get::<_, Option<i64>>(11)?.and_then(|v| {
                let status = ValidationStatus::from_i64(v);
                if status.is_none() {
                    warn!("Invalid validation_status value in database: {}, treating as unset", v);
                }
                status
            }),
            previous_recommendation_id: row.get(12)?,
            created_at: row.get(13)?,
            unlocked_at: row.get(14)?,
            completed_at: row.get(15)?,
            last_validated_at: row.get(16)?,
            updated_at: row.get(17)?,
        })
    }

    pub fn recommendation_id(&self) -> i64 {
        self.recommendation_id
    }

    pub fn scan_id(&self) -> i64 {
        self.scan_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn recommendation_text(&self) -> &str {
        &self.recommendation_text
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn page_url(&self) -> Option<&str> {
        self.page_url.as_deref()
    }

    pub fn required_elements(&self) -> &[String] {
        &self.required_elements
    }

    pub fn unlock_state(&self) -> UnlockState {
        self.unlock_state
    }

    pub fn batch_number(&self) -> i64 {
        self.batch_number
    }

    pub fn progress_percentage(&self) -> i64 {
        self.progress_percentage
    }

    pub fn validation_status(&self) -> Option<ValidationStatus> {
        self.validation_status
    }

    pub fn previous_recommendation_id(&self) -> Option<i64> {
        self.previous_recommendation_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn unlocked_at(&self) -> Option<i64> {
        self.unlocked_at
    }

    pub fn completed_at(&self) -> Option<i64> {
        self.completed_at
    }

    pub fn last_validated_at(&self) -> Option<i64> {
        self.last_validated_at
    }

    pub fn updated_at(&self) -> i64 {
        self.updated_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_round_trip_values() {
        assert_eq!(Scope::from_i64(Scope::SiteWide.as_i64()), Some(Scope::SiteWide));
        assert_eq!(Scope::from_i64(Scope::PageSpecific.as_i64()), Some(Scope::PageSpecific));
        assert_eq!(Scope::from_i64(2), None);
    }

    #[test]
    fn test_validation_status_integer_values() {
        assert_eq!(ValidationStatus::PendingValidation.as_i64(), 0);
        assert_eq!(ValidationStatus::VerifiedComplete.as_i64(), 1);
        assert_eq!(ValidationStatus::PartialProgress.as_i64(), 2);
        assert_eq!(ValidationStatus::NotImplemented.as_i64(), 3);
        assert_eq!(ValidationStatus::Regressed.as_i64(), 4);
        assert_eq!(ValidationStatus::from_i64(5), None);
    }

    #[test]
    fn test_new_recommendation_defaults() {
        let json = r#"{"category":"seo","recommendation_text":"Add a meta description","scope":"site_wide"}"#;
        let rec: NewRecommendation = serde_json::from_str(json).unwrap();
        assert_eq!(rec.batch_number, 1);
        assert!(rec.required_elements.is_empty());
        assert_eq!(rec.page_url, None);
        assert_eq!(rec.scope, Scope::SiteWide);
    }

    #[test]
    fn test_new_recommendation_rejects_unknown_scope() {
        let json = r#"{"category":"seo","recommendation_text":"x","scope":"everywhere"}"#;
        assert!(serde_json::from_str::<NewRecommendation>(json).is_err());
    }
}
