use std::collections::BTreeSet;

use log::warn;
use serde::Serialize;

/// Elements observed on a live page, as reported by the crawler.
///
/// Names are trimmed and lower-cased. Blank names are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveFindings {
    elements: BTreeSet<String>,
}

impl LiveFindings {
    pub fn new<I, S>(elements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let elements = elements
            .into_iter()
            .filter_map(|e| normalize(e.as_ref()))
            .collect();
        LiveFindings { elements }
    }

    /// Parse a crawler payload: a JSON array of element names.
    ///
    /// Anything that is not a string is ignored, and a payload that is not
    /// an array at all yields no findings. Unusable input means "nothing
    /// observed", never a failed validation.
    pub fn from_json(payload: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(payload) {
            Ok(serde_json::Value::Array(values)) => {
                let skipped = values.iter().filter(|v| !v.is_string()).count();
                if skipped > 0 {
                    warn!("Ignoring {} non-string entries in live findings", skipped);
                }
                Self::new(values.iter().filter_map(|v| v.as_str()))
            }
            Ok(_) => {
                warn!("Live findings payload is not a JSON array - treating as empty");
                LiveFindings::default()
            }
            Err(e) => {
                warn!("Malformed live findings payload - treating as empty: {}", e);
                LiveFindings::default()
            }
        }
    }

    pub fn contains(&self, element: &str) -> bool {
        normalize(element).is_some_and(|e| self.elements.contains(&e))
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// Required elements split by whether the page showed them
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ElementMatch {
    pub checked: Vec<String>,
    pub found: Vec<String>,
    pub missing: Vec<String>,
}

impl ElementMatch {
    /// Match declared elements against findings, keeping the declared order
    /// and spelling. Duplicate and blank declarations are checked once.
    pub fn compute(required: &[String], findings: &LiveFindings) -> Self {
        let mut seen = BTreeSet::new();
        let mut result = ElementMatch::default();

        for element in required {
            let Some(key) = normalize(element) else {
                continue;
            };
            if !seen.insert(key) {
                continue;
            }

            result.checked.push(element.clone());
            if findings.contains(element) {
                result.found.push(element.clone());
            } else {
                result.missing.push(element.clone());
            }
        }

        result
    }

    /// Floor of found / checked as a percentage
    pub fn completion_percentage(&self) -> i64 {
        if self.checked.is_empty() {
            0
        } else {
            (self.found.len() * 100 / self.checked.len()) as i64
        }
    }
}

fn normalize(element: &str) -> Option<String> {
    let trimmed = element.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}
