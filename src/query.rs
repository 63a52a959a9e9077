use chrono::NaiveDate;
use serde::Serialize;

use crate::domain::{SessionId, SessionRecord};
use crate::error::OneError;

/// Recognized search filter keys, in the order `search_terms` reports them.
pub const SEARCH_TERMS: &[&str] = &["users", "subjects", "date_range"];

pub fn search_terms() -> Vec<&'static str> {
    SEARCH_TERMS.to_vec()
}

/// Structured session search filters. Users are OR-matched; the date range
/// is inclusive on both ends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchFilters {
    pub users: Vec<String>,
    pub subjects: Option<String>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

impl SearchFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.users.push(user.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subjects = Some(subject.into());
        self
    }

    pub fn date_range(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.date_range = Some((start, end));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.subjects.is_none() && self.date_range.is_none()
    }

    /// An empty filter set is rejected up front rather than being sent to
    /// the registry as an accidental full-table scan.
    pub fn validate(&self) -> Result<(), OneError> {
        if self.is_empty() {
            return Err(OneError::InvalidQuery(
                "search requires at least one filter".to_string(),
            ));
        }
        if self.users.iter().any(|user| user.trim().is_empty()) {
            return Err(OneError::InvalidQuery("empty user filter".to_string()));
        }
        if let Some(subject) = &self.subjects {
            if subject.trim().is_empty() {
                return Err(OneError::InvalidQuery("empty subject filter".to_string()));
            }
        }
        if let Some((start, end)) = self.date_range {
            if start > end {
                return Err(OneError::InvalidQuery(format!(
                    "inverted date range: {start}..{end}"
                )));
            }
        }
        Ok(())
    }
}

/// Search outcome. `records` is present only in details mode and is
/// positionally aligned 1:1 with `eids`. Ordering is whatever the registry
/// returned; it is not re-sorted locally and is not stable across calls.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub eids: Vec<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub records: Option<Vec<SessionRecord>>,
}

impl SearchResult {
    pub fn from_records(records: Vec<SessionRecord>, details: bool) -> Self {
        let eids = records.iter().map(|record| record.id.clone()).collect();
        Self {
            eids,
            records: details.then_some(records),
        }
    }
}
