use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::OneError;

fn session_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
    })
}

/// Opaque identifier of one recorded experiment session (UUID format).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        if !session_id_regex().is_match(&normalized) {
            return Err(OneError::InvalidSessionId(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

/// Dotted hierarchical name of a class of recorded data, e.g.
/// `clusters.templateWaveforms`. Compared by exact match only; case and
/// whitespace are significant, so parsing rejects names containing
/// whitespace rather than normalizing them away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetType(String);

impl DatasetType {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File-name-safe form used for cache path derivation. Dots are kept:
    /// they are legal in file names and preserve the hierarchical reading.
    pub fn file_name(&self) -> String {
        self.0.replace('/', "_")
    }
}

impl fmt::Display for DatasetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetType {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.is_empty() || value.chars().any(char::is_whitespace) {
            return Err(OneError::InvalidDatasetType(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

/// One session summary as returned by the registry. `detail` is populated
/// only when the caller asked for details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub subject: String,
    pub user: String,
    pub start_date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// Existence record for one dataset type of one session. `url` is absent
/// exactly when the session has no data of this type.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetRecord {
    pub session: SessionId,
    pub dataset_type: DatasetType,
    pub url: Option<String>,
}

impl DatasetRecord {
    pub fn exists(&self) -> bool {
        self.url.is_some()
    }
}

/// Catalogue categories the registry can enumerate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListCategory {
    All,
    DatasetTypes,
    Users,
    Subjects,
}

impl ListCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListCategory::All => "All",
            ListCategory::DatasetTypes => "dataset-types",
            ListCategory::Users => "users",
            ListCategory::Subjects => "subjects",
        }
    }
}

impl fmt::Display for ListCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ListCategory {
    type Err = OneError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "All" => Ok(ListCategory::All),
            "dataset-types" => Ok(ListCategory::DatasetTypes),
            "users" => Ok(ListCategory::Users),
            "subjects" => Ok(ListCategory::Subjects),
            _ => Err(OneError::InvalidQuery(format!(
                "unrecognized list category: {value}"
            ))),
        }
    }
}
