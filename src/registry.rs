use std::thread;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;
use tracing::debug;

use crate::domain::{DatasetRecord, DatasetType, ListCategory, SessionId, SessionRecord};
use crate::error::OneError;
use crate::query::SearchFilters;

/// Remote registry operations the client depends on. Implemented over HTTP
/// by [`AlyxHttpClient`]; tests substitute mocks.
pub trait RegistryClient: Send + Sync {
    /// Session summaries matching the filters, in registry order. Detail
    /// blobs are populated only when `details` is set.
    fn search_sessions(
        &self,
        filters: &SearchFilters,
        details: bool,
    ) -> Result<Vec<SessionRecord>, OneError>;

    /// Every dataset record the registry holds for one session, existing
    /// or not, with remote locators for the ones that exist.
    fn session_datasets(&self, session: &SessionId) -> Result<Vec<DatasetRecord>, OneError>;

    /// Registry-wide catalogue listing for a fixed category.
    fn list_catalog(&self, category: ListCategory) -> Result<Vec<String>, OneError>;
}

#[derive(Clone)]
pub struct AlyxHttpClient {
    client: Client,
    base_url: String,
}

impl AlyxHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, OneError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("one-client/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| OneError::Transport(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|err| OneError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn sessions_url(&self, filters: &SearchFilters) -> String {
        let mut params = Vec::new();
        for user in &filters.users {
            params.push(format!("users={user}"));
        }
        if let Some(subject) = &filters.subjects {
            params.push(format!("subject={subject}"));
        }
        if let Some((start, end)) = filters.date_range {
            params.push(format!("start_date={start}"));
            params.push(format!("end_date={end}"));
        }
        format!("{}/sessions?{}", self.base_url, params.join("&"))
    }

    fn session_datasets_url(&self, session: &SessionId) -> String {
        format!("{}/sessions/{}/datasets", self.base_url, session.as_str())
    }

    fn catalog_url(&self, category: ListCategory) -> String {
        let segment = match category {
            ListCategory::All | ListCategory::DatasetTypes => "dataset-types",
            ListCategory::Users => "users",
            ListCategory::Subjects => "subjects",
        };
        format!("{}/{}", self.base_url, segment)
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, OneError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "registry request failed".to_string());
        Err(OneError::RegistryStatus { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<reqwest::blocking::Response, OneError>
    where
        F: FnMut() -> reqwest::blocking::RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(OneError::Transport(err.to_string()));
                }
            }
        }
    }

    fn get_json(&self, url: &str) -> Result<Value, OneError> {
        debug!(url, "registry request");
        let response = self.send_with_retries(|| self.client.get(url))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| OneError::Transport(err.to_string()))
    }
}

impl RegistryClient for AlyxHttpClient {
    fn search_sessions(
        &self,
        filters: &SearchFilters,
        details: bool,
    ) -> Result<Vec<SessionRecord>, OneError> {
        let raw = self.get_json(&self.sessions_url(filters))?;
        parse_session_list(&raw, details)
    }

    fn session_datasets(&self, session: &SessionId) -> Result<Vec<DatasetRecord>, OneError> {
        let raw = self.get_json(&self.session_datasets_url(session))?;
        parse_dataset_list(session, &raw)
    }

    fn list_catalog(&self, category: ListCategory) -> Result<Vec<String>, OneError> {
        let raw = self.get_json(&self.catalog_url(category))?;
        parse_name_list(&raw)
    }
}

/// Parses a registry session envelope. The registry returns either a bare
/// array or an object with a `results` array; both forms occur in the wild.
pub fn parse_session_list(raw: &Value, details: bool) -> Result<Vec<SessionRecord>, OneError> {
    let items = envelope_items(raw)?;
    items
        .iter()
        .map(|item| parse_session_record(item, details))
        .collect()
}

fn parse_session_record(item: &Value, details: bool) -> Result<SessionRecord, OneError> {
    let id = item
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| OneError::Transport("session record missing id".to_string()))?
        .parse()?;
    let subject = item
        .get("subject")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let user = item
        .get("users")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|v| v.as_str())
        .or_else(|| item.get("user").and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string();
    let start_date = item
        .get("start_date")
        .and_then(|v| v.as_str())
        .and_then(|value| NaiveDate::parse_from_str(value, "%Y-%m-%d").ok())
        .ok_or_else(|| OneError::Transport("session record missing start_date".to_string()))?;

    Ok(SessionRecord {
        id,
        subject,
        user,
        start_date,
        detail: details.then(|| item.clone()),
    })
}

pub fn parse_dataset_list(
    session: &SessionId,
    raw: &Value,
) -> Result<Vec<DatasetRecord>, OneError> {
    let items = envelope_items(raw)?;
    items
        .iter()
        .map(|item| {
            let dataset_type: DatasetType = item
                .get("dataset_type")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    OneError::Transport("dataset record missing dataset_type".to_string())
                })?
                .parse()?;
            let url = item
                .get("data_url")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            Ok(DatasetRecord {
                session: session.clone(),
                dataset_type,
                url,
            })
        })
        .collect()
}

fn parse_name_list(raw: &Value) -> Result<Vec<String>, OneError> {
    let items = envelope_items(raw)?;
    Ok(items
        .iter()
        .filter_map(|item| {
            item.as_str()
                .or_else(|| item.get("name").and_then(|v| v.as_str()))
                .map(|v| v.to_string())
        })
        .collect())
}

fn envelope_items(raw: &Value) -> Result<&Vec<Value>, OneError> {
    raw.as_array()
        .or_else(|| raw.get("results").and_then(|v| v.as_array()))
        .ok_or_else(|| OneError::Transport("unexpected registry response shape".to_string()))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    #[test]
    fn sessions_url_encodes_filters() {
        let client =
            AlyxHttpClient::new("https://alyx.example.org/", Duration::from_secs(30)).unwrap();
        let filters = SearchFilters::new().user("olivier").date_range(
            NaiveDate::from_ymd_opt(2018, 8, 24).unwrap(),
            NaiveDate::from_ymd_opt(2018, 8, 24).unwrap(),
        );
        assert_eq!(
            client.sessions_url(&filters),
            "https://alyx.example.org/sessions?users=olivier&start_date=2018-08-24&end_date=2018-08-24"
        );
    }

    #[test]
    fn parse_session_envelope() {
        let raw = json!({
            "results": [{
                "id": "86e27228-8708-48d8-96ed-9aa61ab951db",
                "subject": "flowers",
                "users": ["olivier"],
                "start_date": "2018-08-24"
            }]
        });
        let records = parse_session_list(&raw, false).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].subject, "flowers");
        assert_eq!(records[0].user, "olivier");
        assert!(records[0].detail.is_none());

        let detailed = parse_session_list(&raw, true).unwrap();
        assert!(detailed[0].detail.is_some());
    }

    #[test]
    fn parse_dataset_envelope_keeps_missing_urls() {
        let session: SessionId = "86e27228-8708-48d8-96ed-9aa61ab951db".parse().unwrap();
        let raw = json!([
            {"dataset_type": "clusters.probes", "data_url": "https://files.example.org/p.npy"},
            {"dataset_type": "clusters.depths", "data_url": null}
        ]);
        let records = parse_dataset_list(&session, &raw).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].exists());
        assert!(!records[1].exists());
    }
}
