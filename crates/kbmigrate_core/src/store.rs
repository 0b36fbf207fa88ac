use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::MigrateConfig;
use crate::record::{Lookup, Record};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// One table query against the source platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordQuery {
    pub table: String,
    pub filter: String,
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub display_values: bool,
}

impl RecordQuery {
    pub fn new(table: &str, filter: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            filter: filter.into(),
            fields: Vec::new(),
            limit: None,
            offset: 0,
            display_values: false,
        }
    }

    pub fn fields(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|field| (*field).to_string()).collect();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_display_values(mut self) -> Self {
        self.display_values = true;
        self
    }
}

/// Read access to the source knowledge base. Shared by all fetch workers.
pub trait RecordStore: Send + Sync {
    fn query_records(&self, query: &RecordQuery) -> Result<Vec<Record>>;
    fn get_record(&self, table: &str, sys_id: &str, fields: &[&str]) -> Result<Lookup<Record>>;
    fn get_attachment_bytes(&self, sys_id: &str) -> Result<Vec<u8>>;
    fn request_count(&self) -> usize;
}

/// Page through a query until the store returns a short page.
pub fn query_all<S: RecordStore + ?Sized>(
    store: &S,
    query: &RecordQuery,
    page_size: usize,
) -> Result<Vec<Record>> {
    let page_size = page_size.max(1);
    let mut records = Vec::new();
    let mut offset = query.offset;
    loop {
        let page = store.query_records(&query.clone().limit(page_size).offset(offset))?;
        let count = page.len();
        debug!(table = %query.table, offset, count, "fetched page");
        records.extend(page);
        if count < page_size {
            break;
        }
        offset += page_size;
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct ServiceNowClientConfig {
    pub instance: String,
    pub username: String,
    pub password: String,
    pub user_agent: String,
    pub timeout_ms: u64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ServiceNowClientConfig {
    pub fn from_config(config: &MigrateConfig) -> Result<Self> {
        config.validate_source()?;
        Ok(Self {
            instance: config.instance().unwrap_or_default(),
            username: config.username().unwrap_or_default(),
            password: config.password().unwrap_or_default(),
            user_agent: crate::config::DEFAULT_USER_AGENT.to_string(),
            timeout_ms: config.timeout_ms(),
            max_retries: config.max_retries(),
            retry_delay_ms: config.retry_delay_ms(),
        })
    }

    pub fn base_url(&self) -> String {
        let instance = self
            .instance
            .trim()
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/');
        format!("https://{instance}/api/now")
    }
}

/// Blocking client for the ServiceNow Table and Attachment APIs.
pub struct ServiceNowClient {
    client: Client,
    config: ServiceNowClientConfig,
    base_url: String,
    request_count: AtomicUsize,
}

impl ServiceNowClient {
    pub fn new(config: ServiceNowClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to build ServiceNow HTTP client")?;
        let base_url = config.base_url();
        Ok(Self {
            client,
            config,
            base_url,
            request_count: AtomicUsize::new(0),
        })
    }

    fn send_get(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        for attempt in 0..=self.config.max_retries {
            self.request_count.fetch_add(1, Ordering::Relaxed);
            let response = self
                .client
                .get(&url)
                .basic_auth(&self.config.username, Some(&self.config.password))
                .header("Accept", "application/json")
                .header("User-Agent", self.config.user_agent.clone())
                .query(params)
                .send();

            match response {
                Ok(response) => {
                    let status = response.status();
                    if attempt < self.config.max_retries && is_retryable_status(status) {
                        warn!(%url, %status, attempt, "retrying ServiceNow request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Ok(response);
                }
                Err(error) => {
                    if attempt < self.config.max_retries && is_retryable_error(&error) {
                        warn!(%url, %error, attempt, "retrying ServiceNow request");
                        self.wait_before_retry(attempt);
                        continue;
                    }
                    return Err(error)
                        .with_context(|| format!("failed to call ServiceNow API {url}"));
                }
            }
        }

        bail!("ServiceNow request to {url} exhausted retry budget")
    }

    fn request_json(&self, endpoint: &str, params: &[(&str, String)]) -> Result<Option<Value>> {
        let response = self.send_get(endpoint, params)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            bail!("ServiceNow request {endpoint} failed with HTTP {status}");
        }
        let payload: Value = response
            .json()
            .context("failed to decode ServiceNow JSON response")?;
        if let Some(error) = payload.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            let detail = error
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("");
            bail!("ServiceNow API error: {message} {detail}");
        }
        Ok(Some(payload))
    }

    fn wait_before_retry(&self, attempt: usize) {
        let exponent = u32::try_from(attempt).unwrap_or(16);
        let base = self
            .config
            .retry_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        sleep(Duration::from_millis(base.saturating_add(jitter)));
    }
}

impl RecordStore for ServiceNowClient {
    fn query_records(&self, query: &RecordQuery) -> Result<Vec<Record>> {
        let mut params = vec![("sysparm_offset", query.offset.to_string())];
        if !query.filter.is_empty() {
            params.push(("sysparm_query", query.filter.clone()));
        }
        if !query.fields.is_empty() {
            params.push(("sysparm_fields", query.fields.join(",")));
        }
        if let Some(limit) = query.limit {
            params.push(("sysparm_limit", limit.to_string()));
        }
        if query.display_values {
            params.push(("sysparm_display_value", "all".to_string()));
        }

        let endpoint = format!("table/{}", query.table);
        let payload = match self.request_json(&endpoint, &params)? {
            Some(payload) => payload,
            None => bail!("ServiceNow table {} not found", query.table),
        };
        let rows = payload
            .get("result")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().map(Record::from_json).collect())
            .unwrap_or_default();
        Ok(rows)
    }

    fn get_record(&self, table: &str, sys_id: &str, fields: &[&str]) -> Result<Lookup<Record>> {
        let mut params = Vec::new();
        if !fields.is_empty() {
            params.push(("sysparm_fields", fields.join(",")));
        }
        params.push(("sysparm_display_value", "all".to_string()));

        let endpoint = format!("table/{table}/{sys_id}");
        let payload = match self.request_json(&endpoint, &params)? {
            Some(payload) => payload,
            None => return Ok(Lookup::NotFound),
        };
        match payload.get("result") {
            Some(result) if result.as_object().is_some_and(|map| !map.is_empty()) => {
                Ok(Lookup::Found(Record::from_json(result)))
            }
            _ => Ok(Lookup::NotFound),
        }
    }

    fn get_attachment_bytes(&self, sys_id: &str) -> Result<Vec<u8>> {
        let endpoint = format!("attachment/{sys_id}/file");
        let response = self.send_get(&endpoint, &[])?;
        let status = response.status();
        if !status.is_success() {
            bail!("attachment {sys_id} download failed with HTTP {status}");
        }
        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read attachment {sys_id} body"))?;
        Ok(bytes.to_vec())
    }

    fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockStore;

    #[test]
    fn base_url_strips_scheme_and_trailing_slash() {
        let config = ServiceNowClientConfig {
            instance: "https://acme.service-now.com/".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            user_agent: "test".to_string(),
            timeout_ms: 1_000,
            max_retries: 0,
            retry_delay_ms: 0,
        };
        assert_eq!(config.base_url(), "https://acme.service-now.com/api/now");
    }

    #[test]
    fn query_all_pages_until_short_page() {
        let mut store = MockStore::default();
        let rows = (0..5)
            .map(|index| Record::default().with_text("sys_id", &format!("r{index}")))
            .collect::<Vec<_>>();
        store.add_query("kb_knowledge", "active=true", rows);

        let records = query_all(&store, &RecordQuery::new("kb_knowledge", "active=true"), 2)
            .expect("query_all");
        assert_eq!(records.len(), 5);
        assert_eq!(records[4].sys_id(), "r4");
        assert_eq!(store.request_count(), 3);
    }

    #[test]
    fn retryable_statuses_match_transient_failures() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    }
}
