//! HTTP record source for ApplyLog: the `/applications` JSON API behind a
//! small async trait, with bounded concurrency and retrying reads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use applog_core::{ApplicationPatch, ApplicationRecord, NewApplication, StatsResponse};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "applog-client";

pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("application {id} not found")]
    NotFound { id: String },
    #[error("update for application {id} carries no changes")]
    EmptyPatch { id: String },
    #[error("invalid json body for {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("create response from {url} carried neither a record nor an id")]
    MissingId { url: String },
}

/// The record API as seen by the dashboard. Implementations own transport,
/// retries and error mapping; callers only see records.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<ApplicationRecord>, SourceError>;

    async fn get(&self, id: &str) -> Result<ApplicationRecord, SourceError>;

    async fn create(&self, fields: &NewApplication) -> Result<ApplicationRecord, SourceError>;

    async fn update(
        &self,
        id: &str,
        patch: &ApplicationPatch,
    ) -> Result<ApplicationRecord, SourceError>;

    async fn delete(&self, id: &str) -> Result<(), SourceError>;

    async fn stats(&self) -> Result<StatsResponse, SourceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    /// Page size used when the dashboard pulls a full snapshot.
    pub page_limit: usize,
    pub backoff: BackoffPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("applog/{}", env!("CARGO_PKG_VERSION"))),
            max_in_flight: 8,
            page_limit: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_url: env_or("APPLOG_API_BASE", defaults.base_url),
            timeout: Duration::from_secs(env_parsed("APPLOG_HTTP_TIMEOUT_SECS", 20)),
            user_agent: std::env::var("APPLOG_USER_AGENT").ok().or(defaults.user_agent),
            max_in_flight: env_parsed("APPLOG_MAX_IN_FLIGHT", defaults.max_in_flight),
            page_limit: env_parsed("APPLOG_PAGE_LIMIT", defaults.page_limit),
            backoff: defaults.backoff,
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or_else(|_| {
        debug!("{key} not set, using default: {default}");
        default
    })
}

fn env_parsed<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("invalid {key} value `{raw}`, using default: {default}");
            default
        }),
        Err(_) => default,
    }
}

#[derive(Debug)]
pub struct HttpRecordSource {
    client: reqwest::Client,
    base_url: String,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl HttpRecordSource {
    pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        info!(base_url = %config.base_url, "record source configured");

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends the request, retrying transient failures unless it is a POST.
    /// A 404 is reported as `NotFound` when the request targets `id`.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        id: Option<&str>,
        body: Option<&JsonValue>,
    ) -> Result<reqwest::Response, SourceError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .expect("semaphore not closed");
        let idempotent = method != Method::POST;
        let mut attempt = 0usize;

        loop {
            let mut request = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request.json(body);
            }
            let can_retry = idempotent && attempt < self.backoff.max_retries;

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(%status, attempt, "record api responded");
                        return Ok(resp);
                    }

                    if can_retry && classify_status(status) == RetryDisposition::Retryable {
                        warn!(%status, attempt, "retrying record api request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    if status == StatusCode::NOT_FOUND {
                        if let Some(id) = id {
                            return Err(SourceError::NotFound { id: id.to_string() });
                        }
                    }
                    return Err(SourceError::HttpStatus {
                        status: status.as_u16(),
                        url: resp.url().to_string(),
                    });
                }
                Err(err) => {
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        warn!(error = %err, attempt, "retrying record api request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(err));
                }
            }
        }
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        method: Method,
        url: &str,
        id: Option<&str>,
        body: Option<&JsonValue>,
    ) -> Result<T, SourceError> {
        let resp = self.execute(method, url, id, body).await?;
        decode_body(url, &resp.bytes().await?)
    }
}

fn decode_body<T: DeserializeOwned>(url: &str, bytes: &[u8]) -> Result<T, SourceError> {
    let bytes = if bytes.iter().all(u8::is_ascii_whitespace) {
        b"null".as_slice()
    } else {
        bytes
    };
    serde_json::from_slice(bytes).map_err(|source| SourceError::Decode {
        url: url.to_string(),
        source,
    })
}

fn to_body<T: serde::Serialize>(url: &str, payload: &T) -> Result<JsonValue, SourceError> {
    serde_json::to_value(payload).map_err(|source| SourceError::Decode {
        url: url.to_string(),
        source,
    })
}

/// What a write endpoint answered with.
#[derive(Debug)]
enum Written {
    Record(Box<ApplicationRecord>),
    Id(String),
    Ack,
}

fn classify_write(body: JsonValue) -> Written {
    let id = body
        .get("_id")
        .or_else(|| body.get("id"))
        .and_then(JsonValue::as_str)
        .map(str::to_string);
    match serde_json::from_value::<ApplicationRecord>(body) {
        Ok(record) => Written::Record(Box::new(record)),
        Err(_) => match id {
            Some(id) => Written::Id(id),
            None => Written::Ack,
        },
    }
}

#[async_trait]
impl RecordSource for HttpRecordSource {
    async fn list(&self, skip: usize, limit: usize) -> Result<Vec<ApplicationRecord>, SourceError> {
        let url = self.url(&format!("/applications/?skip={skip}&limit={limit}"));
        let span = info_span!("list_applications", skip, limit);
        async {
            let records: Option<Vec<ApplicationRecord>> =
                self.fetch_json(Method::GET, &url, None, None).await?;
            let records = records.unwrap_or_default();
            info!(count = records.len(), "fetched application snapshot");
            Ok::<_, SourceError>(records)
        }
        .instrument(span)
        .await
    }

    async fn get(&self, id: &str) -> Result<ApplicationRecord, SourceError> {
        let url = self.url(&format!("/applications/{id}"));
        let record: Option<ApplicationRecord> = self
            .fetch_json(Method::GET, &url, Some(id), None)
            .instrument(info_span!("get_application", id))
            .await?;
        record.ok_or_else(|| SourceError::NotFound { id: id.to_string() })
    }

    async fn create(&self, fields: &NewApplication) -> Result<ApplicationRecord, SourceError> {
        let url = self.url("/applications/");
        let span = info_span!("create_application", company = %fields.company_name);
        async {
            let body = to_body(&url, fields)?;
            let answer: JsonValue = self.fetch_json(Method::POST, &url, None, Some(&body)).await?;
            match classify_write(answer) {
                Written::Record(record) => Ok(*record),
                Written::Id(id) => {
                    debug!(%id, "create answered with id only, re-reading record");
                    self.get(&id).await
                }
                Written::Ack => Err(SourceError::MissingId { url: url.clone() }),
            }
        }
        .instrument(span)
        .await
    }

    async fn update(
        &self,
        id: &str,
        patch: &ApplicationPatch,
    ) -> Result<ApplicationRecord, SourceError> {
        if patch.is_empty() {
            return Err(SourceError::EmptyPatch { id: id.to_string() });
        }
        let url = self.url(&format!("/applications/{id}"));
        let span = info_span!("update_application", id);
        async {
            let body = to_body(&url, patch)?;
            let answer: JsonValue = self
                .fetch_json(Method::PUT, &url, Some(id), Some(&body))
                .await?;
            match classify_write(answer) {
                Written::Record(record) => Ok(*record),
                Written::Id(_) | Written::Ack => self.get(id).await,
            }
        }
        .instrument(span)
        .await
    }

    async fn delete(&self, id: &str) -> Result<(), SourceError> {
        let url = self.url(&format!("/applications/{id}"));
        self.execute(Method::DELETE, &url, Some(id), None)
            .instrument(info_span!("delete_application", id))
            .await?;
        info!(id, "application deleted");
        Ok(())
    }

    async fn stats(&self) -> Result<StatsResponse, SourceError> {
        let url = self.url("/applications/stats");
        let stats: Option<StatsResponse> = self
            .fetch_json(Method::GET, &url, None, None)
            .instrument(info_span!("application_stats"))
            .await?;
        Ok(stats.unwrap_or_default())
    }
}

/// Pulls one page of `limit` records starting at zero, which is how every
/// dashboard view obtains its snapshot.
pub async fn snapshot(
    source: &dyn RecordSource,
    limit: usize,
) -> Result<Vec<ApplicationRecord>, SourceError> {
    source.list(0, limit).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use applog_core::{Category, Status};
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record_json(id: &str, company: &str, status: &str) -> JsonValue {
        serde_json::json!({
            "_id": id,
            "company_name": company,
            "role": "SDE",
            "category": "campus",
            "status": status,
            "date_applied": "2024-03-01",
            "last_updated": "2024-03-02T10:00:00"
        })
    }

    fn source_for(server: &MockServer) -> HttpRecordSource {
        HttpRecordSource::new(ClientConfig {
            base_url: format!("{}/", server.uri()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..Default::default()
        })
        .expect("client")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[tokio::test]
    async fn list_passes_paging_and_decodes_records() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/applications/"))
            .and(query_param("skip", "0"))
            .and(query_param("limit", "1000"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                record_json("a1", "Acme", "offer"),
                record_json("b2", "Beta", "ghosted"),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server);
        let records = snapshot(&source, 1000).await.expect("list");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, "a1");
        assert_eq!(records[1].status, Status::Other("ghosted".into()));
    }

    #[tokio::test]
    async fn list_treats_null_as_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/applications/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(JsonValue::Null))
            .mount(&server)
            .await;

        let records = source_for(&server).list(0, 10).await.expect("list");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn get_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/applications/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let err = source_for(&server).get("missing").await.unwrap_err();
        assert!(matches!(err, SourceError::NotFound { ref id } if id == "missing"));
    }

    #[tokio::test]
    async fn reads_retry_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/applications/stats"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/applications/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "counts": [{"_id": {"category": "campus", "status": "offer"}, "count": 3}]
            })))
            .mount(&server)
            .await;

        let stats = source_for(&server).stats().await.expect("stats");
        assert_eq!(stats.counts.len(), 1);
        assert_eq!(stats.counts[0].count, 3);
    }

    #[tokio::test]
    async fn create_is_not_retried_and_follows_id_only_answer() {
        let server = MockServer::start().await;
        let fields = NewApplication {
            company_name: "Acme".into(),
            role: "SDE".into(),
            category: Category::Campus,
            status: Status::Applied,
            date_applied: "2024-03-01".into(),
            important_dates: None,
            links: None,
            notes: None,
        };
        Mock::given(method("POST"))
            .and(path("/applications/"))
            .and(body_json(serde_json::json!({
                "company_name": "Acme",
                "role": "SDE",
                "category": "campus",
                "status": "applied",
                "date_applied": "2024-03-01"
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({"id": "n1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/applications/n1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(record_json("n1", "Acme", "applied")))
            .expect(1)
            .mount(&server)
            .await;

        let created = source_for(&server).create(&fields).await.expect("create");
        assert_eq!(created.id, "n1");

        let failing = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&failing)
            .await;
        let err = source_for(&failing).create(&fields).await.unwrap_err();
        assert!(matches!(err, SourceError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn update_sends_only_changed_fields() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/applications/a1"))
            .and(body_json(serde_json::json!({"status": "interview"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(record_json("a1", "Acme", "interview")))
            .expect(1)
            .mount(&server)
            .await;

        let source = source_for(&server);
        let patch = ApplicationPatch {
            status: Some(Status::Interview),
            ..Default::default()
        };
        let updated = source.update("a1", &patch).await.expect("update");
        assert_eq!(updated.status, Status::Interview);

        let err = source
            .update("a1", &ApplicationPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::EmptyPatch { .. }));
    }

    #[tokio::test]
    async fn delete_accepts_empty_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/applications/a1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        source_for(&server).delete("a1").await.expect("delete");
    }

    #[test]
    fn write_answers_are_classified() {
        assert!(matches!(classify_write(record_json("x", "Acme", "offer")), Written::Record(_)));
        assert!(matches!(classify_write(serde_json::json!({"_id": "x"})), Written::Id(ref id) if id == "x"));
        assert!(matches!(classify_write(serde_json::json!({"updated": true})), Written::Ack));
        assert!(matches!(classify_write(JsonValue::Null), Written::Ack));
    }
}
