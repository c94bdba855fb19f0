//! Remote job API: where pending jobs come from and where status goes.
//!
//! HTTP endpoints (relative to the API base URL):
//! - `GET  /api/v1/jobs/pending` - pending jobs
//! - `PUT  /api/v1/jobs/{id}/status` - full job snapshot
//! - `POST /api/v1/jobs/{id}/progress` - latest progress event
//! - `POST /api/v1/worker/status` - worker heartbeat
//!
//! Terminal job reports are retried with exponential backoff, everything else
//! is sent once.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Credentials;
use crate::bridge::protocol::ProgressEvent;
use crate::job::Job;
use crate::version::CONVERSO_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("job API request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("job API returned HTTP {status} for {url}")]
    Status { status: u16, url: String },
    #[error("credentials are missing or expired")]
    Unauthenticated,
    #[error("invalid job API configuration: {0}")]
    Config(String),
}

impl StatusError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Request(_) => "STATUS_REQUEST_FAILED",
            Self::Status { .. } => "STATUS_HTTP_ERROR",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::Config(_) => "STATUS_CONFIG",
        }
    }
}

/// Worker heartbeat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub status: String,
    pub queue_size: usize,
    pub timestamp: DateTime<Utc>,
}

impl WorkerStatus {
    pub fn running(queue_size: usize) -> Self {
        Self {
            status: "running".to_string(),
            queue_size,
            timestamp: Utc::now(),
        }
    }
}

/// Source of pending jobs.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn fetch_pending(&self) -> Result<Vec<Job>, StatusError>;
}

/// Destination for job and worker status.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report_status(&self, job: &Job) -> Result<(), StatusError>;

    async fn report_progress(&self, job_id: &str, progress: &ProgressEvent)
    -> Result<(), StatusError>;

    async fn report_worker(&self, status: &WorkerStatus) -> Result<(), StatusError>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 8,
            backoff_base: Duration::from_millis(100),
            retry_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// reqwest-backed [`JobSource`] and [`StatusSink`].
pub struct HttpJobApi {
    base_url: String,
    client: reqwest::Client,
    retry: RetryConfig,
}

impl HttpJobApi {
    pub fn new(base_url: impl Into<String>, credentials: &Credentials) -> Result<Self, StatusError> {
        Self::with_retry(base_url, credentials, RetryConfig::default())
    }

    pub fn with_retry(
        base_url: impl Into<String>,
        credentials: &Credentials,
        retry: RetryConfig,
    ) -> Result<Self, StatusError> {
        use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};

        let mut headers = HeaderMap::new();
        if credentials.is_present() {
            let mut value = HeaderValue::from_str(&credentials.bearer())
                .map_err(|e| StatusError::Config(format!("access token: {e}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }
        let user_agent = format!("converso/{}", CONVERSO_VERSION);
        if let Ok(value) = HeaderValue::from_str(&user_agent) {
            headers.insert(USER_AGENT, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Base URL plus `segments`, each percent-encoded as one path segment.
    fn url(&self, segments: &[&str]) -> Result<String, StatusError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| StatusError::Config(format!("base URL {}: {e}", self.base_url)))?;
        url.path_segments_mut()
            .map_err(|()| StatusError::Config(format!("base URL {} cannot have a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url.into())
    }

    async fn send_once<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &T,
    ) -> Result<(), StatusError> {
        let response = self.client.request(method, url).json(body).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(StatusError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            })
        }
    }

    /// Exponential backoff on retryable statuses and transport errors.
    async fn send_with_retry<T: Serialize + ?Sized>(
        &self,
        method: reqwest::Method,
        url: &str,
        body: &T,
    ) -> Result<(), StatusError> {
        let mut attempt: u32 = 0;
        loop {
            let err = match self.send_once(method.clone(), url, body).await {
                Ok(()) => {
                    tracing::debug!(%url, attempts = attempt + 1, "Terminal status report sent");
                    return Ok(());
                }
                Err(StatusError::Status { status, .. })
                    if !self.retry.retry_status_codes.contains(&status) =>
                {
                    tracing::error!(%url, status, "Terminal status report failed with non-retryable status");
                    return Err(StatusError::Status {
                        status,
                        url: url.to_string(),
                    });
                }
                Err(e) => e,
            };

            attempt += 1;
            if attempt > self.retry.max_retries {
                tracing::error!(%url, error = %err, attempts = attempt, "Terminal status report failed after max retries");
                return Err(err);
            }
            let backoff = self.retry.backoff_base * (1 << attempt.min(10));
            tracing::warn!(
                %url,
                error = %err,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "Terminal status report failed, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[async_trait]
impl JobSource for HttpJobApi {
    async fn fetch_pending(&self) -> Result<Vec<Job>, StatusError> {
        let url = self.url(&["api", "v1", "jobs", "pending"])?;
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(StatusError::Status {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl StatusSink for HttpJobApi {
    async fn report_status(&self, job: &Job) -> Result<(), StatusError> {
        let url = self.url(&["api", "v1", "jobs", &job.id, "status"])?;
        if job.is_terminal() {
            self.send_with_retry(reqwest::Method::PUT, &url, job).await
        } else {
            self.send_once(reqwest::Method::PUT, &url, job).await
        }
    }

    async fn report_progress(
        &self,
        job_id: &str,
        progress: &ProgressEvent,
    ) -> Result<(), StatusError> {
        let url = self.url(&["api", "v1", "jobs", job_id, "progress"])?;
        self.send_once(reqwest::Method::POST, &url, progress).await
    }

    async fn report_worker(&self, status: &WorkerStatus) -> Result<(), StatusError> {
        let url = self.url(&["api", "v1", "worker", "status"])?;
        self.send_once(reqwest::Method::POST, &url, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Args, ModuleResponse};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            backoff_base: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn api(server: &MockServer) -> HttpJobApi {
        HttpJobApi::with_retry(
            format!("{}/", server.uri()),
            &Credentials::new("tok-123", "dev-1"),
            test_retry(),
        )
        .unwrap()
    }

    fn finished_job() -> Job {
        let mut job = Job::new("job-7", "youtube", "info", Args::new());
        job.start().unwrap();
        job.finish(ModuleResponse::success(Args::new())).unwrap();
        job
    }

    #[test]
    fn retry_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.retry_status_codes, [429, 500, 502, 503, 504]);
        assert!(config.max_retries > 0);
    }

    #[tokio::test]
    async fn fetch_pending_sends_auth_and_parses_jobs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/pending"))
            .and(header("authorization", "Bearer tok-123"))
            .and(header(
                "user-agent",
                format!("converso/{}", CONVERSO_VERSION).as_str(),
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "a", "type": "module", "module": "youtube", "command": "info",
                 "args": {"url": "u"}, "status": "pending"},
                {"id": "b", "module": "audio", "command": "convert"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let jobs = api(&server).fetch_pending().await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].id, "a");
        assert_eq!(jobs[1].module, "audio");
    }

    #[tokio::test]
    async fn fetch_pending_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/jobs/pending"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = api(&server).fetch_pending().await.unwrap_err();
        assert!(matches!(err, StatusError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn terminal_status_retries_on_503() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-7/status"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-7/status"))
            .and(body_partial_json(json!({"id": "job-7", "status": "completed"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        api(&server).report_status(&finished_job()).await.unwrap();
    }

    #[tokio::test]
    async fn terminal_status_carries_module_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-5/status"))
            .and(body_partial_json(json!({
                "id": "job-5",
                "status": "failed",
                "result": {"success": false, "data": {}, "error": "video unavailable"}
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut job = Job::new("job-5", "youtube", "download", Args::new());
        job.start().unwrap();
        job.finish(ModuleResponse::failure("video unavailable")).unwrap();
        api(&server).report_status(&job).await.unwrap();
    }

    #[tokio::test]
    async fn job_id_is_encoded_as_one_path_segment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/a%2Fb%3Fc/progress"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        api(&server)
            .report_progress("a/b?c", &ProgressEvent::new("downloading", 1, 2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn terminal_status_gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-7/status"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = api(&server)
            .report_status(&finished_job())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "STATUS_HTTP_ERROR");
    }

    #[tokio::test]
    async fn terminal_status_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-7/status"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        assert!(api(&server).report_status(&finished_job()).await.is_err());
    }

    #[tokio::test]
    async fn running_status_is_sent_once() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/jobs/job-8/status"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let mut job = Job::new("job-8", "youtube", "info", Args::new());
        job.start().unwrap();
        assert!(api(&server).report_status(&job).await.is_err());
    }

    #[tokio::test]
    async fn progress_and_heartbeat_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs/job-9/progress"))
            .and(body_partial_json(json!({"stage": "downloading", "current": 3, "total": 4})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/worker/status"))
            .and(body_partial_json(json!({"status": "running", "queue_size": 2})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = api(&server);
        api.report_progress("job-9", &ProgressEvent::new("downloading", 3, 4))
            .await
            .unwrap();
        api.report_worker(&WorkerStatus::running(2)).await.unwrap();
    }
}
