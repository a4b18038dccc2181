//! GitHub Actions REST client.
//!
//! Fetches workflow runs and their jobs for one repository and maps the API
//! payloads into protocol snapshots. Transient failures are retried here so
//! the monitor loop only sees a final outcome per request.

use chrono::{DateTime, Utc};
use civiewer_protocol::{JobSnapshot, RepositoryKey, RunSnapshot, StepSnapshot, STATUS_QUEUED};
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::GithubConfig;

const CONNECT_TIMEOUT_SECS: u64 = 10;
const API_VERSION: &str = "2022-11-28";
const ACCEPT_JSON: &str = "application/vnd.github+json";
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("GitHub rejected the token (401). Check GITHUB_TOKEN or --token")]
    Unauthorized,

    #[error("Access to {url} is forbidden (403). The token may lack the `actions:read` scope")]
    Forbidden { url: String },

    #[error("Not found (404): {url}. Check the owner and repository name")]
    NotFound { url: String },

    #[error("Rate limited by GitHub (429)")]
    RateLimited { retry_after: Option<Duration> },

    #[error("GitHub server error {status} for {url}")]
    Server { status: u16, url: String },

    #[error("Unexpected HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Giving up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

impl FetchError {
    /// Errors that no amount of waiting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FetchError::Unauthorized | FetchError::Forbidden { .. } | FetchError::NotFound { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::RateLimited { .. }
                | FetchError::Server { .. }
                | FetchError::Transport { .. }
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Source trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the monitor gets its snapshots from.
pub trait RunSource {
    /// Runs whose `updated_at` is at or after `since`, oldest first.
    fn list_runs_updated_since(
        &self,
        key: &RepositoryKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunSnapshot>, FetchError>;

    /// Jobs of one run, each with its steps ordered by step number.
    fn list_jobs_for_run(&self, run: &RunSnapshot) -> Result<Vec<JobSnapshot>, FetchError>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Wire types
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct WorkflowRunsPage {
    #[serde(default)]
    workflow_runs: Vec<WorkflowRunDto>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJobsPage {
    #[serde(default)]
    jobs: Vec<WorkflowJobDto>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunDto {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub head_branch: Option<String>,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub jobs_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobDto {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub steps: Option<Vec<StepDto>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepDto {
    pub number: u32,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub conclusion: Option<String>,
}

impl From<WorkflowRunDto> for RunSnapshot {
    fn from(dto: WorkflowRunDto) -> Self {
        RunSnapshot {
            name: dto.name.unwrap_or_else(|| format!("run {}", dto.id)),
            id: dto.id,
            head_branch: dto.head_branch.unwrap_or_default(),
            head_sha: dto.head_sha,
            status: dto.status.unwrap_or_else(|| STATUS_QUEUED.to_string()),
            conclusion: dto.conclusion,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
            jobs_url: dto.jobs_url,
        }
    }
}

impl From<WorkflowJobDto> for JobSnapshot {
    fn from(dto: WorkflowJobDto) -> Self {
        let mut steps: Vec<StepSnapshot> = dto
            .steps
            .unwrap_or_default()
            .into_iter()
            .map(StepSnapshot::from)
            .collect();
        steps.sort_by_key(|step| step.number);
        JobSnapshot {
            id: dto.id,
            name: dto.name,
            status: dto.status.unwrap_or_else(|| STATUS_QUEUED.to_string()),
            conclusion: dto.conclusion,
            steps,
        }
    }
}

impl From<StepDto> for StepSnapshot {
    fn from(dto: StepDto) -> Self {
        StepSnapshot {
            number: dto.number,
            name: dto.name,
            status: dto.status.unwrap_or_else(|| STATUS_QUEUED.to_string()),
            conclusion: dto.conclusion,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Client
// ═══════════════════════════════════════════════════════════════════════════════

pub struct GithubClient {
    http: Client,
    api_url: String,
    key: RepositoryKey,
    per_page: u32,
    max_attempts: u32,
    initial_retry_delay: Duration,
}

impl GithubClient {
    pub fn new(
        key: RepositoryKey,
        token: Option<&str>,
        config: &GithubConfig,
    ) -> Result<Self, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_JSON));
        headers.insert("X-GitHub-Api-Version", HeaderValue::from_static(API_VERSION));
        if let Some(token) = token.filter(|token| !token.trim().is_empty()) {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token.trim()))
                .map_err(|err| FetchError::Client(format!("invalid token: {}", err)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .user_agent(concat!("civiewer/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            key,
            per_page: config.per_page,
            max_attempts: config.max_attempts.max(1),
            initial_retry_delay: Duration::from_millis(config.initial_retry_delay_ms),
        })
    }

    fn repo_url(&self) -> String {
        format!("{}/repos/{}/{}", self.api_url, self.key.owner, self.key.repo)
    }

    fn with_per_page(&self, url: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{}{}per_page={}", url, separator, self.per_page)
    }

    /// Confirms the repository exists and the token can see it.
    pub fn verify_repository(&self) -> Result<(), FetchError> {
        let url = self.repo_url();
        let _: serde_json::Value = self.get_json(&url)?;
        debug!(repository = %self.key, "Repository verified");
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let mut delay = self.initial_retry_delay;
        let mut attempt = 1;
        loop {
            let err = match self.get_once(url) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= self.max_attempts {
                return Err(FetchError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let wait = match &err {
                FetchError::RateLimited {
                    retry_after: Some(retry_after),
                } => (*retry_after).min(MAX_RETRY_AFTER),
                _ => delay,
            };
            warn!(
                url,
                attempt,
                wait_ms = wait.as_millis() as u64,
                error = %err,
                "GitHub request failed, retrying"
            );
            std::thread::sleep(wait);
            delay = delay.saturating_mul(2);
            attempt += 1;
        }
    }

    fn get_once<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &response, url));
        }

        let body = response.text().map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_str(&body).map_err(|err| FetchError::Decode {
            url: url.to_string(),
            message: err.to_string(),
        })
    }
}

fn status_error(status: StatusCode, response: &Response, url: &str) -> FetchError {
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    // Secondary rate limits come back as 403 with an exhausted quota.
    let quota_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim() == "0");

    match status.as_u16() {
        401 => FetchError::Unauthorized,
        403 if quota_exhausted || retry_after.is_some() => FetchError::RateLimited { retry_after },
        403 => FetchError::Forbidden {
            url: url.to_string(),
        },
        404 => FetchError::NotFound {
            url: url.to_string(),
        },
        429 => FetchError::RateLimited { retry_after },
        code if status.is_server_error() => FetchError::Server {
            status: code,
            url: url.to_string(),
        },
        code => FetchError::Status {
            status: code,
            url: url.to_string(),
        },
    }
}

impl RunSource for GithubClient {
    fn list_runs_updated_since(
        &self,
        key: &RepositoryKey,
        since: DateTime<Utc>,
    ) -> Result<Vec<RunSnapshot>, FetchError> {
        let url = self.with_per_page(&format!(
            "{}/repos/{}/{}/actions/runs",
            self.api_url, key.owner, key.repo
        ));
        let page: WorkflowRunsPage = self.get_json(&url)?;
        let total = page.workflow_runs.len();

        // The API lists newest first; callers want oldest first.
        let mut runs: Vec<RunSnapshot> = page
            .workflow_runs
            .into_iter()
            .filter(|run| run.updated_at >= since)
            .map(RunSnapshot::from)
            .collect();
        runs.reverse();

        debug!(
            repository = %key,
            fetched = total,
            kept = runs.len(),
            since = %since,
            "Listed workflow runs"
        );
        Ok(runs)
    }

    fn list_jobs_for_run(&self, run: &RunSnapshot) -> Result<Vec<JobSnapshot>, FetchError> {
        let base = match run.jobs_url.as_deref().filter(|url| !url.is_empty()) {
            Some(url) => url.to_string(),
            None => format!("{}/actions/runs/{}/jobs", self.repo_url(), run.id),
        };
        let page: WorkflowJobsPage = self.get_json(&self.with_per_page(&base))?;
        Ok(page.jobs.into_iter().map(JobSnapshot::from).collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
pub(crate) mod fake {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Debug, Clone)]
    pub struct Request {
        pub path: String,
        pub head: String,
    }

    pub struct Reply {
        pub status: u16,
        pub headers: Vec<(&'static str, String)>,
        pub body: String,
    }

    impl Reply {
        pub fn json(body: impl Into<String>) -> Self {
            Self {
                status: 200,
                headers: Vec::new(),
                body: body.into(),
            }
        }

        pub fn status(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: "{\"message\":\"error\"}".to_string(),
            }
        }

        pub fn header(mut self, name: &'static str, value: &str) -> Self {
            self.headers.push((name, value.to_string()));
            self
        }
    }

    /// One-connection-per-request HTTP server on a loopback port.
    pub struct FakeServer {
        pub url: String,
        pub requests: Arc<Mutex<Vec<Request>>>,
    }

    impl FakeServer {
        pub fn start<F>(handler: F) -> Self
        where
            F: Fn(&Request) -> Reply + Send + 'static,
        {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
            let url = format!("http://{}", listener.local_addr().expect("local addr"));
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = Arc::clone(&requests);

            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(mut stream) = stream else { continue };
                    let mut buffer = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buffer.windows(4).any(|window| window == b"\r\n\r\n") {
                        match stream.read(&mut chunk) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buffer).to_string();
                    let path = head
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    let request = Request { path, head };
                    seen.lock().expect("requests lock").push(request.clone());

                    let reply = handler(&request);
                    let mut response = format!(
                        "HTTP/1.1 {} Fake\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n",
                        reply.status,
                        reply.body.len()
                    );
                    for (name, value) in &reply.headers {
                        response.push_str(&format!("{}: {}\r\n", name, value));
                    }
                    response.push_str("\r\n");
                    response.push_str(&reply.body);
                    let _ = stream.write_all(response.as_bytes());
                    let _ = stream.flush();
                }
            });

            Self { url, requests }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().expect("requests lock").len()
        }

        pub fn paths(&self) -> Vec<String> {
            self.requests
                .lock()
                .expect("requests lock")
                .iter()
                .map(|request| request.path.clone())
                .collect()
        }
    }
}
