//! Keeper HTTP client: `ProjectClient` over the control plane's REST project API.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use keeper_core::{Labels, ProjectClient, ProjectId, ProjectSnapshot, RemoteError};
use metrics::{counter, histogram};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

/// Connection settings for the control plane.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Url,
    /// Bearer token sent on every request when set.
    pub token: Option<String>,
    /// Per-request budget; a request exceeding it is a transient failure.
    pub request_timeout: Duration,
}

impl ClientConfig {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint, token: None, request_timeout: Duration::from_secs(30) }
    }

    /// `KEEPER_ENDPOINT` (default `http://127.0.0.1:8080`), `KEEPER_TOKEN`,
    /// `KEEPER_HTTP_TIMEOUT_SECS` (default 30).
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var("KEEPER_ENDPOINT").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let endpoint = Url::parse(&raw).with_context(|| format!("parsing KEEPER_ENDPOINT '{}'", raw))?;
        let token = std::env::var("KEEPER_TOKEN").ok().filter(|t| !t.is_empty());
        let secs = std::env::var("KEEPER_HTTP_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
        Ok(Self { endpoint, token, request_timeout: Duration::from_secs(secs) })
    }
}

/// Request body for create and update.
#[derive(Debug, Serialize)]
struct ProjectWrite<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    labels: Option<&'a Labels>,
}

/// Project as returned by the control plane.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRead {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    labels: Option<Labels>,
    #[serde(default)]
    status: String,
    creation_timestamp: DateTime<Utc>,
    #[serde(default)]
    deletion_timestamp: Option<DateTime<Utc>>,
}

impl From<ProjectRead> for ProjectSnapshot {
    fn from(p: ProjectRead) -> Self {
        ProjectSnapshot {
            name: p.name,
            labels: p.labels.unwrap_or_default(),
            status: p.status,
            creation_timestamp: p.creation_timestamp,
            deletion_timestamp: p.deletion_timestamp,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<String>,
}

/// Map a non-success response to a status error, preferring the server's message.
fn status_error(code: u16, body: &str) -> RemoteError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(b) if !b.error.details.is_empty() => format!("{} ({})", b.error.message, b.error.details.join("; ")),
        Ok(b) if !b.error.message.is_empty() => b.error.message,
        _ if !body.trim().is_empty() => body.trim().chars().take(512).collect(),
        _ => reqwest::StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("unexpected status")
            .to_string(),
    };
    RemoteError::Status { code, message }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    if e.is_decode() {
        return RemoteError::Decode(e.to_string());
    }
    RemoteError::Transport { message: e.to_string(), timeout: e.is_timeout(), temporary: e.is_connect() }
}

fn decode<T: for<'de> Deserialize<'de>>(body: &str) -> Result<T, RemoteError> {
    serde_json::from_str(body).map_err(|e| RemoteError::Decode(e.to_string()))
}

pub struct HttpProjectClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl HttpProjectClient {
    pub fn new(cfg: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .context("building HTTP client")?;
        Self::with_client(cfg, http)
    }

    /// Use a prebuilt `reqwest::Client`; `cfg.request_timeout` is not applied.
    pub fn with_client(cfg: ClientConfig, http: reqwest::Client) -> Result<Self> {
        if cfg.endpoint.cannot_be_a_base() {
            return Err(anyhow!("endpoint '{}' cannot be used as a base URL", cfg.endpoint));
        }
        Ok(Self { http, base: cfg.endpoint, token: cfg.token })
    }

    fn projects_url(&self, id: Option<&ProjectId>) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segs) = url.path_segments_mut() {
            segs.pop_if_empty().extend(["api", "v1", "projects"]);
            if let Some(id) = id {
                segs.push(id.as_str());
            }
        }
        url
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let rb = self.http.request(method, url);
        match &self.token {
            Some(t) => rb.bearer_auth(t),
            None => rb,
        }
    }

    /// Send and read the body; non-2xx responses become status errors.
    async fn send(&self, op: &'static str, rb: RequestBuilder) -> Result<String, RemoteError> {
        let t0 = Instant::now();
        counter!("keeper_http_requests", 1u64, "op" => op);
        let resp: Response = rb.send().await.map_err(transport_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(transport_error)?;
        histogram!("keeper_http_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "op" => op);
        debug!(op, status = status.as_u16(), took_ms = %t0.elapsed().as_millis(), "control plane responded");
        if status.is_success() {
            Ok(body)
        } else {
            counter!("keeper_http_errors", 1u64, "op" => op);
            Err(status_error(status.as_u16(), &body))
        }
    }
}

#[async_trait::async_trait]
impl ProjectClient for HttpProjectClient {
    async fn create(&self, name: &str, labels: Option<&Labels>) -> Result<ProjectId, RemoteError> {
        let rb = self.request(Method::POST, self.projects_url(None)).json(&ProjectWrite { name, labels });
        let body = self.send("create", rb).await?;
        let created: ProjectRead = decode(&body)?;
        if created.id.is_empty() {
            return Err(RemoteError::Decode("create response carries no project id".to_string()));
        }
        Ok(ProjectId::new(created.id))
    }

    async fn get(&self, id: &ProjectId) -> Result<ProjectSnapshot, RemoteError> {
        let body = self.send("get", self.request(Method::GET, self.projects_url(Some(id)))).await?;
        decode::<ProjectRead>(&body).map(Into::into)
    }

    async fn update(&self, id: &ProjectId, name: &str, labels: Option<&Labels>) -> Result<(), RemoteError> {
        let rb = self.request(Method::PUT, self.projects_url(Some(id))).json(&ProjectWrite { name, labels });
        self.send("update", rb).await.map(|_| ())
    }

    async fn delete(&self, id: &ProjectId) -> Result<(), RemoteError> {
        self.send("delete", self.request(Method::DELETE, self.projects_url(Some(id)))).await.map(|_| ())
    }
}
