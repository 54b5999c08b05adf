//! reqwest-based [`ResourceApi`]
//!
//! ## Authentication
//!
//! A bearer token is taken from `api.token` in the engine configuration,
//! usually supplied as `CONVERGE_API__TOKEN` through the environment file.
//!
//! ## Errors
//!
//! | HTTP status        | Error        |
//! |--------------------|--------------|
//! | 404                | `NotFound`   |
//! | 409, 412           | `Conflict`   |
//! | 429, 5xx           | `Transient`  |
//! | anything else      | `Http`       |
//!
//! Reads (fetch, list, poll) that fail transiently are retried a bounded
//! number of times with a doubling backoff, capped at [`MAX_RETRY_DELAY`].
//! Mutations are never retried here.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use converge_core::{
    ApiConfig, AsyncHandle, Error, JobStatus, OperationKind, Page, ResourceKey, Result, State,
    SubmitResponse,
};
use converge_engine::ResourceApi;

use crate::operation::{submit_response, OperationDocument};
use crate::routes::Routes;

/// Upper bound for a single read retry delay
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Management API client
pub struct RestApi {
    client: Client,
    base_url: String,
    token: Option<String>,
    routes: HashMap<String, Routes>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl RestApi {
    /// Create a client from the `[api]` configuration section
    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| Error::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone().filter(|t| !t.is_empty()),
            routes: HashMap::new(),
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff(),
        })
    }

    /// Client with routes for every built-in resource kind
    pub fn with_builtin_routes(config: &ApiConfig) -> Result<Self> {
        Ok(Self::from_config(config)?.with_routes(Routes::instance_group_manager()))
    }

    pub fn with_routes(mut self, routes: Routes) -> Self {
        self.routes.insert(routes.kind.clone(), routes);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn routes(&self, kind: &str) -> Result<&Routes> {
        self.routes
            .get(kind)
            .ok_or_else(|| Error::invalid_input(format!("no routes registered for {}", kind)))
    }

    /// Absolute URL for a path; absolute links from the server pass through
    fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send a request and decode the JSON body. An empty body is `None`.
    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<Option<Value>> {
        debug!("{} {}", method, url);
        let mut req = self.request(method, url);
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(transport_error)?;
        let status = resp.status();
        let text = resp.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// GET with bounded retries on transient failures
    async fn get(&self, url: &str) -> Result<Option<Value>> {
        let mut delay = self.retry_backoff;
        let mut attempt = 0;
        loop {
            match self.send(Method::GET, url, None).await {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(attempt, max = self.max_retries, ?delay, "Retrying GET {}: {}", url, e);
                    tokio::time::sleep(delay).await;
                    delay = next_backoff(delay);
                }
                other => return other,
            }
        }
    }
}

/// Double a retry delay without exceeding [`MAX_RETRY_DELAY`]
fn next_backoff(delay: Duration) -> Duration {
    delay.saturating_mul(2).min(MAX_RETRY_DELAY)
}

/// Map a non-success status to the error taxonomy
pub fn status_error(status: StatusCode, body: &str) -> Error {
    let message = format!("{} - {}", status, body.trim());
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => Error::conflict(message, None),
        StatusCode::TOO_MANY_REQUESTS => Error::Transient(message),
        s if s.is_server_error() => Error::Transient(message),
        _ => Error::Http(message),
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    if err.is_connect() || err.is_timeout() {
        Error::Transient(err.to_string())
    } else {
        Error::Http(err.to_string())
    }
}

#[async_trait]
impl ResourceApi for RestApi {
    async fn fetch(&self, key: &ResourceKey) -> Result<State> {
        let url = self.url(&self.routes(&key.kind)?.resource_path(key)?);
        self.get(&url)
            .await?
            .ok_or_else(|| Error::Http(format!("empty response fetching {}", key)))
    }

    async fn list(&self, parent: &ResourceKey, page_token: Option<&str>, page_size: Option<u32>) -> Result<Page> {
        let routes = self.routes(&parent.kind)?;
        let mut url = reqwest::Url::parse(&self.url(&routes.collection_path(parent)?))
            .map_err(|e| Error::invalid_input(format!("bad list URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(size) = page_size {
                query.append_pair("maxResults", &size.to_string());
            }
            if let Some(token) = page_token {
                query.append_pair("pageToken", token);
            }
        }
        let url = url.to_string().trim_end_matches('?').to_string();

        let body = self.get(&url).await?.unwrap_or(Value::Null);
        let items = body
            .get(&routes.items_field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let next_page_token = body
            .get("nextPageToken")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_string);
        debug!(count = items.len(), more = next_page_token.is_some(), "Listed {}", parent);
        Ok(Page {
            items,
            next_page_token,
        })
    }

    async fn submit(&self, key: &ResourceKey, kind: &OperationKind, body: &Value) -> Result<SubmitResponse> {
        let routes = self.routes(&key.kind)?;
        let (method, path, body) = match kind {
            OperationKind::Create => (Method::POST, routes.collection_path(key)?, Some(body)),
            OperationKind::Update(name) => {
                let (method, path) = routes.update_request(name, key)?;
                (method, path, Some(body))
            }
            OperationKind::Delete => (Method::DELETE, routes.resource_path(key)?, None),
        };
        info!(resource = %key, operation = %kind, "{} {}", method, path);
        let response = self.send(method, &self.url(&path), body).await?;
        Ok(submit_response(response))
    }

    async fn poll(&self, handle: &AsyncHandle) -> Result<JobStatus> {
        let body = self
            .get(&self.url(&handle.status_url))
            .await?
            .ok_or_else(|| Error::Http(format!("empty response polling {}", handle)))?;
        let doc = OperationDocument::detect(&body).ok_or_else(|| {
            Error::Http(format!("operation {} returned a non-operation document", handle.id))
        })?;
        Ok(doc.job_status())
    }
}
