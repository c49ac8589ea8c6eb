//! etcd v2 HTTP client
//!
//! Talks to the `/v2/keys` API:
//! - `PUT ?prevExist=false` for create-if-absent
//! - `POST` on a directory for in-order (sequential) keys
//! - `PUT ?prevValue=` / `DELETE ?prevValue=` for compare-and-swap / compare-and-delete
//! - `GET ?recursive=true&sorted=true` for ordered listings
//! - `GET ?wait=true&waitIndex=` for watches
//!
//! Requests go to the endpoint that last answered; connection failures fail over to the
//! next configured endpoint.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{BackendError, Result};
use crate::node::{CreateOutcome, DeleteOutcome, Node, SwapOutcome, WatchAction, WatchEvent};
use crate::CoordinationBackend;

const KEYS_PATH: &str = "/v2/keys";
const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";

const ERROR_KEY_NOT_FOUND: u32 = 100;
const ERROR_TEST_FAILED: u32 = 101;
const ERROR_NODE_EXISTS: u32 = 105;
const ERROR_EVENT_INDEX_CLEARED: u32 = 401;

/// Configuration for the etcd client
#[derive(Debug, Clone)]
pub struct EtcdClientConfig {
    /// Base URLs, e.g. `http://localhost:2379`
    pub endpoints: Vec<String>,
    /// Timeout for every request except watches
    pub request_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
}

impl Default for EtcdClientConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://localhost:2379".to_string()],
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl EtcdClientConfig {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    #[serde(flatten)]
    node: Node,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtcdErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl EtcdErrorBody {
    /// `prevValue` mismatch or a missing key
    fn is_precondition_failure(&self) -> bool {
        self.error_code == ERROR_TEST_FAILED || self.error_code == ERROR_KEY_NOT_FOUND
    }
}

/// Decoded reply: either a keys response or an etcd error body
enum Reply {
    Success { body: EtcdResponse },
    Failure { status: StatusCode, error: EtcdErrorBody },
    Empty { index: Option<u64> },
}

/// etcd v2 implementation of [`CoordinationBackend`]
pub struct EtcdClient {
    http: Client,
    config: EtcdClientConfig,
    current: AtomicUsize,
}

impl EtcdClient {
    pub fn new(config: EtcdClientConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(BackendError::Unavailable("no etcd endpoints configured".to_string()));
        }

        let http = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            http,
            config,
            current: AtomicUsize::new(0),
        })
    }

    /// Endpoint requests are currently sent to
    pub fn active_endpoint(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.config.endpoints.len();
        &self.config.endpoints[idx]
    }

    /// Each key segment is percent-encoded so names cannot leak into the query or fragment
    fn key_url(endpoint: &str, key: &str) -> String {
        let endpoint = endpoint.trim_end_matches('/');
        let segments: Vec<_> = key
            .split('/')
            .filter(|s| !s.is_empty())
            .map(urlencoding::encode)
            .collect();
        format!("{}{}/{}", endpoint, KEYS_PATH, segments.join("/"))
    }

    /// Send a request, failing over across endpoints on connection errors
    async fn send<F>(&self, key: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client, String) -> RequestBuilder,
    {
        let count = self.config.endpoints.len();
        let start = self.current.load(Ordering::Relaxed) % count;
        let mut failures = Vec::new();

        for attempt in 0..count {
            let idx = (start + attempt) % count;
            let endpoint = &self.config.endpoints[idx];

            match build(&self.http, Self::key_url(endpoint, key)).send().await {
                Ok(response) => {
                    if idx != start {
                        self.current.store(idx, Ordering::Relaxed);
                        info!(endpoint = %endpoint, "Switched to etcd endpoint");
                    }
                    return Ok(response);
                }
                Err(e) if e.is_connect() => {
                    warn!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    failures.push(format!("{}: {}", endpoint, e));
                }
                Err(e) if e.is_timeout() => {
                    return Err(BackendError::Unavailable(format!("{}: {}", endpoint, e)));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(BackendError::Unavailable(failures.join("; ")))
    }

    async fn read(response: Response) -> Result<Reply> {
        let status = response.status();
        let index = response
            .headers()
            .get(ETCD_INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let text = response.text().await?;

        if text.trim().is_empty() {
            return Ok(Reply::Empty { index });
        }

        if status.is_success() {
            let body: EtcdResponse = serde_json::from_str(&text)?;
            Ok(Reply::Success { body })
        } else {
            match serde_json::from_str::<EtcdErrorBody>(&text) {
                Ok(error) => Ok(Reply::Failure { status, error }),
                Err(_) => Err(BackendError::Api {
                    status: status.as_u16(),
                    error_code: 0,
                    message: text,
                }),
            }
        }
    }

    fn api_error(status: StatusCode, error: EtcdErrorBody) -> BackendError {
        let message = if error.cause.is_empty() {
            error.message
        } else {
            format!("{} ({})", error.message, error.cause)
        };
        BackendError::Api {
            status: status.as_u16(),
            error_code: error.error_code,
            message,
        }
    }

    fn unexpected_empty(operation: &str, key: &str) -> BackendError {
        BackendError::Decode(format!("empty response to {} on {}", operation, key))
    }

    fn timeout(&self) -> Duration {
        self.config.request_timeout
    }
}

#[async_trait]
impl CoordinationBackend for EtcdClient {
    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<CreateOutcome> {
        let ttl = ttl_seconds.to_string();
        let response = self
            .send(key, |http, url| {
                http.put(url)
                    .timeout(self.timeout())
                    .query(&[("prevExist", "false")])
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { body } => Ok(CreateOutcome::Created(body.node.node)),
            Reply::Failure { error, .. } if error.error_code == ERROR_NODE_EXISTS => {
                debug!(key, index = error.index, "Key already exists");
                Ok(CreateOutcome::AlreadyExists { index: error.index })
            }
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Err(Self::unexpected_empty("create", key)),
        }
    }

    async fn create_sequential(
        &self,
        parent_key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<Node> {
        let ttl = ttl_seconds.to_string();
        let response = self
            .send(parent_key, |http, url| {
                http.post(url)
                    .timeout(self.timeout())
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { body } => Ok(body.node.node),
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Err(Self::unexpected_empty("create_sequential", parent_key)),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl_seconds: u64,
    ) -> Result<SwapOutcome> {
        let ttl = ttl_seconds.to_string();
        let response = self
            .send(key, |http, url| {
                http.put(url)
                    .timeout(self.timeout())
                    .query(&[("prevValue", expected)])
                    .form(&[("value", new_value), ("ttl", ttl.as_str())])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { body } => Ok(SwapOutcome::Swapped(body.node.node)),
            Reply::Failure { error, .. } if error.is_precondition_failure() => {
                debug!(key, error_code = error.error_code, "Compare-and-swap precondition failed");
                Ok(SwapOutcome::PreconditionFailed)
            }
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Err(Self::unexpected_empty("compare_and_swap", key)),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<DeleteOutcome> {
        let response = self
            .send(key, |http, url| {
                http.delete(url)
                    .timeout(self.timeout())
                    .query(&[("prevValue", expected)])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { .. } => Ok(DeleteOutcome::Deleted),
            Reply::Failure { error, .. } if error.is_precondition_failure() => {
                debug!(
                    key,
                    error_code = error.error_code,
                    "Compare-and-delete precondition failed"
                );
                Ok(DeleteOutcome::PreconditionFailed)
            }
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Err(Self::unexpected_empty("compare_and_delete", key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<Node> {
        let ttl = ttl_seconds.to_string();
        let response = self
            .send(key, |http, url| {
                http.put(url)
                    .timeout(self.timeout())
                    .form(&[("value", value), ("ttl", ttl.as_str())])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { body } => Ok(body.node.node),
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Err(Self::unexpected_empty("set", key)),
        }
    }

    async fn list_sorted(&self, key: &str) -> Result<Vec<Node>> {
        let response = self
            .send(key, |http, url| {
                http.get(url)
                    .timeout(self.timeout())
                    .query(&[("recursive", "true"), ("sorted", "true")])
            })
            .await?;

        match Self::read(response).await? {
            Reply::Success { body } => Ok(body
                .node
                .nodes
                .into_iter()
                .filter(|child| !child.dir)
                .map(|child| child.node)
                .collect()),
            Reply::Failure { error, .. } if error.error_code == ERROR_KEY_NOT_FOUND => {
                Ok(Vec::new())
            }
            Reply::Failure { status, error } => Err(Self::api_error(status, error)),
            Reply::Empty { .. } => Ok(Vec::new()),
        }
    }

    async fn watch(&self, key: &str, wait_index: Option<u64>) -> Result<WatchEvent> {
        let mut wait_index = wait_index;

        loop {
            let index_param = wait_index.map(|i| i.to_string());
            let response = self
                .send(key, |http, url| {
                    let request = http.get(url).query(&[("wait", "true")]);
                    match &index_param {
                        Some(index) => request.query(&[("waitIndex", index.as_str())]),
                        None => request,
                    }
                })
                .await?;

            match Self::read(response).await? {
                Reply::Success { body } => {
                    return Ok(WatchEvent {
                        action: WatchAction::parse(&body.action),
                        node: body.node.node,
                    });
                }
                Reply::Failure { error, .. } if error.error_code == ERROR_EVENT_INDEX_CLEARED => {
                    return Err(BackendError::EventIndexCleared {
                        key: key.to_string(),
                        requested: wait_index.unwrap_or_default(),
                        current: error.index,
                    });
                }
                Reply::Failure { status, error } => return Err(Self::api_error(status, error)),
                Reply::Empty { index } => {
                    // Long poll ended without an event; resume after what the server had seen
                    debug!(key, ?index, "Watch returned without an event, re-issuing");
                    if wait_index.is_none() {
                        wait_index = index.map(|i| i + 1);
                    }
                }
            }
        }
    }
}
