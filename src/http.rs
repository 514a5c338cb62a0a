//! HTTP request/response client.
//!
//! One call posts one JSON-RPC envelope and decodes one reply; batched calls
//! post an array and correlate replies by envelope id rather than array
//! position. Failures always propagate to the caller; retry policy is a
//! caller concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;

use crate::envelope::{RpcRequest, RpcResponse};

const ERROR_BODY_SNIPPET_LEN: usize = 220;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HttpClientDefaults;

impl HttpClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
}

/// Connection and timeout options for [`HttpClient`].
#[derive(Clone, Debug)]
pub struct HttpClientOptions {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: HttpClientDefaults::CONNECT_TIMEOUT,
            request_timeout: HttpClientDefaults::REQUEST_TIMEOUT,
        }
    }
}

/// Validator applied to a decoded result payload before it is returned.
pub type ResponseValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// One element of a batched exchange.
#[derive(Clone)]
pub struct RpcCall {
    method: String,
    params: Vec<Value>,
    validate: Option<ResponseValidator>,
}

impl RpcCall {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            validate: None,
        }
    }

    /// Attaches a result validator evaluated before the value is returned.
    pub fn with_validator<V>(mut self, validate: V) -> Self
    where
        V: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }
}

impl std::fmt::Debug for RpcCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcCall")
            .field("method", &self.method)
            .field("params", &self.params)
            .field("validated", &self.validate.is_some())
            .finish()
    }
}

/// Request/response client for a node's HTTP endpoint.
#[derive(Clone)]
pub struct HttpClient {
    http: Client,
    url: String,
    api_key: Option<SecretString>,
    request_timeout: Duration,
    next_id: Arc<AtomicU64>,
}

impl HttpClient {
    pub fn new(url: impl Into<String>) -> Result<Self, HttpRpcError> {
        Self::with_options(url, None, HttpClientOptions::default())
    }

    pub fn with_api_key(
        url: impl Into<String>,
        api_key: SecretString,
    ) -> Result<Self, HttpRpcError> {
        Self::with_options(url, Some(api_key), HttpClientOptions::default())
    }

    pub fn with_options(
        url: impl Into<String>,
        api_key: Option<SecretString>,
        options: HttpClientOptions,
    ) -> Result<Self, HttpRpcError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(HttpRpcError::Transport)?;

        Ok(Self {
            http,
            url: url.into(),
            api_key,
            request_timeout: options.request_timeout,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Sends one request and returns the validated result payload.
    ///
    /// `validate` is a shape predicate over the decoded result; a reply that
    /// fails it is a [`HttpRpcError::Protocol`] error, never a partial value.
    pub async fn call<V>(
        &self,
        method: &str,
        params: Vec<Value>,
        validate: V,
    ) -> Result<Value, HttpRpcError>
    where
        V: Fn(&Value) -> bool,
    {
        let request = RpcRequest::new(self.allocate_id(), method, params);
        let body = self.post(&serde_json::to_value(&request).map_err(|err| {
            HttpRpcError::Protocol {
                method: method.to_string(),
                detail: format!("failed to encode request: {err}"),
            }
        })?)
        .await?;

        let reply: RpcResponse =
            serde_json::from_str(&body).map_err(|err| HttpRpcError::Protocol {
                method: method.to_string(),
                detail: format!("failed to decode reply envelope: {err}"),
            })?;
        if reply.id != request.id {
            return Err(HttpRpcError::Protocol {
                method: method.to_string(),
                detail: format!("reply id {} does not match request id {}", reply.id, request.id),
            });
        }

        let value = reply.into_result().map_err(|error| HttpRpcError::Rpc {
            method: method.to_string(),
            code: error.code,
            message: error.message,
        })?;
        if !validate(&value) {
            return Err(HttpRpcError::Protocol {
                method: method.to_string(),
                detail: "result failed shape validation".to_string(),
            });
        }
        Ok(value)
    }

    /// Sends `calls` as one exchange and returns results in request order.
    ///
    /// Replies are matched by envelope id. Any failed member fails the whole
    /// batch; callers must not assume any element succeeded when this
    /// returns an error.
    pub async fn batch_call(&self, calls: Vec<RpcCall>) -> Result<Vec<Value>, HttpRpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let requests: Vec<RpcRequest> = calls
            .iter()
            .map(|call| RpcRequest::new(self.allocate_id(), &call.method, call.params.clone()))
            .collect();

        let body = self
            .post(&serde_json::to_value(&requests).map_err(|err| HttpRpcError::Protocol {
                method: "batch".to_string(),
                detail: format!("failed to encode batch: {err}"),
            })?)
            .await?;

        let replies: Vec<RpcResponse> =
            serde_json::from_str(&body).map_err(|err| HttpRpcError::Protocol {
                method: "batch".to_string(),
                detail: format!("failed to decode batch reply: {err}"),
            })?;

        correlate_batch(&calls, &requests, replies)
    }

    async fn post(&self, body: &Value) -> Result<String, HttpRpcError> {
        let mut builder = self
            .http
            .post(&self.url)
            .timeout(self.request_timeout)
            .json(body);

        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("x-api-key", api_key.expose_secret());
        }

        let response = builder.send().await.map_err(HttpRpcError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(HttpRpcError::Transport)?;

        if !status.is_success() {
            return Err(HttpRpcError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }
        Ok(body)
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Errors produced by the request/response transport.
#[derive(Debug, Error)]
pub enum HttpRpcError {
    /// Network-level failure: the call could not complete.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Non-success HTTP status before any envelope could be decoded.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Server-reported error envelope for one call.
    #[error("{method} failed with code {code}: {message}")]
    Rpc {
        method: String,
        code: i64,
        message: String,
    },

    /// A reply was received but does not match the expected shape.
    #[error("protocol error for {method}: {detail}")]
    Protocol { method: String, detail: String },
}

/// Matches batch replies to their requests by envelope id and validates each
/// result, failing the whole batch on the first failed member.
fn correlate_batch(
    calls: &[RpcCall],
    requests: &[RpcRequest],
    replies: Vec<RpcResponse>,
) -> Result<Vec<Value>, HttpRpcError> {
    if replies.len() != requests.len() {
        return Err(HttpRpcError::Protocol {
            method: "batch".to_string(),
            detail: format!(
                "batch of {} requests received {} replies",
                requests.len(),
                replies.len()
            ),
        });
    }

    let mut by_id = std::collections::HashMap::with_capacity(replies.len());
    for reply in replies {
        if by_id.insert(reply.id, reply).is_some() {
            return Err(HttpRpcError::Protocol {
                method: "batch".to_string(),
                detail: "duplicate reply id in batch".to_string(),
            });
        }
    }

    let mut results = Vec::with_capacity(requests.len());
    for (call, request) in calls.iter().zip(requests) {
        let reply = by_id.remove(&request.id).ok_or_else(|| HttpRpcError::Protocol {
            method: call.method.clone(),
            detail: format!("batch reply missing for id {}", request.id),
        })?;

        let value = reply.into_result().map_err(|error| HttpRpcError::Rpc {
            method: call.method.clone(),
            code: error.code,
            message: error.message,
        })?;

        if let Some(validate) = call.validate.as_ref() {
            if !validate(&value) {
                return Err(HttpRpcError::Protocol {
                    method: call.method.clone(),
                    detail: "batch member failed shape validation".to_string(),
                });
            }
        }
        results.push(value);
    }
    Ok(results)
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, serde::Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}
