// Copyright 2024 OctoFHIR Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! HTTP transport for declarative `http` rules
//!
//! A rule's request template is resolved against the rule scope into a
//! [`ResolvedHttpRequest`]: every `queryParams` value and every string leaf
//! of `body` is an expression. The resolved request's fingerprint keys the
//! response cache and decides whether a new request is needed at all.

use crate::evaluator::value::to_display_string;
use crate::evaluator::{EvaluationResult, EvaluationScope, ExpressionEvaluator};
use crate::model::HttpRequestConfig;
use async_trait::async_trait;
use indexmap::IndexMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

/// Errors raised by an HTTP transport
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpError {
    /// Request could not be sent
    #[error("HTTP request to '{url}' failed: {message}")]
    Transport {
        /// Request URL
        url: String,
        /// Transport message
        message: String,
    },

    /// Non-success status code
    #[error("HTTP request to '{url}' returned status {status}")]
    Status {
        /// Request URL
        url: String,
        /// Status code
        status: u16,
    },

    /// Body was not JSON
    #[error("HTTP response from '{url}' is not valid JSON: {message}")]
    Decode {
        /// Request URL
        url: String,
        /// Decoder message
        message: String,
    },

    /// Method string not understood
    #[error("Unsupported HTTP method '{0}'")]
    InvalidMethod(String),
}

/// A request with every expression evaluated
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedHttpRequest {
    /// Upper-case method
    pub method: String,
    /// Full URL including the query string
    pub url: String,
    /// Request headers
    pub headers: IndexMap<String, String>,
    /// JSON body
    pub body: Option<Value>,
}

impl ResolvedHttpRequest {
    /// Cache key; requests with equal fingerprints return equal responses
    pub fn fingerprint(&self) -> String {
        match &self.body {
            Some(body) => format!("{} {} {}", self.method, self.url, body),
            None => format!("{} {}", self.method, self.url),
        }
    }

    /// Resolve a request template against a rule scope
    pub fn resolve(
        evaluator: &ExpressionEvaluator,
        config: &HttpRequestConfig,
        scope: &EvaluationScope<'_>,
    ) -> EvaluationResult<Self> {
        let mut params = Vec::with_capacity(config.query_params.len());
        for (name, expression) in &config.query_params {
            let value = match evaluator.evaluate_source(expression, scope)? {
                Value::Null => String::new(),
                other => to_display_string(&other),
            };
            params.push((name.as_str(), value));
        }

        let url = match Url::parse(&config.url) {
            Ok(mut url) => {
                if !params.is_empty() {
                    url.query_pairs_mut().extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())));
                }
                url.to_string()
            }
            // relative URLs are kept as written; the transport decides
            Err(_) if params.is_empty() => config.url.clone(),
            Err(_) => {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(params.iter().map(|(k, v)| (*k, v.as_str())))
                    .finish();
                let separator = if config.url.contains('?') { '&' } else { '?' };
                format!("{}{separator}{query}", config.url)
            }
        };

        let body = config
            .body
            .as_ref()
            .map(|body| resolve_body(evaluator, body, scope))
            .transpose()?;

        Ok(Self {
            method: config.method.to_ascii_uppercase(),
            url,
            headers: config.headers.clone(),
            body,
        })
    }
}

fn resolve_body(
    evaluator: &ExpressionEvaluator,
    body: &Value,
    scope: &EvaluationScope<'_>,
) -> EvaluationResult<Value> {
    Ok(match body {
        Value::String(expression) => evaluator.evaluate_source(expression, scope)?,
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_body(evaluator, item, scope))
                .collect::<EvaluationResult<_>>()?,
        ),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve_body(evaluator, value, scope)?);
            }
            Value::Object(resolved)
        }
        other => other.clone(),
    })
}

/// Sends resolved requests; the response body is returned as JSON
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform the request
    async fn send(&self, request: &ResolvedHttpRequest) -> Result<Value, HttpError>;
}

/// Transport backed by `reqwest`
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Transport with a default client
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport with a preconfigured client
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ResolvedHttpRequest) -> Result<Value, HttpError> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| HttpError::InvalidMethod(request.method.clone()))?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| HttpError::Transport {
            url: request.url.clone(),
            message: e.to_string(),
        })?;
        if !response.status().is_success() {
            return Err(HttpError::Status {
                url: request.url.clone(),
                status: response.status().as_u16(),
            });
        }
        response.json::<Value>().await.map_err(|e| HttpError::Decode {
            url: request.url.clone(),
            message: e.to_string(),
        })
    }
}

type MockHandler = Arc<dyn Fn(&ResolvedHttpRequest) -> Result<Value, HttpError> + Send + Sync>;

/// In-memory transport for tests and offline simulation
///
/// Requests are answered by the handler after an optional delay; every
/// request is recorded.
pub struct MockHttpTransport {
    handler: MockHandler,
    delay: Option<Duration>,
    requests: Mutex<Vec<ResolvedHttpRequest>>,
    calls: AtomicUsize,
}

impl std::fmt::Debug for MockHttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHttpTransport")
            .field("delay", &self.delay)
            .field("calls", &self.calls())
            .finish()
    }
}

impl MockHttpTransport {
    /// Answer every request with the handler's result
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&ResolvedHttpRequest) -> Result<Value, HttpError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            delay: None,
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Answer every request with the same body
    pub fn fixed(response: Value) -> Self {
        Self::new(move |_| Ok(response.clone()))
    }

    /// Delay each response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests sent
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests sent so far
    pub fn requests(&self) -> Vec<ResolvedHttpRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: &ResolvedHttpRequest) -> Result<Value, HttpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.handler)(request)
    }
}

#[derive(Debug, Clone)]
struct CachedResponse {
    expires_at: Instant,
    body: Value,
}

/// LRU cache of HTTP responses keyed by request fingerprint, with TTL
#[derive(Debug)]
pub struct ResponseCache {
    entries: Option<Mutex<LruCache<String, CachedResponse>>>,
}

impl ResponseCache {
    /// Create a cache; capacity 0 disables caching
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))),
        }
    }

    /// Live cached response
    pub fn get(&self, fingerprint: &str) -> Option<Value> {
        let mut entries = self.entries.as_ref()?.lock();
        match entries.get(fingerprint) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.body.clone()),
            Some(_) => {
                entries.pop(fingerprint);
                None
            }
            None => None,
        }
    }

    /// Store a response for `ttl`; a zero TTL stores nothing
    pub fn insert(&self, fingerprint: String, body: Value, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        if let Some(entries) = &self.entries {
            entries.lock().put(
                fingerprint,
                CachedResponse {
                    expires_at: Instant::now() + ttl,
                    body,
                },
            );
        }
    }

    /// Number of entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.lock().len())
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn config(value: Value) -> HttpRequestConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_resolve_query_params() {
        let evaluator = ExpressionEvaluator::default();
        let field = json!("ada lovelace");
        let form = json!({ "country": "UK" });
        let scope = EvaluationScope::new(&field, &form);

        let request = ResolvedHttpRequest::resolve(
            &evaluator,
            &config(json!({
                "url": "https://api.example.com/users/check",
                "queryParams": { "name": "fieldValue", "country": "formValue.country" }
            })),
            &scope,
        )
        .unwrap();

        assert_eq!(request.method, "GET");
        assert_eq!(
            request.url,
            "https://api.example.com/users/check?name=ada+lovelace&country=UK"
        );
        assert_eq!(
            request.fingerprint(),
            "GET https://api.example.com/users/check?name=ada+lovelace&country=UK"
        );
    }

    #[test]
    fn test_resolve_relative_url_and_body() {
        let evaluator = ExpressionEvaluator::default();
        let field = json!(5);
        let form = json!({ "sku": "A1" });
        let scope = EvaluationScope::new(&field, &form);

        let request = ResolvedHttpRequest::resolve(
            &evaluator,
            &config(json!({
                "url": "/api/stock",
                "method": "post",
                "queryParams": { "q": "fieldValue" },
                "body": { "sku": "formValue.sku", "qty": "fieldValue * 2", "fixed": 1 }
            })),
            &scope,
        )
        .unwrap();

        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "/api/stock?q=5");
        assert_eq!(request.body, Some(json!({ "sku": "A1", "qty": 10, "fixed": 1 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_cache_ttl() {
        let cache = ResponseCache::new(4);
        cache.insert("GET /a".to_string(), json!(1), Duration::from_millis(100));
        assert_eq!(cache.get("GET /a"), Some(json!(1)));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("GET /a"), None);
        assert!(cache.is_empty());

        cache.insert("GET /b".to_string(), json!(2), Duration::ZERO);
        assert_eq!(cache.get("GET /b"), None);
    }

    #[tokio::test]
    async fn test_mock_transport_records_requests() {
        let transport = MockHttpTransport::fixed(json!({ "available": true }));
        let request = ResolvedHttpRequest {
            method: "GET".to_string(),
            url: "/check".to_string(),
            headers: IndexMap::new(),
            body: None,
        };
        assert_eq!(transport.send(&request).await.unwrap(), json!({ "available": true }));
        assert_eq!(transport.calls(), 1);
        assert_eq!(transport.requests()[0].url, "/check");
    }
}
