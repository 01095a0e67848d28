//! Network boundary
//!
//! The request transport consumed by the request queue, and the
//! network-quality signal that sizes its concurrency budget.

mod http;
mod quality;

pub use http::HttpTransport;
pub use quality::{EffectiveType, NetworkMonitor, NetworkStatus};

use crate::error::ResilienceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// Per-request options handed to the transport untouched
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestOptions {
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportResponse {
    pub status: u16,
    /// Decoded JSON body, `Value::Null` when the body was empty
    pub body: Value,
}

impl TransportResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Request/response transport.
///
/// Implementations return `Ok` for any response that arrived, successful or
/// not; the caller decides what counts as a failure. Dropping the returned
/// future must abandon the request.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        target: &str,
        options: &RequestOptions,
    ) -> ResilienceResult<TransportResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_success_range() {
        assert!(TransportResponse::ok(Value::Null).is_success());
        assert!(TransportResponse::new(204, Value::Null).is_success());
        assert!(!TransportResponse::new(304, Value::Null).is_success());
        assert!(!TransportResponse::new(503, Value::Null).is_success());
    }

    #[test]
    fn test_request_options_builder() {
        let opts = RequestOptions::post(json!({"title": "x"}))
            .with_method(Method::Patch)
            .with_header("X-Trace", "abc");
        assert_eq!(opts.method.as_str(), "PATCH");
        assert_eq!(opts.headers.get("X-Trace").map(String::as_str), Some("abc"));
        assert_eq!(opts.body, Some(json!({"title": "x"})));
    }
}
