use super::{Method, RequestOptions, Transport, TransportResponse};
use crate::error::{ResilienceError, ResilienceResult};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::time::Duration;

/// Default [`Transport`] over HTTP.
///
/// Relative targets (`/api/items`) are joined to the base URL, absolute ones
/// are used as-is. The per-attempt timeout is enforced by the request queue,
/// the client-level timeout here is only a backstop.
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> ResilienceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(16)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            client,
        })
    }

    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn set_token(&mut self, token: &str) {
        self.token = Some(token.to_string());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn resolve(&self, target: &str) -> String {
        if target.starts_with("http://") || target.starts_with("https://") {
            target.to_string()
        } else if target.starts_with('/') {
            format!("{}{}", self.base_url, target)
        } else {
            format!("{}/{}", self.base_url, target)
        }
    }

    fn headers(&self, options: &RequestOptions) -> ResilienceResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ResilienceError::InvalidInput(format!("Bad token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ResilienceError::InvalidInput(format!("Bad header name: {}", e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ResilienceError::InvalidInput(format!("Bad header value: {}", e)))?;
            headers.insert(name, value);
        }
        Ok(headers)
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        target: &str,
        options: &RequestOptions,
    ) -> ResilienceResult<TransportResponse> {
        let url = self.resolve(target);
        let mut request = self
            .client
            .request(to_reqwest_method(options.method), &url)
            .headers(self.headers(options)?);

        if let Some(body) = &options.body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ResilienceError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| ResilienceError::Transport(format!("Failed to read response: {}", e)))?;

        // Non-JSON bodies are kept as a string so error pages stay inspectable
        let body = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::trace!("{} {} -> {}", options.method.as_str(), url, status);
        Ok(TransportResponse { status, body })
    }
}
