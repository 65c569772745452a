//! The transport seam.
//!
//! The coalescer never performs I/O itself. Every attempt goes through an [`Executor`], which
//! defaults to [`HttpExecutor`].

use std::future::Future;

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Url};
use serde_json::Value;

use crate::error::CoalescerError;
use crate::types::{Method, RequestConfig};

/// Performs a single attempt of a request.
///
/// Errors are normalized with [`CoalescerError::from_executor`]. To signal a specific failure,
/// such as a status code, return a [`CoalescerError`] converted into [`anyhow::Error`].
pub trait Executor: Send + Sync + 'static {
    fn execute(&self, config: RequestConfig) -> BoxFuture<'static, anyhow::Result<Value>>;
}

impl<F, Fut> Executor for F
where
    F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn execute(&self, config: RequestConfig) -> BoxFuture<'static, anyhow::Result<Value>> {
        self(config).boxed()
    }
}

/// Executes requests over HTTP, sending payloads and reading responses as JSON.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: Client,
    base_url: Option<Url>,
}

impl HttpExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Resolves relative endpoints against `base_url`.
    ///
    /// Resolution follows URL rules: `users` is appended to a base ending in `/`, whereas
    /// `/users` replaces the entire path.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn resolve_url(&self, endpoint: &str) -> anyhow::Result<Url> {
        match &self.base_url {
            Some(base) => base
                .join(endpoint)
                .with_context(|| format!("invalid endpoint `{endpoint}`")),
            None => Url::parse(endpoint).with_context(|| format!("invalid endpoint `{endpoint}`")),
        }
    }
}

fn to_http_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

async fn send(client: Client, url: Url, config: RequestConfig) -> anyhow::Result<Value> {
    let method = to_http_method(config.effective_method());
    tracing::trace!(%method, %url, "Sending request");

    let mut request = client
        .request(method, url)
        .header(CONTENT_TYPE, "application/json");
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(data) = &config.data {
        request = request.json(data);
    }

    let response = request.send().await.context("failed to send request")?;
    let status = response.status();
    if !status.is_success() {
        return Err(CoalescerError::Status(status.as_u16()).into());
    }

    let body = response
        .bytes()
        .await
        .context("failed to read response body")?;
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&body).context("failed to parse response body")
}

impl Executor for HttpExecutor {
    fn execute(&self, config: RequestConfig) -> BoxFuture<'static, anyhow::Result<Value>> {
        match self.resolve_url(&config.endpoint) {
            Ok(url) => send(self.client.clone(), url, config).boxed(),
            Err(err) => futures::future::ready(Err(err)).boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_url() {
        let executor = HttpExecutor::default()
            .with_base_url(Url::parse("http://localhost:8080/api/").unwrap());

        assert_eq!(
            executor.resolve_url("users").unwrap().as_str(),
            "http://localhost:8080/api/users"
        );
        assert_eq!(
            executor.resolve_url("/users").unwrap().as_str(),
            "http://localhost:8080/users"
        );
        assert_eq!(
            executor.resolve_url("https://example.com/x").unwrap().as_str(),
            "https://example.com/x"
        );

        assert!(HttpExecutor::default().resolve_url("/users").is_err());
    }

    #[tokio::test]
    async fn test_closure_executor() {
        let executor = |config: RequestConfig| async move {
            Ok::<_, anyhow::Error>(Value::String(config.endpoint))
        };
        let value = Executor::execute(&executor, RequestConfig::new("/a"))
            .await
            .unwrap();
        assert_eq!(value, Value::String("/a".into()));
    }
}
