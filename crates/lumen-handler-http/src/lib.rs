//! Lumen HTTP Handler
//!
//! A [`StepHandler`] that posts a step's inputs as JSON to an endpoint and
//! returns the JSON it answers with. This is how flows reach model
//! providers. The endpoint comes from the step's `config` block:
//!
//! ```json
//! {
//!   "name": "outline",
//!   "handler": "http",
//!   "config": {
//!     "url": "https://models.internal/v1/outline",
//!     "headers": { "authorization": "Bearer ..." },
//!     "timeout_ms": 60000
//!   }
//! }
//! ```

mod error;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lumen_flow::{StepContext, StepFailure, StepHandler};
use reqwest::{Client, Method};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

pub use error::HttpError;

/// Header carrying the task id, so endpoints can deduplicate retried calls.
pub const TASK_ID_HEADER: &str = "x-lumen-task-id";

/// Longest response excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 512;

/// Per-step request settings, read from the step's `config`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HttpConfig {
  pub url: String,
  #[serde(default = "default_method")]
  pub method: String,
  #[serde(default)]
  pub headers: HashMap<String, String>,
  pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
  "POST".to_string()
}

impl HttpConfig {
  pub fn from_step(config: &serde_json::Value) -> Result<Self, HttpError> {
    if config.is_null() {
      return Err(HttpError::InvalidConfig {
        message: "step has no config block".to_string(),
      });
    }
    serde_json::from_value(config.clone()).map_err(|e| HttpError::InvalidConfig {
      message: e.to_string(),
    })
  }

  /// Parse the URL, accepting only http and https.
  pub fn parsed_url(&self) -> Result<Url, HttpError> {
    let url = Url::parse(&self.url).map_err(|e| HttpError::InvalidUrl {
      url: self.url.clone(),
      message: e.to_string(),
    })?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      scheme => Err(HttpError::InvalidUrl {
        url: self.url.clone(),
        message: format!("unsupported scheme '{}'", scheme),
      }),
    }
  }

  fn parsed_method(&self) -> Result<Method, HttpError> {
    match self.method.to_uppercase().as_str() {
      "POST" => Ok(Method::POST),
      "PUT" => Ok(Method::PUT),
      "PATCH" => Ok(Method::PATCH),
      _ => Err(HttpError::InvalidConfig {
        message: format!("unsupported HTTP method: {}", self.method),
      }),
    }
  }
}

/// Calls the endpoint configured on each step.
#[derive(Debug, Clone, Default)]
pub struct HttpHandler {
  client: Client,
}

impl HttpHandler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Use a preconfigured client (proxies, TLS roots, pooling).
  pub fn with_client(client: Client) -> Self {
    Self { client }
  }

  /// Send `inputs` as configured and decode the JSON answer.
  pub async fn call(
    &self,
    config: &HttpConfig,
    task_id: &str,
    inputs: &serde_json::Value,
  ) -> Result<serde_json::Value, HttpError> {
    let url = config.parsed_url()?;
    let mut request = self
      .client
      .request(config.parsed_method()?, url)
      .header(TASK_ID_HEADER, task_id)
      .json(inputs);
    for (key, value) in &config.headers {
      request = request.header(key, value);
    }
    if let Some(timeout_ms) = config.timeout_ms {
      request = request.timeout(Duration::from_millis(timeout_ms));
    }

    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    debug!(status = status.as_u16(), bytes = body.len(), "endpoint responded");

    if !status.is_success() {
      return Err(HttpError::Status {
        status: status.as_u16(),
        body: excerpt(&body),
      });
    }
    serde_json::from_str(&body).map_err(|e| HttpError::NotJson {
      message: e.to_string(),
    })
  }
}

#[async_trait]
impl StepHandler for HttpHandler {
  async fn execute(
    &self,
    ctx: StepContext,
    inputs: serde_json::Value,
  ) -> Result<serde_json::Value, StepFailure> {
    let config = HttpConfig::from_step(&ctx.config)?;
    ctx.checkpoint()?;
    self
      .call(&config, &ctx.task_id, &inputs)
      .await
      .map_err(|e| {
        warn!(step = %ctx.step_name, url = %config.url, error = %e, "http step failed");
        StepFailure::from(e)
      })
  }
}

fn excerpt(body: &str) -> String {
  match body.char_indices().nth(ERROR_BODY_LIMIT) {
    Some((end, _)) => format!("{}...", &body[..end]),
    None => body.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  /// Serve one canned HTTP response on a local port and return its URL.
  async fn serve_once(status_line: &'static str, body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut buf = vec![0u8; 8192];
      let _ = socket.read(&mut buf).await;
      let response = format!(
        "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
        status_line,
        body.len(),
        body
      );
      socket.write_all(response.as_bytes()).await.unwrap();
      let _ = socket.shutdown().await;
    });
    format!("http://{}/v1/outline", addr)
  }

  fn step(url: &str) -> StepContext {
    StepContext::new("task-1", "outline").with_config(json!({ "url": url }))
  }

  #[test]
  fn test_config_defaults_and_validation() {
    let config = HttpConfig::from_step(&json!({"url": "https://models.internal/v1"})).unwrap();
    assert_eq!(config.method, "POST");
    assert!(config.headers.is_empty());
    assert!(config.parsed_url().is_ok());

    assert!(matches!(
      HttpConfig::from_step(&serde_json::Value::Null),
      Err(HttpError::InvalidConfig { .. })
    ));
    assert!(matches!(
      HttpConfig::from_step(&json!({"headers": {}})),
      Err(HttpError::InvalidConfig { .. })
    ));

    let ftp = HttpConfig::from_step(&json!({"url": "ftp://models.internal"})).unwrap();
    assert!(matches!(ftp.parsed_url(), Err(HttpError::InvalidUrl { .. })));
  }

  #[test]
  fn test_status_classification() {
    let status = |status| HttpError::Status {
      status,
      body: String::new(),
    };
    assert!(status(429).is_transient());
    assert!(status(500).is_transient());
    assert!(status(503).is_transient());
    assert!(!status(400).is_transient());
    assert!(!status(404).is_transient());
    assert!(
      !HttpError::NotJson {
        message: "expected value".to_string()
      }
      .is_transient()
    );
  }

  #[test]
  fn test_excerpt_truncates_long_bodies() {
    let long = "x".repeat(ERROR_BODY_LIMIT + 10);
    assert_eq!(excerpt(&long).len(), ERROR_BODY_LIMIT + 3);
    assert_eq!(excerpt("short"), "short");
  }

  #[tokio::test]
  async fn test_returns_json_response() {
    let url = serve_once("200 OK", r#"{"outline": ["tides", "moons"]}"#).await;
    let output = HttpHandler::new()
      .execute(step(&url), json!({"topic": "tides"}))
      .await
      .unwrap();
    assert_eq!(output, json!({"outline": ["tides", "moons"]}));
  }

  #[tokio::test]
  async fn test_server_error_is_transient() {
    let url = serve_once("503 Service Unavailable", r#"{"error": "overloaded"}"#).await;
    let failure = HttpHandler::new()
      .execute(step(&url), json!({}))
      .await
      .unwrap_err();
    assert!(failure.is_transient());
    assert!(failure.message().contains("503"));
  }

  #[tokio::test]
  async fn test_client_error_is_permanent() {
    let url = serve_once("422 Unprocessable Entity", r#"{"error": "bad prompt"}"#).await;
    let failure = HttpHandler::new()
      .execute(step(&url), json!({}))
      .await
      .unwrap_err();
    assert!(matches!(failure, StepFailure::Permanent(_)));
  }

  #[tokio::test]
  async fn test_non_json_body_is_permanent() {
    let url = serve_once("200 OK", "<html>hello</html>").await;
    let failure = HttpHandler::new()
      .execute(step(&url), json!({}))
      .await
      .unwrap_err();
    assert!(matches!(failure, StepFailure::Permanent(_)));
  }

  #[tokio::test]
  async fn test_refused_connection_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let failure = HttpHandler::new()
      .execute(step(&format!("http://{}/", addr)), json!({}))
      .await
      .unwrap_err();
    assert!(failure.is_transient());
  }

  #[tokio::test]
  async fn test_missing_config_is_permanent() {
    let ctx = StepContext::new("task-1", "outline");
    let failure = HttpHandler::new().execute(ctx, json!({})).await.unwrap_err();
    assert!(matches!(failure, StepFailure::Permanent(_)));
  }
}
