use lumen_flow::StepFailure;
use thiserror::Error;

/// Errors raised while calling an HTTP endpoint for a step.
#[derive(Debug, Error)]
pub enum HttpError {
  /// The step's `config` block is missing or malformed.
  #[error("invalid http config: {message}")]
  InvalidConfig { message: String },

  /// The configured URL cannot be used.
  #[error("invalid url '{url}': {message}")]
  InvalidUrl { url: String, message: String },

  /// The request could not be completed.
  #[error("http error: {0}")]
  Request(#[from] reqwest::Error),

  /// The endpoint answered with a non-success status.
  #[error("endpoint returned {status}: {body}")]
  Status { status: u16, body: String },

  /// The endpoint answered 2xx with a body that is not JSON.
  #[error("response is not JSON: {message}")]
  NotJson { message: String },
}

impl HttpError {
  /// Whether another attempt could succeed.
  ///
  /// Connect errors, timeouts, 429 and 5xx are worth retrying; everything
  /// else would fail the same way again.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Request(e) => !e.is_builder(),
      Self::Status { status, .. } => *status == 429 || *status >= 500,
      Self::InvalidConfig { .. } | Self::InvalidUrl { .. } | Self::NotJson { .. } => false,
    }
  }
}

impl From<HttpError> for StepFailure {
  fn from(error: HttpError) -> Self {
    if error.is_transient() {
      StepFailure::transient(error)
    } else {
      StepFailure::permanent(error)
    }
  }
}
