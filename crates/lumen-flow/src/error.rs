use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
  #[error("flow not found: {0}")]
  FlowNotFound(String),

  #[error("flow defined twice: {0}")]
  DuplicateFlow(String),

  #[error("flow '{flow}' has no steps")]
  EmptyFlow { flow: String },

  #[error("flow '{flow}' defines step '{step}' twice")]
  DuplicateStep { flow: String, step: String },

  #[error("flow '{flow}' step '{step}' uses unknown handler '{handler}'")]
  UnknownHandler {
    flow: String,
    step: String,
    handler: String,
  },

  #[error("flow '{flow}' step '{step}' requires '{key}', which no flow input or earlier step provides")]
  UnsatisfiedInput {
    flow: String,
    step: String,
    key: String,
  },

  #[error("step '{step}' is missing required input '{key}'")]
  MissingInput { step: String, key: String },

  #[error("input resolution failed for step '{step}': {message}")]
  InputResolution { step: String, message: String },

  #[error("handler registered twice: {0}")]
  DuplicateHandler(String),

  #[error("failed to parse flow definitions: {0}")]
  Parse(#[from] serde_json::Error),
}
