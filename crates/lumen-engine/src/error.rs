//! Engine errors.

use lumen_flow::FlowError;

/// Errors raised by the tracker, dispatcher and worker pool.
///
/// Handler failures are not errors at this level: they are recorded on the
/// task and step run and drive the retry policy.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  /// A storage operation failed.
  #[error(transparent)]
  Store(#[from] lumen_store::Error),

  /// A flow could not be resolved or its inputs derived.
  #[error(transparent)]
  Flow(#[from] FlowError),

  /// A step run points past the end of its flow's definition.
  #[error("flow '{flow}' has no step at index {index}")]
  UnknownStep { flow: String, index: i32 },

  /// Initial inputs of a flow run must be a JSON object.
  #[error("invalid inputs for flow '{flow}': {message}")]
  InvalidInputs { flow: String, message: String },

  /// The queue transport failed.
  #[error("transport error: {message}")]
  Transport { message: String },

  /// The configuration file could not be read or parsed.
  #[error("invalid config {path}: {message}")]
  Config { path: String, message: String },
}
