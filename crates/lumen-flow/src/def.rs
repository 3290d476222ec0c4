use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

/// A document holding flow definitions, as loaded from disk.
///
/// ```json
/// {
///   "flows": [
///     {
///       "name": "unit_content",
///       "inputs": ["unit_id", "topic"],
///       "steps": [
///         { "name": "outline", "handler": "llm", "produces": ["outline"] },
///         { "name": "lessons", "handler": "llm", "requires": ["outline"], "max_retries": 2 }
///       ]
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowsFile {
  pub flows: Vec<FlowDef>,
}

impl FlowsFile {
  pub fn from_json(content: &str) -> Result<Self, FlowError> {
    Ok(serde_json::from_str(content)?)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
  pub name: String,
  /// Keys the caller supplies as initial inputs. When declared, step
  /// requirements are checked against them when the registry is built.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub inputs: Vec<String>,
  pub steps: Vec<StepDef>,
  /// Default retry budget for steps that do not set their own.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_retries: Option<u32>,
  /// Default queue for steps that do not set their own.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub queue: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
  pub name: String,
  /// Id of the handler that executes this step.
  pub handler: String,
  /// Keys this step consumes. When set, only these keys are passed.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub requires: Vec<String>,
  /// Keys this step's output provides to later steps.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub produces: Vec<String>,
  /// Input mapping rendered against the accumulated context. String values
  /// may contain minijinja templates, e.g. `"Write about {{ topic }}"`.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub inputs: BTreeMap<String, serde_json::Value>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_retries: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub queue: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<i32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub timeout_ms: Option<u64>,
  /// Handler-specific configuration, passed through untouched.
  #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
  pub config: serde_json::Value,
}

impl StepDef {
  pub fn new(name: impl Into<String>, handler: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      handler: handler.into(),
      requires: Vec::new(),
      produces: Vec::new(),
      inputs: BTreeMap::new(),
      max_retries: None,
      queue: None,
      priority: None,
      timeout_ms: None,
      config: serde_json::Value::Null,
    }
  }

  pub fn requires<I, S>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.requires = keys.into_iter().map(Into::into).collect();
    self
  }

  pub fn produces<I, S>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.produces = keys.into_iter().map(Into::into).collect();
    self
  }

  pub fn input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
    self.inputs.insert(key.into(), value);
    self
  }

  pub fn max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }

  pub fn queue(mut self, queue: impl Into<String>) -> Self {
    self.queue = Some(queue.into());
    self
  }

  pub fn priority(mut self, priority: i32) -> Self {
    self.priority = Some(priority);
    self
  }

  pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
    self.timeout_ms = Some(timeout_ms);
    self
  }

  pub fn config(mut self, config: serde_json::Value) -> Self {
    self.config = config;
    self
  }
}

impl FlowDef {
  pub fn new(name: impl Into<String>, steps: Vec<StepDef>) -> Self {
    Self {
      name: name.into(),
      inputs: Vec::new(),
      steps,
      max_retries: None,
      queue: None,
    }
  }

  pub fn with_inputs<I, S>(mut self, keys: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.inputs = keys.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_max_retries(mut self, max_retries: u32) -> Self {
    self.max_retries = Some(max_retries);
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_flows_file() {
    let content = r#"{
      "flows": [{
        "name": "unit_content",
        "inputs": ["topic"],
        "max_retries": 1,
        "steps": [
          {"name": "outline", "handler": "llm", "produces": ["outline"],
           "inputs": {"prompt": "Outline {{ topic }}"}},
          {"name": "lessons", "handler": "llm", "requires": ["outline"],
           "max_retries": 3, "queue": "background", "timeout_ms": 30000,
           "config": {"model": "small"}}
        ]
      }]
    }"#;

    let file = FlowsFile::from_json(content).unwrap();
    let flow = &file.flows[0];
    assert_eq!(flow.name, "unit_content");
    assert_eq!(flow.max_retries, Some(1));
    assert_eq!(flow.steps.len(), 2);
    assert_eq!(flow.steps[0].inputs["prompt"], json!("Outline {{ topic }}"));
    assert_eq!(flow.steps[1].queue.as_deref(), Some("background"));
    assert_eq!(flow.steps[1].config, json!({"model": "small"}));
    assert!(flow.steps[0].config.is_null());
  }

  #[test]
  fn test_rejects_malformed_file() {
    assert!(matches!(
      FlowsFile::from_json(r#"{"flows": [{"name": "x"}]}"#),
      Err(FlowError::Parse(_))
    ));
  }
}
