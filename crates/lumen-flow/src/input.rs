//! Input derivation for flow steps.
//!
//! A step's context is the flow's initial inputs merged with the outputs of
//! every earlier step, in step order. Object outputs merge key by key (later
//! steps win); any other output is stored under the producing step's name.
//!
//! The step's payload is then built from that context:
//! - with an `inputs` mapping, each mapped value is rendered with minijinja
//!   against the context (`"Write about {{ topic }}"`, `"{{ outline }}"`);
//! - otherwise the whole context is passed;
//! - if the step declares `requires`, the payload is narrowed to those keys
//!   and a missing key is an error.

use minijinja::{Environment, Value};

use crate::def::StepDef;
use crate::error::FlowError;

/// Merge the initial inputs with earlier step outputs.
///
/// `outputs` holds `(step_name, output)` pairs in step order.
pub fn accumulate<'a, I>(initial: &serde_json::Value, outputs: I) -> serde_json::Value
where
  I: IntoIterator<Item = (&'a str, &'a serde_json::Value)>,
{
  let mut context = match initial {
    serde_json::Value::Object(map) => map.clone(),
    serde_json::Value::Null => serde_json::Map::new(),
    other => {
      let mut map = serde_json::Map::new();
      map.insert("input".to_string(), other.clone());
      map
    }
  };

  for (step_name, output) in outputs {
    match output {
      serde_json::Value::Object(map) => {
        for (k, v) in map {
          context.insert(k.clone(), v.clone());
        }
      }
      serde_json::Value::Null => {}
      other => {
        context.insert(step_name.to_string(), other.clone());
      }
    }
  }

  serde_json::Value::Object(context)
}

/// Build the payload a step's handler receives.
pub fn resolve_step_inputs(
  step: &StepDef,
  context: &serde_json::Value,
) -> Result<serde_json::Value, FlowError> {
  let payload = if step.inputs.is_empty() {
    context.clone()
  } else {
    let env = Environment::new();
    let ctx_value = Value::from_serialize(context);
    let mut resolved = serde_json::Map::new();
    for (key, value) in &step.inputs {
      resolved.insert(
        key.clone(),
        resolve_json_value(&env, &step.name, key, value, &ctx_value)?,
      );
    }
    serde_json::Value::Object(resolved)
  };

  if step.requires.is_empty() {
    return Ok(payload);
  }

  let mut narrowed = serde_json::Map::new();
  for key in &step.requires {
    let value = payload
      .get(key)
      .ok_or_else(|| FlowError::MissingInput {
        step: step.name.clone(),
        key: key.clone(),
      })?;
    narrowed.insert(key.clone(), value.clone());
  }
  Ok(serde_json::Value::Object(narrowed))
}

/// Recursively resolve templates in a JSON value.
fn resolve_json_value(
  env: &Environment,
  step: &str,
  input_key: &str,
  value: &serde_json::Value,
  context: &Value,
) -> Result<serde_json::Value, FlowError> {
  match value {
    serde_json::Value::String(s) => {
      if !(s.contains("{{") || s.contains("{%")) {
        return Ok(value.clone());
      }
      // A lone `{{ expr }}` resolves to the referenced value itself, so
      // arrays and objects pass through without being stringified.
      if let Some(expr) = pure_expression(s) {
        let compiled = env
          .compile_expression(expr)
          .map_err(|e| resolution_error(step, input_key, e))?;
        let result = compiled
          .eval(context.clone())
          .map_err(|e| resolution_error(step, input_key, e))?;
        return serde_json::to_value(&result).map_err(|e| FlowError::InputResolution {
          step: step.to_string(),
          message: format!("failed to convert input '{}': {}", input_key, e),
        });
      }
      let rendered = env
        .render_str(s, context.clone())
        .map_err(|e| resolution_error(step, input_key, e))?;
      Ok(serde_json::Value::String(rendered))
    }
    serde_json::Value::Array(arr) => {
      let resolved: Result<Vec<_>, _> = arr
        .iter()
        .map(|v| resolve_json_value(env, step, input_key, v, context))
        .collect();
      Ok(serde_json::Value::Array(resolved?))
    }
    serde_json::Value::Object(obj) => {
      let mut resolved = serde_json::Map::new();
      for (k, v) in obj {
        resolved.insert(k.clone(), resolve_json_value(env, step, input_key, v, context)?);
      }
      Ok(serde_json::Value::Object(resolved))
    }
    _ => Ok(value.clone()),
  }
}

/// The inner expression of a string that is exactly one `{{ expr }}`.
fn pure_expression(s: &str) -> Option<&str> {
  let trimmed = s.trim();
  let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") {
    return None;
  }
  Some(inner.trim())
}

fn resolution_error(step: &str, input_key: &str, e: minijinja::Error) -> FlowError {
  FlowError::InputResolution {
    step: step.to_string(),
    message: format!("failed to resolve input '{}': {}", input_key, e),
  }
}
