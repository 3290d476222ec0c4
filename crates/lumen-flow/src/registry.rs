use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::def::{FlowDef, StepDef};
use crate::error::FlowError;
use crate::handler::{HandlerRegistry, StepHandler};

/// A step with its handler resolved.
#[derive(Clone)]
pub struct Step {
  pub index: usize,
  pub def: StepDef,
  handler: Arc<dyn StepHandler>,
}

impl Step {
  pub fn name(&self) -> &str {
    &self.def.name
  }

  pub fn handler(&self) -> Arc<dyn StepHandler> {
    self.handler.clone()
  }
}

impl fmt::Debug for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Step")
      .field("index", &self.index)
      .field("name", &self.def.name)
      .field("handler", &self.def.handler)
      .finish()
  }
}

/// A validated flow ready for execution.
#[derive(Debug, Clone)]
pub struct Flow {
  pub name: String,
  pub steps: Vec<Step>,
  /// Retry budget for steps that do not set their own.
  pub default_max_retries: Option<u32>,
  pub default_queue: Option<String>,
}

impl Flow {
  pub fn step(&self, index: usize) -> Option<&Step> {
    self.steps.get(index)
  }

  pub fn len(&self) -> usize {
    self.steps.len()
  }

  pub fn is_empty(&self) -> bool {
    self.steps.is_empty()
  }

  pub fn is_last(&self, index: usize) -> bool {
    index + 1 == self.steps.len()
  }

  /// Retry budget for a step, falling back to the flow default then `fallback`.
  pub fn max_retries_for(&self, step: &Step, fallback: u32) -> u32 {
    step
      .def
      .max_retries
      .or(self.default_max_retries)
      .unwrap_or(fallback)
  }

  /// Queue for a step, falling back to the flow default then `fallback`.
  pub fn queue_for<'a>(&'a self, step: &'a Step, fallback: &'a str) -> &'a str {
    step
      .def
      .queue
      .as_deref()
      .or(self.default_queue.as_deref())
      .unwrap_or(fallback)
  }
}

/// The frozen set of flows and handlers known to a process.
///
/// Built once at start-up; nothing can be registered afterwards.
#[derive(Debug, Clone)]
pub struct FlowRegistry {
  flows: HashMap<String, Arc<Flow>>,
  handlers: HandlerRegistry,
}

impl FlowRegistry {
  pub fn builder(handlers: HandlerRegistry) -> FlowRegistryBuilder {
    FlowRegistryBuilder {
      handlers,
      defs: Vec::new(),
    }
  }

  pub fn get(&self, flow_name: &str) -> Result<Arc<Flow>, FlowError> {
    self
      .flows
      .get(flow_name)
      .cloned()
      .ok_or_else(|| FlowError::FlowNotFound(flow_name.to_string()))
  }

  /// Handler for a standalone task, looked up by its task type.
  pub fn handler(&self, id: &str) -> Option<Arc<dyn StepHandler>> {
    self.handlers.get(id)
  }

  pub fn flow_names(&self) -> impl Iterator<Item = &str> {
    self.flows.keys().map(String::as_str)
  }
}

pub struct FlowRegistryBuilder {
  handlers: HandlerRegistry,
  defs: Vec<FlowDef>,
}

impl FlowRegistryBuilder {
  pub fn flow(mut self, def: FlowDef) -> Self {
    self.defs.push(def);
    self
  }

  pub fn flows(mut self, defs: impl IntoIterator<Item = FlowDef>) -> Self {
    self.defs.extend(defs);
    self
  }

  /// Validate every definition and resolve each step's handler.
  pub fn build(self) -> Result<FlowRegistry, FlowError> {
    let mut flows = HashMap::new();
    for def in self.defs {
      if flows.contains_key(&def.name) {
        return Err(FlowError::DuplicateFlow(def.name));
      }
      let flow = resolve_flow(&self.handlers, def)?;
      flows.insert(flow.name.clone(), Arc::new(flow));
    }
    Ok(FlowRegistry {
      flows,
      handlers: self.handlers,
    })
  }
}

fn resolve_flow(handlers: &HandlerRegistry, def: FlowDef) -> Result<Flow, FlowError> {
  if def.steps.is_empty() {
    return Err(FlowError::EmptyFlow { flow: def.name });
  }

  let check_requirements = !def.inputs.is_empty();
  let mut known: HashSet<String> = def.inputs.iter().cloned().collect();
  let mut seen = HashSet::new();
  let mut steps = Vec::with_capacity(def.steps.len());

  for (index, step) in def.steps.into_iter().enumerate() {
    if !seen.insert(step.name.clone()) {
      return Err(FlowError::DuplicateStep {
        flow: def.name,
        step: step.name,
      });
    }

    let handler = handlers
      .get(&step.handler)
      .ok_or_else(|| FlowError::UnknownHandler {
        flow: def.name.clone(),
        step: step.name.clone(),
        handler: step.handler.clone(),
      })?;

    if check_requirements {
      // A mapping replaces the context, so its keys are all the step sees.
      let available: HashSet<&str> = if step.inputs.is_empty() {
        known.iter().map(String::as_str).collect()
      } else {
        step.inputs.keys().map(String::as_str).collect()
      };
      if let Some(missing) = step.requires.iter().find(|k| !available.contains(k.as_str())) {
        return Err(FlowError::UnsatisfiedInput {
          flow: def.name,
          step: step.name.clone(),
          key: missing.clone(),
        });
      }
    }

    known.extend(step.produces.iter().cloned());
    known.insert(step.name.clone());
    steps.push(Step {
      index,
      def: step,
      handler,
    });
  }

  Ok(Flow {
    name: def.name,
    steps,
    default_max_retries: def.max_retries,
    default_queue: def.queue,
  })
}
