//! Flow definitions and step handlers.
//!
//! A flow is an ordered list of named steps. Each step names a handler from
//! the [`HandlerRegistry`]; the [`FlowRegistry`] resolves and validates all
//! of them once, at start-up.

mod def;
mod error;
mod handler;
mod input;
mod registry;

pub use def::{FlowDef, FlowsFile, StepDef};
pub use error::FlowError;
pub use handler::{
  FnHandler, HandlerRegistry, NoopProgress, ProgressSink, StepContext, StepFailure, StepHandler,
  handler_fn,
};
pub use input::{accumulate, resolve_step_inputs};
pub use registry::{Flow, FlowRegistry, FlowRegistryBuilder, Step};
