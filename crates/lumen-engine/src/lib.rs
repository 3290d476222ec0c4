//! Lumen Engine
//!
//! Executes flows durably on top of a [`lumen_store::Store`]:
//!
//! - [`Dispatcher`] persists tasks and wakes workers through a [`QueueTransport`]
//! - [`Tracker`] turns task outcomes into step attempts and run status
//! - [`WorkerPool`] claims tasks and runs their handlers
//! - [`RetryPolicy`] decides whether a failure is retried, and when
//! - [`Reaper`] requeues tasks whose worker stopped renewing its lease
//!
//! All shared state lives in the store; any number of engines may serve the
//! same database.

mod config;
mod dispatcher;
mod engine;
mod error;
mod events;
mod reaper;
mod retry;
mod tracker;
mod transport;
mod worker;

pub use config::{EngineConfig, RetryConfig};
pub use dispatcher::Dispatcher;
pub use engine::{Engine, EngineBuilder};
pub use error::EngineError;
pub use events::{ChannelNotifier, FlowEvent, FlowNotifier, LogNotifier, NoopNotifier};
pub use reaper::{LEASE_EXPIRED, ReapReport, Reaper};
pub use retry::{RetryPolicy, failure_kind};
pub use tracker::{StepStart, Tracker};
pub use transport::{DEFAULT_QUEUE_CAPACITY, MemoryTransport, QueueTransport};
pub use worker::WorkerPool;
