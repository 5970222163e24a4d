//! Command execution, boot replay and background workers on top of the log.
//!
//! Features register command handlers (with optional validators), queries and
//! workers with a [`Host`]. The [`Executor`] is the only write path: validate,
//! append, then apply. On start the host rebuilds state by replaying the log
//! through the handlers and then launches every worker.

pub mod error;
pub mod executor;
pub mod host;
pub mod registry;
pub mod traits;
pub mod worker;

pub use error::{DispatchError, ExecuteError, HostError, QueryError, RegistryError, WorkerError};
pub use executor::{Executor, ExecutorMetrics, MetricsSnapshot};
pub use host::{Feature, Host, HostConfig, ReplayStats, WorkerStatus};
pub use registry::{CommandRegistry, QueryRegistry};
pub use traits::{CommandHandler, Query, QueryHandler, Validator};
pub use worker::{
    position_key, worker_name_from_key, Delivery, Mode, PeriodicTask, WorkReport, Worker,
    WorkerBuilder, WorkerCallback, WorkerDeps,
};
