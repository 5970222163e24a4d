//! Typed errors for registration, dispatch, execution and lifecycle.

use thiserror::Error;

/// Registration failures. All of these happen at startup and are meant to
/// stop the process before it serves anything.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("duplicate handler for command '{0}'")]
    DuplicateCommand(String),

    #[error("duplicate handler for query '{0}'")]
    DuplicateQuery(String),

    #[error("duplicate worker '{0}'")]
    DuplicateWorker(String),

    #[error("worker '{worker}' already has a callback for '{command}'")]
    DuplicateCallback { worker: String, command: String },

    #[error("registration is closed once the host has started")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler registered for command '{0}'")]
    NotRegistered(String),

    /// The value handed over is not the shape registered under its tag.
    #[error("command '{command}' does not decode as {expected}")]
    Decode {
        command: String,
        expected: &'static str,
    },

    /// The feature validator refused the command.
    #[error("command '{command}' rejected: {source}")]
    Rejected {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler for '{command}' failed: {source}")]
    Handler {
        command: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no handler registered for query '{0}'")]
    NotRegistered(String),

    #[error("query '{query}' produced an unexpected output type")]
    Decode { query: String },

    #[error("query '{query}' failed: {source}")]
    Handler {
        query: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of a failed `Executor::execute`.
///
/// Only `Applied` leaves a durable trace: the command is in the log but its
/// handler failed in this process.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The host has not finished rebuilding state. Nothing was written.
    #[error("'{command}' refused: host has not finished boot replay")]
    NotStarted { command: String },

    /// Client-correctable. Nothing was written.
    #[error("validation failed for '{command}': {source}")]
    Validation {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// Nothing was written; safe to retry.
    #[error("failed to persist '{command}': {source}")]
    Persistence {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    /// Nothing was written: the command could not be routed.
    #[error(transparent)]
    Dispatch(DispatchError),

    /// Recorded at `seq` but not applied. Needs manual reconciliation.
    #[error("command '{command}' recorded at seq {seq} but not applied: {source}")]
    Applied {
        command: String,
        seq: u64,
        #[source]
        source: DispatchError,
    },
}

impl ExecuteError {
    /// Whether the log was written before the failure.
    pub fn is_recorded(&self) -> bool {
        matches!(self, ExecuteError::Applied { .. })
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker '{0}' is already started")]
    AlreadyStarted(String),

    #[error("worker '{0}' did not stop in time")]
    StopTimeout(String),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("expected commands have no handler: {0:?}")]
    MissingCommands(Vec<String>),

    /// A handler that succeeded when the command was accepted now fails.
    /// State can no longer be rebuilt deterministically.
    #[error("replay diverged at seq {seq} ('{command}'): {source}")]
    ReplayDiverged {
        seq: u64,
        command: String,
        #[source]
        source: DispatchError,
    },

    #[error("workers did not stop within the shutdown timeout: {pending:?}")]
    ShutdownTimeout { pending: Vec<String> },

    #[error("host is already started")]
    AlreadyStarted,

    /// Boot got past the point where state was touched and then failed.
    /// Build a new host.
    #[error("host failed during boot and cannot be started again")]
    BootFailed,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
