//! The write path: validate → append → dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use strata_events::{AnyMessage, EventLog};
use tracing::{debug, error, warn};

use crate::error::{DispatchError, ExecuteError};
use crate::registry::CommandRegistry;

/// Counters for the write path. `dispatch_failures` counts commands that are in
/// the log but were not applied in this process.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    executed: AtomicU64,
    rejected: AtomicU64,
    persistence_failures: AtomicU64,
    dispatch_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct MetricsSnapshot {
    pub executed: u64,
    pub rejected: u64,
    pub persistence_failures: u64,
    pub dispatch_failures: u64,
}

impl ExecutorMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Sole entry point for changing state.
///
/// Cheap to clone; clones share the log, registry and metrics.
#[derive(Clone)]
pub struct Executor {
    log: EventLog,
    commands: Arc<CommandRegistry>,
    metrics: Arc<ExecutorMetrics>,
    /// Cleared while in-memory state is still being rebuilt.
    accepting: Arc<AtomicBool>,
}

impl Executor {
    pub fn new(log: EventLog, commands: Arc<CommandRegistry>) -> Self {
        Self::with_gate(log, commands, true)
    }

    /// An executor that refuses every command until [`Executor::open`].
    pub(crate) fn gated(log: EventLog, commands: Arc<CommandRegistry>) -> Self {
        Self::with_gate(log, commands, false)
    }

    fn with_gate(log: EventLog, commands: Arc<CommandRegistry>, accepting: bool) -> Self {
        Self {
            log,
            commands,
            metrics: Arc::new(ExecutorMetrics::default()),
            accepting: Arc::new(AtomicBool::new(accepting)),
        }
    }

    pub(crate) fn open(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub(crate) fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    /// Whether commands are accepted. Clones share the gate.
    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validate, durably record, then apply `command`. Returns its sequence
    /// number.
    ///
    /// Commands arriving before the host has replayed the log, unknown
    /// commands and validation failures return before anything is written. Once the append succeeds the command is permanent: a handler
    /// failure after that point is reported as [`ExecuteError::Applied`] and is
    /// not rolled back.
    pub async fn execute(&self, command: &dyn AnyMessage) -> Result<u64, ExecuteError> {
        let command_type = command.type_tag();

        if !self.is_open() {
            debug!(command = command_type, "Command refused, boot replay not finished");
            return Err(ExecuteError::NotStarted {
                command: command_type.to_string(),
            });
        }

        if let Err(e) = self.commands.validate(command).await {
            self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(match e {
                DispatchError::Rejected { command, source } => {
                    debug!(command = command.as_str(), error = %source, "Command rejected");
                    ExecuteError::Validation { command, source }
                }
                other => {
                    warn!(command = command_type, error = %other, "Command cannot be routed");
                    ExecuteError::Dispatch(other)
                }
            });
        }

        let seq = match self.log.append(command).await {
            Ok(seq) => seq,
            Err(source) => {
                self.metrics.persistence_failures.fetch_add(1, Ordering::Relaxed);
                warn!(command = command_type, error = %source, "Append failed");
                return Err(ExecuteError::Persistence {
                    command: command_type.to_string(),
                    source,
                });
            }
        };

        if let Err(source) = self.commands.dispatch(command).await {
            self.metrics.dispatch_failures.fetch_add(1, Ordering::Relaxed);
            error!(
                seq,
                command = command_type,
                error = %source,
                "Command recorded but not applied; state in this process is missing it"
            );
            return Err(ExecuteError::Applied {
                command: command_type.to_string(),
                seq,
                source,
            });
        }

        self.metrics.executed.fetch_add(1, Ordering::Relaxed);
        debug!(seq, command = command_type, "Command executed");
        Ok(seq)
    }
}
