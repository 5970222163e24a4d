//! Host: owns storage, registries, the executor and every worker.
//!
//! Lifecycle: register features, `start()` (boot replay, then workers),
//! serve commands and queries, `stop()`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::StreamExt;
use serde::Serialize;
use sqlx::SqlitePool;
use strata_events::{DecodeError, EventLog, KvStore, Message, TypeRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::error::{DispatchError, HostError, QueryError, RegistryError, WorkerError};
use crate::executor::Executor;
use crate::registry::{CommandRegistry, QueryRegistry};
use crate::traits::{CommandHandler, Query, QueryHandler, Validator};
use crate::worker::{Worker, WorkerBuilder, WorkerDeps};

#[derive(Debug, Clone, TypedBuilder)]
pub struct HostConfig {
    #[builder(default = strata_events::store::DEFAULT_BATCH_SIZE)]
    pub read_batch_size: usize,
    #[builder(default = Duration::from_millis(1000))]
    pub worker_tick: Duration,
    #[builder(default = Duration::from_millis(250))]
    pub worker_jitter: Duration,
    #[builder(default = Duration::from_millis(5000))]
    pub shutdown_timeout: Duration,
    /// Abort the process when a handler fails during boot replay. When false,
    /// `start` returns [`HostError::ReplayDiverged`] instead.
    #[builder(default = true)]
    pub abort_on_replay_failure: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<&strata_common::Config> for HostConfig {
    fn from(config: &strata_common::Config) -> Self {
        Self {
            read_batch_size: config.read_batch_size,
            worker_tick: config.worker_tick,
            worker_jitter: config.worker_jitter,
            shutdown_timeout: config.shutdown_timeout,
            abort_on_replay_failure: config.abort_on_replay_failure,
        }
    }
}

/// A vertical slice: its commands, queries and workers registered together.
pub trait Feature {
    fn register(&self, host: &mut Host) -> Result<(), HostError>;
}

/// Outcome of a boot replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub applied: u64,
    /// Records whose command has no handler in this process.
    pub not_registered: u64,
    /// Records whose type tag is not registered in this process.
    pub undecodable: u64,
    /// Records whose payload does not decode into its registered shape, or
    /// whose shape the handler does not accept.
    pub decode_errors: u64,
    /// Highest sequence read, decodable or not.
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub running: bool,
    pub position: u64,
}

pub struct Host {
    config: HostConfig,
    log: EventLog,
    kv: KvStore,
    commands: Arc<CommandRegistry>,
    queries: Arc<QueryRegistry>,
    executor: Executor,
    workers: Vec<Arc<Worker>>,
    expected: Vec<String>,
    shutdown: CancellationToken,
    started: AtomicBool,
    /// Set once a boot failed after state was touched.
    failed: AtomicBool,
}

impl Host {
    /// Open (creating if needed) the database at `database_url`.
    pub async fn connect(database_url: &str, config: HostConfig) -> Result<Self, HostError> {
        let pool = strata_events::connect(database_url).await?;
        Ok(Self::with_pool(pool, config))
    }

    /// Build on an already migrated pool.
    pub fn with_pool(pool: SqlitePool, config: HostConfig) -> Self {
        let log = EventLog::new(pool.clone(), Arc::new(TypeRegistry::new()))
            .with_batch_size(config.read_batch_size);
        let kv = KvStore::new(pool);
        let commands = Arc::new(CommandRegistry::new());
        let executor = Executor::gated(log.clone(), Arc::clone(&commands));

        Self {
            config,
            log,
            kv,
            commands,
            queries: Arc::new(QueryRegistry::new()),
            executor,
            workers: Vec::new(),
            expected: Vec::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    /// Refuses commands until `start` has replayed the log.
    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    pub fn queries(&self) -> &QueryRegistry {
        &self.queries
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(RegistryError::Closed);
        }
        Ok(())
    }

    pub fn register_command<C, H>(&mut self, handler: H) -> Result<(), HostError>
    where
        C: Message,
        H: CommandHandler<C> + 'static,
    {
        self.ensure_open()?;
        self.commands.register::<C, H>(handler)?;
        self.log.register_type::<C>();
        Ok(())
    }

    pub fn register_validated_command<C, H, V>(
        &mut self,
        handler: H,
        validator: V,
    ) -> Result<(), HostError>
    where
        C: Message,
        H: CommandHandler<C> + 'static,
        V: Validator<C> + 'static,
    {
        self.ensure_open()?;
        self.commands.register_validated::<C, H, V>(handler, validator)?;
        self.log.register_type::<C>();
        Ok(())
    }

    pub fn register_query<Q, H>(&mut self, handler: H) -> Result<(), HostError>
    where
        Q: Query,
        H: QueryHandler<Q> + 'static,
    {
        self.ensure_open()?;
        self.queries.register::<Q, H>(handler)?;
        Ok(())
    }

    /// Bind the worker to this host's storage and executor. Names are unique.
    pub fn register_worker(&mut self, builder: WorkerBuilder) -> Result<(), HostError> {
        self.ensure_open()?;
        if self.workers.iter().any(|w| w.name() == builder.name()) {
            return Err(RegistryError::DuplicateWorker(builder.name().to_string()).into());
        }

        let deps = WorkerDeps::builder()
            .log(self.log.clone())
            .executor(self.executor.clone())
            .kv(self.kv.clone())
            .build();
        let worker = builder
            .default_timing(self.config.worker_tick, self.config.worker_jitter)
            .build(deps);
        self.workers.push(Arc::new(worker));
        Ok(())
    }

    pub fn install(&mut self, feature: &impl Feature) -> Result<(), HostError> {
        feature.register(self)
    }

    /// Declare commands that must have a handler by the time `start` runs.
    pub fn expect_commands(&mut self, commands: &[&str]) {
        for command in commands {
            if !self.expected.iter().any(|c| c == command) {
                self.expected.push(command.to_string());
            }
        }
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn worker(&self, name: &str) -> Option<&Arc<Worker>> {
        self.workers.iter().find(|w| w.name() == name)
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Rebuild in-memory state by applying every logged command to its
    /// handler. Validators are not consulted and nothing is appended.
    pub async fn replay(&self) -> Result<ReplayStats, HostError> {
        let mut stats = ReplayStats::default();
        let mut records = self.log.read_raw_stream(0);

        while let Some(record) = records.next().await {
            let record = record?;
            let seq = record.seq;
            stats.last_seq = seq;

            let message = match self.log.decode(record) {
                Ok(message) => message,
                Err(DecodeError::Unregistered(type_tag)) => {
                    warn!(seq, type_tag = type_tag.as_str(), "Unknown type tag, skipping during replay");
                    stats.undecodable += 1;
                    continue;
                }
                Err(e @ DecodeError::Payload { .. }) => {
                    warn!(seq, error = %e, "Payload does not decode, skipping during replay");
                    stats.decode_errors += 1;
                    continue;
                }
            };

            match self.commands.dispatch(&*message.value).await {
                Ok(()) => stats.applied += 1,
                Err(DispatchError::NotRegistered(command)) => {
                    debug!(seq, command = command.as_str(), "No handler, skipping during replay");
                    stats.not_registered += 1;
                }
                Err(e @ DispatchError::Decode { .. }) => {
                    warn!(seq, error = %e, "Record does not match its handler, skipping");
                    stats.decode_errors += 1;
                }
                Err(source) => {
                    let command = message.type_tag().to_string();
                    error!(
                        seq,
                        command = command.as_str(),
                        error = %source,
                        "Handler failed during replay, state cannot be rebuilt"
                    );
                    if self.config.abort_on_replay_failure {
                        std::process::abort();
                    }
                    return Err(HostError::ReplayDiverged {
                        seq,
                        command,
                        source,
                    });
                }
            }
        }

        info!(
            applied = stats.applied,
            not_registered = stats.not_registered,
            undecodable = stats.undecodable,
            decode_errors = stats.decode_errors,
            last_seq = stats.last_seq,
            "Boot replay complete"
        );
        Ok(stats)
    }

    /// Check declared commands, replay the log, open the executor, then start
    /// every worker. Registration is closed from here on.
    ///
    /// A failure before replay (missing commands) leaves the host startable.
    /// Any later failure is final: state may be partially rebuilt, so the host
    /// answers [`HostError::BootFailed`] from then on.
    pub async fn start(&self) -> Result<ReplayStats, HostError> {
        if self.failed.load(Ordering::SeqCst) {
            return Err(HostError::BootFailed);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(HostError::AlreadyStarted);
        }

        let result = self.boot().await;
        match &result {
            Err(HostError::MissingCommands(_)) => self.started.store(false, Ordering::SeqCst),
            Err(_) => self.failed.store(true, Ordering::SeqCst),
            Ok(_) => {}
        }
        result
    }

    async fn boot(&self) -> Result<ReplayStats, HostError> {
        let registered: HashSet<String> = self.commands.registered_types().into_iter().collect();
        let missing: Vec<String> = self
            .expected
            .iter()
            .filter(|c| !registered.contains(*c))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(HostError::MissingCommands(missing));
        }

        let stats = self.replay().await?;
        self.executor.open();

        for (started, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start(&self.shutdown) {
                self.executor.close();
                self.stop_workers(&self.workers[..started]).await;
                return Err(e.into());
            }
        }

        info!(
            commands = self.commands.registered_types().len(),
            queries = self.queries.registered_types().len(),
            workers = self.workers.len(),
            "Host started"
        );
        Ok(stats)
    }

    /// Undo a partial boot. Stop failures are logged only.
    async fn stop_workers(&self, workers: &[Arc<Worker>]) {
        let timeout = self.config.shutdown_timeout;
        for result in join_all(workers.iter().map(|w| w.stop(timeout))).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker stop failed while unwinding boot");
            }
        }
    }

    /// Cancel every worker and wait for them under the shutdown timeout.
    /// Workers still running at the deadline are aborted and reported.
    pub async fn stop(&self) -> Result<(), HostError> {
        self.shutdown.cancel();

        let timeout = self.config.shutdown_timeout;
        let results = join_all(self.workers.iter().map(|w| w.stop(timeout))).await;

        let mut pending = Vec::new();
        for result in results {
            match result {
                Ok(()) => {}
                Err(WorkerError::StopTimeout(name)) => pending.push(name),
                Err(e) => warn!(error = %e, "Worker stop failed"),
            }
        }

        if !pending.is_empty() {
            error!(?pending, "Shutdown timed out");
            return Err(HostError::ShutdownTimeout { pending });
        }
        info!("Host stopped");
        Ok(())
    }

    pub async fn query<Q: Query>(&self, query: Q) -> Result<Q::Output, QueryError> {
        self.queries.dispatch(query).await
    }

    pub async fn worker_status(&self) -> Result<Vec<WorkerStatus>, HostError> {
        let mut statuses = Vec::with_capacity(self.workers.len());
        for worker in &self.workers {
            statuses.push(WorkerStatus {
                name: worker.name().to_string(),
                running: worker.is_running(),
                position: worker.position().await?,
            });
        }
        Ok(statuses)
    }
}
