//! Worker: named background consumer of the log with its own cursor.
//!
//! A worker rebuilds its derived state from the whole log on start
//! ([`Worker::replay`], callbacks see [`Mode::Replay`]), then catches up
//! incrementally on every tick ([`Worker::work`], callbacks see
//! [`Mode::Normal`]). Only `Normal` deliveries may cause external effects.
//!
//! The cursor is persisted in the key-value store after each cycle. A callback
//! failure stops the cycle before that record, so the record is delivered again
//! on the next tick: delivery is at-least-once.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use rand::Rng;
use strata_events::{DecodedMessage, EventLog, KvStore, Message, TypeRegistry};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;

use crate::error::{RegistryError, WorkerError};
use crate::executor::Executor;

const DEFAULT_TICK: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(250);
const POSITION_PREFIX: &str = "worker:";
const POSITION_SUFFIX: &str = ":position";

/// KV key holding the cursor of worker `name`.
pub fn position_key(name: &str) -> String {
    format!("{POSITION_PREFIX}{name}{POSITION_SUFFIX}")
}

/// Inverse of [`position_key`].
pub fn worker_name_from_key(key: &str) -> Option<&str> {
    key.strip_prefix(POSITION_PREFIX)?.strip_suffix(POSITION_SUFFIX)
}

// ---------------------------------------------------------------------------
// Public seams
// ---------------------------------------------------------------------------

/// Shared references injected by the host.
#[derive(Clone, TypedBuilder)]
pub struct WorkerDeps {
    pub log: EventLog,
    pub executor: Executor,
    pub kv: KvStore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Rebuilding derived state. Bookkeeping only, no external effects.
    Replay,
    /// Live catch-up. External effects allowed.
    Normal,
}

/// Context handed to a callback alongside the command.
pub struct Delivery<'a> {
    pub worker: &'a str,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub mode: Mode,
    pub deps: &'a WorkerDeps,
}

impl Delivery<'_> {
    pub fn is_replay(&self) -> bool {
        self.mode == Mode::Replay
    }
}

#[async_trait]
pub trait WorkerCallback<C: Message>: Send + Sync {
    async fn handle(&self, command: &C, delivery: &Delivery<'_>) -> Result<()>;
}

/// Runs at the end of every work cycle, whether or not new records arrived.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    async fn run(&self, deps: &WorkerDeps) -> Result<()>;
}

#[async_trait]
impl<C: Message, F: WorkerCallback<C> + ?Sized> WorkerCallback<C> for Arc<F> {
    async fn handle(&self, command: &C, delivery: &Delivery<'_>) -> Result<()> {
        (**self).handle(command, delivery).await
    }
}

#[async_trait]
impl<P: PeriodicTask + ?Sized> PeriodicTask for Arc<P> {
    async fn run(&self, deps: &WorkerDeps) -> Result<()> {
        (**self).run(deps).await
    }
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[async_trait]
trait Route: Send + Sync {
    fn register_type(&self, types: &TypeRegistry);

    async fn deliver(&self, message: &DecodedMessage, delivery: &Delivery<'_>) -> Result<()>;
}

struct TypedRoute<C: Message> {
    callback: Arc<dyn WorkerCallback<C>>,
    _marker: PhantomData<fn() -> C>,
}

#[async_trait]
impl<C: Message> Route for TypedRoute<C> {
    fn register_type(&self, types: &TypeRegistry) {
        types.register::<C>();
    }

    async fn deliver(&self, message: &DecodedMessage, delivery: &Delivery<'_>) -> Result<()> {
        match message.downcast_ref::<C>() {
            Some(command) => self.callback.handle(command, delivery).await,
            None => {
                warn!(
                    worker = delivery.worker,
                    seq = message.seq(),
                    type_tag = message.type_tag(),
                    expected = std::any::type_name::<C>(),
                    "Record decoded into a different shape, skipping"
                );
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerBuilder
// ---------------------------------------------------------------------------

/// Declares a worker's callbacks before the host injects its dependencies.
///
/// ```ignore
/// let builder = WorkerBuilder::new("mailer")
///     .on::<SignedUp, _>(mailer.clone())?
///     .periodic(mailer);
/// host.register_worker(builder)?;
/// ```
pub struct WorkerBuilder {
    name: String,
    routes: HashMap<&'static str, Arc<dyn Route>>,
    periodic: Option<Arc<dyn PeriodicTask>>,
    tick: Option<Duration>,
    jitter: Option<Duration>,
}

impl WorkerBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routes: HashMap::new(),
            periodic: None,
            tick: None,
            jitter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route records of type `C` to `callback`. One callback per type.
    pub fn on<C, F>(mut self, callback: F) -> Result<Self, RegistryError>
    where
        C: Message,
        F: WorkerCallback<C> + 'static,
    {
        if self.routes.contains_key(C::TYPE) {
            return Err(RegistryError::DuplicateCallback {
                worker: self.name,
                command: C::TYPE.to_string(),
            });
        }
        self.routes.insert(
            C::TYPE,
            Arc::new(TypedRoute::<C> {
                callback: Arc::new(callback),
                _marker: PhantomData,
            }),
        );
        Ok(self)
    }

    pub fn periodic<P: PeriodicTask + 'static>(mut self, task: P) -> Self {
        self.periodic = Some(Arc::new(task));
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = Some(tick);
        self
    }

    /// Upper bound of the random delay added to each tick.
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Fill in timing the feature did not choose itself.
    pub(crate) fn default_timing(mut self, tick: Duration, jitter: Duration) -> Self {
        self.tick.get_or_insert(tick);
        self.jitter.get_or_insert(jitter);
        self
    }

    /// Bind dependencies. Registers every routed type with the log so the
    /// worker can decode it.
    pub fn build(self, deps: WorkerDeps) -> Worker {
        for route in self.routes.values() {
            route.register_type(deps.log.types());
        }

        Worker {
            core: Arc::new(WorkerCore {
                position_key: position_key(&self.name),
                name: self.name,
                routes: self.routes,
                periodic: self.periodic,
                deps,
                tick: self.tick.unwrap_or(DEFAULT_TICK),
                jitter: self.jitter.unwrap_or(DEFAULT_JITTER),
                cycle: tokio::sync::Mutex::new(()),
            }),
            running: Mutex::new(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// What one [`Worker::work`] cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkReport {
    /// Cursor before the cycle.
    pub from: u64,
    /// Cursor after the cycle.
    pub to: u64,
    /// Records handed to a callback.
    pub delivered: usize,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Worker {
    core: Arc<WorkerCore>,
    running: Mutex<Option<Running>>,
}

impl Worker {
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The persisted cursor (0 if the worker never ran).
    pub async fn position(&self) -> Result<u64> {
        self.core.load_position().await
    }

    /// Rebuild derived state from the entire log, then persist the cursor at
    /// the highest sequence seen. Ignores the saved cursor.
    pub async fn replay(&self) -> Result<u64> {
        self.core.replay().await
    }

    /// Deliver everything after the persisted cursor, persist the new cursor,
    /// then run the periodic task.
    pub async fn work(&self) -> Result<WorkReport> {
        self.core.work().await
    }

    /// Spawn the replay-then-tick loop under a child of `parent`.
    pub fn start(&self, parent: &CancellationToken) -> Result<(), WorkerError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(WorkerError::AlreadyStarted(self.core.name.clone()));
        }

        let token = parent.child_token();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.core), token.clone()));
        *running = Some(Running { token, handle });
        Ok(())
    }

    /// Whether the loop task is alive.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Cancel the loop and wait up to `timeout` for it to exit. No-op if not
    /// started. On timeout the task is aborted and an error returned.
    pub async fn stop(&self, timeout: Duration) -> Result<(), WorkerError> {
        let taken = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { token, mut handle }) = taken else {
            return Ok(());
        };

        token.cancel();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                handle.abort();
                warn!(
                    worker = self.core.name.as_str(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Worker ignored cancellation, aborted"
                );
                Err(WorkerError::StopTimeout(self.core.name.clone()))
            }
        }
    }
}

struct WorkerCore {
    name: String,
    position_key: String,
    routes: HashMap<&'static str, Arc<dyn Route>>,
    periodic: Option<Arc<dyn PeriodicTask>>,
    deps: WorkerDeps,
    tick: Duration,
    jitter: Duration,
    /// Serializes replay and work cycles of this worker.
    cycle: tokio::sync::Mutex<()>,
}

impl WorkerCore {
    async fn load_position(&self) -> Result<u64> {
        match self.deps.kv.get(&self.position_key).await? {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Corrupt cursor for worker {}: {raw}", self.name)),
            None => Ok(0),
        }
    }

    async fn save_position(&self, position: u64) -> Result<()> {
        self.deps
            .kv
            .set(&self.position_key, &position.to_string())
            .await
    }

    /// Returns whether a callback was invoked.
    async fn deliver(&self, message: &DecodedMessage, mode: Mode) -> Result<bool> {
        let Some(route) = self.routes.get(message.type_tag()) else {
            debug!(
                worker = self.name.as_str(),
                seq = message.seq(),
                type_tag = message.type_tag(),
                "No callback, skipping"
            );
            return Ok(false);
        };

        let delivery = Delivery {
            worker: &self.name,
            seq: message.seq(),
            ts: message.record.ts,
            mode,
            deps: &self.deps,
        };
        route.deliver(message, &delivery).await?;
        Ok(true)
    }

    async fn replay(&self) -> Result<u64> {
        let _cycle = self.cycle.lock().await;

        let mut highest = 0;
        let mut replayed = 0usize;
        let mut stream = self.deps.log.read_from(0);
        while let Some(item) = stream.next().await {
            let message = item.with_context(|| format!("Worker {} failed reading log", self.name))?;
            match self.deliver(&message, Mode::Replay).await {
                Ok(true) => replayed += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    worker = self.name.as_str(),
                    seq = message.seq(),
                    error = %format!("{e:#}"),
                    "Replay callback failed, continuing"
                ),
            }
            highest = message.seq();
        }

        self.save_position(highest).await?;
        info!(
            worker = self.name.as_str(),
            position = highest,
            replayed,
            "Worker replay complete"
        );
        Ok(highest)
    }

    async fn work(&self) -> Result<WorkReport> {
        let _cycle = self.cycle.lock().await;

        let from = self.load_position().await?;
        let mut to = from;
        let mut delivered = 0usize;
        let mut failure: Option<anyhow::Error> = None;

        let mut stream = self.deps.log.read_from(from);
        while let Some(item) = stream.next().await {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    failure = Some(e.context(format!("Worker {} failed reading log", self.name)));
                    break;
                }
            };
            match self.deliver(&message, Mode::Normal).await {
                Ok(routed) => {
                    to = message.seq();
                    if routed {
                        delivered += 1;
                    }
                }
                Err(e) => {
                    failure = Some(e.context(format!(
                        "Worker {} callback failed at seq {}",
                        self.name,
                        message.seq()
                    )));
                    break;
                }
            }
        }
        drop(stream);

        if to != from {
            match self.save_position(to).await {
                Ok(()) => {
                    debug!(worker = self.name.as_str(), from, to, delivered, "Cursor advanced");
                }
                Err(e) => {
                    let e = e.context(format!("Worker {} failed to persist cursor {to}", self.name));
                    if failure.is_some() {
                        warn!(worker = self.name.as_str(), error = %format!("{e:#}"), "Cursor not persisted");
                    } else {
                        failure = Some(e);
                    }
                }
            }
        }

        let periodic = match &self.periodic {
            Some(task) => task.run(&self.deps).await,
            None => Ok(()),
        };

        if let Some(e) = failure {
            if let Err(p) = periodic {
                warn!(worker = self.name.as_str(), error = %p, "Periodic task failed");
            }
            return Err(e);
        }
        periodic.map_err(|e| anyhow!("Worker {} periodic task failed: {e:#}", self.name))?;

        Ok(WorkReport {
            from,
            to,
            delivered,
        })
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.tick;
        }
        self.tick + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }
}

async fn run_loop(core: Arc<WorkerCore>, token: CancellationToken) {
    let name = core.name.as_str();
    info!(worker = name, "Worker starting");

    let replayed = tokio::select! {
        _ = token.cancelled() => None,
        result = core.replay() => Some(result),
    };
    match replayed {
        None => {
            info!(worker = name, "Worker cancelled during replay");
            return;
        }
        Some(Err(e)) => {
            error!(worker = name, error = %format!("{e:#}"), "Worker replay failed, not running");
            return;
        }
        Some(Ok(_)) => {}
    }

    loop {
        let delay = core.next_delay();
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        if let Err(e) = core.work().await {
            warn!(worker = name, error = %format!("{e:#}"), "Work cycle failed");
        }
    }

    info!(worker = name, "Worker stopped");
}
