//! Shared fixtures for engine integration tests.
//!
//! A small ledger feature (commands, validators, queries) and a mailer worker
//! that records what it was handed. Each test gets a private in-memory SQLite
//! database.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use strata_engine::{
    CommandHandler, CommandRegistry, Delivery, Executor, Feature, Host, HostConfig, HostError,
    Mode, PeriodicTask, Query, QueryHandler, Validator, WorkerBuilder, WorkerCallback, WorkerDeps,
};
use strata_events::{connect_in_memory, EventLog, KvStore, Message, TypeRegistry};
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenAccount {
    pub account: String,
}

impl Message for OpenAccount {
    const TYPE: &'static str = "ledger.open_account";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub account: String,
    pub amount: i64,
}

impl Message for Deposit {
    const TYPE: &'static str = "ledger.deposit";
}

/// Owned by a feature that is not installed everywhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddNote {
    pub text: String,
}

impl Message for AddNote {
    const TYPE: &'static str = "notes.add";
}

pub fn open(account: &str) -> OpenAccount {
    OpenAccount {
        account: account.into(),
    }
}

pub fn deposit(account: &str, amount: i64) -> Deposit {
    Deposit {
        account: account.into(),
        amount,
    }
}

// ---------------------------------------------------------------------------
// Ledger feature
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Ledger {
    balances: Mutex<BTreeMap<String, i64>>,
    /// When set, the deposit handler fails.
    pub fail_deposits: AtomicBool,
}

impl Ledger {
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.balances.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandHandler<OpenAccount> for Ledger {
    async fn handle(&self, command: &OpenAccount) -> Result<()> {
        self.balances
            .lock()
            .unwrap()
            .entry(command.account.clone())
            .or_insert(0);
        Ok(())
    }
}

#[async_trait]
impl Validator<OpenAccount> for Ledger {
    async fn validate(&self, command: &OpenAccount) -> Result<()> {
        if self.balances.lock().unwrap().contains_key(&command.account) {
            bail!("account {} already open", command.account);
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler<Deposit> for Ledger {
    async fn handle(&self, command: &Deposit) -> Result<()> {
        if self.fail_deposits.load(Ordering::SeqCst) {
            bail!("deposit handler unavailable");
        }
        let mut balances = self.balances.lock().unwrap();
        let balance = balances
            .get_mut(&command.account)
            .ok_or_else(|| anyhow!("no account {}", command.account))?;
        *balance += command.amount;
        Ok(())
    }
}

#[async_trait]
impl Validator<Deposit> for Ledger {
    async fn validate(&self, command: &Deposit) -> Result<()> {
        if command.amount <= 0 {
            bail!("amount must be positive");
        }
        if !self.balances.lock().unwrap().contains_key(&command.account) {
            bail!("no account {}", command.account);
        }
        Ok(())
    }
}

pub struct Balance {
    pub account: String,
}

impl Query for Balance {
    const TYPE: &'static str = "ledger.balance";
    type Output = Option<i64>;
}

#[async_trait]
impl QueryHandler<Balance> for Ledger {
    async fn handle(&self, query: Balance) -> Result<Option<i64>> {
        Ok(self.balances.lock().unwrap().get(&query.account).copied())
    }
}

pub struct LedgerFeature {
    pub ledger: Arc<Ledger>,
}

impl LedgerFeature {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Ledger::default()),
        }
    }
}

impl Feature for LedgerFeature {
    fn register(&self, host: &mut Host) -> Result<(), HostError> {
        host.register_validated_command::<OpenAccount, _, _>(
            self.ledger.clone(),
            self.ledger.clone(),
        )?;
        host.register_validated_command::<Deposit, _, _>(self.ledger.clone(), self.ledger.clone())?;
        host.register_query::<Balance, _>(self.ledger.clone())?;
        Ok(())
    }
}

#[derive(Default)]
pub struct Notes {
    pub texts: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandHandler<AddNote> for Notes {
    async fn handle(&self, command: &AddNote) -> Result<()> {
        self.texts.lock().unwrap().push(command.text.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mailer worker
// ---------------------------------------------------------------------------

/// Sends a "receipt" per deposit. Receipts are the external effect.
#[derive(Default)]
pub struct Mailer {
    /// Every seq handed over, in any mode.
    pub seen: Mutex<BTreeSet<u64>>,
    /// Seqs handled in normal mode, in delivery order.
    pub sent: Mutex<Vec<u64>>,
    /// Fail the next delivery of this seq.
    pub fail_once_at: Mutex<Option<u64>>,
    pub periodic_runs: AtomicUsize,
}

impl Mailer {
    pub fn seen(&self) -> BTreeSet<u64> {
        self.seen.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<u64> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkerCallback<Deposit> for Mailer {
    async fn handle(&self, _command: &Deposit, delivery: &Delivery<'_>) -> Result<()> {
        {
            let mut fail = self.fail_once_at.lock().unwrap();
            if *fail == Some(delivery.seq) {
                *fail = None;
                bail!("smtp unavailable");
            }
        }
        self.seen.lock().unwrap().insert(delivery.seq);
        if delivery.mode == Mode::Normal {
            self.sent.lock().unwrap().push(delivery.seq);
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for Mailer {
    async fn run(&self, _deps: &WorkerDeps) -> Result<()> {
        self.periodic_runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A periodic task that never returns and never checks for cancellation.
#[derive(Default)]
pub struct Stubborn {
    pub entered: Notify,
}

#[async_trait]
impl PeriodicTask for Stubborn {
    async fn run(&self, _deps: &WorkerDeps) -> Result<()> {
        self.entered.notify_one();
        std::future::pending::<()>().await;
        Ok(())
    }
}

pub fn mailer_worker(name: &str, mailer: &Arc<Mailer>) -> WorkerBuilder {
    WorkerBuilder::new(name)
        .on::<Deposit, _>(mailer.clone())
        .unwrap()
        .periodic(mailer.clone())
}

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

pub fn fast_config() -> HostConfig {
    HostConfig::builder()
        .worker_tick(Duration::from_millis(10))
        .worker_jitter(Duration::ZERO)
        .shutdown_timeout(Duration::from_millis(200))
        .abort_on_replay_failure(false)
        .build()
}

pub async fn test_pool() -> SqlitePool {
    connect_in_memory().await.unwrap()
}

pub async fn test_host(pool: SqlitePool) -> (Host, Arc<Ledger>) {
    let mut host = Host::with_pool(pool, fast_config());
    let feature = LedgerFeature::new();
    host.install(&feature).unwrap();
    (host, feature.ledger)
}

/// Storage, executor and worker deps without a host.
pub struct Rig {
    pub log: EventLog,
    pub kv: KvStore,
    pub executor: Executor,
}

impl Rig {
    pub async fn new() -> Self {
        let pool = test_pool().await;
        let log = EventLog::new(pool.clone(), Arc::new(TypeRegistry::new()));
        let kv = KvStore::new(pool);
        let executor = Executor::new(log.clone(), Arc::new(CommandRegistry::new()));
        Self { log, kv, executor }
    }

    pub fn deps(&self) -> WorkerDeps {
        WorkerDeps::builder()
            .log(self.log.clone())
            .executor(self.executor.clone())
            .kv(self.kv.clone())
            .build()
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn eventually(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
