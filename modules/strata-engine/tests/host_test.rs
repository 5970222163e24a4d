//! Integration tests for Host: registration, boot replay and worker lifecycle.

mod harness;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use harness::*;
use sqlx::SqlitePool;
use strata_engine::{ExecuteError, HostError, RegistryError, WorkerBuilder, WorkerError};
use tokio_util::sync::CancellationToken;

async fn seed(host: &strata_engine::Host) {
    let executor = host.executor();
    executor.execute(&open("alice")).await.unwrap();
    executor.execute(&open("bob")).await.unwrap();
    executor.execute(&deposit("alice", 30)).await.unwrap();
    executor.execute(&deposit("bob", 5)).await.unwrap();
    executor.execute(&deposit("alice", 12)).await.unwrap();
}

/// Write the seed history through a started host, as a previous run would.
async fn seed_log(pool: &SqlitePool) -> BTreeMap<String, i64> {
    let (live, ledger) = test_host(pool.clone()).await;
    live.start().await.unwrap();
    seed(&live).await;
    live.stop().await.unwrap();
    ledger.snapshot()
}

// =========================================================================
// Boot replay
// =========================================================================

#[tokio::test]
async fn replay_rebuilds_identical_state() {
    let pool = test_pool().await;

    let live = seed_log(&pool).await;

    for _ in 0..2 {
        let (rebooted, ledger) = test_host(pool.clone()).await;
        let stats = rebooted.start().await.unwrap();

        assert_eq!(stats.applied, 5);
        assert_eq!(stats.last_seq, 5);
        assert_eq!(ledger.snapshot(), live);
        rebooted.stop().await.unwrap();
    }
}

#[tokio::test]
async fn replay_skips_commands_without_handler() {
    let pool = test_pool().await;

    let (mut live, _) = test_host(pool.clone()).await;
    live.register_command::<AddNote, _>(Notes::default()).unwrap();
    live.start().await.unwrap();
    seed(&live).await;
    live.executor()
        .execute(&AddNote {
            text: "remember".into(),
        })
        .await
        .unwrap();

    // Decodable here (a worker could route it) but no handler in this process.
    let (rebooted, ledger) = test_host(pool).await;
    rebooted.log().register_type::<AddNote>();
    let stats = rebooted.start().await.unwrap();

    assert_eq!(stats.applied, 5);
    assert_eq!(stats.not_registered, 1);
    assert_eq!(stats.last_seq, 6);
    assert_eq!(ledger.snapshot().get("alice"), Some(&42));
}

#[tokio::test]
async fn replay_does_not_validate_or_append() {
    let pool = test_pool().await;
    seed_log(&pool).await;

    let (rebooted, _) = test_host(pool).await;
    rebooted.start().await.unwrap();

    assert_eq!(rebooted.log().current_version().await.unwrap(), 5);
    assert_eq!(rebooted.executor().metrics().rejected, 0);
}

#[tokio::test]
async fn handler_failure_during_replay_diverges() {
    let pool = test_pool().await;
    seed_log(&pool).await;

    let (rebooted, ledger) = test_host(pool).await;
    ledger.fail_deposits.store(true, Ordering::SeqCst);

    match rebooted.start().await {
        Err(HostError::ReplayDiverged { seq, command, .. }) => {
            assert_eq!(seq, 3);
            assert_eq!(command, "ledger.deposit");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    // Partially rebuilt state: no second attempt, no commands.
    assert!(matches!(rebooted.start().await, Err(HostError::BootFailed)));
    assert!(!rebooted.executor().is_open());
    assert_eq!(ledger.snapshot().get("alice"), Some(&0));
}

#[tokio::test]
async fn unknown_type_tags_are_counted_during_replay() {
    let pool = test_pool().await;

    let (mut live, _) = test_host(pool.clone()).await;
    live.register_command::<AddNote, _>(Notes::default()).unwrap();
    live.start().await.unwrap();
    live.executor().execute(&open("alice")).await.unwrap();
    live.executor()
        .execute(&AddNote {
            text: "retired feature".into(),
        })
        .await
        .unwrap();

    let (rebooted, ledger) = test_host(pool).await;
    let stats = rebooted.start().await.unwrap();

    assert_eq!(stats.applied, 1);
    assert_eq!(stats.undecodable, 1);
    assert_eq!(stats.not_registered, 0);
    assert_eq!(stats.last_seq, 2);
    assert_eq!(stats.last_seq, rebooted.log().current_version().await.unwrap());
    assert_eq!(ledger.snapshot().get("alice"), Some(&0));
}

// =========================================================================
// Executor gating
// =========================================================================

#[tokio::test]
async fn execute_before_start_is_refused() {
    let (host, ledger) = test_host(test_pool().await).await;

    let err = host.executor().execute(&open("alice")).await.unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::NotStarted { ref command } if command == "ledger.open_account"
    ));
    assert!(!err.is_recorded());
    assert_eq!(host.log().current_version().await.unwrap(), 0);

    host.start().await.unwrap();
    host.executor().execute(&open("alice")).await.unwrap();
    host.executor().execute(&deposit("alice", 30)).await.unwrap();
    assert_eq!(ledger.snapshot().get("alice"), Some(&30));
}

#[tokio::test]
async fn rebooted_host_applies_history_once() {
    let pool = test_pool().await;
    seed_log(&pool).await;

    let (host, ledger) = test_host(pool).await;
    assert!(host.executor().execute(&deposit("alice", 8)).await.is_err());

    host.start().await.unwrap();
    assert_eq!(ledger.snapshot().get("alice"), Some(&42));

    host.executor().execute(&deposit("alice", 8)).await.unwrap();
    assert_eq!(ledger.snapshot().get("alice"), Some(&50));
    assert_eq!(host.log().current_version().await.unwrap(), 6);
}

// =========================================================================
// Registration
// =========================================================================

#[tokio::test]
async fn duplicate_command_registration_fails() {
    let (mut host, _) = test_host(test_pool().await).await;

    let err = host.install(&LedgerFeature::new()).unwrap_err();
    assert!(matches!(
        err,
        HostError::Registry(RegistryError::DuplicateCommand(ref t)) if t == "ledger.open_account"
    ));
}

#[tokio::test]
async fn duplicate_worker_name_fails() {
    let (mut host, _) = test_host(test_pool().await).await;
    let mailer = Arc::new(Mailer::default());

    host.register_worker(mailer_worker("mailer", &mailer)).unwrap();
    let err = host
        .register_worker(mailer_worker("mailer", &mailer))
        .unwrap_err();
    assert!(matches!(
        err,
        HostError::Registry(RegistryError::DuplicateWorker(ref n)) if n == "mailer"
    ));
}

#[tokio::test]
async fn registration_closes_on_start() {
    let (mut host, _) = test_host(test_pool().await).await;
    host.start().await.unwrap();

    let err = host.register_command::<AddNote, _>(Notes::default()).unwrap_err();
    assert!(matches!(err, HostError::Registry(RegistryError::Closed)));
    assert!(matches!(host.start().await, Err(HostError::AlreadyStarted)));

    host.stop().await.unwrap();
}

#[tokio::test]
async fn expected_commands_must_have_handlers() {
    let (mut host, _) = test_host(test_pool().await).await;
    host.expect_commands(&["ledger.deposit", "notes.add"]);

    match host.start().await {
        Err(HostError::MissingCommands(missing)) => assert_eq!(missing, vec!["notes.add"]),
        other => panic!("unexpected result: {other:?}"),
    }

    host.register_command::<AddNote, _>(Notes::default()).unwrap();
    host.start().await.unwrap();
    host.stop().await.unwrap();
}

#[tokio::test]
async fn query_reads_feature_state() {
    let (host, _) = test_host(test_pool().await).await;
    host.start().await.unwrap();
    seed(&host).await;

    let balance = host
        .query(Balance {
            account: "alice".into(),
        })
        .await
        .unwrap();
    assert_eq!(balance, Some(42));

    let missing = host
        .query(Balance {
            account: "carol".into(),
        })
        .await
        .unwrap();
    assert_eq!(missing, None);
}

// =========================================================================
// Workers
// =========================================================================

#[tokio::test]
async fn workers_start_after_replay_and_report_status() {
    let pool = test_pool().await;
    seed_log(&pool).await;
    let (mut host, ledger) = test_host(pool).await;

    let mailer = Arc::new(Mailer::default());
    host.register_worker(mailer_worker("mailer", &mailer)).unwrap();
    host.start().await.unwrap();

    let cycled = eventually(Duration::from_secs(2), || {
        mailer.periodic_runs.load(Ordering::SeqCst) > 0
    })
    .await;
    assert!(cycled);

    let status = host.worker_status().await.unwrap();
    assert_eq!(status.len(), 1);
    assert_eq!(status[0].name, "mailer");
    assert!(status[0].running);
    assert_eq!(status[0].position, 5);
    assert_eq!(mailer.seen().len(), 3);
    assert!(mailer.sent().is_empty());
    assert_eq!(ledger.snapshot().get("alice"), Some(&42));

    host.executor().execute(&deposit("bob", 1)).await.unwrap();
    let sent = eventually(Duration::from_secs(2), || mailer.sent() == vec![6]).await;
    assert!(sent, "sent = {:?}", mailer.sent());

    host.stop().await.unwrap();
    let status = host.worker_status().await.unwrap();
    assert!(!status[0].running);
    assert_eq!(status[0].position, 6);
}

#[tokio::test]
async fn stop_times_out_on_worker_ignoring_cancellation() {
    let (mut host, _) = test_host(test_pool().await).await;

    let mailer = Arc::new(Mailer::default());
    let stubborn = Arc::new(Stubborn::default());
    host.register_worker(mailer_worker("mailer", &mailer)).unwrap();
    host.register_worker(WorkerBuilder::new("stubborn").periodic(stubborn.clone()))
        .unwrap();
    host.start().await.unwrap();

    tokio::time::timeout(Duration::from_secs(2), stubborn.entered.notified())
        .await
        .unwrap();

    let stopped = tokio::time::timeout(Duration::from_secs(2), host.stop())
        .await
        .unwrap();
    match stopped {
        Err(HostError::ShutdownTimeout { pending }) => assert_eq!(pending, vec!["stubborn"]),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn failed_worker_start_stops_workers_already_started() {
    let (mut host, _) = test_host(test_pool().await).await;

    let first = Arc::new(Mailer::default());
    let second = Arc::new(Mailer::default());
    host.register_worker(mailer_worker("first", &first)).unwrap();
    host.register_worker(mailer_worker("second", &second)).unwrap();

    // Started out of band, so the host cannot start it again.
    let elsewhere = CancellationToken::new();
    host.worker("second").unwrap().start(&elsewhere).unwrap();

    match host.start().await {
        Err(HostError::Worker(WorkerError::AlreadyStarted(name))) => assert_eq!(name, "second"),
        other => panic!("unexpected result: {other:?}"),
    }

    assert!(!host.worker("first").unwrap().is_running());
    assert!(!host.executor().is_open());
    assert!(matches!(host.start().await, Err(HostError::BootFailed)));

    host.worker("second")
        .unwrap()
        .stop(Duration::from_secs(1))
        .await
        .unwrap();
}
