//! Tailing, retry and persistence scenarios over an in-process master.

use proptest::prelude::*;
use replica_master::MasterConfig;
use replica_protocol::{Document, DocumentId, LogCursor, LogRead};
use replica_slave::{ReplError, ReplMode, ResyncReason, StepOutcome};
use replica_storage::{MemoryStorage, StorageEngine};
use replica_testkit::prelude::*;

#[test]
fn slave_applies_log_in_order() {
    let pair = ReplicaPair::new(
        MasterConfig::default(),
        test_slave_config().with_pull_batch_size(3),
    );
    pair.write_numbered("app", "users", 0, 2, 8);
    pair.sync().unwrap();

    let node = pair.master_node();
    let id = DocumentId::from("doc-1");
    node.insert("app", "users", Document::with_id(id.clone()).set("n", 1))
        .unwrap();
    node.update("app", "users", Document::with_id(id.clone()).set("n", 2))
        .unwrap();
    node.remove("app", "users", id.clone()).unwrap();
    node.insert("app", "users", Document::with_id(id.clone()).set("n", 3))
        .unwrap();
    let last = pair.write_numbered("app", "orders", 0, 7, 8);

    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    assert!(pair.databases_match("app"));
    let doc = pair.slave_storage().get("app", "users", &id).unwrap().unwrap();
    assert_eq!(doc.get("n"), Some(&serde_json::json!(3)));
    assert_eq!(pair.slave().state().last_applied, last);
}

#[test]
fn transient_failures_within_budget_are_absorbed() {
    let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
    pair.write_numbered("app", "c", 0, 3, 8);
    pair.client.fail_next(2);
    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    assert!(pair.databases_match("app"));

    pair.write_numbered("app", "c", 3, 3, 8);
    pair.client.fail_next(2);
    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    assert!(pair.databases_match("app"));
    assert_eq!(pair.slave().state().mode, ReplMode::Tailing);
}

#[test]
fn exhausted_retry_budget_faults_the_slave() {
    let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
    pair.write_numbered("app", "c", 0, 3, 8);
    pair.sync().unwrap();

    pair.write_numbered("app", "c", 3, 3, 8);
    pair.client.fail_next(3);
    let err = pair.sync().unwrap_err();
    assert!(matches!(err, ReplError::Fatal(_)));
    assert_eq!(pair.slave().state().mode, ReplMode::Fault);

    // Writes are halted until an operator resyncs.
    assert_eq!(pair.slave().poll_once().unwrap(), StepOutcome::Paused);
    assert!(pair.slave().run_command("resync").ok);
    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    assert!(pair.databases_match("app"));
}

#[test]
fn initial_resync_failure_faults_the_slave() {
    let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
    pair.write_numbered("app", "c", 0, 3, 8);
    pair.client.fail_next(3);
    assert!(pair.sync().is_err());
    let state = pair.slave().state();
    assert_eq!(state.mode, ReplMode::Fault);
    assert!(!state.initialized);
}

#[test]
fn file_backed_slave_resumes_after_restart() {
    let mut pair = ReplicaPair::file(MasterConfig::default(), test_slave_config());
    pair.write_numbered("app", "c", 0, 5, 8);
    pair.sync().unwrap();
    pair.stop_slave();

    let last = pair.write_numbered("app", "c", 5, 5, 8);
    pair.restart_slave().unwrap();
    assert!(!pair.slave().controller().is_pending());
    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    assert_eq!(pair.slave().state().last_applied, last);
    assert!(pair.databases_match("app"));
}

#[test]
fn interrupted_resync_restarts_on_reopen() {
    let mut pair = ReplicaPair::file(MasterConfig::default(), test_slave_config());
    pair.write_numbered("app", "c", 0, 5, 8);
    pair.sync().unwrap();
    pair.write_numbered("app", "c", 5, 5, 8);

    assert!(pair.slave().run_command("resync").ok);
    pair.restart_slave().unwrap();
    assert_eq!(pair.slave().state().mode, ReplMode::Resyncing);
    assert!(pair.slave().controller().is_pending());

    assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
    let outcome = pair.slave().controller().last_outcome().unwrap();
    assert_eq!(outcome.reason, ResyncReason::Initial);
    assert!(pair.databases_match("app"));
}

#[test]
fn background_threads_replicate_and_stop() {
    let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
    let last = pair.write_numbered("app", "c", 0, 20, 8);
    pair.slave().start().unwrap();
    assert!(pair.slave().is_running());

    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    while pair.slave().state().last_applied < last {
        assert!(std::time::Instant::now() < deadline, "slave did not catch up");
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    pair.slave().shutdown().unwrap();
    assert!(!pair.slave().is_running());
    assert!(pair.databases_match("app"));
}

#[test]
fn top_tracks_applied_namespaces() {
    let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
    pair.sync().unwrap();
    pair.write_numbered("app", "c", 0, 4, 8);
    pair.sync().unwrap();

    let usage = pair.slave().top().usage();
    let entry = usage.get("app.c").unwrap();
    assert_eq!(entry.insert.count, 4);
    assert_eq!(entry.write_lock.count, 4);

    let top = pair.slave().run_command("top").to_json();
    assert_eq!(top["totals"]["app.c"]["insert"]["count"], 4);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn slave_converges_to_master(
        before in operation_sequence_strategy(20),
        after in operation_sequence_strategy(40),
    ) {
        let pair = ReplicaPair::new(
            MasterConfig::default(),
            test_slave_config().with_pull_batch_size(4),
        );
        for op in before {
            pair.master_node().write(op).unwrap();
        }
        pair.sync().unwrap();
        for op in after {
            pair.master_node().write(op).unwrap();
        }
        prop_assert_eq!(pair.sync().unwrap(), StepOutcome::CaughtUp);
        for db in DATABASES {
            prop_assert!(pair.databases_match(db));
        }
        prop_assert_eq!(
            pair.slave().state().last_applied,
            pair.master_node().tail_info().latest
        );
    }

    #[test]
    fn replaying_a_suffix_is_idempotent(
        ops in operation_sequence_strategy(30),
        replay_from in 0usize..30,
    ) {
        let pair = ReplicaPair::new(MasterConfig::default(), test_slave_config());
        for op in ops {
            pair.master_node().write(op).unwrap();
        }
        let entries = match pair.master_node().read_from(LogCursor::start(), usize::MAX) {
            LogRead::Entries { entries, .. } => entries,
            LogRead::Gap { .. } => unreachable!("default log never evicts here"),
        };

        let storage = MemoryStorage::new();
        for entry in &entries {
            storage.apply(entry).unwrap();
        }
        let start = replay_from.min(entries.len());
        for entry in &entries[start..] {
            storage.apply(entry).unwrap();
        }
        for db in DATABASES {
            let expected = pair.master_node().storage().snapshot(db).unwrap();
            prop_assert_eq!(storage.snapshot(db).unwrap().data, expected.data);
        }
    }
}
