use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use testledger::actions::{ActionOutcome, ActionRequest, Authorization};
use testledger::clock::ManualClock;
use testledger::model::Table;
use testledger::name::Name;
use testledger::query::TableQuery;
use testledger::Ledger;

fn n(s: &str) -> Name {
    Name::new(s).unwrap()
}

fn add(actor: &str, testid: &str) -> ActionRequest {
    ActionRequest {
        account: n("llmtest"),
        name: n("addtest"),
        authorization: vec![Authorization::active(n(actor))],
        data: json!({"creator": actor, "testid": testid, "description": "run", "results": [0.5, 0.75]}),
    }
}

fn clear() -> ActionRequest {
    ActionRequest {
        account: n("llmtest"),
        name: n("clearall"),
        authorization: vec![Authorization::active(n("llmtest"))],
        data: json!({"user": "llmtest"}),
    }
}

fn row_ids(ledger: &Ledger<testledger::storage::SegmentBackend>) -> Vec<u64> {
    ledger
        .get_table_rows(&TableQuery::new(n("llmtest"), Table::Tests))
        .unwrap()
        .rows
        .iter()
        .map(|r| r.id)
        .collect()
}

#[test]
fn test_records_and_counter_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.log");
    let clock = Arc::new(ManualClock::new(1_700_000_000));

    {
        let ledger = Ledger::open_with_clock(&path, true, clock.clone()).unwrap();
        for t in ["t1", "t2", "t3"] {
            ledger.push_action(add("alice", t)).unwrap();
        }
        ledger.push_action(clear()).unwrap();
        ledger.push_action(add("bob", "t4")).unwrap();
    }

    let ledger = Ledger::open_with_clock(&path, true, clock).unwrap();
    assert_eq!(row_ids(&ledger), vec![3]);

    let outcome = ledger.push_action(add("bob", "t5")).unwrap();
    assert!(matches!(outcome, ActionOutcome::Added(r) if r.id == 4));
}

#[test]
fn test_rejected_actions_are_not_logged() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.log");

    let ledger = Ledger::open(&path, false).unwrap();
    ledger.push_action(add("alice", "t1")).unwrap();
    let size = ledger.size_bytes().unwrap();

    let mut bad = add("alice", "t2");
    bad.authorization = vec![Authorization::active(n("mallory"))];
    assert!(ledger.push_action(bad).is_err());
    assert_eq!(ledger.size_bytes().unwrap(), size);
}

#[test]
fn test_compaction_keeps_state_and_shrinks_log() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.log");

    let ledger = Ledger::open(&path, false).unwrap();
    for i in 0..20 {
        ledger.push_action(add("alice", &format!("t{}", i % 5 + 1))).unwrap();
    }
    ledger.push_action(clear()).unwrap();
    ledger.push_action(add("carol", "t1")).unwrap();

    let stats = ledger.compact().unwrap();
    assert!(stats.bytes_after < stats.bytes_before);
    assert_eq!(row_ids(&ledger), vec![20]);
    drop(ledger);

    let ledger = Ledger::open(&path, false).unwrap();
    assert_eq!(row_ids(&ledger), vec![20]);
    let outcome = ledger.push_action(add("carol", "t2")).unwrap();
    assert!(matches!(outcome, ActionOutcome::Added(r) if r.id == 21));
}

#[test]
fn test_torn_tail_is_dropped_on_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.log");

    {
        let ledger = Ledger::open(&path, true).unwrap();
        ledger.push_action(add("alice", "t1")).unwrap();
        ledger.push_action(add("alice", "t2")).unwrap();
    }
    {
        // A frame header promising more bytes than were written
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&500u32.to_le_bytes()).unwrap();
        file.write_all(&[0u8; 8]).unwrap();
        file.write_all(b"partial").unwrap();
    }

    let ledger = Ledger::open(&path, true).unwrap();
    assert_eq!(row_ids(&ledger), vec![0, 1]);
    let outcome = ledger.push_action(add("alice", "t3")).unwrap();
    assert!(matches!(outcome, ActionOutcome::Added(r) if r.id == 2));
}
