//! Tests for the SQLite run ledger.

use dynsched::ledger::{LedgerError, RunLedger, WorkflowName};

#[tokio::test]
async fn start_request_creates_row() {
    let ledger = RunLedger::in_memory().await.unwrap();

    let run = ledger.create_from_start_request("node-1").await.unwrap();
    assert_eq!(run.node_id, "node-1");
    assert_eq!(run.workflow_name, WorkflowName::Start);
    assert!(!run.is_reverting);
    assert!(!run.waiting_manual_intervention);
    assert!(run.cancelled.is_none());

    let fetched = ledger.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(fetched.run_id, run.run_id);
    assert_eq!(fetched.workflow_name, WorkflowName::Start);

    let by_node = ledger.get_run_from_node_id("node-1").await.unwrap().unwrap();
    assert_eq!(by_node.run_id, run.run_id);
}

#[tokio::test]
async fn second_request_for_same_node_conflicts() {
    let ledger = RunLedger::in_memory().await.unwrap();

    let run = ledger.create_from_start_request("node-1").await.unwrap();

    let err = ledger.create_from_start_request("node-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::RunAlreadyExists(ref node) if node == "node-1"));
    let err = ledger.create_from_stop_request("node-1").await.unwrap_err();
    assert!(matches!(err, LedgerError::RunAlreadyExists(_)));

    // Other nodes are unaffected.
    ledger.create_from_start_request("node-2").await.unwrap();

    ledger.remove_run(&run.run_id).await.unwrap();
    let stop = ledger.create_from_stop_request("node-1").await.unwrap();
    assert_eq!(stop.workflow_name, WorkflowName::Stop);
    assert!(stop.is_reverting);
}

#[tokio::test]
async fn cancel_and_flag_update_row() {
    let ledger = RunLedger::in_memory().await.unwrap();
    let run = ledger.create_from_start_request("node-1").await.unwrap();

    ledger.cancel_run(&run.run_id).await.unwrap();
    let first = ledger.get_run(&run.run_id).await.unwrap().unwrap();
    let cancelled_at = first.cancelled.unwrap();

    // Second cancel keeps the first timestamp.
    ledger.cancel_run(&run.run_id).await.unwrap();
    let second = ledger.get_run(&run.run_id).await.unwrap().unwrap();
    assert_eq!(second.cancelled, Some(cancelled_at));

    ledger
        .set_waiting_manual_intervention(&run.run_id)
        .await
        .unwrap();
    assert!(
        ledger
            .get_run(&run.run_id)
            .await
            .unwrap()
            .unwrap()
            .waiting_manual_intervention
    );
}

#[tokio::test]
async fn cancelled_or_flagged_run_still_blocks_its_node() {
    let ledger = RunLedger::in_memory().await.unwrap();
    let run = ledger.create_from_start_request("node-1").await.unwrap();

    ledger.cancel_run(&run.run_id).await.unwrap();
    assert!(matches!(
        ledger.create_from_start_request("node-1").await,
        Err(LedgerError::RunAlreadyExists(_))
    ));

    ledger
        .set_waiting_manual_intervention(&run.run_id)
        .await
        .unwrap();
    assert!(matches!(
        ledger.create_from_stop_request("node-1").await,
        Err(LedgerError::RunAlreadyExists(_))
    ));

    ledger.remove_run(&run.run_id).await.unwrap();
    ledger.create_from_start_request("node-1").await.unwrap();
}

#[tokio::test]
async fn missing_runs_are_no_ops() {
    let ledger = RunLedger::in_memory().await.unwrap();

    assert!(ledger.get_run("missing").await.unwrap().is_none());
    assert!(ledger.get_run_from_node_id("missing").await.unwrap().is_none());
    ledger.cancel_run("missing").await.unwrap();
    ledger.set_waiting_manual_intervention("missing").await.unwrap();
    ledger.remove_run("missing").await.unwrap();
    assert!(ledger.get_all_runs().await.unwrap().is_empty());
}

#[tokio::test]
async fn get_all_runs_oldest_first() {
    let ledger = RunLedger::in_memory().await.unwrap();
    let a = ledger.create_from_start_request("a").await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let b = ledger.create_from_stop_request("b").await.unwrap();

    let runs = ledger.get_all_runs().await.unwrap();
    let ids: Vec<&str> = runs.iter().map(|r| r.run_id.as_str()).collect();
    assert_eq!(ids, vec![a.run_id.as_str(), b.run_id.as_str()]);
}

#[tokio::test]
async fn file_ledger_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data").join("runs.db");

    let run_id = {
        let ledger = RunLedger::from_path(&path).await.unwrap();
        ledger.create_from_start_request("node-1").await.unwrap().run_id
    };

    let reopened = RunLedger::from_path(&path).await.unwrap();
    let run = reopened.get_run(&run_id).await.unwrap().unwrap();
    assert_eq!(run.node_id, "node-1");
    assert!(matches!(
        reopened.create_from_start_request("node-1").await,
        Err(LedgerError::RunAlreadyExists(_))
    ));
}
