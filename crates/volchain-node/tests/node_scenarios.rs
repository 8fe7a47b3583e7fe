// volchain-node/tests/node_scenarios.rs
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use volchain_core::{GroundTruth, ReplaySource, SealOutcome, Transaction, TxRequest};
use volchain_crypto::KeyPair;
use volchain_node::{CommitOutcome, Node, NodeConfig, NodeError};

fn test_config(dir: &TempDir) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.data_dir = dir.path().to_string_lossy().into_owned();
    config.producer.interval_ms = 20;
    config.barrier.poll_ms = 5;
    config.barrier.timeout_ms = 2_000;
    config
}

fn mint(kp: &KeyPair, amount: u64, op_id: &str) -> Transaction {
    Transaction::mint(kp.public_key(), amount).unwrap().with_op_id(op_id)
}

async fn sealed(node: &Node) {
    match node.seal_now(None).await.unwrap() {
        SealOutcome::Sealed(_) => {}
        other => panic!("expected a block, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mint_transfer_and_replay() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(test_config(&dir)).unwrap();
    let (a, b) = (KeyPair::generate(), KeyPair::generate());

    node.submit(mint(&a, 10, "op1")).await.unwrap();
    sealed(&node).await;
    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().balance, 10);

    let transfer = Transaction::transfer(a.public_key(), b.public_key(), 4, 1)
        .unwrap()
        .with_op_id("op2")
        .signed(&a)
        .unwrap();
    node.submit(transfer).await.unwrap();
    sealed(&node).await;

    let account_a = node.account(&a.public_key().to_hex()).await.unwrap();
    assert_eq!((account_a.balance, account_a.nonce), (6, 1));
    let address_b = b.address().unwrap().to_string();
    assert_eq!(node.account(&address_b).await.unwrap().balance, 4);

    let report = node.verify().await.unwrap();
    assert!(report.ok, "{report:?}");
    assert_eq!(report.mode, Some(ReplaySource::Blocks));
    assert_eq!(node.head().await.height, 2);
}

#[tokio::test]
async fn test_stake_attack_scenario() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(test_config(&dir)).unwrap();
    let (a, b) = (KeyPair::generate(), KeyPair::generate());

    node.submit_bundle(vec![mint(&a, 5, "ma"), mint(&b, 5, "mb")]).await.unwrap();
    sealed(&node).await;
    for kp in [&a, &b] {
        let stake = Transaction::stake(kp.public_key(), 3).unwrap().signed(kp).unwrap();
        node.submit(stake).await.unwrap();
    }
    sealed(&node).await;
    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().available, 2);

    node.submit(Transaction::attack(a.public_key(), b.public_key()).unwrap()).await.unwrap();
    sealed(&node).await;

    let attacker = node.account(&a.public_key().to_hex()).await.unwrap();
    let defender = node.account(&b.public_key().to_hex()).await.unwrap();
    assert_eq!((attacker.balance, attacker.available), (4, 1));
    assert_eq!(defender.staked, 2);
    assert_eq!(node.snapshot().await.supply(), 8);
    assert!(node.verify().await.unwrap().ok);
}

#[tokio::test]
async fn test_commit_bundle_with_running_producer() {
    let dir = TempDir::new().unwrap();
    let node = Arc::new(Node::new(test_config(&dir)).unwrap());
    node.clone().start().await.unwrap();
    assert!(matches!(node.clone().start().await, Err(NodeError::AlreadyRunning)));

    let a = KeyPair::generate();
    let mut truth = GroundTruth::default();
    truth.set(*a.public_key(), 3, 0);

    let outcome = node.commit_bundle(vec![mint(&a, 3, "dig-1")], Some(&truth)).await.unwrap();
    match outcome {
        CommitOutcome::Committed { receipt, seal, apply, guard } => {
            assert_eq!(receipt.op_ids, vec!["dig-1"]);
            assert!(seal.ok && apply.ok);
            assert!(guard.unwrap().ok);
        }
        other => panic!("unexpected outcome {other:?}"),
    }

    let again = node.commit_bundle(vec![mint(&a, 3, "dig-1")], Some(&truth)).await.unwrap();
    assert!(matches!(again, CommitOutcome::AlreadyApplied { ref code } if code == "duplicate_op_id"));
    assert_eq!(node.metrics().await.op_id_dedup_total, 1);
    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().balance, 3);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_commit_bundle_reports_guard_failure() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(test_config(&dir)).unwrap();
    let a = KeyPair::generate();
    let mut truth = GroundTruth::default();
    truth.set(*a.public_key(), 1, 0);

    let err = node.commit_bundle(vec![mint(&a, 2, "over")], Some(&truth)).await.unwrap_err();
    assert_eq!(err.code(), "guard_failed");
    match err {
        NodeError::GuardFailed(report) => assert!(report.has_critical()),
        other => panic!("unexpected error {other:?}"),
    }
    // the ledger keeps the committed bundle; the caller rolls back its own state
    assert_eq!(node.snapshot().await.supply(), 2);

    let correction = node.guard_correct(&truth).await.unwrap();
    assert_eq!(correction.supply_after, 1);
    assert!(node.guard_check(&truth).await.ok);
}

#[tokio::test]
async fn test_restart_recovers_state_and_mempool() {
    let dir = TempDir::new().unwrap();
    let a = KeyPair::generate();
    {
        let node = Node::new(test_config(&dir)).unwrap();
        node.submit(mint(&a, 4, "r1")).await.unwrap();
        sealed(&node).await;
        node.submit(mint(&a, 1, "r2")).await.unwrap();
    }

    let node = Node::new(test_config(&dir)).unwrap();
    assert_eq!(node.head().await.height, 1);
    assert_eq!(node.metrics().await.pool.pending_count, 1);
    sealed(&node).await;
    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().balance, 5);
    assert!(node.verify().await.unwrap().ok);
}

#[tokio::test]
async fn test_submit_request_and_history_pages() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(test_config(&dir)).unwrap();
    let a = KeyPair::generate();

    for i in 0..3 {
        let request: TxRequest = serde_json::from_value(serde_json::json!({
            "type": "mint",
            "from": "SYSTEM",
            "to": a.address().unwrap().to_string(),
            "amount": "2",
            "nonce": 0,
            "memo": { "op_id": format!("req{i}"), "toPubkey": a.public_key().to_base64() },
        }))
        .unwrap();
        node.submit_request(request).await.unwrap();
        sealed(&node).await;
    }

    let bad: TxRequest = serde_json::from_value(serde_json::json!({
        "type": "mint", "from": "SYSTEM", "amount": -1, "nonce": 0,
    }))
    .unwrap();
    assert_eq!(node.submit_request(bad).await.unwrap_err().code(), "invalid_amount");

    let page = node.blocks(2, None).unwrap();
    assert_eq!(page.items.iter().map(|h| h.height).collect::<Vec<_>>(), vec![3, 2]);
    assert_eq!(page.next_cursor, Some(2));
    let events = node.events(10, None).unwrap();
    assert_eq!(events.items.len(), 3);
    assert_eq!(events.items[0].id, 3);

    let holders = node.holders(10).await;
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].balance, 6);
}

#[tokio::test]
async fn test_wait_until_sealed_times_out_without_producer() {
    let dir = TempDir::new().unwrap();
    let node = Node::new(test_config(&dir)).unwrap();
    let a = KeyPair::generate();
    node.submit(mint(&a, 1, "slow")).await.unwrap();

    let ids = vec!["slow".to_string()];
    let outcome = node.wait_until_sealed(&ids, Some(Duration::from_millis(30))).await;
    assert!(outcome.timed_out);
    assert_eq!(node.barrier().metrics().timeouts_total, 1);

    sealed(&node).await;
    let outcome = node.wait_until_sealed(&ids, None).await;
    assert!(outcome.ok);
}

#[tokio::test]
async fn test_failed_snapshot_write_recovers_on_restart() {
    let dir = TempDir::new().unwrap();
    let a = KeyPair::generate();
    // a directory at the temp path makes every snapshot write fail
    let blocker = dir.path().join("snapshot.json.tmp");
    {
        let node = Node::new(test_config(&dir)).unwrap();
        node.submit(mint(&a, 4, "w1")).await.unwrap();
        sealed(&node).await;

        std::fs::create_dir(&blocker).unwrap();
        node.submit(mint(&a, 1, "w2")).await.unwrap();
        assert_eq!(node.seal_now(None).await.unwrap_err().code(), "storage_error");
        // the block is durable, so the live ledger already includes it
        assert_eq!(node.head().await.height, 2);
    }
    std::fs::remove_dir(&blocker).unwrap();

    let node = Node::new(test_config(&dir)).unwrap();
    assert_eq!(node.head().await.height, 2);
    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().balance, 5);
    assert_eq!(node.metrics().await.pool.pending_count, 0);
    let events = node.events(10, None).unwrap();
    assert_eq!(events.items.iter().map(|e| e.id).collect::<Vec<_>>(), vec![2, 1]);
    assert!(node.verify().await.unwrap().ok);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_submits_with_running_producer() {
    let dir = TempDir::new().unwrap();
    let node = Arc::new(Node::new(test_config(&dir)).unwrap());
    node.clone().start().await.unwrap();
    let a = KeyPair::generate();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let node = node.clone();
        let tx = mint(&a, 1, &format!("c{i}"));
        tasks.push(tokio::spawn(async move { node.submit(tx).await }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let ids: Vec<String> = (0..16).map(|i| format!("c{i}")).collect();
    assert!(node.wait_until_sealed(&ids, None).await.ok);
    node.stop().await.unwrap();

    assert_eq!(node.account(&a.public_key().to_hex()).await.unwrap().balance, 16);
    assert!(node.verify().await.unwrap().ok);
}
