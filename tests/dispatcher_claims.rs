// tests/dispatcher_claims.rs
//
// Claim lifecycle against the in-memory queue:
// - concurrent claimers never share an item
// - complete / fail transitions
// - a lost claim turns complete/fail into a no-op
// - run_once with a handler

use anyhow::anyhow;
use async_trait::async_trait;
use feed_pipeline::{
    Item, ManualClock, MemoryStageQueue, Stage, StageHandler, StageQueue, StallRecovery,
    WorkDispatcher,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

async fn seeded(n: usize) -> Arc<MemoryStageQueue> {
    let queue = Arc::new(MemoryStageQueue::new());
    let now = chrono::Utc::now();
    for i in 0..n {
        queue
            .push(Stage::Pending, Item::new(format!("it-{i}"), json!({ "n": i }), now))
            .await
            .unwrap();
    }
    queue
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claims_never_hand_out_the_same_item() {
    let queue = seeded(5).await;
    let dispatcher = WorkDispatcher::new(queue.clone(), Arc::new(ManualClock::default()));

    let mut handles = Vec::new();
    for _ in 0..20 {
        let d = dispatcher.clone();
        handles.push(tokio::spawn(async move { d.claim_next().await.unwrap() }));
    }

    let mut ids = HashSet::new();
    let mut empty = 0;
    for h in handles {
        match h.await.unwrap() {
            Some(it) => {
                assert_eq!(it.attempts, 1);
                assert!(it.claimed_at.is_some());
                assert!(ids.insert(it.id), "item claimed twice");
            }
            None => empty += 1,
        }
    }
    assert_eq!(ids.len(), 5);
    assert_eq!(empty, 15);

    let c = queue.counts().await.unwrap();
    assert_eq!(c.pending, 0);
    assert_eq!(c.processing, 5);
}

#[tokio::test]
async fn claim_on_empty_queue_returns_none() {
    let queue = Arc::new(MemoryStageQueue::new());
    let d = WorkDispatcher::new(queue, Arc::new(ManualClock::default()));
    assert!(d.claim_next().await.unwrap().is_none());
}

#[tokio::test]
async fn complete_and_fail_move_out_of_processing() {
    let queue = seeded(2).await;
    let d = WorkDispatcher::new(queue.clone(), Arc::new(ManualClock::default()));

    let a = d.claim_next().await.unwrap().unwrap();
    let b = d.claim_next().await.unwrap().unwrap();
    assert!(d.complete(&a, json!({ "translated": "hola" })).await.unwrap());
    assert!(d.fail(&b, "translator returned 500").await.unwrap());

    let done = queue.get(&a.id).await.unwrap().unwrap();
    assert_eq!(done.stage, Stage::Completed);
    assert_eq!(done.result, Some(json!({ "translated": "hola" })));

    let errored = queue.get(&b.id).await.unwrap().unwrap();
    assert_eq!(errored.stage, Stage::Error);
    assert_eq!(errored.last_error.as_deref(), Some("translator returned 500"));

    let c = queue.counts().await.unwrap();
    assert_eq!((c.processing, c.completed, c.error), (0, 1, 1));
}

#[tokio::test]
async fn completing_a_recovered_claim_is_a_no_op() {
    let queue = seeded(1).await;
    let clock = Arc::new(ManualClock::default());
    let d = WorkDispatcher::new(queue.clone(), clock.clone());
    let recovery = StallRecovery::new(queue.clone(), clock.clone(), Duration::from_secs(60), 3);

    let slow = d.claim_next().await.unwrap().unwrap();
    clock.advance(chrono::Duration::seconds(61));
    assert_eq!(recovery.recover_stalled(Duration::from_secs(60)).await.unwrap(), 1);

    // Re-claimed by a fresh worker before the slow one reports.
    let fresh = d.claim_next().await.unwrap().unwrap();
    assert_eq!(fresh.id, slow.id);
    assert_eq!(fresh.attempts, 2);

    assert!(!d.complete(&slow, json!("late")).await.unwrap());
    assert!(!d.fail(&slow, "late").await.unwrap());
    assert_eq!(
        queue.get(&slow.id).await.unwrap().unwrap().stage,
        Stage::Processing
    );

    assert!(d.complete(&fresh, json!("ok")).await.unwrap());
    assert_eq!(
        queue.get(&slow.id).await.unwrap().unwrap().stage,
        Stage::Completed
    );
}

struct Upper;

#[async_trait]
impl StageHandler for Upper {
    async fn handle(&self, item: &Item) -> anyhow::Result<Value> {
        match item.payload.get("title").and_then(Value::as_str) {
            Some(t) => Ok(json!(t.to_uppercase())),
            None => Err(anyhow!("missing title")),
        }
    }
    fn name(&self) -> &'static str {
        "upper"
    }
}

#[tokio::test]
async fn run_once_routes_handler_errors_to_error_stage() {
    let queue = Arc::new(MemoryStageQueue::new());
    let now = chrono::Utc::now();
    queue
        .push(Stage::Pending, Item::new("ok", json!({ "title": "fed" }), now))
        .await
        .unwrap();
    queue
        .push(Stage::Pending, Item::new("bad", json!({}), now))
        .await
        .unwrap();
    let d = WorkDispatcher::new(queue.clone(), Arc::new(ManualClock::default()));

    assert!(d.run_once(&Upper).await.unwrap());
    assert!(d.run_once(&Upper).await.unwrap());
    assert!(!d.run_once(&Upper).await.unwrap());

    let ok = queue.get("ok").await.unwrap().unwrap();
    assert_eq!(ok.stage, Stage::Completed);
    assert_eq!(ok.result, Some(json!("FED")));

    let bad = queue.get("bad").await.unwrap().unwrap();
    assert_eq!(bad.stage, Stage::Error);
    assert!(bad.last_error.unwrap().contains("missing title"));
}

#[tokio::test]
async fn spawned_worker_drains_pending() {
    use feed_pipeline::config::DispatchConfig;
    use feed_pipeline::dispatcher::{spawn_dispatch_worker, DispatchWorkerCfg};

    let queue = Arc::new(MemoryStageQueue::new());
    let now = chrono::Utc::now();
    for i in 0..3 {
        queue
            .push(
                Stage::Pending,
                Item::new(format!("w{i}"), json!({ "title": format!("t{i}") }), now),
            )
            .await
            .unwrap();
    }
    let clock = Arc::new(ManualClock::default());
    let dispatch = DispatchConfig {
        poll_interval_ms: 10,
        ..DispatchConfig::default()
    };
    let cfg = DispatchWorkerCfg::from(&dispatch).with_recovery(Arc::new(StallRecovery::new(
        queue.clone(),
        clock.clone(),
        dispatch.max_processing_age(),
        dispatch.max_attempts,
    )));
    assert_eq!(cfg.poll_interval, Duration::from_millis(10));

    let worker = spawn_dispatch_worker(
        WorkDispatcher::new(queue.clone(), clock),
        Arc::new(Upper),
        cfg,
    );

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while queue.counts().await.unwrap().completed < 3 {
        assert!(tokio::time::Instant::now() < deadline, "worker did not drain pending");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    worker.abort();

    let c = queue.counts().await.unwrap();
    assert_eq!((c.pending, c.processing, c.completed), (0, 0, 3));
}
