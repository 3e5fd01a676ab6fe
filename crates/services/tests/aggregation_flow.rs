use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use quiz_core::model::{AttemptId, QuestionId, QuestionStat};
use quiz_core::time::fixed_now;
use services::{
    AggregationError, AggregatorConfig, AttemptAggregator, Clock, attempt_marker_key,
};
use storage::repository::{
    AtomicUnit, CounterStore, InMemoryCounterStore, StorageError, UnitOutcome,
};

/// Wraps the in-memory store and fails the Nth `apply_unit` call once.
struct FlakyStore {
    inner: InMemoryCounterStore,
    calls: AtomicUsize,
    fail_on: usize,
}

impl FlakyStore {
    fn new(inner: InMemoryCounterStore, fail_on: usize) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_on,
        }
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    fn max_ops_per_unit(&self) -> usize {
        self.inner.max_ops_per_unit()
    }

    async fn apply_unit(&self, unit: &AtomicUnit) -> Result<UnitOutcome, StorageError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(StorageError::Unavailable("injected outage".into()));
        }
        self.inner.apply_unit(unit).await
    }

    async fn get_stat(&self, question_id: &QuestionId) -> Result<QuestionStat, StorageError> {
        self.inner.get_stat(question_id).await
    }

    async fn is_processed(&self, marker_key: &str) -> Result<bool, StorageError> {
        self.inner.is_processed(marker_key).await
    }
}

fn qid(s: &str) -> QuestionId {
    QuestionId::new(s).unwrap()
}

fn done_key(attempt_id: &str) -> String {
    attempt_marker_key(&AttemptId::new(attempt_id).unwrap())
}

fn aggregator(store: Arc<dyn CounterStore>) -> AttemptAggregator {
    AttemptAggregator::new(Clock::fixed(fixed_now()), store, AggregatorConfig::default())
}

async fn counters(store: &dyn CounterStore, q: &str) -> (u64, u64) {
    match store.get_stat(&qid(q)).await {
        Ok(stat) => (stat.total_attempts(), stat.correct_attempts()),
        Err(StorageError::NotFound) => (0, 0),
        Err(e) => panic!("unexpected storage error: {e}"),
    }
}

fn example_payload() -> Value {
    json!({
        "results": [
            { "questionId": "q1", "isCorrect": true },
            { "questionId": "q1", "isCorrect": false },
            { "questionId": "q2", "isCorrect": true }
        ]
    })
}

fn many_questions(count: usize) -> Value {
    let results: Vec<Value> = (0..count)
        .map(|i| json!({ "questionId": format!("q{i:03}"), "isCorrect": i % 2 == 0 }))
        .collect();
    json!({ "results": results })
}

#[tokio::test]
async fn example_record_updates_only_its_questions() {
    let store = Arc::new(InMemoryCounterStore::new());
    store
        .merge_increment(
            &qid("q9"),
            quiz_core::model::StatDelta::new(5, 2).unwrap(),
            fixed_now(),
        )
        .await
        .unwrap();
    let agg = aggregator(store.clone());

    let outcome = agg.handle("a1", &example_payload()).await.unwrap();
    assert_eq!(outcome.questions, 2);
    assert_eq!(outcome.units_committed, 1);

    assert_eq!(counters(&*store, "q1").await, (2, 1));
    assert_eq!(counters(&*store, "q2").await, (1, 1));
    assert_eq!(counters(&*store, "q9").await, (5, 2));
}

#[tokio::test]
async fn redelivery_leaves_counters_unchanged() {
    let store = Arc::new(InMemoryCounterStore::new());
    let agg = aggregator(store.clone());

    agg.handle("a1", &example_payload()).await.unwrap();
    for _ in 0..3 {
        let outcome = agg.handle("a1", &example_payload()).await.unwrap();
        assert!(outcome.is_duplicate());
    }

    assert_eq!(counters(&*store, "q1").await, (2, 1));
    assert_eq!(counters(&*store, "q2").await, (1, 1));
}

#[tokio::test]
async fn outcome_order_does_not_change_counters() {
    let forward = Arc::new(InMemoryCounterStore::new());
    let reversed = Arc::new(InMemoryCounterStore::new());

    let payload = example_payload();
    let mut items = payload["results"].as_array().unwrap().clone();
    items.reverse();
    let reversed_payload = json!({ "results": items });

    aggregator(forward.clone()).handle("a1", &payload).await.unwrap();
    aggregator(reversed.clone())
        .handle("a1", &reversed_payload)
        .await
        .unwrap();

    for q in ["q1", "q2"] {
        assert_eq!(
            counters(&*forward, q).await,
            counters(&*reversed, q).await
        );
    }
}

#[tokio::test]
async fn malformed_record_changes_nothing() {
    let store = Arc::new(InMemoryCounterStore::new());
    let agg = aggregator(store.clone());

    let payload = json!({ "results": [
        { "questionId": "q1", "isCorrect": true },
        { "questionId": "q2" }
    ]});
    let err = agg.handle("a1", &payload).await.unwrap_err();
    assert!(matches!(err, AggregationError::MalformedRecord(_)));
    assert!(!err.is_retryable());

    assert_eq!(counters(&*store, "q1").await, (0, 0));
    assert!(!store.is_processed(&done_key("a1")).await.unwrap());

    let err = agg.handle_slice("a2", b"not json").await.unwrap_err();
    assert!(matches!(err, AggregationError::MalformedRecord(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distinct_attempts_sum_up() {
    let store = Arc::new(InMemoryCounterStore::new());
    let agg = Arc::new(aggregator(store.clone()));

    let mut handles = Vec::new();
    for i in 0..20 {
        let agg = Arc::clone(&agg);
        handles.push(tokio::spawn(async move {
            let payload = json!({ "results": [
                { "questionId": "shared", "isCorrect": i % 2 == 0 },
                { "questionId": format!("own-{i}"), "isCorrect": true }
            ]});
            agg.handle(&format!("attempt-{i}"), &payload).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(counters(&*store, "shared").await, (20, 10));
    assert_eq!(counters(&*store, "own-7").await, (1, 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redeliveries_apply_once() {
    let store = Arc::new(InMemoryCounterStore::new());
    let agg = Arc::new(aggregator(store.clone()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let agg = Arc::clone(&agg);
        handles.push(tokio::spawn(async move {
            agg.handle("a1", &example_payload()).await
        }));
    }

    let mut committed = 0;
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        committed += outcome.units_committed;
    }

    assert_eq!(committed, 1);
    assert_eq!(counters(&*store, "q1").await, (2, 1));
}

#[tokio::test]
async fn chunked_attempt_applies_all_chunks_once() {
    let store = Arc::new(InMemoryCounterStore::with_max_ops(5));
    let agg = aggregator(store.clone());

    let outcome = agg.handle("big", &many_questions(10)).await.unwrap();
    // 5-op cap leaves 3 increments per unit: 10 questions need 4 units.
    assert_eq!(outcome.units_committed, 4);
    assert!(store.is_processed(&done_key("big")).await.unwrap());

    let again = agg.handle("big", &many_questions(10)).await.unwrap();
    assert!(again.is_duplicate());
    assert_eq!(counters(&*store, "q000").await, (1, 1));
    assert_eq!(counters(&*store, "q009").await, (1, 0));
}

#[tokio::test]
async fn failure_after_first_chunk_is_partial_and_resumable() {
    let inner = InMemoryCounterStore::with_max_ops(5);
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 2));
    let agg = aggregator(flaky);

    let err = agg.handle("big", &many_questions(10)).await.unwrap_err();
    match &err {
        AggregationError::PartialApplyFailure {
            attempt_id,
            committed,
            total,
            ..
        } => {
            assert_eq!(attempt_id.as_str(), "big");
            assert_eq!(*committed, 1);
            assert_eq!(*total, 4);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }
    assert!(err.is_retryable());

    // First chunk landed, nothing after it did.
    assert_eq!(counters(&inner, "q000").await, (1, 1));
    assert_eq!(counters(&inner, "q003").await, (0, 0));
    assert!(!inner.is_processed(&done_key("big")).await.unwrap());

    // Redelivery skips the committed chunk and finishes the rest.
    let outcome = agg.handle("big", &many_questions(10)).await.unwrap();
    assert_eq!(outcome.units_skipped, 1);
    assert_eq!(outcome.units_committed, 3);
    for i in 0..10 {
        let expected = (1, u64::from(i % 2 == 0));
        assert_eq!(counters(&inner, &format!("q{i:03}")).await, expected);
    }
}

#[tokio::test]
async fn failure_on_first_unit_is_store_unavailable() {
    let inner = InMemoryCounterStore::new();
    let flaky = Arc::new(FlakyStore::new(inner.clone(), 1));
    let agg = aggregator(flaky);

    let err = agg.handle("a1", &example_payload()).await.unwrap_err();
    assert!(matches!(err, AggregationError::StoreUnavailable(_)));
    assert!(err.is_retryable());
    assert_eq!(counters(&inner, "q1").await, (0, 0));

    agg.handle("a1", &example_payload()).await.unwrap();
    assert_eq!(counters(&inner, "q1").await, (2, 1));
}

#[tokio::test]
async fn cap_too_small_is_reported() {
    let store = Arc::new(InMemoryCounterStore::new());
    let agg = AttemptAggregator::new(
        Clock::fixed(fixed_now()),
        store.clone(),
        AggregatorConfig::default().with_max_ops(2),
    );

    let err = agg.handle("a1", &example_payload()).await.unwrap_err();
    assert!(matches!(
        err,
        AggregationError::AtomicUnitTooLarge { ops: 3, max: 2 }
    ));
    assert_eq!(counters(&*store, "q1").await, (0, 0));
}

#[tokio::test]
async fn lookalike_attempt_ids_are_counted_in_either_order() {
    let other = json!({ "results": [{ "questionId": "other", "isCorrect": true }] });

    for lookalike in ["x#1/3", "chunk:1/3:x", "x#3/3"] {
        // Chunked attempt first, then an attempt named like one of its chunks.
        let store = Arc::new(InMemoryCounterStore::with_max_ops(3));
        let agg = aggregator(store.clone());
        let chunked = agg.handle("x", &many_questions(3)).await.unwrap();
        assert_eq!(chunked.units_committed, 3);
        let outcome = agg.handle(lookalike, &other).await.unwrap();
        assert_eq!(outcome.units_committed, 1, "{lookalike} after x");
        assert_eq!(counters(&*store, "other").await, (1, 1));

        // And the reverse delivery order.
        let store = Arc::new(InMemoryCounterStore::with_max_ops(3));
        let agg = aggregator(store.clone());
        agg.handle(lookalike, &other).await.unwrap();
        let chunked = agg.handle("x", &many_questions(3)).await.unwrap();
        assert_eq!(chunked.units_committed, 3, "x after {lookalike}");
        for i in 0..3 {
            let expected = (1, u64::from(i % 2 == 0));
            assert_eq!(counters(&*store, &format!("q{i:03}")).await, expected);
        }
    }
}

#[tokio::test]
async fn redelivery_after_cap_shrinks_is_a_duplicate() {
    let store = Arc::new(InMemoryCounterStore::new());
    aggregator(store.clone())
        .handle("a1", &example_payload())
        .await
        .unwrap();

    let narrow = AttemptAggregator::new(
        Clock::fixed(fixed_now()),
        store.clone(),
        AggregatorConfig::default().with_max_ops(2),
    );
    let outcome = narrow.handle("a1", &example_payload()).await.unwrap();
    assert!(outcome.is_duplicate());
    assert_eq!(counters(&*store, "q1").await, (2, 1));
}

#[tokio::test]
async fn sqlite_backed_flow_is_idempotent() {
    let (storage, agg) = AttemptAggregator::sqlite(
        "sqlite:file:memdb_services_flow?mode=memory&cache=shared",
        Clock::fixed(fixed_now()),
        AggregatorConfig::default().with_max_ops(4),
    )
    .await
    .expect("open sqlite");

    agg.handle("a1", &example_payload()).await.unwrap();
    let dup = agg.handle("a1", &example_payload()).await.unwrap();
    assert!(dup.is_duplicate());

    let chunked = agg.handle("a2", &many_questions(5)).await.unwrap();
    assert_eq!(chunked.units_committed, 3);
    let dup = agg.handle("a2", &many_questions(5)).await.unwrap();
    assert!(dup.is_duplicate());

    let counters_store = &*storage.counters;
    assert_eq!(counters(counters_store, "q1").await, (2, 1));
    assert_eq!(counters(counters_store, "q2").await, (1, 1));
    assert_eq!(counters(counters_store, "q004").await, (1, 1));
}

/// File-backed database under the system temp dir, removed before use.
fn temp_db_url(name: &str) -> String {
    let path = std::env::temp_dir().join(format!("{name}-{}.db", std::process::id()));
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{suffix}", path.display()));
    }
    format!("sqlite://{}?mode=rwc", path.display())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_concurrent_deliveries_apply_each_attempt_once() {
    let (storage, agg) = AttemptAggregator::sqlite(
        &temp_db_url("quiz-stats-concurrent"),
        Clock::fixed(fixed_now()),
        AggregatorConfig::default().with_max_ops(4),
    )
    .await
    .expect("open sqlite");
    let agg = Arc::new(agg);

    // Six questions under a 4-op cap: three chunks per delivery of "dup".
    let mut dup_results: Vec<Value> = (0..5)
        .map(|i| json!({ "questionId": format!("q{i:03}"), "isCorrect": i % 2 == 0 }))
        .collect();
    dup_results.push(json!({ "questionId": "shared", "isCorrect": true }));
    let dup_payload = Arc::new(json!({ "results": dup_results }));

    let mut redeliveries = Vec::new();
    let mut distinct = Vec::new();
    for i in 0..8 {
        let dup_agg = Arc::clone(&agg);
        let payload = Arc::clone(&dup_payload);
        redeliveries.push(tokio::spawn(async move { dup_agg.handle("dup", &payload).await }));

        let solo_agg = Arc::clone(&agg);
        distinct.push(tokio::spawn(async move {
            let payload = json!({ "results": [
                { "questionId": "shared", "isCorrect": i % 2 == 0 }
            ]});
            solo_agg.handle(&format!("solo-{i}"), &payload).await
        }));
    }

    let mut dup_committed = 0;
    for handle in redeliveries {
        dup_committed += handle.await.unwrap().unwrap().units_committed;
    }
    for handle in distinct {
        assert_eq!(handle.await.unwrap().unwrap().units_committed, 1);
    }

    assert_eq!(dup_committed, 3);
    let store = &*storage.counters;
    assert_eq!(counters(store, "shared").await, (9, 5));
    assert_eq!(counters(store, "q000").await, (1, 1));
    assert_eq!(counters(store, "q004").await, (1, 1));
    assert!(store.is_processed(&done_key("dup")).await.unwrap());
}
