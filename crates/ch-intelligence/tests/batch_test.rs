//! Batch orchestration: failure isolation, pacing, bounded parallelism,
//! artifacts and the persisted summary.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ch_core::config::BackendConfig;
use ch_intelligence::batch::{
    BatchInput, BatchItem, BatchItemError, BatchOrchestrator, BatchSummary, ExecutionMode,
    ItemOutcome, ItemProcessor, SUMMARY_FILE,
};
use ch_intelligence::critique::CritiqueService;
use ch_intelligence::fanout::FanOutProcessor;
use ch_intelligence::mock::{MockBackend, MockReply};
use ch_intelligence::pool::{BackendPool, Targets};
use ch_intelligence::tournament::{
    TournamentError, TournamentOutcome, TournamentProcessor, TournamentRunner, TournamentSummary,
};
use tokio::time::Instant;

fn item(id: &str) -> BatchItem {
    BatchItem {
        id: id.into(),
        title: format!("Scene {id}"),
        outline: format!("Outline for {id}"),
        required_context: vec![],
        previous_scenes: vec![],
    }
}

fn input(ids: &[&str]) -> BatchInput {
    BatchInput {
        chapter_id: "ch1".into(),
        scenes: ids.iter().map(|id| item(id)).collect(),
    }
}

/// Fails ids starting with "fail", panics on ids starting with "panic",
/// sleeps `delay_ms` from a per-id table, and tracks concurrency.
#[derive(Default)]
struct ScriptedProcessor {
    delays: BTreeMap<String, u64>,
    starts: Mutex<Vec<(String, Instant)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProcessor {
    fn with_delay(mut self, id: &str, ms: u64) -> Self {
        self.delays.insert(id.into(), ms);
        self
    }

    fn starts(&self) -> Vec<(String, Instant)> {
        self.starts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    async fn process(
        &self,
        _chapter_id: &str,
        item: &BatchItem,
    ) -> Result<ItemOutcome, BatchItemError> {
        self.starts
            .lock()
            .unwrap()
            .push((item.id.clone(), Instant::now()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(ms) = self.delays.get(&item.id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if item.id.starts_with("fail") {
            return Err(BatchItemError::Other(format!("{} could not be generated", item.id)));
        }
        if item.id.starts_with("panic") {
            panic!("processor blew up on {}", item.id);
        }
        Ok(ItemOutcome {
            output: serde_json::json!({ "text": format!("draft of {}", item.id) }),
            cost: 0.25,
            tokens: 100,
            quality_scores: BTreeMap::from([("score".to_string(), 8.0)]),
        })
    }
}

fn read_summary(dir: &std::path::Path) -> serde_json::Value {
    let text = std::fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap();
    serde_json::from_str(&text).unwrap()
}

// ===========================================================================
// Failure isolation
// ===========================================================================

async fn run_three_with_middle_failing(mode: ExecutionMode) -> (BatchSummary, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator =
        BatchOrchestrator::new(Arc::new(ScriptedProcessor::default()), mode, dir.path());
    let summary = orchestrator
        .run(&input(&["s1", "fail-s2", "s3"]))
        .await
        .unwrap();
    (summary, dir)
}

fn assert_middle_failure(summary: &BatchSummary, dir: &std::path::Path) {
    assert_eq!(summary.metadata.total_items, 3);
    assert_eq!(summary.metadata.processed, 2);
    assert_eq!(summary.metadata.failed, 1);
    assert_eq!(summary.failed_items.len(), 1);
    assert_eq!(summary.failed_items[0].item_id, "fail-s2");
    assert!(summary.failed_items[0].error.contains("could not be generated"));

    assert!(dir.join("000-s1.json").exists());
    assert!(dir.join("002-s3.json").exists());
    assert!(!dir.join("001-fail-s2.json").exists());
    assert_eq!(summary.outputs.len(), 2);

    assert!((summary.cost.total - 0.5).abs() < 1e-9);
    assert!((summary.cost.average_per_item - 0.25).abs() < 1e-9);
    let costed: Vec<_> = summary.cost.per_item.iter().map(|c| c.item_id.as_str()).collect();
    assert_eq!(costed, vec!["s1", "s3"]);
    assert!((summary.quality.averages["score"] - 8.0).abs() < 1e-9);
    assert_eq!(summary.exit_code(), 1);

    let persisted = read_summary(dir);
    assert_eq!(persisted["metadata"]["processed"], 2);
    assert_eq!(persisted["metadata"]["failed"], 1);
    assert_eq!(persisted["failed_items"][0]["item_id"], "fail-s2");
}

#[tokio::test(start_paused = true)]
async fn sequential_batch_isolates_failed_item() {
    let (summary, dir) = run_three_with_middle_failing(ExecutionMode::Sequential {
        pacing: Duration::from_millis(10),
    })
    .await;
    assert_middle_failure(&summary, dir.path());
    let order: Vec<_> = summary.results.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(order, vec!["s1", "fail-s2", "s3"]);
}

#[tokio::test]
async fn parallel_batch_isolates_failed_item() {
    let (summary, dir) =
        run_three_with_middle_failing(ExecutionMode::Parallel { workers: 2 }).await;
    assert_middle_failure(&summary, dir.path());
}

#[tokio::test]
async fn panicking_item_is_recorded_not_propagated() {
    for mode in [
        ExecutionMode::Sequential {
            pacing: Duration::ZERO,
        },
        ExecutionMode::Parallel { workers: 3 },
    ] {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            BatchOrchestrator::new(Arc::new(ScriptedProcessor::default()), mode, dir.path());
        let summary = orchestrator
            .run(&input(&["s1", "panic-s2", "s3"]))
            .await
            .unwrap();
        assert_eq!(summary.metadata.processed, 2);
        assert_eq!(summary.metadata.failed, 1);
        assert_eq!(summary.failed_items[0].item_id, "panic-s2");
        assert!(summary.failed_items[0].error.contains("panicked"));
    }
}

#[tokio::test]
async fn all_successful_batch_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(ScriptedProcessor::default()),
        ExecutionMode::Parallel { workers: 4 },
        dir.path(),
    );
    let summary = orchestrator.run(&input(&["a", "b"])).await.unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert!(!summary.has_failures());

    let artifact: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("000-a.json")).unwrap())
            .unwrap();
    assert_eq!(artifact["chapter_id"], "ch1");
    assert_eq!(artifact["item_id"], "a");
    assert_eq!(artifact["output"]["text"], "draft of a");
}

#[tokio::test]
async fn artifacts_share_the_run_trace_id() {
    for mode in [
        ExecutionMode::Sequential {
            pacing: Duration::ZERO,
        },
        ExecutionMode::Parallel { workers: 2 },
    ] {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            BatchOrchestrator::new(Arc::new(ScriptedProcessor::default()), mode, dir.path());
        let summary = orchestrator.run(&input(&["a", "b", "c"])).await.unwrap();

        let trace_id = summary.metadata.trace_id.clone();
        assert_eq!(trace_id.len(), 32);
        for output in &summary.outputs {
            let artifact: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&output.path).unwrap()).unwrap();
            assert_eq!(artifact["trace_id"], trace_id.as_str());
        }
        assert_eq!(read_summary(dir.path())["metadata"]["trace_id"], trace_id.as_str());
    }
}

#[tokio::test]
async fn colliding_ids_keep_separate_artifacts() {
    for mode in [
        ExecutionMode::Sequential {
            pacing: Duration::ZERO,
        },
        ExecutionMode::Parallel { workers: 3 },
    ] {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator =
            BatchOrchestrator::new(Arc::new(ScriptedProcessor::default()), mode, dir.path());
        let summary = orchestrator
            .run(&input(&["scene/1", "scene_1", "scene_1"]))
            .await
            .unwrap();
        assert_eq!(summary.metadata.processed, 3);

        let mut paths: Vec<_> = summary.outputs.iter().map(|o| o.path.clone()).collect();
        paths.sort();
        paths.dedup();
        assert_eq!(paths.len(), 3);

        for output in &summary.outputs {
            let artifact: serde_json::Value =
                serde_json::from_str(&std::fs::read_to_string(&output.path).unwrap()).unwrap();
            assert_eq!(artifact["item_id"], output.item_id.as_str());
        }
        let slashed: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("000-scene_1.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(slashed["item_id"], "scene/1");

        assert_eq!(summary.cost.per_item.len(), 3);
        assert!((summary.cost.total - 0.75).abs() < 1e-9);
    }
}

#[tokio::test]
async fn empty_batch_writes_summary() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(ScriptedProcessor::default()),
        ExecutionMode::Parallel { workers: 2 },
        dir.path().join("nested"),
    );
    let summary = orchestrator.run(&input(&[])).await.unwrap();
    assert_eq!(summary.metadata.total_items, 0);
    assert!(dir.path().join("nested").join(SUMMARY_FILE).exists());
}

// ===========================================================================
// Pacing and bounded parallelism
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn sequential_mode_paces_between_items_only() {
    let dir = tempfile::tempdir().unwrap();
    let processor = Arc::new(ScriptedProcessor::default());
    let orchestrator = BatchOrchestrator::new(
        processor.clone(),
        ExecutionMode::Sequential {
            pacing: Duration::from_secs(2),
        },
        dir.path(),
    );

    orchestrator.run(&input(&["s1", "s2", "s3"])).await.unwrap();
    let finished = Instant::now();

    let starts = processor.starts();
    let ids: Vec<_> = starts.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(ids, vec!["s1", "s2", "s3"]);
    assert!(starts[1].1 - starts[0].1 >= Duration::from_secs(2));
    assert!(starts[2].1 - starts[1].1 >= Duration::from_secs(2));
    // No pause after the final item.
    assert!(finished - starts[2].1 < Duration::from_secs(2));
    assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn parallel_mode_bounds_in_flight_items() {
    let dir = tempfile::tempdir().unwrap();
    let mut processor = ScriptedProcessor::default();
    for id in ["a", "b", "c", "d", "e", "f"] {
        processor = processor.with_delay(id, 100);
    }
    let processor = Arc::new(processor);
    let orchestrator = BatchOrchestrator::new(
        processor.clone(),
        ExecutionMode::Parallel { workers: 2 },
        dir.path(),
    );

    let summary = orchestrator
        .run(&input(&["a", "b", "c", "d", "e", "f"]))
        .await
        .unwrap();
    assert_eq!(summary.metadata.processed, 6);
    assert_eq!(processor.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn parallel_results_arrive_in_completion_order() {
    let dir = tempfile::tempdir().unwrap();
    let processor = ScriptedProcessor::default()
        .with_delay("slow", 500)
        .with_delay("fast", 50);
    let orchestrator = BatchOrchestrator::new(
        Arc::new(processor),
        ExecutionMode::Parallel { workers: 2 },
        dir.path(),
    );

    let summary = orchestrator.run(&input(&["slow", "fast"])).await.unwrap();
    let order: Vec<_> = summary.results.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(order, vec!["fast", "slow"]);
}

// ===========================================================================
// Input loading
// ===========================================================================

#[tokio::test]
async fn load_input_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chapter.json");
    std::fs::write(
        &path,
        r#"{
            "chapter_id": "ch7",
            "scenes": [
                {"id": "s1", "title": "Dawn", "outline": "Mara wakes",
                 "required_context": ["people/mara.md"], "previous_scenes": []},
                {"id": "s2", "outline": "The harbour", "previous_scenes": ["s1"]}
            ]
        }"#,
    )
    .unwrap();

    let input = BatchInput::load(&path).await.unwrap();
    assert_eq!(input.chapter_id, "ch7");
    assert_eq!(input.scenes.len(), 2);
    assert_eq!(input.scenes[0].required_context, vec!["people/mara.md"]);
    assert_eq!(input.scenes[1].previous_scenes, vec!["s1"]);
}

#[tokio::test]
async fn load_input_errors() {
    assert!(BatchInput::load("/no/such/chapter.json").await.is_err());

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "{not json").unwrap();
    assert!(BatchInput::load(&path).await.is_err());
}

// ===========================================================================
// Fan-out and tournament processors
// ===========================================================================

fn mock_config(name: &str) -> BackendConfig {
    BackendConfig::new(name, format!("mock-{name}")).with_retry(1, Duration::from_millis(1))
}

#[tokio::test]
async fn fanout_processor_end_to_end() {
    let pool = Arc::new(BackendPool::new());
    pool.register(Arc::new(
        MockBackend::new(mock_config("A"))
            .with_default_reply(MockReply::new("variant A").with_tokens(60, 40).with_cost(0.01)),
    ))
    .await
    .unwrap();
    pool.register(Arc::new(MockBackend::new(mock_config("B")).failing("quota")))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let processor = FanOutProcessor::new(Arc::clone(&pool)).with_targets(Targets::named(["A", "B"]));
    let orchestrator = BatchOrchestrator::new(
        Arc::new(processor),
        ExecutionMode::Sequential {
            pacing: Duration::ZERO,
        },
        dir.path(),
    );

    let summary = orchestrator.run(&input(&["s1"])).await.unwrap();
    assert_eq!(summary.metadata.processed, 1);
    assert!((summary.cost.total - 0.01).abs() < 1e-9);
    assert_eq!(summary.results[0].tokens, 100);

    let artifact: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("000-s1.json")).unwrap())
            .unwrap();
    assert_eq!(artifact["output"]["variants"][0]["backend"], "A");
    assert_eq!(artifact["output"]["failures"][0]["backend"], "B");
}

#[tokio::test]
async fn fanout_item_fails_when_no_backend_succeeds() {
    let pool = Arc::new(BackendPool::new());
    pool.register(Arc::new(MockBackend::new(mock_config("B")).failing("quota")))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(FanOutProcessor::new(pool)),
        ExecutionMode::Parallel { workers: 1 },
        dir.path(),
    );
    let summary = orchestrator.run(&input(&["s1"])).await.unwrap();
    assert_eq!(summary.metadata.failed, 1);
    assert!(summary.failed_items[0].error.contains("no backend produced output"));
}

#[tokio::test]
async fn fanout_with_critique_adds_critique_cost() {
    let pool = Arc::new(BackendPool::new());
    for name in ["A", "B"] {
        pool.register(Arc::new(
            MockBackend::new(mock_config(name))
                .with_default_reply(MockReply::new(format!("draft {name}")).with_cost(0.01)),
        ))
        .await
        .unwrap();
    }
    pool.register(Arc::new(
        MockBackend::new(mock_config("critic"))
            .with_default_reply(MockReply::new("critique").with_cost(0.002)),
    ))
    .await
    .unwrap();

    let critique = Arc::new(CritiqueService::new(
        Arc::clone(&pool),
        "critic",
        vec!["pacing".into()],
    ));
    let processor = FanOutProcessor::new(Arc::clone(&pool))
        .with_targets(Targets::named(["A", "B"]))
        .with_critique(critique);

    let dir = tempfile::tempdir().unwrap();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(processor),
        ExecutionMode::Sequential {
            pacing: Duration::ZERO,
        },
        dir.path(),
    );
    let summary = orchestrator.run(&input(&["s1"])).await.unwrap();

    // Two drafts, two critiques and one comparative call.
    assert!((summary.cost.total - (0.02 + 3.0 * 0.002)).abs() < 1e-9);
    let artifact: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(dir.path().join("000-s1.json")).unwrap())
            .unwrap();
    assert_eq!(artifact["output"]["critique"]["comparative"]["status"], "completed");
}

struct StubRunner;

#[async_trait]
impl TournamentRunner for StubRunner {
    async fn run_tournament(
        &self,
        _chapter_id: &str,
        item: &BatchItem,
    ) -> Result<TournamentOutcome, TournamentError> {
        if item.id == "s2" {
            return Err(TournamentError::Failed("judge unavailable".into()));
        }
        Ok(TournamentOutcome {
            summary: TournamentSummary {
                highest_scoring: "A".into(),
                highest_score: if item.id == "s1" { 8.0 } else { 6.0 },
                hybrid_score: Some(9.0),
                total_cost: 0.1,
                total_tokens: 1000,
            },
            details: serde_json::Map::new(),
        })
    }
}

#[tokio::test]
async fn tournament_processor_feeds_quality_summary() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = BatchOrchestrator::new(
        Arc::new(TournamentProcessor::new(Arc::new(StubRunner))),
        ExecutionMode::Parallel { workers: 2 },
        dir.path(),
    );
    let summary = orchestrator.run(&input(&["s1", "s2", "s3"])).await.unwrap();

    assert_eq!(summary.metadata.processed, 2);
    assert_eq!(summary.failed_items[0].item_id, "s2");
    assert!(summary.failed_items[0].error.contains("judge unavailable"));
    assert!((summary.quality.averages["highest_score"] - 7.0).abs() < 1e-9);
    assert!((summary.quality.averages["hybrid_score"] - 9.0).abs() < 1e-9);
    assert!((summary.cost.total - 0.2).abs() < 1e-9);
}
