//! Integration test: autonomous research scheduler — task sources, growth
//! bounds, and failure handling.
//!
//! Verifies that:
//! 1. The fifth semantic connection on a concept queues a connection-growth
//!    deepening pass, and the first four do not.
//! 2. Duplicate proposals for the same work merge, keeping the highest
//!    priority and any approval.
//! 3. The per-node daily deepening cap defers a third pass to the next UTC
//!    midnight, and depth never decreases across the passes that did run.
//! 4. Transient backend failures defer with exponential backoff and demote
//!    priority after repeated failures.
//! 5. Supervised mode sits on unapproved tasks until they are approved.
//! 6. An open question is answered exactly once and never re-proposed.
//! 7. A dangling reference materializes as a stub note, once.
//! 8. An isolated node gets wired into the graph by an exploration pass.
//! 9. Queued tasks whose condition resolved on its own are discarded.
//! 10. A paused scheduler skips cycles until resumed.
//! 11. The scheduler loop serves control requests end to end and stops
//!     when the last handle drops.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use mnema_core::{
    create_similarity_search, find_sparse_regions, fingerprint, init_scheduler_loop, now_ms,
    ActivityTracker, AutonomousScheduler, ControlMessage, DeepeningTrigger, EdgeKind,
    GenerationService, GraphStore, MemoryService, MnemaConfig, MockGeneration, NodeKind,
    NodePayload, ResearchTask, RetrievalEngine, SchedulerHandle, TaskKind, TaskQueue, TaskStatus,
    REFERENCE_CATEGORY,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn observation(content: &str) -> NodePayload {
    NodePayload::Observation {
        content: content.to_string(),
        category: "daily".to_string(),
        source_refs: vec![],
    }
}

fn opinion(content: &str) -> NodePayload {
    NodePayload::Opinion {
        content: content.to_string(),
        stance: "supports".to_string(),
        conviction: 0.8,
    }
}

fn triggered_config() -> MnemaConfig {
    let mut config = MnemaConfig::default();
    config.scheduler.mode = "triggered".to_string();
    config
}

/// Store, queue, and scheduler wired the way the daemon wires them, minus the
/// control loop. The tempdir rides along so the store outlives the test body.
fn build_stack(
    config: &MnemaConfig,
    generation: Arc<dyn GenerationService>,
) -> (
    tempfile::TempDir,
    Arc<GraphStore>,
    Arc<TaskQueue>,
    AutonomousScheduler,
) {
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = Arc::new(GraphStore::open_path(dir.path()).expect("open store"));
    let queue = Arc::new(TaskQueue::new());
    let search = create_similarity_search(&config.similarity, store.clone());
    let retrieval = Arc::new(RetrievalEngine::new(
        store.clone(),
        search.clone(),
        config.retrieval.clone(),
    ));
    let scheduler = AutonomousScheduler::new(
        store.clone(),
        queue.clone(),
        retrieval,
        search,
        generation,
        ActivityTracker::new(),
        config,
    );
    (dir, store, queue, scheduler)
}

/// Always-failing backend for exercising deferral and demotion.
struct FailingGeneration;

#[async_trait::async_trait]
impl GenerationService for FailingGeneration {
    async fn generate(
        &self,
        _system: &str,
        _prompt: &str,
    ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
        Err("backend offline".into())
    }

    fn describe(&self) -> String {
        "failing".to_string()
    }
}

// ---------------------------------------------------------------------------
// Task sources
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connection_growth_fires_at_the_threshold() {
    let config = triggered_config();
    let dir = tempfile::tempdir().expect("create tempdir");
    let store = Arc::new(GraphStore::open_path(dir.path()).expect("open store"));
    let queue = Arc::new(TaskQueue::new());
    let search = create_similarity_search(&config.similarity, store.clone());
    let retrieval = Arc::new(RetrievalEngine::new(
        store.clone(),
        search,
        config.retrieval.clone(),
    ));
    let service = MemoryService::new(
        store.clone(),
        queue.clone(),
        retrieval,
        ActivityTracker::new(),
        &config,
    );

    let concept = service
        .append_opinion(
            "Consistency beats intensity for building any lasting habit.",
            "supports",
            0.8,
        )
        .expect("append opinion");
    let evidence = [
        "Ran before sunrise on Monday and felt sharper all day.",
        "Skipped the evening scroll and read twenty pages instead.",
        "Prepped lunches on Sunday and the week ran smoother.",
        "Stretching for ten minutes undid most of the desk stiffness.",
        "Went to bed at the same hour five nights running.",
    ];

    for (i, content) in evidence.iter().enumerate() {
        let obs = service
            .append_observation(content, "habit", vec![])
            .expect("append observation");
        service
            .add_edge(obs, concept, EdgeKind::Supports, serde_json::json!({}))
            .expect("add edge");

        let deepenings: Vec<ResearchTask> = queue
            .live_tasks()
            .into_iter()
            .filter(|t| t.kind == TaskKind::Deepening)
            .collect();
        if i < 4 {
            assert!(
                deepenings.is_empty(),
                "no deepening should be proposed after {} connections",
                i + 1
            );
        } else {
            assert_eq!(deepenings.len(), 1, "fifth connection proposes exactly one");
            let task = &deepenings[0];
            assert_eq!(task.target_id, Some(concept));
            assert_eq!(task.trigger, Some(DeepeningTrigger::ConnectionGrowth));
            assert!((task.priority - 0.7).abs() < f32::EPSILON);
        }
    }
}

#[test]
fn duplicate_proposals_merge_at_max_priority() {
    let queue = TaskQueue::new();
    let node = Uuid::new_v4();

    let (first_id, inserted) =
        queue.submit(ResearchTask::deepening(node, DeepeningTrigger::ConnectionGrowth));
    assert!(inserted, "first proposal lands as a new entry");

    let (second_id, inserted) = queue.submit(
        ResearchTask::deepening(node, DeepeningTrigger::Explicit).with_approval(),
    );
    assert!(!inserted, "same target and kind merges instead of inserting");
    assert_eq!(first_id, second_id, "submit reports the surviving entry");
    assert_eq!(queue.len(), 1);

    let merged = queue.get(first_id).expect("merged task present");
    assert!(
        (merged.priority - 0.9).abs() < f32::EPSILON,
        "merge keeps the higher priority, got {}",
        merged.priority
    );
    assert!(merged.approved, "approval survives the merge");
    assert_eq!(
        merged.trigger,
        Some(DeepeningTrigger::ConnectionGrowth),
        "an already-set trigger is not overwritten"
    );
}

#[tokio::test]
async fn open_questions_get_answered_once() {
    let config = triggered_config();
    let (_dir, store, _queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let question = "What would make mornings easier to start?";
    store
        .add_node(NodePayload::SoloReflection {
            content: format!("Slept badly again. {}", question),
            focus: None,
        })
        .expect("add reflection");

    let report = scheduler.run_cycle().await.expect("first cycle");
    assert_eq!(report.refreshed, 1, "the question is proposed once");
    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].outcome, "completed");

    let reflections = store
        .nodes_of_kind(NodeKind::SoloReflection)
        .expect("list reflections");
    assert_eq!(reflections.len(), 2, "the answer lands as its own reflection");
    let answer = reflections
        .iter()
        .find(|n| {
            matches!(
                &n.payload,
                NodePayload::SoloReflection { focus: Some(f), .. } if f == question
            )
        })
        .expect("answer carries the question as its focus");
    assert!(!answer.content_text().is_empty());
    assert!(
        store
            .is_question_answered(&fingerprint(question))
            .expect("check answered"),
        "the question fingerprint is remembered"
    );

    let report = scheduler.run_cycle().await.expect("second cycle");
    assert_eq!(report.refreshed, 0, "an answered question is not re-proposed");
    assert!(report.executed.is_empty());
}

#[tokio::test]
async fn dangling_references_materialize_as_stubs() {
    let config = triggered_config();
    let (_dir, store, _queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let referrer = store
        .add_node(NodePayload::Observation {
            content: "Spent the evening sanding drawer fronts at the workbench.".to_string(),
            category: "shop".to_string(),
            source_refs: vec!["the maple workbench".to_string()],
        })
        .expect("add observation");

    let report = scheduler.run_cycle().await.expect("first cycle");
    assert_eq!(report.refreshed, 1, "the dangling reference is proposed once");
    assert_eq!(report.executed.len(), 1);

    let stubs = store
        .find_nodes(Some(NodeKind::Observation), |n| {
            matches!(
                &n.payload,
                NodePayload::Observation { category, .. } if category == REFERENCE_CATEGORY
            )
        })
        .expect("find stubs");
    assert_eq!(stubs.len(), 1, "the reference materialized as one stub note");
    assert_eq!(
        store.edge_count().expect("edge count"),
        1,
        "the stub is tied back to its referrer"
    );
    assert!(
        store.get_node(&referrer).expect("get referrer").is_some(),
        "the referrer itself is untouched"
    );

    let report = scheduler.run_cycle().await.expect("second cycle");
    assert_eq!(report.refreshed, 0, "a resolved reference is not re-proposed");
    let stubs = store
        .find_nodes(Some(NodeKind::Observation), |n| {
            matches!(
                &n.payload,
                NodePayload::Observation { category, .. } if category == REFERENCE_CATEGORY
            )
        })
        .expect("find stubs again");
    assert_eq!(stubs.len(), 1, "no second stub appears");
}

#[tokio::test]
async fn sparse_nodes_get_connected() {
    let config = triggered_config();
    let (_dir, store, _queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let a = store
        .add_node(observation("Long runs build the aerobic base for race season."))
        .expect("add a");
    let b = store
        .add_node(observation("Tempo runs sharpen the same aerobic base before race day."))
        .expect("add b");
    let c = store
        .add_node(observation("Recovery weeks protect the aerobic base from overuse."))
        .expect("add c");
    let isolated = store
        .add_node(observation("Missed the long run this week because of travel."))
        .expect("add isolated");
    for (from, to) in [(a, b), (b, c), (c, a)] {
        store
            .add_edge(from, to, EdgeKind::RelatesTo, serde_json::json!({}))
            .expect("add triangle edge");
    }

    let report = scheduler.run_cycle().await.expect("exploration cycle");
    assert_eq!(report.executed.len(), 1);
    assert_eq!(
        report.executed[0].edges_formed, 3,
        "the isolated node is linked to each lexical neighbor"
    );

    let snapshot = store.snapshot().expect("snapshot");
    assert!(
        snapshot.degree(&isolated) >= 3,
        "the formerly isolated node is now connected"
    );
    assert!(
        find_sparse_regions(&snapshot).is_empty(),
        "no region reads as sparse after the pass"
    );

    let report = scheduler.run_cycle().await.expect("quiet cycle");
    assert!(report.executed.is_empty(), "nothing left to explore");
}

#[tokio::test]
async fn satisfied_conditions_discard_queued_tasks() {
    let config = triggered_config();
    let (_dir, store, queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let referrer = store
        .add_node(NodePayload::Observation {
            content: "Ana talked me through the draft over coffee.".to_string(),
            category: "social".to_string(),
            source_refs: vec!["Ana".to_string()],
        })
        .expect("add observation");
    queue.submit(ResearchTask::resolve_reference(referrer, "Ana"));

    // The reference resolves before the scheduler ever gets to it.
    store
        .add_node(NodePayload::Participant {
            name: "Ana".to_string(),
            relationship: "friend".to_string(),
            notes: "Reads every draft first.".to_string(),
        })
        .expect("add participant");

    let report = scheduler.run_cycle().await.expect("cycle");
    assert_eq!(report.discarded, 1, "the stale proposal is dropped");
    assert!(report.executed.is_empty());
    assert!(queue.is_empty(), "nothing lingers in the queue");
}

// ---------------------------------------------------------------------------
// Growth bounds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn daily_deepening_cap_defers_the_third_pass() {
    let mut config = triggered_config();
    config.scheduler.max_deepenings_per_node_per_day = 2;
    config.scheduler.min_resynthesis_interval_hours = 0;
    let (_dir, store, queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let concept = store
        .add_node(opinion(
            "Walking meetings surface better ideas than conference rooms.",
        ))
        .expect("add concept");

    for pass in 1..=2u32 {
        queue.submit(ResearchTask::deepening(concept, DeepeningTrigger::Explicit));
        let report = scheduler.run_cycle().await.expect("deepening cycle");
        assert_eq!(report.executed.len(), 1, "pass {} executes", pass);
        // Keep the next request strictly after this pass's synthesis stamp.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let evolution = store.get_evolution(concept).expect("evolution");
    assert_eq!(evolution.len(), 3, "two passes produced two successors");
    let head = evolution.last().expect("chain head");
    let maturity = head.maturity.as_ref().expect("concept carries maturity");
    assert_eq!(maturity.level, 2);
    assert_eq!(maturity.synthesis_history.len(), 2);
    assert_eq!(maturity.connections_added_since_last_synthesis, 0);

    let earlier = evolution[1]
        .maturity
        .as_ref()
        .expect("prior version carries maturity");
    assert!(
        maturity.depth_score >= earlier.depth_score,
        "depth never decreases: {} then {}",
        earlier.depth_score,
        maturity.depth_score
    );

    let (third_id, _) =
        queue.submit(ResearchTask::deepening(concept, DeepeningTrigger::Explicit));
    let before = now_ms();
    let report = scheduler.run_cycle().await.expect("capped cycle");
    assert!(report.executed.is_empty(), "the capped pass does not run");
    assert_eq!(report.deferred_for_bounds, 1);

    let deferred = queue.get(third_id).expect("deferred task present");
    assert_eq!(deferred.status, TaskStatus::Deferred);
    assert!(deferred.next_eligible_ms > before, "deferred into the future");
    assert_eq!(
        deferred.next_eligible_ms % 86_400_000,
        0,
        "deferred exactly to the next UTC midnight"
    );
    assert_eq!(
        store.get_evolution(concept).expect("evolution").len(),
        3,
        "the chain did not grow past the cap"
    );
}

// ---------------------------------------------------------------------------
// Failure handling and control
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_failures_back_off_and_demote() {
    let mut config = triggered_config();
    config.scheduler.backoff_base_secs = 60;
    config.scheduler.backoff_max_secs = 3600;
    config.scheduler.demote_after_failures = 2;
    let (_dir, store, queue, scheduler) = build_stack(&config, Arc::new(FailingGeneration));

    let concept = store
        .add_node(opinion("Short feedback loops keep side projects alive."))
        .expect("add concept");
    let (task_id, _) =
        queue.submit(ResearchTask::deepening(concept, DeepeningTrigger::Explicit));

    let before = now_ms();
    let report = scheduler.run_cycle().await.expect("failing cycle");
    let after = now_ms();
    assert!(report.executed.is_empty(), "a failing task never completes");

    let task = queue.get(task_id).expect("task survives the failure");
    assert_eq!(task.status, TaskStatus::Deferred);
    assert_eq!(task.consecutive_failures, 1);
    assert!(
        (task.priority - 0.9).abs() < 0.01,
        "one failure does not demote yet, got {}",
        task.priority
    );
    assert!(task.next_eligible_ms >= before + 60_000, "base backoff applies");
    assert!(task.next_eligible_ms <= after + 60_000);

    // Pull the task forward so the next cycle retries it immediately.
    assert!(queue.update(task_id, |t| t.next_eligible_ms = 0));

    let before = now_ms();
    let report = scheduler.run_cycle().await.expect("second failing cycle");
    let after = now_ms();
    assert_eq!(report.released, 1, "the deferred task was released for retry");
    assert!(report.executed.is_empty());

    let task = queue.get(task_id).expect("task survives again");
    assert_eq!(task.consecutive_failures, 2);
    assert!(
        (task.priority - 0.45).abs() < 0.01,
        "the second failure halves priority, got {}",
        task.priority
    );
    assert!(task.next_eligible_ms >= before + 120_000, "backoff doubled");
    assert!(task.next_eligible_ms <= after + 120_000);

    assert_eq!(
        store.get_evolution(concept).expect("evolution").len(),
        1,
        "no synthesis happened while the backend was down"
    );
}

#[tokio::test]
async fn supervised_mode_waits_for_approval() {
    let mut config = triggered_config();
    config.scheduler.mode = "supervised".to_string();
    let (_dir, store, queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));

    let concept = store
        .add_node(opinion("Reading aloud exposes clumsy sentences instantly."))
        .expect("add concept");
    let (task_id, _) =
        queue.submit(ResearchTask::deepening(concept, DeepeningTrigger::Explicit));

    let report = scheduler.run_cycle().await.expect("unapproved cycle");
    assert!(report.executed.is_empty(), "unapproved work stays put");
    assert_eq!(
        queue.get(task_id).expect("task still queued").status,
        TaskStatus::Queued
    );
    assert_eq!(store.get_evolution(concept).expect("evolution").len(), 1);

    assert!(queue.approve(task_id));
    let report = scheduler.run_cycle().await.expect("approved cycle");
    assert_eq!(report.executed.len(), 1, "approval releases the task");
    assert_eq!(store.get_evolution(concept).expect("evolution").len(), 2);
}

#[tokio::test]
async fn pause_halts_cycles_until_resume() {
    let config = triggered_config();
    let (_dir, store, queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));
    let mut pulses = scheduler.subscribe();

    let concept = store
        .add_node(opinion("Small diffs get reviewed the same day they land."))
        .expect("add concept");
    let (task_id, _) =
        queue.submit(ResearchTask::deepening(concept, DeepeningTrigger::Explicit));

    scheduler.apply_control(ControlMessage::Pause).await;
    let report = scheduler.run_cycle().await.expect("paused cycle");
    assert!(report.executed.is_empty(), "a paused scheduler does nothing");
    assert_eq!(
        queue.get(task_id).expect("task untouched").status,
        TaskStatus::Queued
    );

    let mut saw_paused = false;
    while let Ok(line) = pulses.try_recv() {
        if line.contains("paused") {
            saw_paused = true;
        }
    }
    assert!(saw_paused, "the activity stream reports the skipped cycle");

    scheduler.apply_control(ControlMessage::Resume).await;
    let report = scheduler.run_cycle().await.expect("resumed cycle");
    assert_eq!(report.executed.len(), 1, "resume picks the work back up");
    assert_eq!(store.get_evolution(concept).expect("evolution").len(), 2);
}

#[tokio::test]
async fn control_loop_serves_requests_end_to_end() {
    let config = triggered_config();
    let (_dir, store, _queue, scheduler) =
        build_stack(&config, Arc::new(MockGeneration::default()));
    let scheduler = Arc::new(scheduler);

    let concept = store
        .add_node(opinion("Walking meetings surface disagreements earlier."))
        .expect("add concept");

    let (handle, control_rx) = SchedulerHandle::channel();
    let loop_handle = init_scheduler_loop(scheduler.clone(), control_rx);

    // The loop drains messages in order: the deepening request lands in the
    // queue before the triggered cycle runs, and the snapshot answers after.
    assert!(handle.request_deepening(concept).await);
    assert!(handle.trigger_cycle().await);
    let snap = handle
        .queue_snapshot()
        .await
        .expect("loop answers the snapshot request");
    assert_eq!(snap.total, 1);
    assert_eq!(snap.counts.completed, 1, "the requested pass ran");
    assert_eq!(store.get_evolution(concept).expect("evolution").len(), 2);

    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), loop_handle)
        .await
        .expect("loop stops once the last handle drops")
        .expect("loop task exits cleanly");
}
