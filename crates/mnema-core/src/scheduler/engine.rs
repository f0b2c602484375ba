//! Autonomous research scheduler.
//!
//! Runs cycles against the graph: refresh task sources, discard proposals
//! whose condition resolved itself, pick the best feasible task, execute it
//! under a timeout, and report. Growth bounds defer work instead of dropping
//! it, so a bounded day never loses a proposal.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::config::{MnemaConfig, SchedulerConfig};
use crate::error::{MnemaError, MnemaResult};
use crate::generation::GenerationService;
use crate::graph::{
    now_ms, rfc3339_of_ms, EdgeKind, EdgeSpec, GraphStore, NodePayload, REFERENCE_CATEGORY,
};
use crate::maturity::{
    validate_candidate, DeepeningTrigger, MaturityTracker, ResynthesisEngine,
};
use crate::retrieval::{RetrievalEngine, RetrievalSeed, SimilaritySearch};

use super::priority::PriorityEngine;
use super::queue::{QueueSnapshot, TaskQueue};
use super::report::{CycleReport, TaskReport};
use super::sources;
use super::task::{fingerprint, ResearchTask, TaskKind, TaskStatus};

const STUB_SYSTEM_PROMPT: &str = "You maintain a personal memory graph. Write a short \
    factual note (2-4 sentences) capturing what is known about a referenced entity from \
    the surrounding material. Plain prose, no headers, no speculation beyond the material.";

const ANSWER_SYSTEM_PROMPT: &str = "You maintain a personal memory graph. Answer the \
    question using only the connected material provided. Write 2-5 sentences of plain \
    prose. If the material cannot settle the question, say what is missing.";

const QUESTION_REGION_LIMIT: usize = 2;
const EXPLORE_EDGE_LIMIT: usize = 3;
const EXPLORE_SEARCH_LIMIT: usize = 6;
const PRUNE_KEEP_MS: i64 = 86_400_000;
const SNAPSHOT_PENDING_LIMIT: usize = 50;

// ---------------------------------------------------------------------------
// Modes and activity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerMode {
    /// Cycle whenever writes have been quiet past the threshold.
    Continuous,
    /// Cycle on every interval tick, executing up to a batch of tasks.
    Batched,
    /// Cycle only on an explicit trigger.
    Triggered,
    /// Cycle on the interval but execute only approved tasks.
    Supervised,
}

impl SchedulerMode {
    pub fn label(&self) -> &'static str {
        match self {
            SchedulerMode::Continuous => "continuous",
            SchedulerMode::Batched => "batched",
            SchedulerMode::Triggered => "triggered",
            SchedulerMode::Supervised => "supervised",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::all().into_iter().find(|m| m.label() == label)
    }

    pub fn all() -> [SchedulerMode; 4] {
        [
            SchedulerMode::Continuous,
            SchedulerMode::Batched,
            SchedulerMode::Triggered,
            SchedulerMode::Supervised,
        ]
    }
}

/// Tracks the last foreground write so continuous mode can wait for quiet.
/// Scheduler-originated writes never touch this; otherwise background work
/// would postpone itself forever.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last_write_ms: Arc<AtomicI64>,
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_write_ms: Arc::new(AtomicI64::new(now_ms())),
        }
    }

    pub fn touch(&self) {
        self.last_write_ms.store(now_ms(), Ordering::Release);
    }

    pub fn quiet_duration(&self) -> Duration {
        let last = self.last_write_ms.load(Ordering::Acquire);
        Duration::from_millis(now_ms().saturating_sub(last).max(0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Pulses and control
// ---------------------------------------------------------------------------

/// One line of the scheduler's activity stream, pushed to subscribers so a
/// front-end can surface background work as it happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerPulse {
    pub phase: String,
    pub cycle: u64,
    #[serde(default)]
    pub target: Option<String>,
    pub details: String,
    pub timestamp: String,
}

impl SchedulerPulse {
    pub fn to_stream_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug)]
pub enum ControlMessage {
    SetMode(SchedulerMode),
    TriggerCycle,
    Snapshot {
        respond_to: oneshot::Sender<QueueSnapshot>,
    },
    Pause,
    Resume,
    ApproveTask {
        id: Uuid,
    },
    RequestDeepening {
        node_id: Uuid,
    },
    SetActiveContext {
        context: Option<String>,
    },
}

/// Cheap cloneable handle for steering the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl SchedulerHandle {
    pub fn channel() -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }

    pub async fn set_mode(&self, mode: SchedulerMode) -> bool {
        self.tx.send(ControlMessage::SetMode(mode)).await.is_ok()
    }

    pub async fn trigger_cycle(&self) -> bool {
        self.tx.send(ControlMessage::TriggerCycle).await.is_ok()
    }

    pub async fn pause(&self) -> bool {
        self.tx.send(ControlMessage::Pause).await.is_ok()
    }

    pub async fn resume(&self) -> bool {
        self.tx.send(ControlMessage::Resume).await.is_ok()
    }

    pub async fn approve_task(&self, id: Uuid) -> bool {
        self.tx.send(ControlMessage::ApproveTask { id }).await.is_ok()
    }

    pub async fn request_deepening(&self, node_id: Uuid) -> bool {
        self.tx
            .send(ControlMessage::RequestDeepening { node_id })
            .await
            .is_ok()
    }

    pub async fn set_active_context(&self, context: Option<String>) -> bool {
        self.tx
            .send(ControlMessage::SetActiveContext { context })
            .await
            .is_ok()
    }

    pub async fn queue_snapshot(&self) -> Option<QueueSnapshot> {
        let (respond_to, rx) = oneshot::channel();
        if self
            .tx
            .send(ControlMessage::Snapshot { respond_to })
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct AutonomousScheduler {
    store: Arc<GraphStore>,
    queue: Arc<TaskQueue>,
    retrieval: Arc<RetrievalEngine>,
    search: Arc<dyn SimilaritySearch>,
    generation: Arc<dyn GenerationService>,
    tracker: MaturityTracker,
    resynthesis: Arc<ResynthesisEngine>,
    priority: PriorityEngine,
    activity: ActivityTracker,
    config: SchedulerConfig,
    mode: RwLock<SchedulerMode>,
    paused: AtomicBool,
    cycle_count: AtomicU64,
    nodes_created_this_cycle: AtomicU32,
    active_context: RwLock<Option<String>>,
    pulse_tx: broadcast::Sender<String>,
}

impl AutonomousScheduler {
    pub fn new(
        store: Arc<GraphStore>,
        queue: Arc<TaskQueue>,
        retrieval: Arc<RetrievalEngine>,
        search: Arc<dyn SimilaritySearch>,
        generation: Arc<dyn GenerationService>,
        activity: ActivityTracker,
        config: &MnemaConfig,
    ) -> Self {
        let resynthesis = Arc::new(ResynthesisEngine::new(
            store.clone(),
            retrieval.clone(),
            generation.clone(),
            config.maturity.clone(),
            config.scheduler.task_timeout(),
        ));
        let mode = SchedulerMode::from_label(&config.scheduler.mode)
            .unwrap_or(SchedulerMode::Triggered);
        let (pulse_tx, _) = broadcast::channel(64);
        Self {
            store,
            queue,
            retrieval,
            search,
            generation,
            tracker: MaturityTracker::new(config.maturity.clone()),
            resynthesis,
            priority: PriorityEngine::new(config.scheduler.priority_weights.clone()),
            activity,
            config: config.scheduler.clone(),
            mode: RwLock::new(mode),
            paused: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            nodes_created_this_cycle: AtomicU32::new(0),
            active_context: RwLock::new(None),
            pulse_tx,
        }
    }

    pub fn mode(&self) -> SchedulerMode {
        *self.mode.read().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_mode(&self, mode: SchedulerMode) {
        *self.mode.write().unwrap_or_else(|p| p.into_inner()) = mode;
        tracing::info!(
            target: "mnema::scheduler",
            mode = mode.label(),
            "SET_MODE scheduler mode changed"
        );
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn cycles_run(&self) -> u64 {
        self.cycle_count.load(Ordering::Acquire)
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Subscribe to the pulse stream. Each line is one serialized
    /// [`SchedulerPulse`].
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.pulse_tx.subscribe()
    }

    pub fn set_active_context(&self, context: Option<String>) {
        *self
            .active_context
            .write()
            .unwrap_or_else(|p| p.into_inner()) = context;
    }

    fn active_context(&self) -> Option<String> {
        self.active_context
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn pulse(&self, phase: &str, target: Option<String>, details: impl Into<String>) {
        let pulse = SchedulerPulse {
            phase: phase.to_string(),
            cycle: self.cycles_run(),
            target,
            details: details.into(),
            timestamp: rfc3339_of_ms(now_ms()),
        };
        let _ = self.pulse_tx.send(pulse.to_stream_line());
    }

    // -- cycle ---------------------------------------------------------------

    /// Run one full cycle: release, refresh, discard, select, execute,
    /// report. Task-level failures defer the task and never abort the cycle.
    pub async fn run_cycle(&self) -> MnemaResult<CycleReport> {
        let mode = self.mode();
        if self.is_paused() {
            self.pulse("paused", None, "cycle skipped while paused");
            return Ok(CycleReport::empty(self.cycles_run(), mode.label()));
        }

        let cycle = self.cycle_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.nodes_created_this_cycle.store(0, Ordering::Release);
        let started = now_ms();
        let mut report = CycleReport::empty(cycle, mode.label());
        self.pulse("cycle_start", None, format!("mode {}", mode.label()));

        report.released = self.queue.release_due(started);
        report.refreshed = self.refresh_sources()?;
        report.discarded = self.discard_satisfied()?;

        let max_tasks = if mode == SchedulerMode::Batched {
            self.config.batch_size.max(1)
        } else {
            1
        };
        let supervised = mode == SchedulerMode::Supervised;
        let budget_ms = self.config.cycle_time_budget_ms();

        while report.executed.len() < max_tasks {
            let now = now_ms();
            let remaining_ms = budget_ms - (now - started);
            if remaining_ms <= 0 {
                break;
            }
            let Some(task) = self.select_task(now, remaining_ms, supervised)? else {
                break;
            };

            if let Some((until_ms, reason)) = self.growth_deferral(&task, now)? {
                self.queue.defer(task.id, until_ms);
                report.deferred_for_bounds += 1;
                self.pulse(
                    "bound_deferral",
                    Some(task.description.clone()),
                    format!("{}, eligible again at {}", reason, rfc3339_of_ms(until_ms)),
                );
                tracing::info!(
                    target: "mnema::scheduler",
                    task = %task.id,
                    kind = task.kind.label(),
                    reason = %reason,
                    "DEFER growth bound reached"
                );
                continue;
            }

            self.queue.mark_running(task.id);
            self.pulse("task_start", Some(task.description.clone()), task.kind.label());
            let task_started = now_ms();
            let outcome = tokio::time::timeout(self.config.task_timeout(), self.dispatch(&task))
                .await
                .unwrap_or(Err(MnemaError::Timeout {
                    secs: self.config.task_timeout_secs,
                }));

            match outcome {
                Ok((mut task_report, follow_ups)) => {
                    self.queue.mark_completed(task.id);
                    for follow_up in follow_ups {
                        task_report.follow_ups.push(follow_up.description.clone());
                        self.queue.submit(follow_up);
                    }
                    task_report.duration_ms = now_ms() - task_started;
                    self.store.append_task_report(task_report.to_value())?;
                    self.pulse(
                        "task_complete",
                        Some(task.description.clone()),
                        format!(
                            "{} nodes created, {} edges formed",
                            task_report.nodes_created.len(),
                            task_report.edges_formed
                        ),
                    );
                    report.executed.push(task_report);
                }
                Err(err) => {
                    let outcome = self.handle_failure(&task, &err, now_ms());
                    self.pulse(
                        if outcome == "failed" {
                            "task_failed"
                        } else {
                            "task_deferred"
                        },
                        Some(task.description.clone()),
                        err.to_string(),
                    );
                }
            }
        }

        self.queue.prune_terminal(PRUNE_KEEP_MS);
        report.duration_ms = now_ms() - started;
        report.queue = self.queue.counts();
        tracing::info!(
            target: "mnema::scheduler",
            cycle,
            mode = mode.label(),
            refreshed = report.refreshed,
            discarded = report.discarded,
            executed = report.executed.len(),
            deferred_for_bounds = report.deferred_for_bounds,
            duration_ms = report.duration_ms,
            "CYCLE complete"
        );
        self.pulse(
            "cycle_complete",
            None,
            format!(
                "{} executed, {} deferred on bounds",
                report.executed.len(),
                report.deferred_for_bounds
            ),
        );
        Ok(report)
    }

    /// Re-derive proposals from the graph. Returns how many were new to the
    /// queue.
    fn refresh_sources(&self) -> MnemaResult<usize> {
        let snapshot = self.store.snapshot()?;
        let mut proposals: Vec<ResearchTask> = Vec::new();
        for (target, trigger) in self.tracker.sweep(&snapshot) {
            proposals.push(ResearchTask::deepening(target, trigger));
        }
        proposals.extend(sources::harvest_unresolved_references(&snapshot));
        proposals.extend(sources::extract_open_questions(&self.store, &snapshot)?);
        proposals.extend(sources::find_sparse_regions(&snapshot));

        let mut inserted = 0;
        for proposal in proposals {
            let (_, new) = self.queue.submit(proposal);
            if new {
                inserted += 1;
            }
        }
        if inserted > 0 {
            tracing::debug!(
                target: "mnema::scheduler",
                inserted,
                "REFRESH sources proposed new tasks"
            );
        }
        Ok(inserted)
    }

    /// Drop queued tasks whose target condition resolved on its own.
    fn discard_satisfied(&self) -> MnemaResult<usize> {
        let snapshot = self.store.snapshot()?;
        let mut discarded = 0;
        for task in self.queue.live_tasks() {
            if task.status == TaskStatus::Running {
                continue;
            }
            if sources::condition_satisfied(&task, &self.store, &snapshot)? {
                self.queue.remove(task.id);
                discarded += 1;
                tracing::debug!(
                    target: "mnema::scheduler",
                    task = %task.id,
                    kind = task.kind.label(),
                    "DISCARD condition already satisfied"
                );
            }
        }
        Ok(discarded)
    }

    /// Highest-priority eligible task whose estimated duration fits the
    /// remaining cycle budget. Rescores against the current graph first.
    fn select_task(
        &self,
        now: i64,
        remaining_ms: i64,
        supervised: bool,
    ) -> MnemaResult<Option<ResearchTask>> {
        let candidates = self.queue.eligible(now, supervised);
        if candidates.is_empty() {
            return Ok(None);
        }
        let snapshot = self.store.snapshot()?;
        let peers = self.queue.live_tasks();
        let context = self.active_context();

        let mut scored: Vec<(f32, ResearchTask)> = candidates
            .into_iter()
            .map(|task| {
                let computed = self
                    .priority
                    .score(&task, &snapshot, &peers, context.as_deref());
                let effective = task.priority.max(computed);
                if effective > task.priority {
                    self.queue.update(task.id, |t| t.priority = effective);
                }
                (effective, task)
            })
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.created_at_ms.cmp(&b.1.created_at_ms))
                .then(a.1.id.cmp(&b.1.id))
        });

        Ok(scored
            .into_iter()
            .map(|(_, task)| task)
            .find(|task| (task.estimated_duration_secs() as i64) * 1000 <= remaining_ms))
    }

    // -- growth bounds -------------------------------------------------------

    fn node_budget_exhausted(&self) -> bool {
        self.nodes_created_this_cycle.load(Ordering::Acquire) >= self.config.max_new_nodes_per_cycle
    }

    /// Check growth bounds for a task about to run. Returns the defer-until
    /// timestamp and the bound's name when a bound would be violated.
    fn growth_deferral(
        &self,
        task: &ResearchTask,
        now: i64,
    ) -> MnemaResult<Option<(i64, String)>> {
        match task.kind {
            TaskKind::Deepening => self.deepening_deferral(task, now),
            TaskKind::ResolveReference | TaskKind::OpenQuestion => {
                if self.node_budget_exhausted() {
                    let until = now + self.config.interval().as_millis() as i64;
                    Ok(Some((until, "node budget for this cycle spent".to_string())))
                } else {
                    Ok(None)
                }
            }
            TaskKind::ExploreRegion => Ok(None),
        }
    }

    /// Per-node deepening bounds, read from the synthesis history the chain
    /// head carries. The daily cap counts calendar-day (UTC) entries; the
    /// interval bound keys off the last synthesis timestamp.
    fn deepening_deferral(
        &self,
        task: &ResearchTask,
        now: i64,
    ) -> MnemaResult<Option<(i64, String)>> {
        let Some(target) = task.target_id else {
            return Ok(None);
        };
        let head_id = self.store.resolve_head(&target)?;
        let head = self.store.require_node(&head_id)?;
        let Some(maturity) = head.maturity.as_ref() else {
            return Ok(None);
        };

        let today = day_key(now);
        let today_count = maturity
            .synthesis_history
            .iter()
            .filter(|entry| entry.date.starts_with(&today))
            .count() as u32;
        if today_count >= self.config.max_deepenings_per_node_per_day {
            return Ok(Some((
                next_utc_midnight_ms(now),
                format!("daily deepening cap ({}) reached", today_count),
            )));
        }

        let interval_ms = self.config.min_resynthesis_interval_ms();
        if interval_ms > 0 {
            if let Some(last) = maturity.last_deepened_ms {
                if now - last < interval_ms {
                    return Ok(Some((
                        last + interval_ms,
                        "minimum resynthesis interval not yet elapsed".to_string(),
                    )));
                }
            }
        }
        Ok(None)
    }

    // -- execution -----------------------------------------------------------

    async fn dispatch(
        &self,
        task: &ResearchTask,
    ) -> MnemaResult<(TaskReport, Vec<ResearchTask>)> {
        match task.kind {
            TaskKind::Deepening => self.run_deepening(task).await,
            TaskKind::ResolveReference => self.run_resolve_reference(task).await,
            TaskKind::OpenQuestion => self.run_open_question(task).await,
            TaskKind::ExploreRegion => self.run_explore_region(task).await,
        }
    }

    async fn run_deepening(
        &self,
        task: &ResearchTask,
    ) -> MnemaResult<(TaskReport, Vec<ResearchTask>)> {
        let target = task
            .target_id
            .ok_or_else(|| MnemaError::validation("deepening task carries no target"))?;
        let trigger = task.trigger.unwrap_or(DeepeningTrigger::Explicit);
        let result = self.resynthesis.execute(target, trigger).await?;

        // One-hop propagation: connected concepts get their own queued pass,
        // and those passes do not propagate further from here.
        let snapshot = self.store.snapshot()?;
        let follow_ups: Vec<ResearchTask> = if trigger != DeepeningTrigger::Propagation {
            self.tracker
                .propagation_targets(&snapshot, &result.new_node_id)
                .into_iter()
                .map(|id| ResearchTask::deepening(id, DeepeningTrigger::Propagation))
                .collect()
        } else {
            Vec::new()
        };

        let report = TaskReport::new(task, "completed")
            .created(result.new_node_id)
            .updated(result.superseded_id)
            .with_edges(1)
            .with_insight(format!(
                "resynthesized to level {} from {} context items (depth {:.2})",
                result.level, result.context_size, result.depth_score
            ));
        Ok((report, follow_ups))
    }

    async fn run_resolve_reference(
        &self,
        task: &ResearchTask,
    ) -> MnemaResult<(TaskReport, Vec<ResearchTask>)> {
        let referrer = task
            .target_id
            .ok_or_else(|| MnemaError::validation("reference task carries no referrer"))?;
        let reference = task
            .target_ref
            .clone()
            .ok_or_else(|| MnemaError::validation("reference task carries no reference text"))?;
        let referrer_head = self.store.resolve_head(&referrer)?;

        let context = self
            .retrieval
            .gather_context(RetrievalSeed::Node(referrer_head), &self.retrieval.default_spec())
            .await?;
        let prompt = format!(
            "Referenced entity: {}\n\nMaterial that mentions it:\n{}",
            reference,
            context.render_prompt_context(4000)
        );
        let completion = self
            .generation
            .generate(STUB_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|e| MnemaError::generation(e.to_string()))?;
        let content = validate_candidate(&completion)?;

        let stub_id = self.store.add_node_with_edges(
            NodePayload::Observation {
                content,
                category: REFERENCE_CATEGORY.to_string(),
                source_refs: vec![reference.clone()],
            },
            vec![EdgeSpec::outbound(referrer_head, EdgeKind::EmergedFrom)],
        )?;
        self.nodes_created_this_cycle.fetch_add(1, Ordering::AcqRel);

        let follow_ups = self
            .tracker
            .evaluate_endpoints(&self.store, &[referrer_head])?
            .into_iter()
            .map(|(id, trigger)| ResearchTask::deepening(id, trigger))
            .collect();

        let report = TaskReport::new(task, "completed")
            .created(stub_id)
            .with_edges(1)
            .with_insight(format!("materialized '{}' as a reference note", reference));
        Ok((report, follow_ups))
    }

    async fn run_open_question(
        &self,
        task: &ResearchTask,
    ) -> MnemaResult<(TaskReport, Vec<ResearchTask>)> {
        let origin = task
            .target_id
            .ok_or_else(|| MnemaError::validation("question task carries no origin node"))?;
        let question = task
            .target_ref
            .clone()
            .ok_or_else(|| MnemaError::validation("question task carries no question text"))?;
        let origin_head = self.store.resolve_head(&origin)?;

        let context = self
            .retrieval
            .gather_context(RetrievalSeed::Node(origin_head), &self.retrieval.default_spec())
            .await?;
        let prompt = format!(
            "Question: {}\n\nConnected material:\n{}",
            question,
            context.render_prompt_context(4000)
        );
        let completion = self
            .generation
            .generate(ANSWER_SYSTEM_PROMPT, &prompt)
            .await
            .map_err(|e| MnemaError::generation(e.to_string()))?;
        let answer = validate_candidate(&completion)?;

        let reflection_id = self.store.add_node_with_edges(
            NodePayload::SoloReflection {
                content: answer.clone(),
                focus: Some(question.clone()),
            },
            vec![EdgeSpec::outbound(origin_head, EdgeKind::EmergedFrom)],
        )?;
        self.nodes_created_this_cycle.fetch_add(1, Ordering::AcqRel);
        self.store.mark_question_answered(&fingerprint(&question))?;

        let mut report = TaskReport::new(task, "completed")
            .created(reflection_id)
            .with_edges(1)
            .with_insight(format!("answered '{}'", question));
        let mut follow_ups: Vec<ResearchTask> = self
            .tracker
            .evaluate_endpoints(&self.store, &[origin_head])?
            .into_iter()
            .map(|(id, trigger)| ResearchTask::deepening(id, trigger))
            .collect();

        // Answers often open the next question; carry up to a couple forward.
        for raised in sources::extract_open_questions(&self.store, &self.store.snapshot()?)?
            .into_iter()
            .filter(|t| t.target_id == Some(reflection_id))
            .take(QUESTION_REGION_LIMIT)
        {
            if let Some(text) = &raised.target_ref {
                report = report.with_question(text.clone());
            }
            follow_ups.push(raised);
        }
        Ok((report, follow_ups))
    }

    async fn run_explore_region(
        &self,
        task: &ResearchTask,
    ) -> MnemaResult<(TaskReport, Vec<ResearchTask>)> {
        let target = task
            .target_id
            .ok_or_else(|| MnemaError::validation("explore task carries no target"))?;
        let head_id = self.store.resolve_head(&target)?;
        let head = self.store.require_node(&head_id)?;
        if head.archived {
            return Err(MnemaError::validation(format!(
                "node {} is archived, nothing to connect",
                head_id
            )));
        }

        let hits = self
            .search
            .search(head.content_text(), EXPLORE_SEARCH_LIMIT)
            .await?;
        let snapshot = self.store.snapshot()?;
        let chain: std::collections::HashSet<Uuid> =
            snapshot.chain_of(&head_id).into_iter().collect();
        let semantic: Vec<EdgeKind> = EdgeKind::all()
            .into_iter()
            .filter(|k| k.is_semantic())
            .collect();
        let connected: std::collections::HashSet<Uuid> = snapshot
            .neighbors_along(&head_id, &semantic)
            .into_iter()
            .map(|(_, other, _)| snapshot.resolve_head(&other))
            .collect();

        let mut formed = 0;
        let mut touched = vec![head_id];
        for hit in hits {
            if formed >= EXPLORE_EDGE_LIMIT {
                break;
            }
            let other = snapshot.resolve_head(&hit.node_id);
            if chain.contains(&other) || connected.contains(&other) {
                continue;
            }
            let Some(other_node) = snapshot.node(&other) else {
                continue;
            };
            if other_node.archived {
                continue;
            }
            let created = self.store.add_edge(
                head_id,
                other,
                EdgeKind::RelatesTo,
                serde_json::json!({ "strength": hit.score.clamp(0.0, 1.0) }),
            )?;
            if created {
                formed += 1;
                touched.push(other);
            }
        }

        let follow_ups = self
            .tracker
            .evaluate_endpoints(&self.store, &touched)?
            .into_iter()
            .map(|(id, trigger)| ResearchTask::deepening(id, trigger))
            .collect();

        let report = TaskReport::new(task, "completed")
            .with_edges(formed)
            .with_insight(if formed == 0 {
                "no new connections stood out".to_string()
            } else {
                format!("linked {} related entries", formed)
            });
        Ok((report, follow_ups))
    }

    /// Route a task failure: integrity errors are terminal, everything else
    /// defers with exponential backoff and demotes priority after repeated
    /// failures. Returns the outcome label.
    fn handle_failure(&self, task: &ResearchTask, err: &MnemaError, now: i64) -> &'static str {
        match err {
            MnemaError::Validation { .. } | MnemaError::NotFound { .. } | MnemaError::Cycle { .. } => {
                self.queue.mark_failed(task.id);
                tracing::warn!(
                    target: "mnema::scheduler",
                    task = %task.id,
                    kind = task.kind.label(),
                    error = %err,
                    "FAIL task rejected"
                );
                "failed"
            }
            _ => {
                let base = self.config.backoff_base_secs;
                let cap = self.config.backoff_max_secs;
                let demote_at = self.config.demote_after_failures;
                self.queue.update(task.id, |t| {
                    t.consecutive_failures = t.consecutive_failures.saturating_add(1);
                    if t.consecutive_failures >= demote_at {
                        t.priority = (t.priority * 0.5).max(0.05);
                    }
                    t.status = TaskStatus::Deferred;
                    t.next_eligible_ms = now + t.backoff_ms(base, cap);
                });
                tracing::warn!(
                    target: "mnema::scheduler",
                    task = %task.id,
                    kind = task.kind.label(),
                    error = %err,
                    "DEFER transient failure, backing off"
                );
                "deferred"
            }
        }
    }

    // -- control -------------------------------------------------------------

    pub async fn apply_control(&self, message: ControlMessage) {
        match message {
            ControlMessage::SetMode(mode) => self.set_mode(mode),
            ControlMessage::TriggerCycle => {
                if let Err(err) = self.run_cycle().await {
                    tracing::error!(
                        target: "mnema::scheduler",
                        error = %err,
                        "CYCLE triggered run failed"
                    );
                }
            }
            ControlMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.queue.snapshot(SNAPSHOT_PENDING_LIMIT));
            }
            ControlMessage::Pause => {
                self.paused.store(true, Ordering::Release);
                self.pulse("paused", None, "autonomous work paused");
                tracing::info!(target: "mnema::scheduler", "PAUSE autonomous work");
            }
            ControlMessage::Resume => {
                self.paused.store(false, Ordering::Release);
                self.pulse("resumed", None, "autonomous work resumed");
                tracing::info!(target: "mnema::scheduler", "RESUME autonomous work");
            }
            ControlMessage::ApproveTask { id } => {
                if !self.queue.approve(id) {
                    tracing::warn!(
                        target: "mnema::scheduler",
                        task = %id,
                        "APPROVE unknown task"
                    );
                }
            }
            ControlMessage::RequestDeepening { node_id } => {
                let task = ResearchTask::deepening(node_id, DeepeningTrigger::Explicit)
                    .with_approval();
                self.queue.submit(task);
            }
            ControlMessage::SetActiveContext { context } => self.set_active_context(context),
        }
    }
}

/// Spawn the scheduler loop: interval ticks drive mode-dependent cycles,
/// control messages steer it, and a closed control channel shuts it down.
pub fn init_scheduler_loop(
    scheduler: Arc<AutonomousScheduler>,
    mut control_rx: mpsc::Receiver<ControlMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(scheduler.config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            target: "mnema::scheduler",
            mode = scheduler.mode().label(),
            interval_secs = scheduler.config.interval_secs,
            "START scheduler loop"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match scheduler.mode() {
                        SchedulerMode::Triggered => {
                            tracing::debug!(
                                target: "mnema::scheduler",
                                "tick, waiting for an explicit trigger"
                            );
                        }
                        SchedulerMode::Continuous => {
                            if scheduler.activity.quiet_duration()
                                >= scheduler.config.quiet_threshold()
                            {
                                run_and_log(&scheduler).await;
                            } else {
                                scheduler.pulse(
                                    "idle",
                                    None,
                                    "recent writes, waiting for a quiet window",
                                );
                            }
                        }
                        SchedulerMode::Batched | SchedulerMode::Supervised => {
                            run_and_log(&scheduler).await;
                        }
                    }
                }
                message = control_rx.recv() => {
                    match message {
                        Some(message) => scheduler.apply_control(message).await,
                        None => {
                            tracing::info!(
                                target: "mnema::scheduler",
                                "control channel closed, stopping loop"
                            );
                            break;
                        }
                    }
                }
            }
        }
    })
}

async fn run_and_log(scheduler: &AutonomousScheduler) {
    if let Err(err) = scheduler.run_cycle().await {
        tracing::error!(
            target: "mnema::scheduler",
            error = %err,
            "CYCLE failed"
        );
    }
}

/// UTC calendar-day key for an epoch-ms timestamp.
fn day_key(ms: i64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Start of the next UTC calendar day, in epoch ms.
fn next_utc_midnight_ms(ms: i64) -> i64 {
    use chrono::{Days, TimeZone, Utc};
    Utc.timestamp_millis_opt(ms)
        .single()
        .and_then(|dt| dt.date_naive().checked_add_days(Days::new(1)))
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp_millis())
        .unwrap_or(ms + 86_400_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_labels_round_trip() {
        for mode in SchedulerMode::all() {
            assert_eq!(SchedulerMode::from_label(mode.label()), Some(mode));
        }
        assert_eq!(SchedulerMode::from_label("bogus"), None);
    }

    #[test]
    fn next_midnight_lands_on_the_following_day() {
        use chrono::{TimeZone, Utc};
        let afternoon = Utc
            .with_ymd_and_hms(2025, 5, 5, 13, 30, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        let midnight = next_utc_midnight_ms(afternoon);
        let expected = Utc
            .with_ymd_and_hms(2025, 5, 6, 0, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        assert_eq!(midnight, expected);
        assert_eq!(day_key(afternoon), "2025-05-05");
        assert_eq!(day_key(midnight), "2025-05-06");
    }

    #[test]
    fn activity_tracker_resets_on_touch() {
        let tracker = ActivityTracker::new();
        std::thread::sleep(Duration::from_millis(25));
        assert!(tracker.quiet_duration() >= Duration::from_millis(20));
        tracker.touch();
        assert!(tracker.quiet_duration() < Duration::from_millis(20));
    }
}
