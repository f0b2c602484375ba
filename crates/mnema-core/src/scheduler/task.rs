//! Research task records.
//!
//! Tasks move `queued -> running -> {completed | deferred | failed}`.
//! Deferred tasks re-enter `queued` once their backoff elapses. Identity for
//! duplicate suppression is the (kind, target) pair, so re-proposing the
//! same work merges instead of queueing twice.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::now_ms;
use crate::maturity::DeepeningTrigger;

fn default_priority() -> f32 {
    0.5
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Resynthesize a concept node.
    Deepening,
    /// Materialize a referenced-but-missing target as a stub node.
    ResolveReference,
    /// Answer a question found in reflective content.
    OpenQuestion,
    /// Connect an under-linked node into the rest of the graph.
    ExploreRegion,
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Deepening => "deepening",
            TaskKind::ResolveReference => "resolve_reference",
            TaskKind::OpenQuestion => "open_question",
            TaskKind::ExploreRegion => "explore_region",
        }
    }

    /// Coarse duration estimate used against the per-cycle time budget.
    pub fn estimated_duration_secs(&self) -> u64 {
        match self {
            TaskKind::Deepening => 60,
            TaskKind::ResolveReference => 30,
            TaskKind::OpenQuestion => 30,
            TaskKind::ExploreRegion => 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Deferred,
    Failed,
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Deferred => "deferred",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Normalized form of free text used for task identity and answered-question
/// bookkeeping: lowercase, alphanumerics only.
pub fn fingerprint(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchTask {
    pub id: Uuid,
    pub kind: TaskKind,
    #[serde(default)]
    pub status: TaskStatus,
    pub description: String,
    /// Node the task operates on. Reference-resolution tasks point at the
    /// referrer here and carry the dangling reference in `target_ref`.
    #[serde(default)]
    pub target_id: Option<Uuid>,
    /// Free-text target: the unresolved reference or the question text.
    #[serde(default)]
    pub target_ref: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: f32,
    #[serde(default)]
    pub trigger: Option<DeepeningTrigger>,
    /// Label of the source that proposed the task.
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Epoch ms before which the task may not run. Zero means immediately.
    #[serde(default)]
    pub next_eligible_ms: i64,
    /// Supervised mode executes only approved tasks.
    #[serde(default)]
    pub approved: bool,
    pub created_at_ms: i64,
    #[serde(default)]
    pub last_transition_ms: i64,
}

impl ResearchTask {
    fn base(kind: TaskKind, description: String, source: &str) -> Self {
        let now = now_ms();
        Self {
            id: Uuid::new_v4(),
            kind,
            status: TaskStatus::Queued,
            description,
            target_id: None,
            target_ref: None,
            priority: default_priority(),
            trigger: None,
            source: source.to_string(),
            attempts: 0,
            consecutive_failures: 0,
            next_eligible_ms: 0,
            approved: false,
            created_at_ms: now,
            last_transition_ms: now,
        }
    }

    pub fn deepening(target: Uuid, trigger: DeepeningTrigger) -> Self {
        let mut task = Self::base(
            TaskKind::Deepening,
            format!("deepen concept {} ({})", target, trigger.label()),
            "maturity",
        );
        task.target_id = Some(target);
        task.trigger = Some(trigger);
        task.priority = trigger.base_priority();
        task
    }

    pub fn resolve_reference(referrer: Uuid, reference: &str) -> Self {
        let mut task = Self::base(
            TaskKind::ResolveReference,
            format!("resolve reference '{}'", reference),
            "unresolved_reference",
        );
        task.target_id = Some(referrer);
        task.target_ref = Some(reference.to_string());
        task
    }

    pub fn open_question(node: Uuid, question: &str) -> Self {
        let mut task = Self::base(
            TaskKind::OpenQuestion,
            format!("answer: {}", question),
            "open_question",
        );
        task.target_id = Some(node);
        task.target_ref = Some(question.to_string());
        task
    }

    pub fn explore_region(node: Uuid) -> Self {
        let mut task = Self::base(
            TaskKind::ExploreRegion,
            format!("connect sparse node {}", node),
            "sparse_region",
        );
        task.target_id = Some(node);
        task.priority = 0.4;
        task
    }

    /// Priority may exceed 1.0 once the unblock and context multipliers are
    /// applied.
    pub fn with_priority(mut self, priority: f32) -> Self {
        self.priority = priority.clamp(0.0, 2.0);
        self
    }

    pub fn with_approval(mut self) -> Self {
        self.approved = true;
        self
    }

    /// Identity used for duplicate suppression. Text-targeted tasks key on
    /// the fingerprint of their text; node-targeted tasks key on the node.
    pub fn dedup_key(&self) -> String {
        match &self.target_ref {
            Some(text) => format!("{}:{}", self.kind.label(), fingerprint(text)),
            None => match &self.target_id {
                Some(id) => format!("{}:{}", self.kind.label(), id),
                None => format!("{}:{}", self.kind.label(), self.id),
            },
        }
    }

    pub fn is_eligible(&self, now_ms: i64, supervised: bool) -> bool {
        self.status == TaskStatus::Queued
            && self.next_eligible_ms <= now_ms
            && (!supervised || self.approved)
    }

    pub fn estimated_duration_secs(&self) -> u64 {
        self.kind.estimated_duration_secs()
    }

    /// Exponential backoff delay in ms, doubling per consecutive failure and
    /// capped at `max_secs`.
    pub fn backoff_ms(&self, base_secs: u64, max_secs: u64) -> i64 {
        let attempt = self.consecutive_failures.saturating_sub(1);
        let delay_secs = base_secs
            .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
            .min(max_secs);
        delay_secs as i64 * 1000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_key_is_stable_across_proposals() {
        let node = Uuid::new_v4();
        let a = ResearchTask::deepening(node, DeepeningTrigger::ConnectionGrowth);
        let b = ResearchTask::deepening(node, DeepeningTrigger::Decay);
        assert_eq!(a.dedup_key(), b.dedup_key());

        let q1 = ResearchTask::open_question(node, "What does the garden need?");
        let q2 = ResearchTask::open_question(Uuid::new_v4(), "what does the GARDEN need");
        assert_eq!(q1.dedup_key(), q2.dedup_key());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut task = ResearchTask::explore_region(Uuid::new_v4());
        task.consecutive_failures = 1;
        assert_eq!(task.backoff_ms(60, 3600), 60_000);
        task.consecutive_failures = 2;
        assert_eq!(task.backoff_ms(60, 3600), 120_000);
        task.consecutive_failures = 3;
        assert_eq!(task.backoff_ms(60, 3600), 240_000);
        task.consecutive_failures = 30;
        assert_eq!(task.backoff_ms(60, 3600), 3_600_000);
    }

    #[test]
    fn eligibility_respects_backoff_and_approval() {
        let mut task = ResearchTask::explore_region(Uuid::new_v4());
        let now = now_ms();
        assert!(task.is_eligible(now, false));
        assert!(!task.is_eligible(now, true));

        task.approved = true;
        assert!(task.is_eligible(now, true));

        task.next_eligible_ms = now + 60_000;
        assert!(!task.is_eligible(now, false));

        task.next_eligible_ms = 0;
        task.status = TaskStatus::Running;
        assert!(!task.is_eligible(now, false));
    }

    #[test]
    fn fingerprint_normalizes_case_and_punctuation() {
        assert_eq!(
            fingerprint("What does the garden need?"),
            fingerprint("what does the garden NEED")
        );
        assert_ne!(fingerprint("one question"), fingerprint("another question"));
    }
}
