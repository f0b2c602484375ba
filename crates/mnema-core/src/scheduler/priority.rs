//! Task priority scoring.
//!
//! Base score is a weighted blend of six factors in [0, 1]. Two situational
//! multipliers sit on top: tasks that unblock other queued work score x1.3,
//! tasks related to the active conversational context score x1.2.

use uuid::Uuid;

use crate::config::PriorityWeights;
use crate::graph::{now_ms, EdgeKind, GraphSnapshot, NodeKind};
use crate::retrieval::lexical_similarity;

use super::task::{fingerprint, ResearchTask, TaskKind};

pub const UNBLOCK_MULTIPLIER: f32 = 1.3;
pub const CONTEXT_MULTIPLIER: f32 = 1.2;

const HEDGE_WORDS: [&str; 6] = ["maybe", "perhaps", "wonder", "unsure", "unclear", "curious"];

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PriorityFactors {
    pub curiosity: f32,
    pub connection_potential: f32,
    pub foundation_relevance: f32,
    pub user_relevance: f32,
    pub recency: f32,
    pub graph_balance: f32,
}

impl PriorityFactors {
    pub fn weighted(&self, weights: &PriorityWeights) -> f32 {
        self.curiosity * weights.curiosity
            + self.connection_potential * weights.connection_potential
            + self.foundation_relevance * weights.foundation_relevance
            + self.user_relevance * weights.user_relevance
            + self.recency * weights.recency
            + self.graph_balance * weights.graph_balance
    }
}

#[derive(Debug, Clone)]
pub struct PriorityEngine {
    weights: PriorityWeights,
}

impl PriorityEngine {
    pub fn new(weights: PriorityWeights) -> Self {
        let mut weights = weights;
        weights.normalize();
        Self { weights }
    }

    /// Score a task against the current graph. `peers` is the full task set,
    /// used to detect unblocking; `active_context` is recent conversational
    /// text, if any.
    pub fn score(
        &self,
        task: &ResearchTask,
        snapshot: &GraphSnapshot,
        peers: &[ResearchTask],
        active_context: Option<&str>,
    ) -> f32 {
        let factors = self.factors(task, snapshot);
        let mut score = factors.weighted(&self.weights).clamp(0.0, 1.0);
        if unblocks_others(task, peers) {
            score *= UNBLOCK_MULTIPLIER;
        }
        if let Some(context) = active_context {
            if context_matches(task, snapshot, context) {
                score *= CONTEXT_MULTIPLIER;
            }
        }
        score
    }

    pub fn factors(&self, task: &ResearchTask, snapshot: &GraphSnapshot) -> PriorityFactors {
        let target = task
            .target_id
            .map(|id| snapshot.resolve_head(&id))
            .filter(|id| snapshot.contains(id));
        PriorityFactors {
            curiosity: curiosity(task),
            connection_potential: connection_potential(target.as_ref(), snapshot),
            foundation_relevance: foundation_relevance(target.as_ref(), snapshot),
            user_relevance: user_relevance(target.as_ref(), snapshot),
            recency: recency(target.as_ref(), snapshot),
            graph_balance: graph_balance(target.as_ref(), snapshot),
        }
    }
}

fn task_text(task: &ResearchTask) -> String {
    match &task.target_ref {
        Some(text) => format!("{} {}", task.description, text),
        None => task.description.clone(),
    }
}

/// How much open curiosity the task carries. Question marks and hedging
/// language both count; reference and question tasks are curious by nature.
fn curiosity(task: &ResearchTask) -> f32 {
    let text = task_text(task).to_lowercase();
    let mut score: f32 = 0.3;
    if text.contains('?') {
        score += 0.25;
    }
    for word in HEDGE_WORDS {
        if text.contains(word) {
            score += 0.1;
        }
    }
    let floor = match task.kind {
        TaskKind::ResolveReference | TaskKind::OpenQuestion => 0.6,
        _ => 0.0,
    };
    score.max(floor).min(1.0)
}

/// Sparse nodes have room to grow; saturated ones do not.
fn connection_potential(target: Option<&Uuid>, snapshot: &GraphSnapshot) -> f32 {
    let Some(id) = target else {
        return 0.6;
    };
    let mean = snapshot.mean_degree();
    if mean <= 0.0 {
        return 0.8;
    }
    (1.0 - snapshot.degree(id) as f32 / (2.0 * mean)).clamp(0.0, 1.0)
}

/// Proximity to foundation nodes (participants, milestones), in hops.
fn foundation_relevance(target: Option<&Uuid>, snapshot: &GraphSnapshot) -> f32 {
    let Some(id) = target else {
        return 0.2;
    };
    match snapshot.distance_to_foundation(id, 3) {
        Some(0) => 1.0,
        Some(1) => 0.75,
        Some(2) => 0.5,
        Some(_) => 0.3,
        None => 0.1,
    }
}

/// Direct participant linkage beats reflective content beats the rest.
fn user_relevance(target: Option<&Uuid>, snapshot: &GraphSnapshot) -> f32 {
    let Some(id) = target else {
        return 0.4;
    };
    let touches_participant = snapshot
        .neighbors_along(id, &[EdgeKind::About, EdgeKind::ParticipatedIn])
        .iter()
        .any(|(_, other, _)| {
            snapshot
                .node(other)
                .map(|n| n.kind == NodeKind::Participant)
                .unwrap_or(false)
        });
    if touches_participant {
        return 0.9;
    }
    let reflective = snapshot
        .node(id)
        .map(|n| n.kind.is_reflective())
        .unwrap_or(false);
    if reflective {
        0.6
    } else {
        0.4
    }
}

/// Recently-touched regions stay warm for about a week.
fn recency(target: Option<&Uuid>, snapshot: &GraphSnapshot) -> f32 {
    let Some(id) = target else {
        return 0.5;
    };
    let last_ms = snapshot
        .most_recent_edge_ms(id)
        .or_else(|| snapshot.node(id).map(|n| n.created_at_ms));
    match last_ms {
        Some(ms) => {
            let age_days = ((now_ms() - ms).max(0) as f32) / 86_400_000.0;
            1.0 / (1.0 + age_days / 7.0)
        }
        None => 0.5,
    }
}

/// Favor work in regions below the mean degree.
fn graph_balance(target: Option<&Uuid>, snapshot: &GraphSnapshot) -> f32 {
    let Some(id) = target else {
        return 0.5;
    };
    let mean = snapshot.mean_degree();
    if mean <= 0.0 {
        return 0.5;
    }
    let degree = snapshot.degree(id) as f32;
    if degree < mean {
        ((mean - degree) / mean).clamp(0.0, 1.0)
    } else {
        0.1
    }
}

/// A task unblocks others when live peer tasks wait on the same target.
fn unblocks_others(task: &ResearchTask, peers: &[ResearchTask]) -> bool {
    peers.iter().any(|peer| {
        if peer.id == task.id || peer.status.is_terminal() {
            return false;
        }
        let same_node = match (task.target_id, peer.target_id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        let same_ref = match (&task.target_ref, &peer.target_ref) {
            (Some(a), Some(b)) => fingerprint(a) == fingerprint(b),
            _ => false,
        };
        same_node || same_ref
    })
}

fn context_matches(task: &ResearchTask, snapshot: &GraphSnapshot, context: &str) -> bool {
    if context.trim().is_empty() {
        return false;
    }
    let mut text = task_text(task);
    if let Some(id) = task.target_id {
        let head = snapshot.resolve_head(&id);
        if let Some(node) = snapshot.node(&head) {
            text.push(' ');
            text.push_str(node.content_text());
        }
    }
    lexical_similarity(context, &text) > 0.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maturity::DeepeningTrigger;

    fn empty_snapshot() -> GraphSnapshot {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::graph::GraphStore::open_path(dir.path()).unwrap();
        store.snapshot().unwrap()
    }

    #[test]
    fn question_tasks_score_curious() {
        let q = ResearchTask::open_question(Uuid::new_v4(), "What feeds the lake?");
        assert!(curiosity(&q) >= 0.6);

        let flat = ResearchTask::explore_region(Uuid::new_v4());
        assert!(curiosity(&flat) < curiosity(&q));
    }

    #[test]
    fn unblock_multiplier_applies_on_shared_target() {
        let engine = PriorityEngine::new(PriorityWeights::default());
        let snapshot = empty_snapshot();
        let node = Uuid::new_v4();

        let task = ResearchTask::deepening(node, DeepeningTrigger::Decay);
        let solo = engine.score(&task, &snapshot, &[], None);

        let peer = ResearchTask::open_question(node, "Where does this lead?");
        let mut peer = peer;
        peer.target_ref = None;
        peer.target_id = Some(node);
        let boosted = engine.score(&task, &snapshot, &[peer], None);

        assert!((boosted / solo - UNBLOCK_MULTIPLIER).abs() < 1e-4);
    }

    #[test]
    fn context_multiplier_requires_overlap() {
        let engine = PriorityEngine::new(PriorityWeights::default());
        let snapshot = empty_snapshot();
        let task = ResearchTask::open_question(Uuid::new_v4(), "How does the sourdough starter stay alive?");

        let with_context = engine.score(&task, &snapshot, &[], Some("we talked about the sourdough starter"));
        let without = engine.score(&task, &snapshot, &[], Some("orbital mechanics homework"));
        assert!(with_context > without);
    }
}
