//! Structured reports from autonomous work.
//!
//! Every executed task summarizes what it changed; every cycle rolls those
//! up. Task reports also land in the mutation journal so the log tells the
//! whole story of background activity.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{now_ms, rfc3339_of_ms};

use super::queue::StatusCounts;
use super::task::ResearchTask;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_id: Uuid,
    pub kind: String,
    pub outcome: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub nodes_created: Vec<Uuid>,
    #[serde(default)]
    pub nodes_updated: Vec<Uuid>,
    #[serde(default)]
    pub edges_formed: usize,
    #[serde(default)]
    pub insights: Vec<String>,
    #[serde(default)]
    pub questions_raised: Vec<String>,
    /// Descriptions of follow-up tasks the executor proposed.
    #[serde(default)]
    pub follow_ups: Vec<String>,
    pub duration_ms: i64,
    pub finished_at: String,
}

impl TaskReport {
    pub fn new(task: &ResearchTask, outcome: &str) -> Self {
        let target = task
            .target_ref
            .clone()
            .or_else(|| task.target_id.map(|id| id.to_string()));
        Self {
            task_id: task.id,
            kind: task.kind.label().to_string(),
            outcome: outcome.to_string(),
            target,
            nodes_created: Vec::new(),
            nodes_updated: Vec::new(),
            edges_formed: 0,
            insights: Vec::new(),
            questions_raised: Vec::new(),
            follow_ups: Vec::new(),
            duration_ms: 0,
            finished_at: rfc3339_of_ms(now_ms()),
        }
    }

    pub fn created(mut self, id: Uuid) -> Self {
        self.nodes_created.push(id);
        self
    }

    pub fn updated(mut self, id: Uuid) -> Self {
        self.nodes_updated.push(id);
        self
    }

    pub fn with_edges(mut self, count: usize) -> Self {
        self.edges_formed = count;
        self
    }

    pub fn with_insight(mut self, insight: impl Into<String>) -> Self {
        self.insights.push(insight.into());
        self
    }

    pub fn with_question(mut self, question: impl Into<String>) -> Self {
        self.questions_raised.push(question.into());
        self
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Roll-up of one scheduler cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub mode: String,
    pub started_at: String,
    pub duration_ms: i64,
    /// Tasks newly proposed by source refresh this cycle.
    pub refreshed: usize,
    /// Deferred tasks whose backoff expired this cycle.
    pub released: usize,
    /// Tasks dropped because their target condition was already satisfied.
    pub discarded: usize,
    pub executed: Vec<TaskReport>,
    /// Tasks pushed back by growth bounds rather than failure.
    pub deferred_for_bounds: usize,
    pub queue: StatusCounts,
}

impl CycleReport {
    pub fn empty(cycle: u64, mode: &str) -> Self {
        Self {
            cycle,
            mode: mode.to_string(),
            started_at: rfc3339_of_ms(now_ms()),
            duration_ms: 0,
            refreshed: 0,
            released: 0,
            discarded: 0,
            executed: Vec::new(),
            deferred_for_bounds: 0,
            queue: StatusCounts::default(),
        }
    }
}
