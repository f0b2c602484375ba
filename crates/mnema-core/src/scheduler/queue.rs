//! Priority queue of research tasks.
//!
//! Keyed by dedup identity so the same proposal from two sources merges into
//! one task at the higher priority. Deferred tasks stay in the queue and
//! return to `queued` once their backoff expires.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{now_ms, rfc3339_of_ms};

use super::task::{ResearchTask, TaskStatus};

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: DashMap<String, ResearchTask>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub deferred: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTask {
    pub id: Uuid,
    pub kind: String,
    pub status: String,
    pub description: String,
    pub priority: f32,
    pub source: String,
    pub attempts: u32,
    pub next_eligible: Option<String>,
    pub approved: bool,
}

/// Point-in-time view of the queue for operators and the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub taken_at: String,
    pub total: usize,
    pub counts: StatusCounts,
    pub pending: Vec<PendingTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or merge a task. Returns the id now queued under the task's
    /// identity and whether a new entry was created.
    pub fn submit(&self, task: ResearchTask) -> (Uuid, bool) {
        let key = task.dedup_key();
        let mut entry = self.tasks.entry(key).or_insert_with(|| task.clone());
        if entry.id == task.id {
            return (task.id, true);
        }
        if entry.status.is_terminal() {
            // Completed work may legitimately be proposed again later.
            *entry = task.clone();
            return (task.id, true);
        }
        if task.priority > entry.priority {
            entry.priority = task.priority;
        }
        entry.approved |= task.approved;
        if entry.trigger.is_none() {
            entry.trigger = task.trigger;
        }
        (entry.id, false)
    }

    pub fn get(&self, id: Uuid) -> Option<ResearchTask> {
        self.tasks
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.value().clone())
    }

    pub fn update<F>(&self, id: Uuid, mutate: F) -> bool
    where
        F: FnOnce(&mut ResearchTask),
    {
        for mut entry in self.tasks.iter_mut() {
            if entry.value().id == id {
                mutate(entry.value_mut());
                entry.value_mut().last_transition_ms = now_ms();
                return true;
            }
        }
        false
    }

    pub fn approve(&self, id: Uuid) -> bool {
        self.update(id, |task| task.approved = true)
    }

    pub fn remove(&self, id: Uuid) -> Option<ResearchTask> {
        let key = self
            .tasks
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| entry.key().clone())?;
        self.tasks.remove(&key).map(|(_, task)| task)
    }

    /// Return deferred tasks whose backoff has elapsed to `queued`. Returns
    /// how many were released.
    pub fn release_due(&self, now_ms: i64) -> usize {
        let mut released = 0;
        for mut entry in self.tasks.iter_mut() {
            let task = entry.value_mut();
            if task.status == TaskStatus::Deferred && task.next_eligible_ms <= now_ms {
                task.status = TaskStatus::Queued;
                task.last_transition_ms = now_ms;
                released += 1;
            }
        }
        released
    }

    /// Runnable tasks ordered by priority, then age, then id.
    pub fn eligible(&self, now_ms: i64, supervised: bool) -> Vec<ResearchTask> {
        let mut tasks: Vec<ResearchTask> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().is_eligible(now_ms, supervised))
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
                .then(a.id.cmp(&b.id))
        });
        tasks
    }

    pub fn mark_running(&self, id: Uuid) -> bool {
        self.update(id, |task| {
            task.status = TaskStatus::Running;
            task.attempts = task.attempts.saturating_add(1);
        })
    }

    pub fn mark_completed(&self, id: Uuid) -> bool {
        self.update(id, |task| {
            task.status = TaskStatus::Completed;
            task.consecutive_failures = 0;
        })
    }

    pub fn mark_failed(&self, id: Uuid) -> bool {
        self.update(id, |task| task.status = TaskStatus::Failed)
    }

    /// Park a task until `until_ms`. Deferral preserves the task; nothing is
    /// dropped on resource-bound or backend trouble.
    pub fn defer(&self, id: Uuid, until_ms: i64) -> bool {
        self.update(id, |task| {
            task.status = TaskStatus::Deferred;
            task.next_eligible_ms = until_ms;
        })
    }

    /// Drop completed and failed tasks older than `keep_ms`.
    pub fn prune_terminal(&self, keep_ms: i64) -> usize {
        let cutoff = now_ms() - keep_ms;
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| {
                entry.value().status.is_terminal() && entry.value().last_transition_ms < cutoff
            })
            .map(|entry| entry.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.tasks.remove(&key);
        }
        count
    }

    /// All non-terminal tasks, unordered.
    pub fn live_tasks(&self) -> Vec<ResearchTask> {
        self.tasks
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for entry in self.tasks.iter() {
            match entry.value().status {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Deferred => counts.deferred += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn snapshot(&self, limit: usize) -> QueueSnapshot {
        let mut pending: Vec<ResearchTask> = self
            .tasks
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.created_at_ms.cmp(&b.created_at_ms))
                .then(a.id.cmp(&b.id))
        });
        pending.truncate(limit);
        QueueSnapshot {
            taken_at: rfc3339_of_ms(now_ms()),
            total: self.tasks.len(),
            counts: self.counts(),
            pending: pending
                .into_iter()
                .map(|task| PendingTask {
                    id: task.id,
                    kind: task.kind.label().to_string(),
                    status: task.status.label().to_string(),
                    description: task.description.clone(),
                    priority: task.priority,
                    source: task.source.clone(),
                    attempts: task.attempts,
                    next_eligible: (task.next_eligible_ms > 0)
                        .then(|| rfc3339_of_ms(task.next_eligible_ms)),
                    approved: task.approved,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maturity::DeepeningTrigger;

    #[test]
    fn duplicate_submission_merges_at_max_priority() {
        let queue = TaskQueue::new();
        let node = Uuid::new_v4();

        let first = ResearchTask::deepening(node, DeepeningTrigger::Propagation);
        let (id, inserted) = queue.submit(first);
        assert!(inserted);

        let second = ResearchTask::deepening(node, DeepeningTrigger::Explicit).with_approval();
        let (merged_id, inserted) = queue.submit(second);
        assert!(!inserted);
        assert_eq!(merged_id, id);
        assert_eq!(queue.len(), 1);

        let task = queue.get(id).unwrap();
        assert_eq!(task.priority, DeepeningTrigger::Explicit.base_priority());
        assert!(task.approved);
    }

    #[test]
    fn terminal_tasks_are_replaced_on_resubmission() {
        let queue = TaskQueue::new();
        let node = Uuid::new_v4();

        let (id, _) = queue.submit(ResearchTask::deepening(node, DeepeningTrigger::Decay));
        queue.mark_running(id);
        queue.mark_completed(id);

        let fresh = ResearchTask::deepening(node, DeepeningTrigger::ConnectionGrowth);
        let fresh_id = fresh.id;
        let (id2, inserted) = queue.submit(fresh);
        assert!(inserted);
        assert_eq!(id2, fresh_id);
        assert_eq!(queue.get(fresh_id).unwrap().status, TaskStatus::Queued);
    }

    #[test]
    fn deferred_tasks_release_after_backoff() {
        let queue = TaskQueue::new();
        let (id, _) = queue.submit(ResearchTask::explore_region(Uuid::new_v4()));
        let now = now_ms();

        queue.defer(id, now + 60_000);
        assert!(queue.eligible(now, false).is_empty());
        assert_eq!(queue.release_due(now), 0);

        assert_eq!(queue.release_due(now + 61_000), 1);
        assert_eq!(queue.eligible(now + 61_000, false).len(), 1);
    }

    #[test]
    fn eligible_orders_by_priority_then_age() {
        let queue = TaskQueue::new();
        let low = ResearchTask::explore_region(Uuid::new_v4()).with_priority(0.2);
        let high = ResearchTask::explore_region(Uuid::new_v4()).with_priority(0.9);
        queue.submit(low);
        queue.submit(high.clone());

        let ordered = queue.eligible(now_ms(), false);
        assert_eq!(ordered.len(), 2);
        assert_eq!(ordered[0].id, high.id);
    }

    #[test]
    fn snapshot_reports_counts_and_pending() {
        let queue = TaskQueue::new();
        let (a, _) = queue.submit(ResearchTask::explore_region(Uuid::new_v4()));
        let (b, _) = queue.submit(ResearchTask::explore_region(Uuid::new_v4()));
        queue.mark_running(a);
        queue.mark_completed(a);
        queue.defer(b, now_ms() + 120_000);

        let snap = queue.snapshot(10);
        assert_eq!(snap.total, 2);
        assert_eq!(snap.counts.completed, 1);
        assert_eq!(snap.counts.deferred, 1);
        assert_eq!(snap.pending.len(), 1);
        assert!(snap.pending[0].next_eligible.is_some());
    }
}
