//! Front-door facade over the substrate.
//!
//! Conversational surfaces call this and nothing else: every write lands
//! atomically in the store, runs synchronous trigger evaluation on the
//! touched nodes, and nudges the activity clock the continuous scheduler
//! watches. Trigger firings enqueue deepening work; nothing heavy runs on
//! the caller's stack.

use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::config::MnemaConfig;
use crate::error::{MnemaError, MnemaResult};
use crate::graph::{
    EdgeKind, EdgeRecord, EdgeSpec, GraphStore, NodeKind, NodePayload, NodeRecord,
};
use crate::maturity::{DeepeningTrigger, MaturityTracker};
use crate::retrieval::{ContextBundle, RetrievalEngine, RetrievalSeed};
use crate::scheduler::{
    ActivityTracker, QueueSnapshot, ResearchTask, SchedulerHandle, SchedulerMode, TaskQueue,
};

pub struct MemoryService {
    store: Arc<GraphStore>,
    queue: Arc<TaskQueue>,
    retrieval: Arc<RetrievalEngine>,
    tracker: MaturityTracker,
    activity: ActivityTracker,
    control: RwLock<Option<SchedulerHandle>>,
}

impl MemoryService {
    pub fn new(
        store: Arc<GraphStore>,
        queue: Arc<TaskQueue>,
        retrieval: Arc<RetrievalEngine>,
        activity: ActivityTracker,
        config: &MnemaConfig,
    ) -> Self {
        Self {
            store,
            queue,
            retrieval,
            tracker: MaturityTracker::new(config.maturity.clone()),
            activity,
            control: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<GraphStore> {
        &self.store
    }

    /// Wire in the scheduler's control channel once the loop is running.
    pub fn attach_control(&self, handle: SchedulerHandle) {
        *self.control.write().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    fn control(&self) -> MnemaResult<SchedulerHandle> {
        self.control
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .ok_or_else(|| MnemaError::validation("scheduler control is not attached"))
    }

    // -- writes --------------------------------------------------------------

    /// Record an observation. Source references that name something already
    /// in the graph become edges in the same atomic write; the rest stay
    /// embedded for the reference harvester to chase later.
    pub fn append_observation(
        &self,
        content: &str,
        category: &str,
        source_refs: Vec<String>,
    ) -> MnemaResult<Uuid> {
        let mut specs = Vec::new();
        let mut endpoints = Vec::new();
        for reference in &source_refs {
            if let Some((target, kind)) = self.resolve_reference_target(reference)? {
                let edge_kind = match kind {
                    NodeKind::Participant => EdgeKind::About,
                    NodeKind::Milestone => EdgeKind::RelatesTo,
                    _ => EdgeKind::EmergedFrom,
                };
                specs.push(EdgeSpec::outbound(target, edge_kind));
                endpoints.push(target);
            }
        }
        let id = self.store.add_node_with_edges(
            NodePayload::Observation {
                content: content.to_string(),
                category: category.to_string(),
                source_refs,
            },
            specs,
        )?;
        self.activity.touch();
        endpoints.push(id);
        self.evaluate_and_queue(&endpoints)?;
        Ok(id)
    }

    pub fn append_opinion(&self, content: &str, stance: &str, conviction: f32) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::Opinion {
            content: content.to_string(),
            stance: stance.to_string(),
            conviction,
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn append_growth_edge(&self, content: &str, practice: Option<String>) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::GrowthEdge {
            content: content.to_string(),
            practice,
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn append_journal_entry(&self, content: &str, mood: Option<String>) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::JournalEntry {
            content: content.to_string(),
            mood,
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn append_solo_reflection(&self, content: &str, focus: Option<String>) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::SoloReflection {
            content: content.to_string(),
            focus,
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn append_mark(&self, content: &str) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::Mark {
            content: content.to_string(),
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn add_participant(
        &self,
        name: &str,
        relationship: &str,
        notes: &str,
    ) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::Participant {
            name: name.to_string(),
            relationship: relationship.to_string(),
            notes: notes.to_string(),
        })?;
        self.activity.touch();
        Ok(id)
    }

    pub fn add_milestone(&self, title: &str, details: &str) -> MnemaResult<Uuid> {
        let id = self.store.add_node(NodePayload::Milestone {
            title: title.to_string(),
            details: details.to_string(),
        })?;
        self.activity.touch();
        Ok(id)
    }

    /// Record a conversation with its participants and notable moments. The
    /// conversation node and participant edges land atomically; each moment
    /// follows as its own contained node.
    pub fn record_conversation(
        &self,
        summary: &str,
        participant_ids: &[Uuid],
        moments: Vec<String>,
    ) -> MnemaResult<Uuid> {
        let mut names = Vec::new();
        let mut specs = Vec::new();
        for pid in participant_ids {
            let node = self.store.require_node(pid)?;
            if let NodePayload::Participant { name, .. } = &node.payload {
                names.push(name.clone());
            }
            specs.push(EdgeSpec::inbound(*pid, EdgeKind::ParticipatedIn));
        }
        let conversation = self.store.add_node_with_edges(
            NodePayload::Conversation {
                summary: summary.to_string(),
                participants: names,
            },
            specs,
        )?;
        for moment in moments {
            self.store.add_node_with_edges(
                NodePayload::ConversationMoment {
                    content: moment,
                    conversation_ref: Some(conversation.to_string()),
                },
                vec![EdgeSpec::inbound(conversation, EdgeKind::Contains)],
            )?;
        }
        self.activity.touch();
        let mut endpoints = participant_ids.to_vec();
        endpoints.push(conversation);
        self.evaluate_and_queue(&endpoints)?;
        Ok(conversation)
    }

    /// Add a typed edge, then evaluate deepening triggers on both endpoints.
    pub fn add_edge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        kind: EdgeKind,
        properties: serde_json::Value,
    ) -> MnemaResult<bool> {
        let created = self.store.add_edge(source_id, target_id, kind, properties)?;
        self.activity.touch();
        if created {
            self.evaluate_and_queue(&[source_id, target_id])?;
        }
        Ok(created)
    }

    pub fn archive_node(&self, id: Uuid) -> MnemaResult<()> {
        self.store.archive_node(id)?;
        self.activity.touch();
        Ok(())
    }

    pub fn resolve_contradiction(&self, edge_id: Uuid, note: &str) -> MnemaResult<()> {
        self.store.resolve_contradiction(edge_id, note)?;
        self.activity.touch();
        Ok(())
    }

    // -- reads ---------------------------------------------------------------

    pub fn node(&self, id: &Uuid) -> MnemaResult<Option<NodeRecord>> {
        self.store.get_node(id)
    }

    /// Walk outward from a node along the given edge kinds. An empty kind
    /// list means every kind.
    pub async fn traverse(
        &self,
        start_id: Uuid,
        edge_kinds: Vec<EdgeKind>,
        max_depth: usize,
    ) -> MnemaResult<ContextBundle> {
        let mut spec = self.retrieval.default_spec().with_max_depth(max_depth);
        if !edge_kinds.is_empty() {
            spec = spec.with_edge_kinds(edge_kinds);
        }
        self.retrieval
            .gather_context(RetrievalSeed::Node(start_id), &spec)
            .await
    }

    /// Free-text recall through the similarity backend.
    pub async fn recall(&self, query: &str) -> MnemaResult<ContextBundle> {
        self.retrieval
            .gather_context(
                RetrievalSeed::Query(query.to_string()),
                &self.retrieval.default_spec(),
            )
            .await
    }

    pub fn find_contradictions(
        &self,
        resolved: bool,
    ) -> MnemaResult<Vec<(NodeRecord, NodeRecord, EdgeRecord)>> {
        self.store.find_contradictions(resolved)
    }

    /// Version chain of a node, oldest first.
    pub fn get_evolution(&self, id: Uuid) -> MnemaResult<Vec<NodeRecord>> {
        self.store.get_evolution(id)
    }

    pub fn queue_snapshot(&self, limit: usize) -> QueueSnapshot {
        self.queue.snapshot(limit)
    }

    // -- autonomy ------------------------------------------------------------

    /// Ask for a deepening pass on a node. The task is queued pre-approved so
    /// supervised mode runs it without a second confirmation.
    pub fn request_deepening(&self, node_id: Uuid) -> MnemaResult<Uuid> {
        self.store.require_node(&node_id)?;
        let task = ResearchTask::deepening(node_id, DeepeningTrigger::Explicit).with_approval();
        let (id, _) = self.queue.submit(task);
        Ok(id)
    }

    pub async fn set_mode(&self, mode: SchedulerMode) -> MnemaResult<()> {
        self.send_control(|c| async move { c.set_mode(mode).await })
            .await
    }

    pub async fn trigger_cycle(&self) -> MnemaResult<()> {
        self.send_control(|c| async move { c.trigger_cycle().await })
            .await
    }

    pub async fn pause(&self) -> MnemaResult<()> {
        self.send_control(|c| async move { c.pause().await }).await
    }

    pub async fn resume(&self) -> MnemaResult<()> {
        self.send_control(|c| async move { c.resume().await }).await
    }

    pub async fn approve_task(&self, task_id: Uuid) -> MnemaResult<()> {
        self.send_control(|c| async move { c.approve_task(task_id).await })
            .await
    }

    /// Tell the scheduler what the conversation is currently about, so
    /// related tasks get their context boost.
    pub async fn set_active_context(&self, context: Option<String>) -> MnemaResult<()> {
        self.send_control(|c| async move { c.set_active_context(context).await })
            .await
    }

    async fn send_control<F, Fut>(&self, send: F) -> MnemaResult<()>
    where
        F: FnOnce(SchedulerHandle) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let handle = self.control()?;
        if send(handle).await {
            Ok(())
        } else {
            Err(MnemaError::validation("scheduler control channel closed"))
        }
    }

    // -- internals -----------------------------------------------------------

    /// Synchronous trigger evaluation after a mutation. Firings enqueue or
    /// re-prioritize tasks only.
    fn evaluate_and_queue(&self, endpoints: &[Uuid]) -> MnemaResult<()> {
        for (target, trigger) in self.tracker.evaluate_endpoints(&self.store, endpoints)? {
            let task = ResearchTask::deepening(target, trigger);
            let (task_id, inserted) = self.queue.submit(task);
            tracing::debug!(
                target: "mnema::maturity",
                node = %target,
                trigger = trigger.label(),
                task = %task_id,
                inserted,
                "TRIGGER deepening proposed"
            );
        }
        Ok(())
    }

    /// Match a free-text reference against the graph: a node id, a live
    /// participant's name, or a live milestone's title.
    fn resolve_reference_target(
        &self,
        reference: &str,
    ) -> MnemaResult<Option<(Uuid, NodeKind)>> {
        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        if let Ok(id) = trimmed.parse::<Uuid>() {
            if let Some(node) = self.store.get_node(&id)? {
                let head = self.store.resolve_head(&node.id)?;
                return Ok(Some((head, node.kind)));
            }
        }
        let wanted = trimmed.to_lowercase();
        for participant in self.store.nodes_of_kind(NodeKind::Participant)? {
            if participant.archived {
                continue;
            }
            if let NodePayload::Participant { name, .. } = &participant.payload {
                if name.to_lowercase() == wanted {
                    return Ok(Some((participant.id, NodeKind::Participant)));
                }
            }
        }
        for milestone in self.store.nodes_of_kind(NodeKind::Milestone)? {
            if milestone.archived {
                continue;
            }
            if let NodePayload::Milestone { title, .. } = &milestone.payload {
                if title.to_lowercase() == wanted {
                    return Ok(Some((milestone.id, NodeKind::Milestone)));
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MnemaConfig;
    use crate::retrieval::create_similarity_search;

    fn service_in(dir: &tempfile::TempDir) -> MemoryService {
        let config = MnemaConfig::default();
        let store = Arc::new(GraphStore::open_path(dir.path()).unwrap());
        let search = create_similarity_search(&config.similarity, store.clone());
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            search,
            config.retrieval.clone(),
        ));
        MemoryService::new(
            store,
            Arc::new(TaskQueue::new()),
            retrieval,
            ActivityTracker::new(),
            &config,
        )
    }

    #[test]
    fn observation_refs_become_edges_when_resolvable() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let mira = service.add_participant("Mira", "friend", "").unwrap();

        let obs = service
            .append_observation(
                "Mira is planning a move to the coast",
                "conversation",
                vec!["Mira".into(), "the coast house".into()],
            )
            .unwrap();

        let store = service.store();
        let snapshot = store.snapshot().unwrap();
        let about = snapshot
            .neighbors_along(&obs, &[EdgeKind::About])
            .into_iter()
            .any(|(_, other, _)| other == mira);
        assert!(about);

        // The unresolvable ref stays embedded for the harvester.
        let node = store.require_node(&obs).unwrap();
        assert!(node
            .payload
            .embedded_refs()
            .contains(&"the coast house".to_string()));
    }

    #[test]
    fn explicit_deepening_request_is_pre_approved() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let obs = service
            .append_observation("a thing worth deepening", "note", Vec::new())
            .unwrap();

        service.request_deepening(obs).unwrap();
        let snap = service.queue_snapshot(10);
        assert_eq!(snap.total, 1);
        assert!(snap.pending[0].approved);
    }

    #[tokio::test]
    async fn control_calls_fail_before_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(&dir);
        let err = service.pause().await;
        assert!(matches!(err, Err(MnemaError::Validation { .. })));
    }
}
