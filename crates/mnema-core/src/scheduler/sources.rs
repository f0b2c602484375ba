//! Task sources: where autonomous work comes from.
//!
//! Each cycle re-derives proposals from the graph itself. Three sources live
//! here; deepening proposals come from the maturity tracker's sweep.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::error::MnemaResult;
use crate::graph::{GraphSnapshot, GraphStore, NodeKind, NodePayload};

use super::task::{fingerprint, ResearchTask, TaskKind};

/// Sentence-shaped questions inside reflective content. Capitalized start,
/// no internal sentence breaks, 8 to 200 chars before the question mark.
static QUESTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Z][^.?!\n]{8,200}\?").expect("question pattern compiles"));

const SPARSE_REGION_LIMIT: usize = 5;

fn is_live_head(snapshot: &GraphSnapshot, id: &Uuid) -> bool {
    snapshot
        .node(id)
        .map(|n| !n.archived && snapshot.is_head(id))
        .unwrap_or(false)
}

/// References mentioned by live nodes that no graph entity answers to.
pub fn harvest_unresolved_references(snapshot: &GraphSnapshot) -> Vec<ResearchTask> {
    let mut tasks = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut heads: Vec<&Uuid> = snapshot
        .iter_nodes()
        .map(|n| &n.id)
        .filter(|id| is_live_head(snapshot, id))
        .collect();
    heads.sort();

    for id in heads {
        let Some(node) = snapshot.node(id) else {
            continue;
        };
        for reference in node.payload.embedded_refs() {
            let trimmed = reference.trim();
            if trimmed.is_empty() || reference_resolves(snapshot, trimmed) {
                continue;
            }
            if seen.insert(fingerprint(trimmed)) {
                tasks.push(ResearchTask::resolve_reference(*id, trimmed));
            }
        }
    }
    tasks
}

/// Whether some graph entity answers to `reference`: a node id, a participant
/// name, a milestone title, or an already-materialized reference stub.
pub fn reference_resolves(snapshot: &GraphSnapshot, reference: &str) -> bool {
    if let Ok(id) = reference.parse::<Uuid>() {
        if snapshot.contains(&id) {
            return true;
        }
    }
    let wanted = reference.to_lowercase();
    snapshot.iter_nodes().any(|node| {
        if node.archived {
            return false;
        }
        match &node.payload {
            NodePayload::Participant { name, .. } => name.to_lowercase() == wanted,
            NodePayload::Milestone { title, .. } => title.to_lowercase() == wanted,
            NodePayload::Observation {
                category,
                source_refs,
                ..
            } if category == crate::graph::REFERENCE_CATEGORY => source_refs
                .iter()
                .any(|r| r.to_lowercase() == wanted),
            _ => false,
        }
    })
}

/// Questions posed in reflective content that nothing has answered yet.
pub fn extract_open_questions(
    store: &GraphStore,
    snapshot: &GraphSnapshot,
) -> MnemaResult<Vec<ResearchTask>> {
    let mut tasks = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut heads: Vec<&Uuid> = snapshot
        .iter_nodes()
        .filter(|n| n.kind.is_reflective())
        .map(|n| &n.id)
        .filter(|id| is_live_head(snapshot, id))
        .collect();
    heads.sort();

    for id in heads {
        let Some(node) = snapshot.node(id) else {
            continue;
        };
        for found in QUESTION_RE.find_iter(node.content_text()) {
            let question = found.as_str().trim();
            let print = fingerprint(question);
            if store.is_question_answered(&print)? {
                continue;
            }
            if seen.insert(print) {
                tasks.push(ResearchTask::open_question(*id, question));
            }
        }
    }
    Ok(tasks)
}

/// Under-connected live nodes, worst first. Quiet until the graph has enough
/// structure for "sparse" to mean anything.
pub fn find_sparse_regions(snapshot: &GraphSnapshot) -> Vec<ResearchTask> {
    let mean = snapshot.mean_degree();
    if mean < 1.0 {
        return Vec::new();
    }
    let threshold = mean * 0.5;
    let mut sparse: Vec<(usize, Uuid)> = snapshot
        .iter_nodes()
        .filter(|n| {
            !matches!(n.kind, NodeKind::ResearchTask | NodeKind::CognitiveSnapshot)
                && is_live_head(snapshot, &n.id)
        })
        .map(|n| (snapshot.degree(&n.id), n.id))
        .filter(|(degree, _)| (*degree as f32) < threshold)
        .collect();
    sparse.sort();
    sparse
        .into_iter()
        .take(SPARSE_REGION_LIMIT)
        .map(|(_, id)| ResearchTask::explore_region(id))
        .collect()
}

/// True when the condition a task was proposed for no longer holds, so the
/// task can be discarded before selection.
pub fn condition_satisfied(
    task: &ResearchTask,
    store: &GraphStore,
    snapshot: &GraphSnapshot,
) -> MnemaResult<bool> {
    match task.kind {
        TaskKind::ResolveReference => Ok(task
            .target_ref
            .as_deref()
            .map(|r| reference_resolves(snapshot, r))
            .unwrap_or(true)),
        TaskKind::OpenQuestion => match task.target_ref.as_deref() {
            Some(question) => store.is_question_answered(&fingerprint(question)),
            None => Ok(true),
        },
        TaskKind::Deepening => {
            let Some(target) = task.target_id else {
                return Ok(true);
            };
            let head = snapshot.resolve_head(&target);
            let Some(node) = snapshot.node(&head) else {
                return Ok(true);
            };
            if node.archived {
                return Ok(true);
            }
            let deepened_since = node
                .maturity
                .as_ref()
                .and_then(|m| m.last_deepened_ms)
                .map(|ms| ms >= task.created_at_ms)
                .unwrap_or(false);
            Ok(deepened_since)
        }
        TaskKind::ExploreRegion => {
            let Some(target) = task.target_id else {
                return Ok(true);
            };
            let head = snapshot.resolve_head(&target);
            if !snapshot.contains(&head) {
                return Ok(true);
            }
            let mean = snapshot.mean_degree();
            Ok(mean >= 1.0 && snapshot.degree(&head) as f32 >= mean * 0.5)
        }
    }
}
