//! Adaptive context gathering.
//!
//! A gather starts from a node or a free-text query, walks the graph
//! breadth-first over a snapshot, and scores every candidate by edge weight,
//! time decay, and novelty against what has already been collected. A branch
//! stops expanding once its novelty falls under the floor, so near-duplicate
//! chains cost one node instead of a subtree. Traversal never mutates the
//! graph.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RetrievalConfig;
use crate::error::{MnemaError, MnemaResult};
use crate::graph::{EdgeKind, GraphSnapshot, GraphStore, NodeRecord};
use crate::retrieval::similarity::{lexical_similarity, SimilaritySearch};

/// Share of the composite score carried by time decay versus novelty. Edge
/// weight scales the blend.
const DECAY_SHARE: f32 = 0.4;
const NOVELTY_SHARE: f32 = 0.6;

/// Where a gather starts.
#[derive(Debug, Clone)]
pub enum RetrievalSeed {
    /// Expand outward from one known node.
    Node(Uuid),
    /// Rank entry points with the similarity backend, then expand from each.
    Query(String),
}

/// Tunable bounds for one gather. Defaults come from the retrieval config.
#[derive(Debug, Clone)]
pub struct GatherSpec {
    pub edge_kinds: Vec<EdgeKind>,
    pub max_depth: usize,
    pub novelty_floor: f32,
    pub node_budget: usize,
}

impl GatherSpec {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            edge_kinds: EdgeKind::all().to_vec(),
            max_depth: config.max_depth,
            novelty_floor: config.novelty_floor,
            node_budget: config.node_budget,
        }
    }

    pub fn with_edge_kinds(mut self, kinds: Vec<EdgeKind>) -> Self {
        self.edge_kinds = kinds;
        self
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_node_budget(mut self, budget: usize) -> Self {
        self.node_budget = budget;
        self
    }
}

/// One hop in the path that led to a collected node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceStep {
    pub edge_id: Uuid,
    pub kind: EdgeKind,
    pub from: Uuid,
    pub to: Uuid,
    /// Whether the edge was followed source-to-target.
    pub forward: bool,
}

/// A collected node with its score and the path that reached it. Seed nodes
/// carry an empty path.
#[derive(Debug, Clone)]
pub struct ContextItem {
    pub node: NodeRecord,
    pub score: f32,
    pub novelty: f32,
    pub depth: usize,
    pub path: Vec<ProvenanceStep>,
}

/// Result of one gather, ordered best-first by composite score.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    pub seed_ids: Vec<Uuid>,
    pub taken_at_ms: i64,
    /// Set when the node budget cut the walk short.
    pub truncated: bool,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn node_ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|i| i.node.id).collect()
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.items.iter().any(|i| i.node.id == *id)
    }

    /// Flatten the bundle into prompt text, one line per node, capped at
    /// `max_chars`.
    pub fn render_prompt_context(&self, max_chars: usize) -> String {
        let mut rendered = String::new();
        for item in &self.items {
            let line = format!(
                "- [{}] {}\n",
                item.node.kind.label(),
                item.node.content_text().trim()
            );
            if rendered.len() + line.len() > max_chars {
                break;
            }
            rendered.push_str(&line);
        }
        rendered
    }
}

pub struct RetrievalEngine {
    store: Arc<GraphStore>,
    search: Arc<dyn SimilaritySearch>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<GraphStore>,
        search: Arc<dyn SimilaritySearch>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            search,
            config,
        }
    }

    pub fn default_spec(&self) -> GatherSpec {
        GatherSpec::from_config(&self.config)
    }

    /// Gather context for a seed. A node seed that does not exist is
    /// `NotFound`; a query seed with no similarity hits returns an empty
    /// bundle.
    pub async fn gather_context(
        &self,
        seed: RetrievalSeed,
        spec: &GatherSpec,
    ) -> MnemaResult<ContextBundle> {
        let snapshot = self.store.snapshot()?;

        let seeds: Vec<(Uuid, f32)> = match &seed {
            RetrievalSeed::Node(id) => {
                if !snapshot.contains(id) {
                    return Err(MnemaError::not_found(id));
                }
                vec![(*id, 1.0)]
            }
            RetrievalSeed::Query(query) => {
                if !self.search.is_available().await {
                    return Err(MnemaError::retrieval(format!(
                        "similarity backend unavailable: {}",
                        self.search.status()
                    )));
                }
                self.search
                    .search(query, self.config.entry_points)
                    .await?
                    .into_iter()
                    .filter(|hit| snapshot.contains(&hit.node_id))
                    .map(|hit| (hit.node_id, hit.score))
                    .collect()
            }
        };

        let bundle = self.walk(&snapshot, &seeds, spec);
        tracing::debug!(
            target: "mnema::retrieval",
            seeds = seeds.len(),
            collected = bundle.len(),
            truncated = bundle.truncated,
            "context gathered"
        );
        Ok(bundle)
    }

    fn walk(
        &self,
        snapshot: &GraphSnapshot,
        seeds: &[(Uuid, f32)],
        spec: &GatherSpec,
    ) -> ContextBundle {
        let mut items: Vec<ContextItem> = Vec::new();
        let mut collected_texts: Vec<String> = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        let mut frontier: VecDeque<(Uuid, usize, Vec<ProvenanceStep>)> = VecDeque::new();
        let mut truncated = false;
        let mut seed_ids = Vec::new();

        for (seed_id, _seed_score) in seeds {
            if items.len() >= spec.node_budget {
                truncated = true;
                break;
            }
            if !visited.insert(*seed_id) {
                continue;
            }
            let Some(node) = snapshot.node(seed_id) else {
                continue;
            };
            let novelty = novelty_against(&collected_texts, node.content_text());
            // Seeds past the first must still clear the floor, otherwise
            // duplicate entry points collapse into one.
            if !collected_texts.is_empty() && novelty < spec.novelty_floor {
                continue;
            }
            seed_ids.push(*seed_id);
            let decay = self.time_decay(node, snapshot.taken_at_ms);
            let score = DECAY_SHARE * decay + NOVELTY_SHARE * novelty;
            collected_texts.push(node.content_text().to_string());
            items.push(ContextItem {
                node: node.clone(),
                score,
                novelty,
                depth: 0,
                path: Vec::new(),
            });
            frontier.push_back((*seed_id, 0, Vec::new()));
        }

        'walk: while let Some((current, depth, path)) = frontier.pop_front() {
            if depth >= spec.max_depth {
                continue;
            }
            for (edge, other, forward) in snapshot.neighbors_along(&current, &spec.edge_kinds) {
                if visited.contains(&other) {
                    continue;
                }
                let Some(node) = snapshot.node(&other) else {
                    continue;
                };
                if node.archived {
                    continue;
                }
                visited.insert(other);

                let novelty = novelty_against(&collected_texts, node.content_text());
                if novelty < spec.novelty_floor {
                    // Branch cut: the near-duplicate is neither collected nor
                    // expanded.
                    continue;
                }
                if items.len() >= spec.node_budget {
                    truncated = true;
                    break 'walk;
                }

                let decay = self.time_decay(node, snapshot.taken_at_ms);
                let edge_weight = self.config.edge_weights.weight_for(edge.kind);
                let score = edge_weight * (DECAY_SHARE * decay + NOVELTY_SHARE * novelty);

                let mut step_path = path.clone();
                step_path.push(ProvenanceStep {
                    edge_id: edge.id,
                    kind: edge.kind,
                    from: current,
                    to: other,
                    forward,
                });

                collected_texts.push(node.content_text().to_string());
                items.push(ContextItem {
                    node: node.clone(),
                    score,
                    novelty,
                    depth: depth + 1,
                    path: step_path.clone(),
                });
                frontier.push_back((other, depth + 1, step_path));
            }
        }

        items.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.depth.cmp(&b.depth))
                .then_with(|| a.node.id.cmp(&b.node.id))
        });

        ContextBundle {
            items,
            seed_ids,
            taken_at_ms: snapshot.taken_at_ms,
            truncated,
        }
    }

    fn time_decay(&self, node: &NodeRecord, now_ms: i64) -> f32 {
        let half_life = self.config.half_life_days.max(0.1);
        1.0 / (1.0 + node.age_days(now_ms) / half_life)
    }
}

/// One minus the best lexical overlap with already-collected content. An
/// empty collection means full novelty.
fn novelty_against(collected: &[String], candidate: &str) -> f32 {
    let best = collected
        .iter()
        .map(|text| lexical_similarity(text, candidate))
        .fold(0.0f32, f32::max);
    (1.0 - best).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn novelty_is_full_against_empty_collection() {
        assert!((novelty_against(&[], "anything at all") - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn novelty_drops_with_overlap() {
        let collected = vec!["the garden needs water every morning".to_string()];
        let near = novelty_against(&collected, "the garden needs water every single morning");
        let far = novelty_against(&collected, "granite holds heat long after sunset");
        assert!(near < far);
        assert!(near < 0.5);
        assert!((far - 1.0).abs() < f32::EPSILON);
    }
}
