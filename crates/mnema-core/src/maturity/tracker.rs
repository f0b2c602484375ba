//! Deepening triggers.
//!
//! Concept nodes accumulate connection counters as edges land. The tracker
//! turns counter state, neighbor resyntheses, and quiet-but-referenced decay
//! into deepening candidates. It proposes work; the scheduler decides when
//! any of it runs.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MaturityConfig;
use crate::error::MnemaResult;
use crate::graph::{now_ms, EdgeKind, GraphSnapshot, GraphStore};

/// Why a concept became a deepening candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeepeningTrigger {
    /// Connection counter crossed the threshold.
    ConnectionGrowth,
    /// A directly-linked concept just completed a resynthesis.
    Propagation,
    /// Long-quiet concept that other material keeps pointing at.
    Decay,
    /// Requested through the control surface.
    Explicit,
}

impl DeepeningTrigger {
    pub fn label(&self) -> &'static str {
        match self {
            DeepeningTrigger::ConnectionGrowth => "connection_growth",
            DeepeningTrigger::Propagation => "propagation",
            DeepeningTrigger::Decay => "decay",
            DeepeningTrigger::Explicit => "explicit",
        }
    }

    /// Starting priority for a task proposed under this trigger. The
    /// scheduler rescoring can only raise it.
    pub fn base_priority(&self) -> f32 {
        match self {
            DeepeningTrigger::Explicit => 0.9,
            DeepeningTrigger::ConnectionGrowth => 0.7,
            DeepeningTrigger::Decay => 0.6,
            DeepeningTrigger::Propagation => 0.55,
        }
    }
}

pub struct MaturityTracker {
    config: MaturityConfig,
}

impl MaturityTracker {
    pub fn new(config: MaturityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MaturityConfig {
        &self.config
    }

    /// Evaluate one node against the counter and decay conditions. Resolves
    /// to the chain head first; superseded, archived, and non-concept nodes
    /// never trigger.
    pub fn evaluate(&self, store: &GraphStore, id: &Uuid) -> MnemaResult<Option<DeepeningTrigger>> {
        let Some(node) = store.get_node(id)? else {
            return Ok(None);
        };
        let head_id = store.resolve_head(&node.id)?;
        let Some(head) = store.get_node(&head_id)? else {
            return Ok(None);
        };
        if head.archived || !head.kind.is_concept() {
            return Ok(None);
        }
        let Some(maturity) = head.maturity.as_ref() else {
            return Ok(None);
        };

        if maturity.connections_added_since_last_synthesis >= self.config.connection_threshold {
            return Ok(Some(DeepeningTrigger::ConnectionGrowth));
        }

        let anchor = maturity.last_deepened_ms.unwrap_or(head.created_at_ms);
        let quiet_ms = now_ms().saturating_sub(anchor);
        if quiet_ms >= self.config.decay_window_ms()
            && store.semantic_in_degree(&head_id)? >= self.config.incoming_floor as usize
        {
            return Ok(Some(DeepeningTrigger::Decay));
        }
        Ok(None)
    }

    /// Evaluate the endpoints touched by a write. Duplicate heads collapse
    /// to one candidate each.
    pub fn evaluate_endpoints(
        &self,
        store: &GraphStore,
        endpoints: &[Uuid],
    ) -> MnemaResult<Vec<(Uuid, DeepeningTrigger)>> {
        let mut seen = std::collections::HashSet::new();
        let mut fired = Vec::new();
        for id in endpoints {
            if store.get_node(id)?.is_none() {
                continue;
            }
            let head = store.resolve_head(id)?;
            if !seen.insert(head) {
                continue;
            }
            if let Some(trigger) = self.evaluate(store, &head)? {
                fired.push((head, trigger));
            }
        }
        Ok(fired)
    }

    /// Snapshot-wide sweep used by the scheduler's source refresh. Picks up
    /// both counter crossings and decay, so triggers missed at write time
    /// (a hand-edited journal, a config change) still surface.
    pub fn sweep(&self, snapshot: &GraphSnapshot) -> Vec<(Uuid, DeepeningTrigger)> {
        let semantic: Vec<EdgeKind> = EdgeKind::all()
            .into_iter()
            .filter(|k| k.is_semantic())
            .collect();
        let now = now_ms();
        let mut fired = Vec::new();
        for node in snapshot.iter_nodes() {
            if node.archived || !node.kind.is_concept() || !snapshot.is_head(&node.id) {
                continue;
            }
            let Some(maturity) = node.maturity.as_ref() else {
                continue;
            };
            if maturity.connections_added_since_last_synthesis >= self.config.connection_threshold
            {
                fired.push((node.id, DeepeningTrigger::ConnectionGrowth));
                continue;
            }
            let anchor = maturity.last_deepened_ms.unwrap_or(node.created_at_ms);
            let in_degree = snapshot
                .neighbors_along(&node.id, &semantic)
                .iter()
                .filter(|(_, _, forward)| !forward)
                .count();
            if now.saturating_sub(anchor) >= self.config.decay_window_ms()
                && in_degree >= self.config.incoming_floor as usize
            {
                fired.push((node.id, DeepeningTrigger::Decay));
            }
        }
        fired.sort_by_key(|(id, _)| *id);
        fired
    }

    /// One-hop propagation after a completed resynthesis: concept heads
    /// linked to any version in the origin's chain become candidates. The
    /// single hop keeps a deepening from cascading across the graph.
    pub fn propagation_targets(&self, snapshot: &GraphSnapshot, origin: &Uuid) -> Vec<Uuid> {
        let chain: std::collections::HashSet<Uuid> =
            snapshot.chain_of(origin).into_iter().collect();
        let semantic: Vec<EdgeKind> = EdgeKind::all()
            .into_iter()
            .filter(|k| k.is_semantic())
            .collect();
        let mut targets = std::collections::HashSet::new();
        for member in &chain {
            for (_edge, other, _forward) in snapshot.neighbors_along(member, &semantic) {
                if chain.contains(&other) {
                    continue;
                }
                let head = snapshot.resolve_head(&other);
                let Some(node) = snapshot.node(&head) else {
                    continue;
                };
                if node.archived || !node.kind.is_concept() {
                    continue;
                }
                targets.insert(head);
            }
        }
        let mut out: Vec<Uuid> = targets.into_iter().collect();
        out.sort();
        out
    }
}
