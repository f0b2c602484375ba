//! Resynthesis: regenerating a concept with its accumulated context.
//!
//! A pass gathers context around the concept, asks the generation backend
//! for a deepened rendering, validates the candidate, and commits it as a
//! new version linked to its predecessor with SUPERSEDES. The predecessor's
//! version is re-checked at commit; a foreground edit that landed in between
//! gets exactly one retry against a fresh read before the error surfaces.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::MaturityConfig;
use crate::error::{MnemaError, MnemaResult};
use crate::generation::GenerationService;
use crate::graph::{now_ms, GraphSnapshot, GraphStore, NodePayload, NodeRecord};
use crate::maturity::tracker::DeepeningTrigger;
use crate::retrieval::{RetrievalEngine, RetrievalSeed};

/// Synthesis passes at which the synthesis component of the depth score
/// saturates.
const LEVEL_CAP: u32 = 10;
/// Distinct chain neighbors at which the density component saturates.
const DENSITY_CAP: usize = 20;
/// Distinct neighbor domains at which the cross-domain component saturates.
const CROSS_DOMAIN_CAP: usize = 6;

/// Floor on candidate length. Anything shorter is a refusal or a fragment,
/// not a deepening.
const MIN_CANDIDATE_CHARS: usize = 40;

/// Prompt context cap handed to the generation backend.
const CONTEXT_CHAR_BUDGET: usize = 6_000;

const DEEPENING_SYSTEM_PROMPT: &str = "You are the reflective voice of a personal memory \
    system. You are given one stored entry and the material connected to it. Rewrite the \
    entry as a deeper version of itself: keep its subject and stance, fold in what the \
    connected material shows, and name the through-line rather than listing sources. \
    Output only the rewritten entry text.";

/// What a completed pass produced.
#[derive(Debug, Clone)]
pub struct ResynthesisReport {
    pub new_node_id: Uuid,
    pub superseded_id: Uuid,
    pub trigger: DeepeningTrigger,
    pub level: u32,
    pub depth_score: f32,
    pub connection_count: u32,
    pub context_size: usize,
}

pub struct ResynthesisEngine {
    store: Arc<GraphStore>,
    retrieval: Arc<RetrievalEngine>,
    generation: Arc<dyn GenerationService>,
    config: MaturityConfig,
    timeout: Duration,
}

impl ResynthesisEngine {
    pub fn new(
        store: Arc<GraphStore>,
        retrieval: Arc<RetrievalEngine>,
        generation: Arc<dyn GenerationService>,
        config: MaturityConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            retrieval,
            generation,
            config,
            timeout,
        }
    }

    /// Run one deepening pass over the chain containing `target`.
    pub async fn execute(
        &self,
        target: Uuid,
        trigger: DeepeningTrigger,
    ) -> MnemaResult<ResynthesisReport> {
        let head_id = self.store.resolve_head(&target)?;
        let node = self.store.require_node(&head_id)?;
        if !node.kind.is_concept() {
            return Err(MnemaError::validation(format!(
                "{} node {} is not a concept and cannot be resynthesized",
                node.kind.label(),
                head_id
            )));
        }
        if node.archived {
            return Err(MnemaError::validation(format!(
                "node {} is archived",
                head_id
            )));
        }
        let started_version = node.version;

        let spec = self.retrieval.default_spec();
        let bundle = self
            .retrieval
            .gather_context(RetrievalSeed::Node(head_id), &spec)
            .await?;
        let context_size = bundle.len();

        let prompt = build_deepening_prompt(&node, &bundle.render_prompt_context(CONTEXT_CHAR_BUDGET));
        let raw = match tokio::time::timeout(
            self.timeout,
            self.generation.generate(DEEPENING_SYSTEM_PROMPT, &prompt),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                return Err(MnemaError::generation(format!("deepening failed: {}", e)));
            }
            Err(_) => {
                return Err(MnemaError::generation(format!(
                    "deepening timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };
        let candidate = validate_candidate(&raw)?;

        match self.commit_successor(&head_id, started_version, &candidate, trigger, context_size) {
            Err(MnemaError::ConcurrentModification { .. }) => {
                // One retry with a fresh read. The regenerated text is kept;
                // the re-read protects the chain and maturity state.
                tracing::warn!(
                    target: "mnema::maturity",
                    node_id = %head_id,
                    "version moved during deepening, retrying with fresh read"
                );
                let fresh_head = self.store.resolve_head(&head_id)?;
                let fresh = self.store.require_node(&fresh_head)?;
                self.commit_successor(&fresh_head, fresh.version, &candidate, trigger, context_size)
            }
            other => other,
        }
    }

    fn commit_successor(
        &self,
        head_id: &Uuid,
        expected_version: u64,
        content: &str,
        trigger: DeepeningTrigger,
        context_size: usize,
    ) -> MnemaResult<ResynthesisReport> {
        let node = self.store.require_node(head_id)?;
        let payload = node.payload.with_content(content);

        let mut maturity = node.maturity.clone().unwrap_or_default();
        let previous_score = maturity.depth_score;
        let connection_count = maturity.connections_added_since_last_synthesis;
        maturity.record_synthesis(trigger.label(), connection_count, now_ms());

        let snapshot = self.store.snapshot()?;
        maturity.depth_score =
            self.compute_depth_score(&snapshot, head_id, maturity.level, previous_score, content);

        let level = maturity.level;
        let depth_score = maturity.depth_score;
        let new_node_id =
            self.store
                .create_successor(*head_id, expected_version, payload, maturity)?;

        tracing::info!(
            target: "mnema::maturity",
            node_id = %new_node_id,
            superseded = %head_id,
            trigger = trigger.label(),
            level,
            depth_score,
            "resynthesis complete"
        );
        Ok(ResynthesisReport {
            new_node_id,
            superseded_id: *head_id,
            trigger,
            level,
            depth_score,
            connection_count,
            context_size,
        })
    }

    /// Weighted blend of synthesis count, connection density, reflective
    /// markers, and cross-domain spread, floored at the previous score so
    /// depth never moves backwards across a successful pass.
    fn compute_depth_score(
        &self,
        snapshot: &GraphSnapshot,
        head_id: &Uuid,
        level: u32,
        previous_score: f32,
        content: &str,
    ) -> f32 {
        let w = &self.config.depth_weights;
        let (neighbors, domains) = snapshot.chain_neighbor_stats(head_id);
        let synthesis = (level as f32 / LEVEL_CAP as f32).min(1.0);
        let density = (neighbors as f32 / DENSITY_CAP as f32).min(1.0);
        let reflective = reflective_marker_score(content);
        let cross_domain = (domains as f32 / CROSS_DOMAIN_CAP as f32).min(1.0);
        let fresh = (w.synthesis * synthesis
            + w.density * density
            + w.reflective * reflective
            + w.cross_domain * cross_domain)
            .clamp(0.0, 1.0);
        fresh.max(previous_score)
    }
}

/// Keyword score for reflective texture: integration language, explicit
/// revision, named tension. Plain restatements stay low.
fn reflective_marker_score(content: &str) -> f32 {
    let haystack = content.to_lowercase();
    let mut score: f32 = 0.2;
    const MARKERS: [&str; 12] = [
        "because",
        "which suggests",
        "pattern",
        "tension",
        "originally",
        "at first",
        "over time",
        "learned",
        "revis",
        "in contrast",
        "connects to",
        "deepens",
    ];
    for marker in MARKERS {
        if haystack.contains(marker) {
            score += 0.1;
        }
    }
    score.clamp(0.0, 1.0)
}

pub(crate) fn validate_candidate(raw: &str) -> MnemaResult<String> {
    let mut text = raw.trim();
    // Backends sometimes wrap output in a code fence despite instructions.
    if text.starts_with("```") {
        text = text
            .trim_start_matches(|c| c != '\n')
            .trim_start_matches('\n')
            .trim_end_matches('`')
            .trim();
    }
    if text.is_empty() {
        return Err(MnemaError::validation("deepening candidate is empty"));
    }
    if text.len() < MIN_CANDIDATE_CHARS {
        return Err(MnemaError::validation(format!(
            "deepening candidate too short ({} chars)",
            text.len()
        )));
    }
    Ok(text.to_string())
}

fn build_deepening_prompt(node: &NodeRecord, context: &str) -> String {
    let revisions = node
        .maturity
        .as_ref()
        .map(|m| m.level)
        .unwrap_or(0);
    let mut prompt = format!(
        "Current entry ({}, revised {} time(s)):\n{}\n",
        node.kind.label(),
        revisions,
        node.content_text().trim()
    );
    if context.is_empty() {
        prompt.push_str("\nNo connected material was found; deepen from the entry alone.\n");
    } else {
        prompt.push_str("\nConnected material:\n");
        prompt.push_str(context);
    }
    if let NodePayload::Opinion { stance, .. } = &node.payload {
        prompt.push_str(&format!("\nKeep the stance: {}.\n", stance));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflective_markers_raise_the_score() {
        let flat = reflective_marker_score("the sky is blue");
        let marked = reflective_marker_score(
            "At first this read as a one-off, but over time a pattern emerged, \
             which suggests the original note understated it.",
        );
        assert!(marked > flat);
        assert!(flat < 0.4);
    }

    #[test]
    fn candidate_validation_rejects_fragments() {
        assert!(validate_candidate("").is_err());
        assert!(validate_candidate("   \n ").is_err());
        assert!(validate_candidate("too short").is_err());
        assert!(validate_candidate(
            "A full sentence that carries enough material to stand as a deepened entry."
        )
        .is_ok());
    }

    #[test]
    fn candidate_validation_strips_code_fences() {
        let fenced = "```\nA full sentence that carries enough material to stand as a \
                      deepened entry.\n```";
        let cleaned = validate_candidate(fenced).unwrap();
        assert!(!cleaned.contains("```"));
        assert!(cleaned.starts_with("A full sentence"));
    }
}
