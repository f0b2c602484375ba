//! Similarity-search seam.
//!
//! Free-text retrieval entry points come from a [`SimilaritySearch`]
//! implementation. The built-in backend scores lexical overlap against node
//! contents held in the store; a heavier embedding index can sit behind the
//! same trait without touching the traversal code.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::SimilarityConfig;
use crate::error::MnemaResult;
use crate::graph::GraphStore;

#[derive(Debug, Clone)]
pub struct SimilarityHit {
    pub node_id: Uuid,
    pub score: f32,
}

#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    /// True when the backing index is reachable.
    async fn is_available(&self) -> bool;

    /// Rank stored nodes against a free-text query, best first. An
    /// unavailable backend errors rather than returning a partial answer.
    async fn search(&self, query: &str, limit: usize) -> MnemaResult<Vec<SimilarityHit>>;

    /// Human-readable backend description for logs and status surfaces.
    fn status(&self) -> String;
}

/// Lexical token overlap between two texts, in [0, 1]. Identical token sets
/// score 1.0; disjoint sets score 0.0. Also used by the traversal engine as
/// the novelty metric: novelty of a candidate is one minus its best overlap
/// with already-collected content.
pub fn lexical_similarity(a: &str, b: &str) -> f32 {
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f32 / union as f32
    }
}

/// Lowercased alphanumeric tokens of three or more characters. The length
/// floor drops most stopwords without a word list.
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Built-in backend: ranks live chain-head nodes by lexical overlap with the
/// query. Always available since it reads the local store.
pub struct LexicalSimilarity {
    store: Arc<GraphStore>,
}

impl LexicalSimilarity {
    pub fn new(store: Arc<GraphStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SimilaritySearch for LexicalSimilarity {
    async fn is_available(&self) -> bool {
        true
    }

    async fn search(&self, query: &str, limit: usize) -> MnemaResult<Vec<SimilarityHit>> {
        let snapshot = self.store.snapshot()?;
        let mut hits: Vec<SimilarityHit> = snapshot
            .iter_nodes()
            .filter(|n| !n.archived && snapshot.is_head(&n.id))
            .filter_map(|n| {
                let score = lexical_similarity(query, n.content_text());
                (score > 0.0).then_some(SimilarityHit {
                    node_id: n.id,
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        hits.truncate(limit);
        tracing::debug!(
            target: "mnema::retrieval",
            query_len = query.len(),
            hits = hits.len(),
            "lexical similarity search"
        );
        Ok(hits)
    }

    fn status(&self) -> String {
        "lexical overlap over local store".to_string()
    }
}

/// Build the similarity backend named by the config. Unknown modes fall back
/// to the lexical backend with a warning.
pub fn create_similarity_search(
    config: &SimilarityConfig,
    store: Arc<GraphStore>,
) -> Arc<dyn SimilaritySearch> {
    match config.mode.as_str() {
        "lexical" => {
            tracing::info!(target: "mnema::retrieval", "similarity backend: lexical");
            Arc::new(LexicalSimilarity::new(store))
        }
        other => {
            tracing::warn!(
                target: "mnema::retrieval",
                mode = other,
                "unknown similarity mode, using lexical backend"
            );
            Arc::new(LexicalSimilarity::new(store))
        }
    }
}
