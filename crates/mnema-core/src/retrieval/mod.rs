//! Retrieval: similarity entry points plus adaptive graph traversal.

mod engine;
mod similarity;

pub use engine::{
    ContextBundle, ContextItem, GatherSpec, ProvenanceStep, RetrievalEngine, RetrievalSeed,
};
pub use similarity::{
    create_similarity_search, lexical_similarity, LexicalSimilarity, SimilarityHit,
    SimilaritySearch,
};
