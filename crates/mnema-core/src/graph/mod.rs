//! Graph substrate: typed nodes and edges, the append-only journal, and the
//! sled-backed store that materializes it.

mod edge;
mod journal;
mod node;
mod store;

pub use edge::{EdgeKind, EdgeRecord};
pub use journal::{MutationEntry, MutationJournal};
pub use node::{
    now_ms, rfc3339_of_ms, MaturityRecord, NodeKind, NodePayload, NodeRecord, SynthesisEntry,
    REFERENCE_CATEGORY,
};
pub use store::{
    EdgeSpec, GraphSnapshot, GraphStore, INDEX_DIR, JOURNAL_FILE, KEY_IN_PREFIX, KEY_KIND_PREFIX,
    KEY_OUT_PREFIX, KEY_QUESTION_PREFIX, TREE_ADJACENCY, TREE_EDGES, TREE_KIND_INDEX, TREE_META,
    TREE_NODES, TREE_RESEARCH_META,
};
