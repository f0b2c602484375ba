//! mnema-core: memory substrate for a long-lived personal agent.
//!
//! A journal-backed typed graph holds everything the agent knows; retrieval
//! walks it with a novelty bound; the maturity layer deepens concepts as
//! evidence accumulates; the autonomous scheduler does research between
//! conversations. The daemon and other surfaces consume this one crate.

mod config;
mod error;
mod generation;
mod graph;
mod maturity;
mod retrieval;
mod scheduler;
mod service;

// Errors
pub use error::{MnemaError, MnemaResult};

// Configuration (TOML file + MNEMA__ environment overrides)
pub use config::{
    DepthWeights, EdgeWeights, GenerationConfig, MaturityConfig, MnemaConfig, PriorityWeights,
    RetrievalConfig, SchedulerConfig, SimilarityConfig, StoreConfig,
};

// Graph substrate: typed nodes and edges, version chains, the append-only
// journal, and the sled index materialized from it
pub use graph::{
    now_ms, rfc3339_of_ms, EdgeKind, EdgeRecord, EdgeSpec, GraphSnapshot, GraphStore,
    MaturityRecord, MutationEntry, MutationJournal, NodeKind, NodePayload, NodeRecord,
    SynthesisEntry, REFERENCE_CATEGORY,
};

// Retrieval: similarity entry points + novelty-bounded traversal
pub use retrieval::{
    create_similarity_search, lexical_similarity, ContextBundle, ContextItem, GatherSpec,
    LexicalSimilarity, ProvenanceStep, RetrievalEngine, RetrievalSeed, SimilarityHit,
    SimilaritySearch,
};

// Text generation bridge (OpenRouter; mock backend for offline runs)
pub use generation::{
    create_generation_service, GenerationService, MockGeneration, OpenRouterGeneration,
};

// Concept maturity: trigger tracking and resynthesis
pub use maturity::{DeepeningTrigger, MaturityTracker, ResynthesisEngine, ResynthesisReport};

// Autonomous research scheduler
pub use scheduler::{
    condition_satisfied, extract_open_questions, find_sparse_regions, fingerprint,
    harvest_unresolved_references, init_scheduler_loop, reference_resolves, ActivityTracker,
    AutonomousScheduler, ControlMessage, CycleReport, PendingTask, PriorityEngine,
    PriorityFactors, QueueSnapshot, ResearchTask, SchedulerHandle, SchedulerMode, SchedulerPulse,
    StatusCounts, TaskKind, TaskQueue, TaskReport, TaskStatus, CONTEXT_MULTIPLIER,
    UNBLOCK_MULTIPLIER,
};

// Front door for conversational surfaces
pub use service::MemoryService;
