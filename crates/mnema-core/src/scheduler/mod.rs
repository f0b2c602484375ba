//! Autonomous research: task queue, priority scoring, task sources, and the
//! scheduler loop that drives background cycles.

mod engine;
mod priority;
mod queue;
mod report;
mod sources;
mod task;

pub use engine::{
    init_scheduler_loop, ActivityTracker, AutonomousScheduler, ControlMessage, SchedulerHandle,
    SchedulerMode, SchedulerPulse,
};
pub use priority::{PriorityEngine, PriorityFactors, CONTEXT_MULTIPLIER, UNBLOCK_MULTIPLIER};
pub use queue::{PendingTask, QueueSnapshot, StatusCounts, TaskQueue};
pub use report::{CycleReport, TaskReport};
pub use sources::{
    condition_satisfied, extract_open_questions, find_sparse_regions,
    harvest_unresolved_references, reference_resolves,
};
pub use task::{fingerprint, ResearchTask, TaskKind, TaskStatus};
