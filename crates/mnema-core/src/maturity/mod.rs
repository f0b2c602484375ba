//! Concept maturity: trigger tracking and resynthesis execution.

mod resynthesis;
mod tracker;

pub use resynthesis::{ResynthesisEngine, ResynthesisReport};
pub(crate) use resynthesis::validate_candidate;
pub use tracker::{DeepeningTrigger, MaturityTracker};
