//! Layered configuration.
//!
//! Defaults, then an optional TOML file, then `MNEMA`-prefixed environment
//! variables with `__` as the section separator (`MNEMA_SCHEDULER__MODE`
//! overrides `[scheduler] mode`). Weight tables are renormalized after
//! loading so hand-edited values never have to sum to one.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::graph::EdgeKind;

fn default_data_dir() -> String {
    "./data/mnema".to_string()
}

fn default_max_depth() -> usize {
    3
}

fn default_novelty_floor() -> f32 {
    0.15
}

fn default_node_budget() -> usize {
    40
}

fn default_entry_points() -> usize {
    5
}

fn default_half_life_days() -> f32 {
    30.0
}

fn default_connection_threshold() -> u32 {
    5
}

fn default_decay_window_days() -> u32 {
    7
}

fn default_incoming_floor() -> u32 {
    10
}

fn default_depth_weight() -> f32 {
    0.25
}

fn default_scheduler_mode() -> String {
    "triggered".to_string()
}

fn default_interval_secs() -> u64 {
    300
}

fn default_quiet_threshold_secs() -> u64 {
    60
}

fn default_cycle_time_budget_secs() -> u64 {
    120
}

fn default_max_new_nodes_per_cycle() -> u32 {
    20
}

fn default_max_deepenings_per_node_per_day() -> u32 {
    2
}

fn default_min_resynthesis_interval_hours() -> u64 {
    24
}

fn default_task_timeout_secs() -> u64 {
    90
}

fn default_backoff_base_secs() -> u64 {
    60
}

fn default_backoff_max_secs() -> u64 {
    3600
}

fn default_demote_after_failures() -> u32 {
    3
}

fn default_batch_size() -> usize {
    3
}

fn default_priority_weight() -> f32 {
    1.0 / 6.0
}

fn default_generation_mode() -> String {
    "mock".to_string()
}

fn default_similarity_mode() -> String {
    "lexical".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding the journal and the derived index.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Fsync every journal append. Off by default; flush-only is enough for
    /// a single-user substrate and an order of magnitude faster.
    #[serde(default)]
    pub journal_fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            journal_fsync: false,
        }
    }
}

/// Per-edge-kind traversal weights in [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeWeights {
    pub supersedes: f32,
    pub emerged_from: f32,
    pub evidenced_by: f32,
    pub relates_to: f32,
    pub contradicts: f32,
    pub supports: f32,
    pub about: f32,
    pub participated_in: f32,
    pub contains: f32,
    pub develops: f32,
    pub triggered: f32,
}

impl Default for EdgeWeights {
    fn default() -> Self {
        Self {
            supersedes: 0.4,
            emerged_from: 0.8,
            evidenced_by: 0.8,
            relates_to: 0.9,
            contradicts: 0.85,
            supports: 0.7,
            about: 0.6,
            participated_in: 0.5,
            contains: 0.6,
            develops: 0.7,
            triggered: 0.6,
        }
    }
}

impl EdgeWeights {
    pub fn weight_for(&self, kind: EdgeKind) -> f32 {
        let w = match kind {
            EdgeKind::Supersedes => self.supersedes,
            EdgeKind::EmergedFrom => self.emerged_from,
            EdgeKind::EvidencedBy => self.evidenced_by,
            EdgeKind::RelatesTo => self.relates_to,
            EdgeKind::Contradicts => self.contradicts,
            EdgeKind::Supports => self.supports,
            EdgeKind::About => self.about,
            EdgeKind::ParticipatedIn => self.participated_in,
            EdgeKind::Contains => self.contains,
            EdgeKind::Develops => self.develops,
            EdgeKind::Triggered => self.triggered,
        };
        w.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_novelty_floor")]
    pub novelty_floor: f32,
    #[serde(default = "default_node_budget")]
    pub node_budget: usize,
    /// Similarity hits taken as entry points for a free-text gather.
    #[serde(default = "default_entry_points")]
    pub entry_points: usize,
    /// Age at which a node's time-decay factor reaches one half.
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f32,
    #[serde(default)]
    pub edge_weights: EdgeWeights,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            novelty_floor: default_novelty_floor(),
            node_budget: default_node_budget(),
            entry_points: default_entry_points(),
            half_life_days: default_half_life_days(),
            edge_weights: EdgeWeights::default(),
        }
    }
}

/// Weights of the four depth-score components. Renormalized to sum to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DepthWeights {
    pub synthesis: f32,
    pub density: f32,
    pub reflective: f32,
    pub cross_domain: f32,
}

impl Default for DepthWeights {
    fn default() -> Self {
        Self {
            synthesis: default_depth_weight(),
            density: default_depth_weight(),
            reflective: default_depth_weight(),
            cross_domain: default_depth_weight(),
        }
    }
}

impl DepthWeights {
    pub fn normalize(&mut self) {
        let sum = self.synthesis + self.density + self.reflective + self.cross_domain;
        if !sum.is_finite() || sum <= 0.0 {
            *self = Self::default();
            return;
        }
        self.synthesis /= sum;
        self.density /= sum;
        self.reflective /= sum;
        self.cross_domain /= sum;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaturityConfig {
    /// Connections since the last synthesis that fire the growth trigger.
    #[serde(default = "default_connection_threshold")]
    pub connection_threshold: u32,
    /// Quiet period after which a well-connected concept decays toward a
    /// refresh pass.
    #[serde(default = "default_decay_window_days")]
    pub decay_window_days: u32,
    /// Incoming-edge floor for the decay trigger.
    #[serde(default = "default_incoming_floor")]
    pub incoming_floor: u32,
    #[serde(default)]
    pub depth_weights: DepthWeights,
}

impl Default for MaturityConfig {
    fn default() -> Self {
        Self {
            connection_threshold: default_connection_threshold(),
            decay_window_days: default_decay_window_days(),
            incoming_floor: default_incoming_floor(),
            depth_weights: DepthWeights::default(),
        }
    }
}

impl MaturityConfig {
    pub fn decay_window_ms(&self) -> i64 {
        self.decay_window_days as i64 * 86_400_000
    }
}

/// Weights of the six priority factors. Renormalized to sum to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub curiosity: f32,
    pub connection_potential: f32,
    pub foundation_relevance: f32,
    pub user_relevance: f32,
    pub recency: f32,
    pub graph_balance: f32,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            curiosity: default_priority_weight(),
            connection_potential: default_priority_weight(),
            foundation_relevance: default_priority_weight(),
            user_relevance: default_priority_weight(),
            recency: default_priority_weight(),
            graph_balance: default_priority_weight(),
        }
    }
}

impl PriorityWeights {
    pub fn normalize(&mut self) {
        let sum = self.curiosity
            + self.connection_potential
            + self.foundation_relevance
            + self.user_relevance
            + self.recency
            + self.graph_balance;
        if !sum.is_finite() || sum <= 0.0 {
            *self = Self::default();
            return;
        }
        self.curiosity /= sum;
        self.connection_potential /= sum;
        self.foundation_relevance /= sum;
        self.user_relevance /= sum;
        self.recency /= sum;
        self.graph_balance /= sum;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// One of `continuous`, `batched`, `triggered`, `supervised`.
    #[serde(default = "default_scheduler_mode")]
    pub mode: String,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// How long writes must have been quiet before a continuous-mode cycle
    /// runs.
    #[serde(default = "default_quiet_threshold_secs")]
    pub quiet_threshold_secs: u64,
    #[serde(default = "default_cycle_time_budget_secs")]
    pub cycle_time_budget_secs: u64,
    #[serde(default = "default_max_new_nodes_per_cycle")]
    pub max_new_nodes_per_cycle: u32,
    #[serde(default = "default_max_deepenings_per_node_per_day")]
    pub max_deepenings_per_node_per_day: u32,
    #[serde(default = "default_min_resynthesis_interval_hours")]
    pub min_resynthesis_interval_hours: u64,
    #[serde(default = "default_task_timeout_secs")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Consecutive failures before a task's priority is demoted.
    #[serde(default = "default_demote_after_failures")]
    pub demote_after_failures: u32,
    /// Tasks per cycle in batched mode.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub priority_weights: PriorityWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            mode: default_scheduler_mode(),
            interval_secs: default_interval_secs(),
            quiet_threshold_secs: default_quiet_threshold_secs(),
            cycle_time_budget_secs: default_cycle_time_budget_secs(),
            max_new_nodes_per_cycle: default_max_new_nodes_per_cycle(),
            max_deepenings_per_node_per_day: default_max_deepenings_per_node_per_day(),
            min_resynthesis_interval_hours: default_min_resynthesis_interval_hours(),
            task_timeout_secs: default_task_timeout_secs(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            demote_after_failures: default_demote_after_failures(),
            batch_size: default_batch_size(),
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_secs)
    }

    pub fn quiet_threshold(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.quiet_threshold_secs)
    }

    pub fn task_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cycle_time_budget_ms(&self) -> i64 {
        self.cycle_time_budget_secs as i64 * 1000
    }

    pub fn min_resynthesis_interval_ms(&self) -> i64 {
        self.min_resynthesis_interval_hours as i64 * 3_600_000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// One of `mock`, `openrouter`.
    pub mode: String,
    pub model: Option<String>,
    pub api_base: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            mode: default_generation_mode(),
            model: None,
            api_base: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityConfig {
    /// Currently only `lexical`.
    #[serde(default = "default_similarity_mode")]
    pub mode: String,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            mode: default_similarity_mode(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MnemaConfig {
    pub store: StoreConfig,
    pub retrieval: RetrievalConfig,
    pub maturity: MaturityConfig,
    pub scheduler: SchedulerConfig,
    pub generation: GenerationConfig,
    pub similarity: SimilarityConfig,
}

impl MnemaConfig {
    /// Load configuration from `MNEMA_CONFIG` (default `config/mnema`), then
    /// apply environment overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("MNEMA_CONFIG").unwrap_or_else(|_| "config/mnema".to_string());
        let mut builder = config::Config::builder();
        let file_path = Path::new(&config_path);
        if file_path.exists() || file_path.with_extension("toml").exists() {
            builder = builder.add_source(config::File::from(file_path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("MNEMA").separator("__"))
            .build()?;
        let mut cfg: MnemaConfig = settings.try_deserialize()?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Clamp out-of-range values and renormalize weight tables. Called by
    /// [`MnemaConfig::load`]; hand-built configs in tests can call it too.
    pub fn normalize(&mut self) {
        self.scheduler.interval_secs = self.scheduler.interval_secs.max(30);
        self.scheduler.batch_size = self.scheduler.batch_size.max(1);
        self.retrieval.max_depth = self.retrieval.max_depth.max(1);
        self.retrieval.node_budget = self.retrieval.node_budget.max(1);
        self.retrieval.entry_points = self.retrieval.entry_points.max(1);
        self.retrieval.novelty_floor = self.retrieval.novelty_floor.clamp(0.0, 1.0);
        self.maturity.connection_threshold = self.maturity.connection_threshold.max(1);
        self.maturity.depth_weights.normalize();
        self.scheduler.priority_weights.normalize();
    }

    /// Write the config as pretty TOML, creating parent directories. Used to
    /// seed a starter file on first boot.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = MnemaConfig::default();
        assert_eq!(cfg.retrieval.max_depth, 3);
        assert!((cfg.retrieval.novelty_floor - 0.15).abs() < f32::EPSILON);
        assert_eq!(cfg.retrieval.node_budget, 40);
        assert_eq!(cfg.maturity.connection_threshold, 5);
        assert_eq!(cfg.maturity.decay_window_days, 7);
        assert_eq!(cfg.maturity.incoming_floor, 10);
        assert_eq!(cfg.scheduler.mode, "triggered");
        assert_eq!(cfg.scheduler.max_new_nodes_per_cycle, 20);
        assert_eq!(cfg.scheduler.max_deepenings_per_node_per_day, 2);
        assert_eq!(cfg.scheduler.min_resynthesis_interval_hours, 24);
        assert_eq!(cfg.generation.mode, "mock");
        assert_eq!(cfg.similarity.mode, "lexical");
    }

    #[test]
    fn normalize_clamps_interval_and_weights() {
        let mut cfg = MnemaConfig::default();
        cfg.scheduler.interval_secs = 5;
        cfg.scheduler.priority_weights.curiosity = 3.0;
        cfg.normalize();
        assert_eq!(cfg.scheduler.interval_secs, 30);
        let w = &cfg.scheduler.priority_weights;
        let sum = w.curiosity
            + w.connection_potential
            + w.foundation_relevance
            + w.user_relevance
            + w.recency
            + w.graph_balance;
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(w.curiosity > w.recency);
    }

    #[test]
    fn degenerate_weights_reset_to_defaults() {
        let mut weights = DepthWeights {
            synthesis: 0.0,
            density: 0.0,
            reflective: 0.0,
            cross_domain: 0.0,
        };
        weights.normalize();
        assert!((weights.synthesis - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let cfg = MnemaConfig::default();
        let rendered = toml::to_string_pretty(&cfg).unwrap();
        let parsed: MnemaConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.scheduler.mode, cfg.scheduler.mode);
        assert_eq!(parsed.store.data_dir, cfg.store.data_dir);
    }
}
