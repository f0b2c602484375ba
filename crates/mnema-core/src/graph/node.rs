//! Typed graph nodes.
//!
//! Every record in the graph is a [`NodeRecord`] carrying a tagged
//! [`NodePayload`]. Concept kinds (observation, opinion, growth edge) also
//! carry a [`MaturityRecord`] that drives the deepening machinery.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MnemaError, MnemaResult};

/// Node kinds understood by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Observation,
    Opinion,
    GrowthEdge,
    Milestone,
    JournalEntry,
    SoloReflection,
    Mark,
    Conversation,
    ConversationMoment,
    Participant,
    CognitiveSnapshot,
    ResearchTask,
}

impl NodeKind {
    #[inline]
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Observation => "observation",
            NodeKind::Opinion => "opinion",
            NodeKind::GrowthEdge => "growth_edge",
            NodeKind::Milestone => "milestone",
            NodeKind::JournalEntry => "journal_entry",
            NodeKind::SoloReflection => "solo_reflection",
            NodeKind::Mark => "mark",
            NodeKind::Conversation => "conversation",
            NodeKind::ConversationMoment => "conversation_moment",
            NodeKind::Participant => "participant",
            NodeKind::CognitiveSnapshot => "cognitive_snapshot",
            NodeKind::ResearchTask => "research_task",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        NodeKind::all().into_iter().find(|k| k.label() == label)
    }

    /// Concept kinds carry maturity records and are eligible for resynthesis.
    #[inline]
    pub fn is_concept(&self) -> bool {
        matches!(
            self,
            NodeKind::Observation | NodeKind::Opinion | NodeKind::GrowthEdge
        )
    }

    /// Kinds whose free text is scanned for open questions.
    #[inline]
    pub fn is_reflective(&self) -> bool {
        matches!(
            self,
            NodeKind::JournalEntry
                | NodeKind::SoloReflection
                | NodeKind::Opinion
                | NodeKind::GrowthEdge
        )
    }

    /// Anchor kinds used when scoring how close a node sits to the agent's
    /// core identity material.
    #[inline]
    pub fn is_foundation(&self) -> bool {
        matches!(self, NodeKind::Participant | NodeKind::Milestone)
    }

    pub fn all() -> [NodeKind; 12] {
        [
            NodeKind::Observation,
            NodeKind::Opinion,
            NodeKind::GrowthEdge,
            NodeKind::Milestone,
            NodeKind::JournalEntry,
            NodeKind::SoloReflection,
            NodeKind::Mark,
            NodeKind::Conversation,
            NodeKind::ConversationMoment,
            NodeKind::Participant,
            NodeKind::CognitiveSnapshot,
            NodeKind::ResearchTask,
        ]
    }
}

fn default_conviction() -> f32 {
    0.5
}

/// Category label for stub observations synthesized while resolving a
/// dangling reference. Nodes in this category are resolution targets, so the
/// reference harvester skips their own `source_refs`.
pub const REFERENCE_CATEGORY: &str = "reference";

/// Kind-specific payload. The `kind` tag keeps journal lines readable and
/// hand-editable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodePayload {
    Observation {
        content: String,
        category: String,
        #[serde(default)]
        source_refs: Vec<String>,
    },
    Opinion {
        content: String,
        stance: String,
        #[serde(default = "default_conviction")]
        conviction: f32,
    },
    GrowthEdge {
        content: String,
        #[serde(default)]
        practice: Option<String>,
    },
    Milestone {
        title: String,
        #[serde(default)]
        details: String,
    },
    JournalEntry {
        content: String,
        #[serde(default)]
        mood: Option<String>,
    },
    SoloReflection {
        content: String,
        #[serde(default)]
        focus: Option<String>,
    },
    Mark {
        content: String,
    },
    Conversation {
        summary: String,
        #[serde(default)]
        participants: Vec<String>,
    },
    ConversationMoment {
        content: String,
        #[serde(default)]
        conversation_ref: Option<String>,
    },
    Participant {
        name: String,
        #[serde(default)]
        relationship: String,
        #[serde(default)]
        notes: String,
    },
    CognitiveSnapshot {
        summary: String,
        #[serde(default)]
        metrics: serde_json::Value,
    },
    ResearchTask {
        description: String,
        task_kind: String,
        #[serde(default)]
        target_ref: Option<String>,
        #[serde(default)]
        status: String,
    },
}

impl NodePayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Observation { .. } => NodeKind::Observation,
            NodePayload::Opinion { .. } => NodeKind::Opinion,
            NodePayload::GrowthEdge { .. } => NodeKind::GrowthEdge,
            NodePayload::Milestone { .. } => NodeKind::Milestone,
            NodePayload::JournalEntry { .. } => NodeKind::JournalEntry,
            NodePayload::SoloReflection { .. } => NodeKind::SoloReflection,
            NodePayload::Mark { .. } => NodeKind::Mark,
            NodePayload::Conversation { .. } => NodeKind::Conversation,
            NodePayload::ConversationMoment { .. } => NodeKind::ConversationMoment,
            NodePayload::Participant { .. } => NodeKind::Participant,
            NodePayload::CognitiveSnapshot { .. } => NodeKind::CognitiveSnapshot,
            NodePayload::ResearchTask { .. } => NodeKind::ResearchTask,
        }
    }

    /// Free text used for similarity scoring, novelty checks, and question
    /// extraction.
    pub fn content_text(&self) -> &str {
        match self {
            NodePayload::Observation { content, .. } => content,
            NodePayload::Opinion { content, .. } => content,
            NodePayload::GrowthEdge { content, .. } => content,
            NodePayload::Milestone { title, .. } => title,
            NodePayload::JournalEntry { content, .. } => content,
            NodePayload::SoloReflection { content, .. } => content,
            NodePayload::Mark { content } => content,
            NodePayload::Conversation { summary, .. } => summary,
            NodePayload::ConversationMoment { content, .. } => content,
            NodePayload::Participant { name, .. } => name,
            NodePayload::CognitiveSnapshot { summary, .. } => summary,
            NodePayload::ResearchTask { description, .. } => description,
        }
    }

    /// Domain label used for cross-domain connection counting. Observations
    /// use their category; everything else falls back to the kind label.
    pub fn domain(&self) -> &str {
        match self {
            NodePayload::Observation { category, .. } if !category.is_empty() => category,
            other => other.kind().label(),
        }
    }

    /// References to other material embedded in the payload. These may be
    /// node ids, participant names, or free-text mentions; unresolvable ones
    /// feed the autonomous research queue.
    pub fn embedded_refs(&self) -> Vec<String> {
        match self {
            NodePayload::Observation {
                source_refs,
                category,
                ..
            } => {
                // Stub observations created to resolve a reference would
                // otherwise re-propose their own source forever.
                if category == REFERENCE_CATEGORY {
                    Vec::new()
                } else {
                    source_refs.clone()
                }
            }
            NodePayload::ConversationMoment {
                conversation_ref: Some(r),
                ..
            } => vec![r.clone()],
            _ => Vec::new(),
        }
    }

    pub fn validate(&self) -> MnemaResult<()> {
        let text = self.content_text();
        if text.trim().is_empty() {
            return Err(MnemaError::validation(format!(
                "{} payload has empty content",
                self.kind().label()
            )));
        }
        match self {
            NodePayload::Observation { category, .. } if category.trim().is_empty() => Err(
                MnemaError::validation("observation payload has empty category"),
            ),
            NodePayload::Opinion { conviction, .. }
                if !(0.0..=1.0).contains(conviction) || !conviction.is_finite() =>
            {
                Err(MnemaError::validation(format!(
                    "opinion conviction {} outside [0, 1]",
                    conviction
                )))
            }
            NodePayload::ResearchTask { task_kind, .. } if task_kind.trim().is_empty() => Err(
                MnemaError::validation("research task payload has empty task_kind"),
            ),
            _ => Ok(()),
        }
    }

    /// Rebuild the payload with replacement free text, keeping structural
    /// fields (category, stance, mood) intact. Used when a resynthesis pass
    /// produces a deepened version of the same concept.
    pub fn with_content(&self, content: &str) -> NodePayload {
        let content = content.to_string();
        match self {
            NodePayload::Observation {
                category,
                source_refs,
                ..
            } => NodePayload::Observation {
                content,
                category: category.clone(),
                source_refs: source_refs.clone(),
            },
            NodePayload::Opinion {
                stance, conviction, ..
            } => NodePayload::Opinion {
                content,
                stance: stance.clone(),
                conviction: *conviction,
            },
            NodePayload::GrowthEdge { practice, .. } => NodePayload::GrowthEdge {
                content,
                practice: practice.clone(),
            },
            NodePayload::Milestone { details, .. } => NodePayload::Milestone {
                title: content,
                details: details.clone(),
            },
            NodePayload::JournalEntry { mood, .. } => NodePayload::JournalEntry {
                content,
                mood: mood.clone(),
            },
            NodePayload::SoloReflection { focus, .. } => NodePayload::SoloReflection {
                content,
                focus: focus.clone(),
            },
            NodePayload::Mark { .. } => NodePayload::Mark { content },
            NodePayload::Conversation { participants, .. } => NodePayload::Conversation {
                summary: content,
                participants: participants.clone(),
            },
            NodePayload::ConversationMoment {
                conversation_ref, ..
            } => NodePayload::ConversationMoment {
                content,
                conversation_ref: conversation_ref.clone(),
            },
            NodePayload::Participant {
                relationship,
                notes,
                ..
            } => NodePayload::Participant {
                name: content,
                relationship: relationship.clone(),
                notes: notes.clone(),
            },
            NodePayload::CognitiveSnapshot { metrics, .. } => NodePayload::CognitiveSnapshot {
                summary: content,
                metrics: metrics.clone(),
            },
            NodePayload::ResearchTask {
                task_kind,
                target_ref,
                status,
                ..
            } => NodePayload::ResearchTask {
                description: content,
                task_kind: task_kind.clone(),
                target_ref: target_ref.clone(),
                status: status.clone(),
            },
        }
    }
}

/// One completed synthesis pass over a concept node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisEntry {
    /// RFC 3339 timestamp of the pass.
    pub date: String,
    /// Label of the trigger that fired it.
    pub trigger: String,
    /// Connection count observed at synthesis time.
    pub connection_count: u32,
}

/// Maturity state carried by concept nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaturityRecord {
    /// Number of completed synthesis passes over the concept's lifetime.
    #[serde(default)]
    pub level: u32,
    /// Epoch ms of the most recent synthesis, if any.
    #[serde(default)]
    pub last_deepened_ms: Option<i64>,
    /// Semantic connections gained since the last synthesis.
    #[serde(default)]
    pub connections_added_since_last_synthesis: u32,
    /// Composite depth score in [0, 1]. Never decreases across successful
    /// syntheses.
    #[serde(default)]
    pub depth_score: f32,
    #[serde(default)]
    pub synthesis_history: Vec<SynthesisEntry>,
}

impl MaturityRecord {
    /// Roll the record forward after a successful synthesis pass. The counter
    /// resets exactly when the history gains an entry.
    pub fn record_synthesis(&mut self, trigger: &str, connection_count: u32, now_ms: i64) {
        self.synthesis_history.push(SynthesisEntry {
            date: rfc3339_of_ms(now_ms),
            trigger: trigger.to_string(),
            connection_count,
        });
        self.connections_added_since_last_synthesis = 0;
        self.last_deepened_ms = Some(now_ms);
        self.level = self.level.saturating_add(1);
    }
}

/// A versioned node. Version numbers advance only when content is replaced;
/// maturity counter bumps leave the version untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: Uuid,
    pub kind: NodeKind,
    pub payload: NodePayload,
    pub version: u64,
    pub created_at_ms: i64,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maturity: Option<MaturityRecord>,
}

impl NodeRecord {
    pub fn new(payload: NodePayload) -> Self {
        let kind = payload.kind();
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            version: 1,
            created_at_ms: now_ms(),
            archived: false,
            maturity: kind.is_concept().then(MaturityRecord::default),
        }
    }

    pub fn content_text(&self) -> &str {
        self.payload.content_text()
    }

    pub fn age_days(&self, now_ms: i64) -> f32 {
        let age_ms = now_ms.saturating_sub(self.created_at_ms).max(0);
        age_ms as f32 / 86_400_000.0
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

/// Current time as epoch milliseconds.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// RFC 3339 rendering of an epoch-ms timestamp, for human-readable records.
pub fn rfc3339_of_ms(ms: i64) -> String {
    use chrono::{TimeZone, Utc};
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kind_round_trip() {
        for kind in NodeKind::all() {
            assert_eq!(NodeKind::from_label(kind.label()), Some(kind));
        }
    }

    #[test]
    fn concept_nodes_start_with_maturity() {
        let node = NodeRecord::new(NodePayload::Observation {
            content: "the harbor is quiet before six".into(),
            category: "neighborhood".into(),
            source_refs: vec![],
        });
        let maturity = node.maturity.as_ref().unwrap();
        assert_eq!(maturity.level, 0);
        assert_eq!(maturity.connections_added_since_last_synthesis, 0);
        assert!(maturity.synthesis_history.is_empty());

        let plain = NodeRecord::new(NodePayload::Mark {
            content: "left a stone on the east rail".into(),
        });
        assert!(plain.maturity.is_none());
    }

    #[test]
    fn validate_rejects_empty_content() {
        let payload = NodePayload::JournalEntry {
            content: "   ".into(),
            mood: None,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_conviction() {
        let payload = NodePayload::Opinion {
            content: "mornings are better for hard thinking".into(),
            stance: "for".into(),
            conviction: 1.4,
        };
        assert!(payload.validate().is_err());
    }

    #[test]
    fn serde_tag_is_snake_case() {
        let payload = NodePayload::GrowthEdge {
            content: "listen longer before answering".into(),
            practice: Some("weekly review".into()),
        };
        let json = serde_json::to_string(&payload).unwrap();
        assert!(json.contains("\"kind\":\"growth_edge\""));
    }

    #[test]
    fn record_synthesis_resets_counter_and_bumps_level() {
        let mut m = MaturityRecord {
            connections_added_since_last_synthesis: 7,
            ..Default::default()
        };
        m.record_synthesis("connection_growth", 7, now_ms());
        assert_eq!(m.level, 1);
        assert_eq!(m.connections_added_since_last_synthesis, 0);
        assert_eq!(m.synthesis_history.len(), 1);
        assert_eq!(m.synthesis_history[0].connection_count, 7);
    }

    #[test]
    fn reference_stubs_do_not_reexport_their_refs() {
        let stub = NodePayload::Observation {
            content: "the red notebook is a pocket journal from 2019".into(),
            category: REFERENCE_CATEGORY.into(),
            source_refs: vec!["the red notebook".into()],
        };
        assert!(stub.embedded_refs().is_empty());
    }

    #[test]
    fn with_content_keeps_structural_fields() {
        let payload = NodePayload::Opinion {
            content: "short meetings work".into(),
            stance: "for".into(),
            conviction: 0.8,
        };
        match payload.with_content("short meetings work, and the reason is practice not policy") {
            NodePayload::Opinion {
                stance, conviction, ..
            } => {
                assert_eq!(stance, "for");
                assert!((conviction - 0.8).abs() < f32::EPSILON);
            }
            other => panic!("kind changed: {:?}", other.kind()),
        }
    }
}
