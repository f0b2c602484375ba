//! Typed, directed edges.
//!
//! SUPERSEDES is the versioning edge and is excluded from connection
//! counters. Direction is stored but traversal follows edges both ways and
//! records which way each hop ran.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::node::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Supersedes,
    EmergedFrom,
    EvidencedBy,
    RelatesTo,
    Contradicts,
    Supports,
    About,
    ParticipatedIn,
    Contains,
    Develops,
    Triggered,
}

impl EdgeKind {
    #[inline]
    pub fn label(&self) -> &'static str {
        match self {
            EdgeKind::Supersedes => "SUPERSEDES",
            EdgeKind::EmergedFrom => "EMERGED_FROM",
            EdgeKind::EvidencedBy => "EVIDENCED_BY",
            EdgeKind::RelatesTo => "RELATES_TO",
            EdgeKind::Contradicts => "CONTRADICTS",
            EdgeKind::Supports => "SUPPORTS",
            EdgeKind::About => "ABOUT",
            EdgeKind::ParticipatedIn => "PARTICIPATED_IN",
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::Develops => "DEVELOPS",
            EdgeKind::Triggered => "TRIGGERED",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        EdgeKind::all().into_iter().find(|k| k.label() == label)
    }

    /// Semantic edges feed maturity connection counters. The versioning edge
    /// does not.
    #[inline]
    pub fn is_semantic(&self) -> bool {
        !matches!(self, EdgeKind::Supersedes)
    }

    pub fn all() -> [EdgeKind; 11] {
        [
            EdgeKind::Supersedes,
            EdgeKind::EmergedFrom,
            EdgeKind::EvidencedBy,
            EdgeKind::RelatesTo,
            EdgeKind::Contradicts,
            EdgeKind::Supports,
            EdgeKind::About,
            EdgeKind::ParticipatedIn,
            EdgeKind::Contains,
            EdgeKind::Develops,
            EdgeKind::Triggered,
        ]
    }
}

/// A directed edge between two stored nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub kind: EdgeKind,
    /// Kind-specific attributes: `strength` on RELATES_TO, `resolved` and
    /// `resolution` on CONTRADICTS.
    #[serde(default)]
    pub properties: serde_json::Value,
    pub created_at_ms: i64,
}

impl EdgeRecord {
    pub fn new(
        source_id: Uuid,
        target_id: Uuid,
        kind: EdgeKind,
        properties: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            kind,
            properties,
            created_at_ms: now_ms(),
        }
    }

    /// Relationship strength in [0, 1]. Only meaningful for RELATES_TO;
    /// absent property reads as 0.5.
    pub fn strength(&self) -> f32 {
        self.properties
            .get("strength")
            .and_then(|v| v.as_f64())
            .map(|v| v.clamp(0.0, 1.0) as f32)
            .unwrap_or(0.5)
    }

    /// Resolution flag on CONTRADICTS edges. Absent property reads as open.
    pub fn is_resolved(&self) -> bool {
        self.properties
            .get("resolved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Mark a contradiction resolved, recording the note and timestamp. The
    /// edge itself stays in the graph.
    pub fn resolve(&mut self, note: &str, resolved_at_ms: i64) {
        if !self.properties.is_object() {
            self.properties = serde_json::json!({});
        }
        if let Some(map) = self.properties.as_object_mut() {
            map.insert("resolved".into(), serde_json::Value::Bool(true));
            map.insert(
                "resolution".into(),
                serde_json::json!({
                    "note": note,
                    "resolved_at_ms": resolved_at_ms,
                }),
            );
        }
    }

    /// Key identifying the (source, target, kind) triple for duplicate
    /// suppression.
    pub fn dedup_key(&self) -> String {
        format!("{}|{}|{}", self.source_id, self.target_id, self.kind.label())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_round_trip() {
        for kind in EdgeKind::all() {
            assert_eq!(EdgeKind::from_label(kind.label()), Some(kind));
        }
    }

    #[test]
    fn supersedes_is_the_only_non_semantic_kind() {
        let non_semantic: Vec<_> = EdgeKind::all()
            .into_iter()
            .filter(|k| !k.is_semantic())
            .collect();
        assert_eq!(non_semantic, vec![EdgeKind::Supersedes]);
    }

    #[test]
    fn strength_defaults_when_absent() {
        let edge = EdgeRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EdgeKind::RelatesTo,
            serde_json::Value::Null,
        );
        assert!((edge.strength() - 0.5).abs() < f32::EPSILON);

        let strong = EdgeRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EdgeKind::RelatesTo,
            serde_json::json!({ "strength": 0.9 }),
        );
        assert!((strong.strength() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn resolve_sets_flag_and_keeps_edge_data() {
        let mut edge = EdgeRecord::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EdgeKind::Contradicts,
            serde_json::Value::Null,
        );
        assert!(!edge.is_resolved());
        edge.resolve("older entry predates the move", 1_700_000_000_000);
        assert!(edge.is_resolved());
        assert_eq!(
            edge.properties["resolution"]["note"],
            "older entry predates the move"
        );
        assert_eq!(edge.kind, EdgeKind::Contradicts);
    }
}
