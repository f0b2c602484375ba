//! Append-only mutation journal.
//!
//! The journal is the source of truth for the graph: one JSON line per
//! applied mutation batch, written before the indexed trees are touched. The
//! format stays hand-editable so an operator can inspect or amend history
//! with a text editor and rebuild the index afterwards.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MnemaError, MnemaResult};
use crate::graph::edge::EdgeRecord;
use crate::graph::node::{NodePayload, NodeRecord};

/// One durably-applied mutation batch. A multi-part write serializes as a
/// single `node_with_edges` line, so replay can never observe a node without
/// its initial edges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MutationEntry {
    NodeAdded {
        node: NodeRecord,
    },
    NodeWithEdges {
        node: NodeRecord,
        edges: Vec<EdgeRecord>,
    },
    EdgeAdded {
        edge: EdgeRecord,
    },
    ContentReplaced {
        id: Uuid,
        version: u64,
        payload: NodePayload,
    },
    NodeArchived {
        id: Uuid,
    },
    ContradictionResolved {
        edge_id: Uuid,
        note: String,
        resolved_at_ms: i64,
    },
    QuestionAnswered {
        fingerprint: String,
        answered_at_ms: i64,
    },
    /// Audit record of a finished background task. Carries no graph state.
    TaskReport {
        report: serde_json::Value,
    },
}

impl MutationEntry {
    pub fn op_label(&self) -> &'static str {
        match self {
            MutationEntry::NodeAdded { .. } => "node_added",
            MutationEntry::NodeWithEdges { .. } => "node_with_edges",
            MutationEntry::EdgeAdded { .. } => "edge_added",
            MutationEntry::ContentReplaced { .. } => "content_replaced",
            MutationEntry::NodeArchived { .. } => "node_archived",
            MutationEntry::ContradictionResolved { .. } => "contradiction_resolved",
            MutationEntry::QuestionAnswered { .. } => "question_answered",
            MutationEntry::TaskReport { .. } => "task_report",
        }
    }
}

pub struct MutationJournal {
    path: PathBuf,
    file: Mutex<File>,
    fsync: bool,
}

impl MutationJournal {
    /// Open (or create) the journal file in append mode.
    pub fn open<P: AsRef<Path>>(path: P, fsync: bool) -> MnemaResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            fsync,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry as a single line, flushed before returning.
    pub fn append(&self, entry: &MutationEntry) -> MnemaResult<()> {
        let line = serde_json::to_string(entry)?;
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        writeln!(file, "{}", line)?;
        file.flush()?;
        if self.fsync {
            file.sync_data()?;
        }
        tracing::debug!(
            target: "mnema::journal",
            op = entry.op_label(),
            bytes = line.len(),
            "journal append"
        );
        Ok(())
    }

    /// Read every entry back in order. Blank lines are tolerated; an
    /// unparseable line is an error naming its position, since silently
    /// skipping it would drop history.
    pub fn replay(&self) -> MnemaResult<Vec<MutationEntry>> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let entry: MutationEntry = serde_json::from_str(trimmed).map_err(|e| {
                MnemaError::validation(format!("journal line {} unparseable: {}", idx + 1, e))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Number of non-blank lines currently in the journal.
    pub fn entry_count(&self) -> MnemaResult<u64> {
        let file = File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut count = 0u64;
        for line in reader.lines() {
            if !line?.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::node::NodePayload;

    fn sample_node() -> NodeRecord {
        NodeRecord::new(NodePayload::Mark {
            content: "first light over the ridge".into(),
        })
    }

    #[test]
    fn append_then_replay_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let journal = MutationJournal::open(dir.path().join("journal.jsonl"), false).unwrap();

        let a = sample_node();
        let b = sample_node();
        journal
            .append(&MutationEntry::NodeAdded { node: a.clone() })
            .unwrap();
        journal
            .append(&MutationEntry::NodeArchived { id: b.id })
            .unwrap();

        let entries = journal.replay().unwrap();
        assert_eq!(entries.len(), 2);
        match &entries[0] {
            MutationEntry::NodeAdded { node } => assert_eq!(node.id, a.id),
            other => panic!("unexpected entry: {}", other.op_label()),
        }
        match &entries[1] {
            MutationEntry::NodeArchived { id } => assert_eq!(*id, b.id),
            other => panic!("unexpected entry: {}", other.op_label()),
        }
    }

    #[test]
    fn replay_tolerates_blank_lines_but_not_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = MutationJournal::open(&path, false).unwrap();
        journal
            .append(&MutationEntry::NodeAdded {
                node: sample_node(),
            })
            .unwrap();

        std::fs::write(
            &path,
            format!("{}\n\n", std::fs::read_to_string(&path).unwrap()),
        )
        .unwrap();
        assert_eq!(journal.replay().unwrap().len(), 1);

        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("not json at all\n");
        std::fs::write(&path, contents).unwrap();
        let err = journal.replay().unwrap_err();
        assert!(err.to_string().contains("unparseable"));
    }

    #[test]
    fn lines_are_one_json_object_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let journal = MutationJournal::open(&path, false).unwrap();
        journal
            .append(&MutationEntry::QuestionAnswered {
                fingerprint: "whatdoesthegardenneed".into(),
                answered_at_ms: 1_700_000_000_000,
            })
            .unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        let line = raw.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["op"], "question_answered");
    }
}
