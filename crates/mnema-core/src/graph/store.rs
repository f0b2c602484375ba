//! Journal-backed graph store.
//!
//! Writes go to the append-only journal first, then to a set of sled trees
//! that act as the materialized index. On open, the store compares the
//! journal against the applied-entry counter and catches up or rebuilds, so
//! the trees can always be regenerated from the journal alone.
//!
//! Mutations validate fully before the journal line is written. A failed
//! validation therefore leaves both the journal and the index untouched,
//! which is what makes the node-plus-initial-edges write atomic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use sled::Db;
use uuid::Uuid;

use crate::error::{MnemaError, MnemaResult};
use crate::graph::edge::{EdgeKind, EdgeRecord};
use crate::graph::journal::{MutationEntry, MutationJournal};
use crate::graph::node::{now_ms, MaturityRecord, NodeKind, NodePayload, NodeRecord};

/// Tree holding full node records keyed by node id.
pub const TREE_NODES: &str = "nodes";
/// Tree holding full edge records keyed by edge id.
pub const TREE_EDGES: &str = "edges";
/// Tree holding adjacency keys pointing at edge ids.
pub const TREE_ADJACENCY: &str = "adjacency";
/// Tree mapping `kind/{label}/{node_id}` to the node id for kind scans.
pub const TREE_KIND_INDEX: &str = "kind_index";
/// Tree holding research bookkeeping such as answered-question fingerprints.
pub const TREE_RESEARCH_META: &str = "research_meta";
/// Tree holding store metadata, currently the applied-entry counter.
pub const TREE_META: &str = "meta";

/// Adjacency key prefix for edges leaving a node: `out/{node_id}/{edge_id}`.
pub const KEY_OUT_PREFIX: &str = "out/";
/// Adjacency key prefix for edges entering a node: `in/{node_id}/{edge_id}`.
pub const KEY_IN_PREFIX: &str = "in/";
/// Kind-index key prefix: `kind/{label}/{node_id}`.
pub const KEY_KIND_PREFIX: &str = "kind/";
/// Research-meta key prefix for answered-question fingerprints.
pub const KEY_QUESTION_PREFIX: &str = "question/";

const KEY_APPLIED_ENTRIES: &str = "applied_entries";

/// Journal file name inside the data directory.
pub const JOURNAL_FILE: &str = "journal.jsonl";
/// Index directory name inside the data directory.
pub const INDEX_DIR: &str = "index";

/// An edge to attach atomically alongside a new node. Outbound specs run
/// new-node -> other; inbound specs run other -> new-node.
#[derive(Debug, Clone)]
pub struct EdgeSpec {
    pub other_id: Uuid,
    pub kind: EdgeKind,
    pub properties: serde_json::Value,
    pub inbound: bool,
}

impl EdgeSpec {
    pub fn outbound(other_id: Uuid, kind: EdgeKind) -> Self {
        Self {
            other_id,
            kind,
            properties: serde_json::Value::Null,
            inbound: false,
        }
    }

    pub fn inbound(other_id: Uuid, kind: EdgeKind) -> Self {
        Self {
            other_id,
            kind,
            properties: serde_json::Value::Null,
            inbound: true,
        }
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

pub struct GraphStore {
    db: Db,
    journal: MutationJournal,
    data_dir: PathBuf,
    cache: Arc<DashMap<String, NodeRecord>>,
}

impl GraphStore {
    /// Open the store rooted at `dir`, creating it if needed. The journal
    /// lives at `dir/journal.jsonl` and the index at `dir/index/`.
    pub fn open_path<P: AsRef<Path>>(dir: P) -> MnemaResult<Self> {
        Self::open_with(dir, false)
    }

    pub fn open_with<P: AsRef<Path>>(dir: P, journal_fsync: bool) -> MnemaResult<Self> {
        let data_dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;
        let db = sled::open(data_dir.join(INDEX_DIR))?;
        let journal = MutationJournal::open(data_dir.join(JOURNAL_FILE), journal_fsync)?;
        let store = Self {
            db,
            journal,
            data_dir,
            cache: Arc::new(DashMap::new()),
        };
        store.reconcile()?;
        tracing::info!(
            target: "mnema::graph",
            dir = %store.data_dir.display(),
            nodes = store.node_count()?,
            edges = store.edge_count()?,
            "graph store open"
        );
        Ok(store)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn journal(&self) -> &MutationJournal {
        &self.journal
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Insert a new node. Returns its id.
    pub fn add_node(&self, payload: NodePayload) -> MnemaResult<Uuid> {
        payload.validate()?;
        let node = NodeRecord::new(payload);
        let id = node.id;
        let kind = node.kind;
        self.commit(MutationEntry::NodeAdded { node })?;
        tracing::info!(
            target: "mnema::graph",
            node_id = %id,
            kind = kind.label(),
            action = "INSERT",
            "graph [{}] INSERT node {}",
            kind.label(),
            id
        );
        Ok(id)
    }

    /// Insert a new node together with its initial edges as one atomic
    /// write: either the node and every edge land, or nothing does.
    pub fn add_node_with_edges(
        &self,
        payload: NodePayload,
        specs: Vec<EdgeSpec>,
    ) -> MnemaResult<Uuid> {
        payload.validate()?;
        let node = NodeRecord::new(payload);

        // Validate every edge before anything is journaled.
        let mut edges = Vec::with_capacity(specs.len());
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert((spec.other_id, spec.kind, spec.inbound)) {
                continue;
            }
            self.require_node(&spec.other_id)?;
            if spec.kind == EdgeKind::Supersedes {
                if spec.inbound {
                    return Err(MnemaError::validation(
                        "a new node cannot be superseded at creation",
                    ));
                }
                self.ensure_not_superseded(&spec.other_id)?;
                // The new node is unreachable from the existing chain, so no
                // cycle is possible here.
            }
            let (source_id, target_id) = if spec.inbound {
                (spec.other_id, node.id)
            } else {
                (node.id, spec.other_id)
            };
            edges.push(EdgeRecord::new(
                source_id,
                target_id,
                spec.kind,
                spec.properties,
            ));
        }

        let id = node.id;
        let kind = node.kind;
        let edge_count = edges.len();
        self.commit(MutationEntry::NodeWithEdges { node, edges })?;
        tracing::info!(
            target: "mnema::graph",
            node_id = %id,
            kind = kind.label(),
            edges = edge_count,
            action = "INSERT",
            "graph [{}] INSERT node {} with {} initial edge(s)",
            kind.label(),
            id,
            edge_count
        );
        Ok(id)
    }

    /// Add a typed edge between two existing nodes. Returns `false` when an
    /// edge with the same source, target, and kind already exists.
    pub fn add_edge(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        kind: EdgeKind,
        properties: serde_json::Value,
    ) -> MnemaResult<bool> {
        self.require_node(&source_id)?;
        self.require_node(&target_id)?;
        if source_id == target_id {
            return Err(MnemaError::validation("edge endpoints must differ"));
        }
        if kind == EdgeKind::Supersedes {
            self.validate_supersedes(&source_id, &target_id)?;
        }
        if self.edge_exists(&source_id, &target_id, kind)? {
            return Ok(false);
        }

        let edge = EdgeRecord::new(source_id, target_id, kind, properties);
        let edge_id = edge.id;
        self.commit(MutationEntry::EdgeAdded { edge })?;
        tracing::info!(
            target: "mnema::graph",
            edge_id = %edge_id,
            kind = kind.label(),
            source = %source_id,
            target = %target_id,
            action = "EDGE",
            "graph EDGE {} {} -> {}",
            kind.label(),
            source_id,
            target_id
        );
        Ok(true)
    }

    /// Create the next version of a concept node: a new node carrying the
    /// rolled-forward maturity record, linked to its predecessor with a
    /// SUPERSEDES edge, in one atomic write. The predecessor's version is
    /// checked against `expected_version` so a foreground edit that landed
    /// in between is detected instead of silently overwritten.
    pub fn create_successor(
        &self,
        predecessor_id: Uuid,
        expected_version: u64,
        payload: NodePayload,
        maturity: MaturityRecord,
    ) -> MnemaResult<Uuid> {
        let predecessor = self.require_node(&predecessor_id)?;
        if predecessor.version != expected_version {
            return Err(MnemaError::ConcurrentModification {
                id: predecessor_id.to_string(),
                expected: expected_version,
                actual: predecessor.version,
            });
        }
        self.ensure_not_superseded(&predecessor_id)?;
        payload.validate()?;
        if payload.kind() != predecessor.kind {
            return Err(MnemaError::validation(format!(
                "successor payload kind {} does not match {}",
                payload.kind().label(),
                predecessor.kind.label()
            )));
        }

        let mut node = NodeRecord::new(payload);
        node.maturity = Some(maturity);
        let id = node.id;
        let edge = EdgeRecord::new(id, predecessor_id, EdgeKind::Supersedes, serde_json::json!({}));
        self.commit(MutationEntry::NodeWithEdges {
            node,
            edges: vec![edge],
        })?;
        tracing::info!(
            target: "mnema::graph",
            node_id = %id,
            predecessor = %predecessor_id,
            action = "SUPERSEDE",
            "graph SUPERSEDE {} -> {}",
            id,
            predecessor_id
        );
        Ok(id)
    }

    /// Replace a node's content in place, bumping its version. Rejects the
    /// write when `expected_version` no longer matches.
    pub fn update_node_content(
        &self,
        id: Uuid,
        payload: NodePayload,
        expected_version: u64,
    ) -> MnemaResult<u64> {
        let node = self.require_node(&id)?;
        if node.version != expected_version {
            return Err(MnemaError::ConcurrentModification {
                id: id.to_string(),
                expected: expected_version,
                actual: node.version,
            });
        }
        payload.validate()?;
        if payload.kind() != node.kind {
            return Err(MnemaError::validation(format!(
                "replacement payload kind {} does not match {}",
                payload.kind().label(),
                node.kind.label()
            )));
        }
        let new_version = node.version + 1;
        self.commit(MutationEntry::ContentReplaced {
            id,
            version: new_version,
            payload,
        })?;
        tracing::info!(
            target: "mnema::graph",
            node_id = %id,
            version = new_version,
            action = "UPDATE",
            "graph UPDATE node {} to version {}",
            id,
            new_version
        );
        Ok(new_version)
    }

    /// Mark a node archived. Archived nodes stay in the graph and keep their
    /// edges; retrieval and the background sources skip them.
    pub fn archive_node(&self, id: Uuid) -> MnemaResult<()> {
        let node = self.require_node(&id)?;
        if node.archived {
            return Ok(());
        }
        self.commit(MutationEntry::NodeArchived { id })?;
        tracing::info!(
            target: "mnema::graph",
            node_id = %id,
            action = "ARCHIVE",
            "graph ARCHIVE node {}",
            id
        );
        Ok(())
    }

    /// Mark a CONTRADICTS edge resolved with a note. The edge and both nodes
    /// survive; only the resolution state changes.
    pub fn resolve_contradiction(&self, edge_id: Uuid, note: &str) -> MnemaResult<()> {
        let edge = self
            .load_edge(&edge_id)?
            .ok_or_else(|| MnemaError::not_found(edge_id))?;
        if edge.kind != EdgeKind::Contradicts {
            return Err(MnemaError::validation(format!(
                "edge {} is {} rather than CONTRADICTS",
                edge_id,
                edge.kind.label()
            )));
        }
        if edge.is_resolved() {
            return Ok(());
        }
        self.commit(MutationEntry::ContradictionResolved {
            edge_id,
            note: note.to_string(),
            resolved_at_ms: now_ms(),
        })?;
        tracing::info!(
            target: "mnema::graph",
            edge_id = %edge_id,
            action = "RESOLVE",
            "graph RESOLVE contradiction {}",
            edge_id
        );
        Ok(())
    }

    /// Record that an open question has been answered, keyed by its
    /// normalized fingerprint.
    pub fn mark_question_answered(&self, fingerprint: &str) -> MnemaResult<()> {
        if self.is_question_answered(fingerprint)? {
            return Ok(());
        }
        self.commit(MutationEntry::QuestionAnswered {
            fingerprint: fingerprint.to_string(),
            answered_at_ms: now_ms(),
        })
    }

    pub fn is_question_answered(&self, fingerprint: &str) -> MnemaResult<bool> {
        let tree = self.db.open_tree(TREE_RESEARCH_META)?;
        let key = format!("{}{}", KEY_QUESTION_PREFIX, fingerprint);
        Ok(tree.get(key.as_bytes())?.is_some())
    }

    /// Append a finished-task report to the journal for auditability. Task
    /// reports carry no graph state and are skipped during rebuilds.
    pub fn append_task_report(&self, report: serde_json::Value) -> MnemaResult<()> {
        self.commit(MutationEntry::TaskReport { report })
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_node(&self, id: &Uuid) -> MnemaResult<Option<NodeRecord>> {
        let key = id.to_string();
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Some(hit.clone()));
        }
        let node = self.load_node(id)?;
        if let Some(ref n) = node {
            self.cache.insert(key, n.clone());
        }
        Ok(node)
    }

    pub fn require_node(&self, id: &Uuid) -> MnemaResult<NodeRecord> {
        self.get_node(id)?
            .ok_or_else(|| MnemaError::not_found(id))
    }

    /// Nodes matching an optional kind filter plus a predicate, ordered by
    /// creation time so repeated queries return stable results.
    pub fn find_nodes<F>(&self, kind: Option<NodeKind>, predicate: F) -> MnemaResult<Vec<NodeRecord>>
    where
        F: Fn(&NodeRecord) -> bool,
    {
        let mut found = Vec::new();
        match kind {
            Some(kind) => {
                let index = self.db.open_tree(TREE_KIND_INDEX)?;
                let prefix = format!("{}{}/", KEY_KIND_PREFIX, kind.label());
                for item in index.scan_prefix(prefix.as_bytes()) {
                    let (_k, v) = item?;
                    let id_str = String::from_utf8(v.to_vec()).unwrap_or_default();
                    if let Ok(id) = id_str.parse::<Uuid>() {
                        if let Some(node) = self.get_node(&id)? {
                            if predicate(&node) {
                                found.push(node);
                            }
                        }
                    }
                }
            }
            None => {
                let tree = self.db.open_tree(TREE_NODES)?;
                for item in tree.iter() {
                    let (_k, v) = item?;
                    if let Some(node) = NodeRecord::from_bytes(&v) {
                        if predicate(&node) {
                            found.push(node);
                        }
                    }
                }
            }
        }
        found.sort_by(|a, b| {
            a.created_at_ms
                .cmp(&b.created_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(found)
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> MnemaResult<Vec<NodeRecord>> {
        self.find_nodes(Some(kind), |_| true)
    }

    pub fn node_count(&self) -> MnemaResult<usize> {
        Ok(self.db.open_tree(TREE_NODES)?.len())
    }

    /// Count of semantic edges entering `id`.
    pub fn semantic_in_degree(&self, id: &Uuid) -> MnemaResult<usize> {
        Ok(self
            .edges_into(id)?
            .iter()
            .filter(|e| e.kind.is_semantic())
            .count())
    }

    pub fn edge_count(&self) -> MnemaResult<usize> {
        Ok(self.db.open_tree(TREE_EDGES)?.len())
    }

    /// Contradiction pairs whose resolved flag matches `resolved`, ordered by
    /// edge creation time. Both endpoint nodes come back with the edge.
    pub fn find_contradictions(
        &self,
        resolved: bool,
    ) -> MnemaResult<Vec<(NodeRecord, NodeRecord, EdgeRecord)>> {
        let tree = self.db.open_tree(TREE_EDGES)?;
        let mut pairs = Vec::new();
        for item in tree.iter() {
            let (_k, v) = item?;
            let Some(edge) = EdgeRecord::from_bytes(&v) else {
                continue;
            };
            if edge.kind != EdgeKind::Contradicts || edge.is_resolved() != resolved {
                continue;
            }
            let source = self.require_node(&edge.source_id)?;
            let target = self.require_node(&edge.target_id)?;
            pairs.push((source, target, edge));
        }
        pairs.sort_by(|a, b| {
            a.2.created_at_ms
                .cmp(&b.2.created_at_ms)
                .then_with(|| a.2.id.cmp(&b.2.id))
        });
        Ok(pairs)
    }

    /// The full version chain containing `id`, ordered oldest to newest.
    pub fn get_evolution(&self, id: Uuid) -> MnemaResult<Vec<NodeRecord>> {
        self.require_node(&id)?;

        // Walk outgoing SUPERSEDES edges back to the oldest version.
        let mut oldest = id;
        let mut guard = HashSet::new();
        while guard.insert(oldest) {
            match self.superseded_by(&oldest)? {
                Some(older) => oldest = older,
                None => break,
            }
        }

        // Then forward along incoming SUPERSEDES edges to the head.
        let mut chain = Vec::new();
        let mut current = Some(oldest);
        let mut seen = HashSet::new();
        while let Some(node_id) = current {
            if !seen.insert(node_id) {
                break;
            }
            chain.push(self.require_node(&node_id)?);
            current = self.superseder_of(&node_id)?;
        }
        Ok(chain)
    }

    /// Latest version in the chain containing `id`.
    pub fn resolve_head(&self, id: &Uuid) -> MnemaResult<Uuid> {
        self.require_node(id)?;
        Ok(self.head_of(id)?)
    }

    pub fn is_head(&self, id: &Uuid) -> MnemaResult<bool> {
        Ok(self.superseder_of(id)?.is_none())
    }

    /// Immutable copy of the whole graph for traversal and scoring. Includes
    /// archived and superseded nodes; consumers filter as needed.
    pub fn snapshot(&self) -> MnemaResult<GraphSnapshot> {
        let mut nodes = HashMap::new();
        let node_tree = self.db.open_tree(TREE_NODES)?;
        for item in node_tree.iter() {
            let (_k, v) = item?;
            if let Some(node) = NodeRecord::from_bytes(&v) {
                nodes.insert(node.id, node);
            }
        }

        let mut out: HashMap<Uuid, Vec<EdgeRecord>> = HashMap::new();
        let mut inbound: HashMap<Uuid, Vec<EdgeRecord>> = HashMap::new();
        let edge_tree = self.db.open_tree(TREE_EDGES)?;
        for item in edge_tree.iter() {
            let (_k, v) = item?;
            if let Some(edge) = EdgeRecord::from_bytes(&v) {
                out.entry(edge.source_id).or_default().push(edge.clone());
                inbound.entry(edge.target_id).or_default().push(edge);
            }
        }
        for edges in out.values_mut().chain(inbound.values_mut()) {
            edges.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.id.cmp(&b.id))
            });
        }

        Ok(GraphSnapshot {
            nodes,
            out,
            inbound,
            taken_at_ms: now_ms(),
        })
    }

    // -----------------------------------------------------------------------
    // Journal maintenance
    // -----------------------------------------------------------------------

    /// Drop every derived tree and reapply the journal from the start. Used
    /// after an operator edits the journal by hand.
    pub fn rebuild_from_journal(&self) -> MnemaResult<()> {
        let entries = self.journal.replay()?;
        self.clear_derived_state()?;
        for entry in &entries {
            self.apply_entry(entry)?;
            self.advance_applied()?;
        }
        tracing::info!(
            target: "mnema::journal",
            entries = entries.len(),
            "index rebuilt from journal"
        );
        Ok(())
    }

    /// Compare the journal against the applied-entry counter and heal the
    /// index: catch up on a missing tail, or rebuild outright when the
    /// journal is shorter than what was applied.
    fn reconcile(&self) -> MnemaResult<()> {
        let applied = self.applied_count()?;
        let total = self.journal.entry_count()?;
        if applied == total {
            return Ok(());
        }
        if applied > total {
            tracing::warn!(
                target: "mnema::journal",
                applied,
                total,
                "journal shorter than applied counter, rebuilding index"
            );
            return self.rebuild_from_journal();
        }
        let entries = self.journal.replay()?;
        tracing::info!(
            target: "mnema::journal",
            applied,
            total,
            "applying journal tail"
        );
        for entry in &entries[applied as usize..] {
            self.apply_entry(entry)?;
            self.advance_applied()?;
        }
        Ok(())
    }

    fn clear_derived_state(&self) -> MnemaResult<()> {
        for name in [
            TREE_NODES,
            TREE_EDGES,
            TREE_ADJACENCY,
            TREE_KIND_INDEX,
            TREE_RESEARCH_META,
            TREE_META,
        ] {
            self.db.drop_tree(name)?;
        }
        self.cache.clear();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Journal the entry, then apply it to the index. The journal line is the
    /// durable record; the index apply is replayable if interrupted.
    fn commit(&self, entry: MutationEntry) -> MnemaResult<()> {
        self.journal.append(&entry)?;
        self.apply_entry(&entry)?;
        self.advance_applied()?;
        Ok(())
    }

    fn apply_entry(&self, entry: &MutationEntry) -> MnemaResult<()> {
        match entry {
            MutationEntry::NodeAdded { node } => {
                self.write_node(node)?;
            }
            MutationEntry::NodeWithEdges { node, edges } => {
                self.write_node(node)?;
                for edge in edges {
                    self.apply_edge(edge)?;
                }
            }
            MutationEntry::EdgeAdded { edge } => {
                self.apply_edge(edge)?;
            }
            MutationEntry::ContentReplaced {
                id,
                version,
                payload,
            } => {
                if let Some(mut node) = self.load_node(id)? {
                    node.payload = payload.clone();
                    node.version = *version;
                    self.write_node(&node)?;
                }
            }
            MutationEntry::NodeArchived { id } => {
                if let Some(mut node) = self.load_node(id)? {
                    node.archived = true;
                    self.write_node(&node)?;
                }
            }
            MutationEntry::ContradictionResolved {
                edge_id,
                note,
                resolved_at_ms,
            } => {
                if let Some(mut edge) = self.load_edge(edge_id)? {
                    edge.resolve(note, *resolved_at_ms);
                    let tree = self.db.open_tree(TREE_EDGES)?;
                    tree.insert(edge.id.to_string().as_bytes(), edge.to_bytes())?;
                }
            }
            MutationEntry::QuestionAnswered {
                fingerprint,
                answered_at_ms,
            } => {
                let tree = self.db.open_tree(TREE_RESEARCH_META)?;
                let key = format!("{}{}", KEY_QUESTION_PREFIX, fingerprint);
                tree.insert(
                    key.as_bytes(),
                    serde_json::json!({ "answered_at_ms": answered_at_ms })
                        .to_string()
                        .into_bytes(),
                )?;
            }
            MutationEntry::TaskReport { .. } => {}
        }
        Ok(())
    }

    fn apply_edge(&self, edge: &EdgeRecord) -> MnemaResult<()> {
        let edges = self.db.open_tree(TREE_EDGES)?;
        edges.insert(edge.id.to_string().as_bytes(), edge.to_bytes())?;

        let adjacency = self.db.open_tree(TREE_ADJACENCY)?;
        let out_key = format!("{}{}/{}", KEY_OUT_PREFIX, edge.source_id, edge.id);
        let in_key = format!("{}{}/{}", KEY_IN_PREFIX, edge.target_id, edge.id);
        let id_bytes = edge.id.to_string().into_bytes();
        adjacency.insert(out_key.as_bytes(), id_bytes.clone())?;
        adjacency.insert(in_key.as_bytes(), id_bytes)?;

        if edge.kind.is_semantic() {
            self.bump_connection_counter(&edge.source_id)?;
            self.bump_connection_counter(&edge.target_id)?;
        }
        Ok(())
    }

    /// Bump the connection counter on the chain head of `id`, when that head
    /// is a concept node. Counter bumps never advance the node version.
    fn bump_connection_counter(&self, id: &Uuid) -> MnemaResult<()> {
        let head_id = self.head_of(id)?;
        let Some(mut node) = self.load_node(&head_id)? else {
            return Ok(());
        };
        if let Some(maturity) = node.maturity.as_mut() {
            maturity.connections_added_since_last_synthesis =
                maturity.connections_added_since_last_synthesis.saturating_add(1);
            let count = maturity.connections_added_since_last_synthesis;
            self.write_node(&node)?;
            tracing::debug!(
                target: "mnema::graph",
                node_id = %head_id,
                connections = count,
                "connection counter bumped"
            );
        }
        Ok(())
    }

    fn write_node(&self, node: &NodeRecord) -> MnemaResult<()> {
        let tree = self.db.open_tree(TREE_NODES)?;
        let key = node.id.to_string();
        tree.insert(key.as_bytes(), node.to_bytes())?;

        let index = self.db.open_tree(TREE_KIND_INDEX)?;
        let index_key = format!("{}{}/{}", KEY_KIND_PREFIX, node.kind.label(), node.id);
        index.insert(index_key.as_bytes(), key.as_bytes())?;

        self.cache.insert(key, node.clone());
        Ok(())
    }

    fn load_node(&self, id: &Uuid) -> MnemaResult<Option<NodeRecord>> {
        let tree = self.db.open_tree(TREE_NODES)?;
        Ok(tree
            .get(id.to_string().as_bytes())?
            .and_then(|v| NodeRecord::from_bytes(&v)))
    }

    fn load_edge(&self, id: &Uuid) -> MnemaResult<Option<EdgeRecord>> {
        let tree = self.db.open_tree(TREE_EDGES)?;
        Ok(tree
            .get(id.to_string().as_bytes())?
            .and_then(|v| EdgeRecord::from_bytes(&v)))
    }

    /// Edges leaving `id`, via the adjacency tree.
    fn edges_from(&self, id: &Uuid) -> MnemaResult<Vec<EdgeRecord>> {
        self.adjacency_edges(&format!("{}{}/", KEY_OUT_PREFIX, id))
    }

    /// Edges entering `id`, via the adjacency tree.
    fn edges_into(&self, id: &Uuid) -> MnemaResult<Vec<EdgeRecord>> {
        self.adjacency_edges(&format!("{}{}/", KEY_IN_PREFIX, id))
    }

    fn adjacency_edges(&self, prefix: &str) -> MnemaResult<Vec<EdgeRecord>> {
        let adjacency = self.db.open_tree(TREE_ADJACENCY)?;
        let mut edges = Vec::new();
        for item in adjacency.scan_prefix(prefix.as_bytes()) {
            let (_k, v) = item?;
            let id_str = String::from_utf8(v.to_vec()).unwrap_or_default();
            if let Ok(edge_id) = id_str.parse::<Uuid>() {
                if let Some(edge) = self.load_edge(&edge_id)? {
                    edges.push(edge);
                }
            }
        }
        Ok(edges)
    }

    fn edge_exists(&self, source_id: &Uuid, target_id: &Uuid, kind: EdgeKind) -> MnemaResult<bool> {
        Ok(self
            .edges_from(source_id)?
            .iter()
            .any(|e| e.target_id == *target_id && e.kind == kind))
    }

    /// The node that `id` directly supersedes, if any.
    fn superseded_by(&self, id: &Uuid) -> MnemaResult<Option<Uuid>> {
        Ok(self
            .edges_from(id)?
            .into_iter()
            .find(|e| e.kind == EdgeKind::Supersedes)
            .map(|e| e.target_id))
    }

    /// The node that directly supersedes `id`, if any.
    fn superseder_of(&self, id: &Uuid) -> MnemaResult<Option<Uuid>> {
        Ok(self
            .edges_into(id)?
            .into_iter()
            .find(|e| e.kind == EdgeKind::Supersedes)
            .map(|e| e.source_id))
    }

    fn head_of(&self, id: &Uuid) -> MnemaResult<Uuid> {
        let mut current = *id;
        let mut guard = HashSet::new();
        while guard.insert(current) {
            match self.superseder_of(&current)? {
                Some(newer) => current = newer,
                None => break,
            }
        }
        Ok(current)
    }

    fn ensure_not_superseded(&self, id: &Uuid) -> MnemaResult<()> {
        if self.superseder_of(id)?.is_some() {
            return Err(MnemaError::validation(format!(
                "node {} is already superseded by a newer version",
                id
            )));
        }
        Ok(())
    }

    /// SUPERSEDES-specific checks: one outgoing edge per node, one incoming
    /// edge per node, and no path from target back to source.
    fn validate_supersedes(&self, source_id: &Uuid, target_id: &Uuid) -> MnemaResult<()> {
        if self.superseded_by(source_id)?.is_some() {
            return Err(MnemaError::validation(format!(
                "node {} already supersedes another version",
                source_id
            )));
        }
        self.ensure_not_superseded(target_id)?;

        let mut current = *target_id;
        let mut guard = HashSet::new();
        while guard.insert(current) {
            match self.superseded_by(&current)? {
                Some(older) => {
                    if older == *source_id {
                        return Err(MnemaError::Cycle {
                            source_id: source_id.to_string(),
                            target_id: target_id.to_string(),
                        });
                    }
                    current = older;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn applied_count(&self) -> MnemaResult<u64> {
        let meta = self.db.open_tree(TREE_META)?;
        Ok(meta
            .get(KEY_APPLIED_ENTRIES.as_bytes())?
            .and_then(|v| String::from_utf8(v.to_vec()).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0))
    }

    fn advance_applied(&self) -> MnemaResult<()> {
        let meta = self.db.open_tree(TREE_META)?;
        meta.update_and_fetch(KEY_APPLIED_ENTRIES.as_bytes(), |old| {
            let current = old
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            Some((current + 1).to_string().into_bytes())
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// GraphSnapshot
// ---------------------------------------------------------------------------

/// Immutable in-memory copy of the graph, taken once per retrieval or
/// scheduler cycle. All traversal and scoring reads go through a snapshot so
/// queries never mutate the store and concurrent writes never shift results
/// mid-walk.
#[derive(Debug, Clone)]
pub struct GraphSnapshot {
    nodes: HashMap<Uuid, NodeRecord>,
    out: HashMap<Uuid, Vec<EdgeRecord>>,
    inbound: HashMap<Uuid, Vec<EdgeRecord>>,
    pub taken_at_ms: i64,
}

impl GraphSnapshot {
    pub fn node(&self, id: &Uuid) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn iter_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Neighbors reachable over edges of the given kinds, in either
    /// direction. Returns the edge, the far endpoint, and whether the edge
    /// leaves `id`.
    pub fn neighbors_along<'a>(
        &'a self,
        id: &Uuid,
        kinds: &[EdgeKind],
    ) -> Vec<(&'a EdgeRecord, Uuid, bool)> {
        let mut hops = Vec::new();
        if let Some(edges) = self.out.get(id) {
            for edge in edges {
                if kinds.contains(&edge.kind) {
                    hops.push((edge, edge.target_id, true));
                }
            }
        }
        if let Some(edges) = self.inbound.get(id) {
            for edge in edges {
                if kinds.contains(&edge.kind) {
                    hops.push((edge, edge.source_id, false));
                }
            }
        }
        hops
    }

    /// Count of semantic edges touching `id`.
    pub fn degree(&self, id: &Uuid) -> usize {
        let out = self
            .out
            .get(id)
            .map(|e| e.iter().filter(|e| e.kind.is_semantic()).count())
            .unwrap_or(0);
        let inbound = self
            .inbound
            .get(id)
            .map(|e| e.iter().filter(|e| e.kind.is_semantic()).count())
            .unwrap_or(0);
        out + inbound
    }

    /// Mean semantic degree over live (non-archived, head) nodes.
    pub fn mean_degree(&self) -> f32 {
        let mut total = 0usize;
        let mut count = 0usize;
        for node in self.nodes.values() {
            if node.archived || !self.is_head(&node.id) {
                continue;
            }
            total += self.degree(&node.id);
            count += 1;
        }
        if count == 0 {
            0.0
        } else {
            total as f32 / count as f32
        }
    }

    /// The node that directly supersedes `id`, if any.
    fn superseder_of(&self, id: &Uuid) -> Option<Uuid> {
        self.inbound
            .get(id)?
            .iter()
            .find(|e| e.kind == EdgeKind::Supersedes)
            .map(|e| e.source_id)
    }

    /// The node that `id` directly supersedes, if any.
    fn superseded_target(&self, id: &Uuid) -> Option<Uuid> {
        self.out
            .get(id)?
            .iter()
            .find(|e| e.kind == EdgeKind::Supersedes)
            .map(|e| e.target_id)
    }

    pub fn is_head(&self, id: &Uuid) -> bool {
        self.superseder_of(id).is_none()
    }

    pub fn resolve_head(&self, id: &Uuid) -> Uuid {
        let mut current = *id;
        let mut guard = HashSet::new();
        while guard.insert(current) {
            match self.superseder_of(&current) {
                Some(newer) => current = newer,
                None => break,
            }
        }
        current
    }

    /// Version chain containing `id`, oldest first.
    pub fn chain_of(&self, id: &Uuid) -> Vec<Uuid> {
        let mut oldest = *id;
        let mut guard = HashSet::new();
        while guard.insert(oldest) {
            match self.superseded_target(&oldest) {
                Some(older) => oldest = older,
                None => break,
            }
        }
        let mut chain = Vec::new();
        let mut current = Some(oldest);
        let mut seen = HashSet::new();
        while let Some(node_id) = current {
            if !seen.insert(node_id) {
                break;
            }
            chain.push(node_id);
            current = self.superseder_of(&node_id);
        }
        chain
    }

    /// Distinct neighbors and distinct domains across the whole version
    /// chain of `id`, excluding chain members themselves. Feeds the density
    /// and cross-domain components of the depth score.
    pub fn chain_neighbor_stats(&self, id: &Uuid) -> (usize, usize) {
        let chain: HashSet<Uuid> = self.chain_of(id).into_iter().collect();
        let mut neighbors = HashSet::new();
        let mut domains = HashSet::new();
        let semantic: Vec<EdgeKind> = EdgeKind::all()
            .into_iter()
            .filter(|k| k.is_semantic())
            .collect();
        for member in &chain {
            for (_edge, other, _outbound) in self.neighbors_along(member, &semantic) {
                if chain.contains(&other) {
                    continue;
                }
                neighbors.insert(other);
                if let Some(node) = self.nodes.get(&other) {
                    domains.insert(node.payload.domain().to_string());
                }
            }
        }
        (neighbors.len(), domains.len())
    }

    /// Hop distance from `id` to the nearest foundation node (participant or
    /// milestone), over semantic edges, up to `max_hops`.
    pub fn distance_to_foundation(&self, id: &Uuid, max_hops: usize) -> Option<usize> {
        if self.nodes.get(id).map(|n| n.kind.is_foundation()) == Some(true) {
            return Some(0);
        }
        let semantic: Vec<EdgeKind> = EdgeKind::all()
            .into_iter()
            .filter(|k| k.is_semantic())
            .collect();
        let mut visited = HashSet::from([*id]);
        let mut frontier = VecDeque::from([(*id, 0usize)]);
        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= max_hops {
                continue;
            }
            for (_edge, other, _outbound) in self.neighbors_along(&current, &semantic) {
                if !visited.insert(other) {
                    continue;
                }
                if self.nodes.get(&other).map(|n| n.kind.is_foundation()) == Some(true) {
                    return Some(depth + 1);
                }
                frontier.push_back((other, depth + 1));
            }
        }
        None
    }

    /// Epoch ms of the most recent edge touching `id`, if any.
    pub fn most_recent_edge_ms(&self, id: &Uuid) -> Option<i64> {
        let out = self
            .out
            .get(id)
            .and_then(|edges| edges.iter().map(|e| e.created_at_ms).max());
        let inbound = self
            .inbound
            .get(id)
            .and_then(|edges| edges.iter().map(|e| e.created_at_ms).max());
        match (out, inbound) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}
