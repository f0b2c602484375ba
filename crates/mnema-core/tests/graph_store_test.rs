//! Integration test: graph store — journal-backed typed graph.
//!
//! Verifies that:
//! 1. Nodes round-trip through the store with payload, version, and kind intact.
//! 2. Edge writes enforce endpoint existence, reject self-loops, and dedupe.
//! 3. `add_node_with_edges` is atomic: one bad edge spec and nothing lands.
//! 4. SUPERSEDES chains stay linear (one successor, no cycles) and
//!    `get_evolution` walks them oldest-first.
//! 5. Optimistic versioning rejects stale writes with ConcurrentModification.
//! 6. Contradiction pairs can be listed unresolved, resolved with a note, and
//!    re-resolved without error.
//! 7. Semantic edges bump the connection counter on concept chain heads.
//! 8. The journal is the source of truth: deleting the derived index and
//!    reopening reproduces the same graph.

use mnema_core::{
    EdgeKind, EdgeSpec, GraphStore, MaturityRecord, MnemaError, NodeKind, NodePayload,
};

// ---------------------------------------------------------------------------
// Helpers: payload builders
// ---------------------------------------------------------------------------

fn observation(content: &str) -> NodePayload {
    NodePayload::Observation {
        content: content.to_string(),
        category: "craft".to_string(),
        source_refs: vec![],
    }
}

fn opinion(content: &str) -> NodePayload {
    NodePayload::Opinion {
        content: content.to_string(),
        stance: "for".to_string(),
        conviction: 0.7,
    }
}

fn participant(name: &str) -> NodePayload {
    NodePayload::Participant {
        name: name.to_string(),
        relationship: "friend".to_string(),
        notes: String::new(),
    }
}

#[test]
fn node_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let id = store
        .add_node(observation("Morning pages work best before coffee."))
        .expect("add_node should succeed");

    let node = store
        .get_node(&id)
        .unwrap()
        .expect("node should be readable back");
    assert_eq!(node.id, id);
    assert_eq!(node.kind, NodeKind::Observation);
    assert_eq!(node.version, 1);
    assert!(!node.archived);
    assert_eq!(node.content_text(), "Morning pages work best before coffee.");
    assert!(
        node.maturity.is_some(),
        "concept nodes carry a maturity record from birth"
    );
    assert_eq!(store.node_count().unwrap(), 1);
}

#[test]
fn empty_content_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let err = store.add_node(observation("   ")).unwrap_err();
    assert!(matches!(err, MnemaError::Validation { .. }));
    assert_eq!(store.node_count().unwrap(), 0);
}

#[test]
fn edge_endpoints_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let a = store.add_node(observation("Tabs beat spaces on my keyboard.")).unwrap();
    let ghost = uuid::Uuid::new_v4();

    let err = store
        .add_edge(a, ghost, EdgeKind::RelatesTo, serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, MnemaError::NotFound { .. }));

    let err = store
        .add_edge(a, a, EdgeKind::RelatesTo, serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, MnemaError::Validation { .. }));
    assert_eq!(store.edge_count().unwrap(), 0);
}

#[test]
fn duplicate_edges_are_deduped() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let a = store.add_node(observation("The stand mixer lives on the counter now.")).unwrap();
    let b = store.add_node(observation("Bread nights moved to Fridays.")).unwrap();

    let first = store
        .add_edge(a, b, EdgeKind::RelatesTo, serde_json::json!({}))
        .unwrap();
    let second = store
        .add_edge(a, b, EdgeKind::RelatesTo, serde_json::json!({"strength": 0.9}))
        .unwrap();
    assert!(first, "first write should create the edge");
    assert!(!second, "second identical (source, target, kind) should be a no-op");
    assert_eq!(store.edge_count().unwrap(), 1);

    // Opposite direction and other kinds are distinct edges.
    assert!(store.add_edge(b, a, EdgeKind::RelatesTo, serde_json::json!({})).unwrap());
    assert!(store.add_edge(a, b, EdgeKind::Supports, serde_json::json!({})).unwrap());
    assert_eq!(store.edge_count().unwrap(), 3);
}

#[test]
fn add_node_with_edges_is_atomic() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let anchor = store.add_node(participant("Mira")).unwrap();
    let ghost = uuid::Uuid::new_v4();

    let err = store
        .add_node_with_edges(
            observation("Mira recommended the Horowitz recordings."),
            vec![
                EdgeSpec::outbound(anchor, EdgeKind::About),
                EdgeSpec::outbound(ghost, EdgeKind::EmergedFrom),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, MnemaError::NotFound { .. }));
    assert_eq!(store.node_count().unwrap(), 1, "the new node must not land");
    assert_eq!(store.edge_count().unwrap(), 0, "no partial edges either");

    // With valid specs the node and both edges land together.
    let id = store
        .add_node_with_edges(
            observation("Mira recommended the Horowitz recordings."),
            vec![
                EdgeSpec::outbound(anchor, EdgeKind::About),
                EdgeSpec::outbound(anchor, EdgeKind::About), // duplicate spec collapses
            ],
        )
        .unwrap();
    assert_eq!(store.node_count().unwrap(), 2);
    assert_eq!(store.edge_count().unwrap(), 1);
    assert!(store.get_node(&id).unwrap().is_some());
}

#[test]
fn supersedes_chain_stays_linear() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let v1 = store.add_node(opinion("Deadlines are mostly useful.")).unwrap();
    let v2 = store
        .create_successor(
            v1,
            1,
            opinion("Deadlines are useful when they are visible early."),
            MaturityRecord::default(),
        )
        .expect("first successor should succeed");

    // A second successor of the already-superseded v1 violates linearity.
    let err = store
        .create_successor(v1, 1, opinion("Deadlines are theatre."), MaturityRecord::default())
        .unwrap_err();
    assert!(matches!(err, MnemaError::Validation { .. }));

    // A manual SUPERSEDES edge closing the chain back on itself is a cycle.
    let err = store
        .add_edge(v1, v2, EdgeKind::Supersedes, serde_json::json!({}))
        .unwrap_err();
    assert!(matches!(err, MnemaError::Cycle { .. }));

    let chain = store.get_evolution(v2).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].id, v1, "evolution starts at the oldest version");
    assert_eq!(chain[1].id, v2);

    // Either member of the chain resolves to the same head.
    assert_eq!(store.resolve_head(&v1).unwrap(), v2);
    assert_eq!(store.resolve_head(&v2).unwrap(), v2);
    assert!(!store.is_head(&v1).unwrap());
    assert!(store.is_head(&v2).unwrap());
}

#[test]
fn stale_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let id = store.add_node(opinion("Short standups beat long ones.")).unwrap();
    let v2 = store
        .update_node_content(id, opinion("Short written standups beat long ones."), 1)
        .unwrap();
    assert_eq!(v2, 2);

    // A writer still holding version 1 loses the race.
    let err = store
        .update_node_content(id, opinion("Standups are optional."), 1)
        .unwrap_err();
    match err {
        MnemaError::ConcurrentModification { expected, actual, .. } => {
            assert_eq!(expected, 1);
            assert_eq!(actual, 2);
        }
        other => panic!("expected ConcurrentModification, got {other}"),
    }

    // create_successor performs the same check.
    let err = store
        .create_successor(id, 1, opinion("Standups are optional."), MaturityRecord::default())
        .unwrap_err();
    assert!(matches!(err, MnemaError::ConcurrentModification { .. }));
}

#[test]
fn contradictions_surface_and_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let a = store.add_node(opinion("Remote work suits deep focus.")).unwrap();
    let b = store.add_node(opinion("Remote work erodes deep focus.")).unwrap();
    store
        .add_edge(a, b, EdgeKind::Contradicts, serde_json::json!({}))
        .unwrap();

    let open = store.find_contradictions(false).unwrap();
    assert_eq!(open.len(), 1);
    let (source, target, edge) = &open[0];
    assert_eq!(source.id, a);
    assert_eq!(target.id, b);
    assert!(!edge.is_resolved());

    // Re-querying without a mutation in between returns the same pair.
    let again = store.find_contradictions(false).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].2.id, edge.id);
    assert!(store.find_contradictions(true).unwrap().is_empty());

    store
        .resolve_contradiction(edge.id, "Both hold; depends on the week's meeting load.")
        .expect("resolution should succeed");
    assert!(store.find_contradictions(false).unwrap().is_empty());
    let resolved = store.find_contradictions(true).unwrap();
    assert_eq!(resolved.len(), 1);
    assert!(resolved[0].2.is_resolved());

    // Resolving again is a no-op, not an error.
    store.resolve_contradiction(edge.id, "duplicate note").unwrap();
    assert_eq!(store.find_contradictions(true).unwrap().len(), 1);

    // Only CONTRADICTS edges are resolvable.
    let c = store.add_node(observation("Focus log, week 12.")).unwrap();
    store.add_edge(a, c, EdgeKind::EvidencedBy, serde_json::json!({})).unwrap();
    let plain_edge = store
        .snapshot()
        .unwrap()
        .neighbors_along(&a, &[EdgeKind::EvidencedBy])
        .first()
        .map(|(e, _, _)| e.id)
        .expect("evidence edge should exist");
    let err = store.resolve_contradiction(plain_edge, "note").unwrap_err();
    assert!(matches!(err, MnemaError::Validation { .. }));
}

#[test]
fn semantic_edges_bump_head_connection_counter() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let concept = store.add_node(opinion("Practice journals compound.")).unwrap();
    let e1 = store.add_node(observation("Skipped three days, felt the loss.")).unwrap();
    let e2 = store.add_node(observation("Re-read January entries before the review.")).unwrap();

    store.add_edge(concept, e1, EdgeKind::EvidencedBy, serde_json::json!({})).unwrap();
    store.add_edge(e2, concept, EdgeKind::Supports, serde_json::json!({})).unwrap();

    let maturity = store.get_node(&concept).unwrap().unwrap().maturity.unwrap();
    assert_eq!(
        maturity.connections_added_since_last_synthesis, 2,
        "both directions of semantic edges count toward the concept"
    );

    // Version the concept, then connect to the *old* id. The counter lands on
    // the chain head, not the superseded node.
    let head = store
        .create_successor(
            concept,
            1,
            opinion("Practice journals compound when reviewed monthly."),
            MaturityRecord::default(),
        )
        .unwrap();
    let e3 = store.add_node(observation("Monthly review caught a stalled habit.")).unwrap();
    store.add_edge(e3, concept, EdgeKind::Supports, serde_json::json!({})).unwrap();

    let head_maturity = store.get_node(&head).unwrap().unwrap().maturity.unwrap();
    assert_eq!(head_maturity.connections_added_since_last_synthesis, 1);
    assert_eq!(store.semantic_in_degree(&concept).unwrap(), 2);
}

#[test]
fn archive_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let id = store.add_node(observation("The old phone is finally recycled.")).unwrap();
    store.archive_node(id).unwrap();
    store.archive_node(id).unwrap();

    let node = store.get_node(&id).unwrap().unwrap();
    assert!(node.archived);
    assert_eq!(store.node_count().unwrap(), 1, "archived nodes stay in the graph");
}

#[test]
fn answered_questions_are_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let store = GraphStore::open_path(dir.path()).unwrap();

    let fp = "whatwouldittaketorunwithoutanalarm";
    assert!(!store.is_question_answered(fp).unwrap());
    store.mark_question_answered(fp).unwrap();
    store.mark_question_answered(fp).unwrap();
    assert!(store.is_question_answered(fp).unwrap());
    assert!(!store.is_question_answered("someotherquestion").unwrap());
}

#[test]
fn reopen_preserves_graph() {
    let dir = tempfile::tempdir().unwrap();
    let (a, b);
    {
        let store = GraphStore::open_path(dir.path()).unwrap();
        a = store.add_node(opinion("Good defaults beat configuration.")).unwrap();
        b = store.add_node(observation("Spent an hour undoing a clever override.")).unwrap();
        store.add_edge(a, b, EdgeKind::EvidencedBy, serde_json::json!({})).unwrap();
    }

    let store = GraphStore::open_path(dir.path()).unwrap();
    assert_eq!(store.node_count().unwrap(), 2);
    assert_eq!(store.edge_count().unwrap(), 1);
    assert_eq!(
        store.get_node(&a).unwrap().unwrap().content_text(),
        "Good defaults beat configuration."
    );
    assert_eq!(store.get_node(&b).unwrap().unwrap().kind, NodeKind::Observation);
}

#[test]
fn journal_rebuilds_deleted_index() {
    let dir = tempfile::tempdir().unwrap();
    let (concept, head);
    {
        let store = GraphStore::open_path(dir.path()).unwrap();
        concept = store.add_node(opinion("Walking meetings produce better decisions.")).unwrap();
        let evidence = store.add_node(observation("Two hard calls settled on the canal loop.")).unwrap();
        store.add_edge(concept, evidence, EdgeKind::EvidencedBy, serde_json::json!({})).unwrap();
        head = store
            .create_successor(
                concept,
                1,
                opinion("Walking meetings produce better decisions for two-person calls."),
                MaturityRecord::default(),
            )
            .unwrap();
        store.archive_node(evidence).unwrap();
    }

    // Drop the derived sled index entirely; only journal.jsonl remains.
    std::fs::remove_dir_all(dir.path().join("index")).expect("index dir should exist");

    let store = GraphStore::open_path(dir.path()).unwrap();
    assert_eq!(store.node_count().unwrap(), 3);
    assert_eq!(store.edge_count().unwrap(), 2, "evidence edge plus the SUPERSEDES link");
    assert_eq!(store.resolve_head(&concept).unwrap(), head);

    let chain = store.get_evolution(concept).unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].id, concept);
    assert_eq!(chain[1].id, head);

    let archived = store
        .find_nodes(Some(NodeKind::Observation), |n| n.archived)
        .unwrap();
    assert_eq!(archived.len(), 1, "archive flag survives the rebuild");
}
