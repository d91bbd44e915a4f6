use docqa_core::chunker::HierarchicalChunker;
use docqa_core::types::{ChunkSchedule, Document, Node, SearchHit};
use docqa_core::Error;
use docqa_embed::FakeEmbedder;
use docqa_index::{AutoMergingRetriever, NodeStore, VectorIndex};

fn node(id: &str, parent: Option<&str>, level: usize, children: &[&str], span: (usize, usize)) -> Node {
    Node {
        id: id.to_string(),
        doc_id: "doc_test_tree.txt".to_string(),
        text: format!("text of {id}"),
        level,
        parent: parent.map(str::to_string),
        children: children.iter().map(|c| c.to_string()).collect(),
        start: span.0,
        end: span.1,
    }
}

fn hit(id: &str, score: f32) -> SearchHit {
    SearchHit { id: id.to_string(), score }
}

/// root -> p1 (a, b), p2 (c, d)
fn two_level_store() -> NodeStore {
    let mut store = NodeStore::new();
    store.add_nodes(vec![
        node("root", None, 0, &["p1", "p2"], (0, 100)),
        node("p1", Some("root"), 1, &["a", "b"], (0, 50)),
        node("p2", Some("root"), 1, &["c", "d"], (50, 100)),
        node("a", Some("p1"), 2, &[], (0, 25)),
        node("b", Some("p1"), 2, &[], (25, 50)),
        node("c", Some("p2"), 2, &[], (50, 75)),
        node("d", Some("p2"), 2, &[], (75, 100)),
    ]);
    store
}

fn chunked_store() -> NodeStore {
    let chunker = HierarchicalChunker::new(ChunkSchedule::new(vec![40, 12, 5], 2).unwrap()).unwrap();
    let text = (0..30).map(|i| format!("Line {i} mentions item {}.", i * 3)).collect::<Vec<_>>().join(" ");
    let tree = chunker.chunk(&Document::new("carol", "items.txt", text)).unwrap();
    let mut store = NodeStore::new();
    store.add_nodes(tree.into_nodes());
    store
}

#[test]
fn store_round_trip_keeps_referential_integrity() -> anyhow::Result<()> {
    let store = chunked_store();
    store.validate()?;

    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("docstore.json");
    store.persist(&path)?;
    let loaded = NodeStore::load(&path)?;
    assert_eq!(loaded, store);
    loaded.validate()?;

    for node in loaded.all_nodes() {
        for child in loaded.get_children(&node.id)? {
            assert_eq!(child.parent.as_deref(), Some(node.id.as_str()));
        }
        match loaded.get_parent(&node.id)? {
            Some(parent) => assert!(parent.children.contains(&node.id)),
            None => assert_eq!(node.level, 0),
        }
    }
    assert_eq!(loaded.document_ids().into_iter().collect::<Vec<_>>(), vec!["doc_carol_items.txt"]);
    Ok(())
}

#[test]
fn store_upsert_is_idempotent_and_reports_missing_nodes() {
    let mut store = chunked_store();
    let before = store.len();
    let again: Vec<Node> = store.all_nodes().cloned().collect();
    assert_eq!(store.add_nodes(again), 0);
    assert_eq!(store.len(), before);

    assert!(matches!(store.get_node("nope"), Err(Error::NodeNotFound(id)) if id == "nope"));
    assert!(matches!(store.get_children("nope"), Err(Error::NodeNotFound(_))));
}

#[test]
fn store_merge_is_a_union_on_id() -> anyhow::Result<()> {
    let mut left = NodeStore::new();
    left.add_nodes(vec![node("p", None, 0, &["a", "b"], (0, 10)), node("a", Some("p"), 1, &[], (0, 5))]);
    let mut right = NodeStore::new();
    let mut changed_a = node("a", Some("p"), 1, &[], (0, 5));
    changed_a.text = "replacement".into();
    right.add_nodes(vec![changed_a, node("b", Some("p"), 1, &[], (5, 10))]);

    assert_eq!(left.merge(right), 1);
    assert_eq!(left.len(), 3);
    assert_eq!(left.get_node("a")?.text, "text of a");
    left.validate()?;
    let ids: Vec<&str> = left.all_nodes().map(|n| n.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "p"]);
    Ok(())
}

#[test]
fn store_detects_dangling_links() {
    let mut store = NodeStore::new();
    store.add_nodes(vec![node("a", Some("ghost"), 1, &[], (0, 5))]);
    assert!(matches!(store.get_parent("a"), Err(Error::StoreConsistency(_))));
    assert!(matches!(store.validate(), Err(Error::StoreConsistency(_))));
}

#[test]
fn store_load_distinguishes_missing_from_corrupt() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let missing = NodeStore::load(&tmp.path().join("absent.json")).unwrap_err();
    assert!(missing.is_missing_index());

    let path = tmp.path().join("docstore.json");
    std::fs::write(&path, b"{ not json")?;
    let corrupt = NodeStore::load(&path).unwrap_err();
    assert!(matches!(corrupt, Error::IndexLoad { .. }));
    assert!(!corrupt.is_missing_index());
    Ok(())
}

#[test]
fn vector_search_breaks_ties_by_insertion_order() -> anyhow::Result<()> {
    let embedder = FakeEmbedder::new(64);
    let mut first = node("second-id", None, 0, &[], (0, 10));
    first.text = "alpha beta".into();
    let mut second = node("first-id", None, 0, &[], (0, 10));
    second.text = "alpha beta".into();
    let mut other = node("other", None, 0, &[], (0, 10));
    other.text = "gamma delta".into();

    let mut index = VectorIndex::for_embedder(&embedder);
    assert_eq!(index.insert(&[&first, &second, &other], &embedder, 2)?, 3);

    let query = docqa_core::traits::Embedder::embed_batch(&embedder, &["alpha beta".to_string()])?.remove(0);
    let hits = index.search(&query, 2)?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, "second-id");
    assert_eq!(hits[1].id, "first-id");
    assert!((hits[0].score - hits[1].score).abs() < 1e-6);
    Ok(())
}

#[test]
fn vector_insert_skips_known_leaves() -> anyhow::Result<()> {
    let embedder = FakeEmbedder::new(32);
    let store = chunked_store();
    let leaves: Vec<&Node> = store.all_nodes().filter(|n| n.is_leaf()).collect();

    let mut index = VectorIndex::for_embedder(&embedder);
    let added = index.insert(&leaves, &embedder, 4)?;
    assert_eq!(added, leaves.len());
    assert_eq!(index.insert(&leaves, &embedder, 4)?, 0);
    assert_eq!(index.len(), leaves.len());

    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("vector_store.json");
    index.persist(&path)?;
    let mut loaded = VectorIndex::load(&path)?;
    assert_eq!(loaded, index);
    assert!(leaves.iter().all(|leaf| loaded.contains(&leaf.id)));
    assert_eq!(loaded.insert(&leaves, &embedder, 4)?, 0);
    Ok(())
}

#[test]
fn vector_file_with_duplicate_entries_is_corrupt() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let path = tmp.path().join("vector_store.json");
    let entry = serde_json::json!({ "node_id": "a", "vector": [1.0, 0.0] });
    let file = serde_json::json!({ "embedder_id": "fake:xxhash:d2", "dim": 2, "entries": [entry.clone(), entry] });
    std::fs::write(&path, serde_json::to_vec(&file)?)?;

    let err = VectorIndex::load(&path).unwrap_err();
    assert!(matches!(err, Error::IndexLoad { .. }), "{err}");
    assert!(!err.is_missing_index());
    Ok(())
}

#[test]
fn vector_index_rejects_other_embedders() {
    let built_with = FakeEmbedder::new(32);
    let other = FakeEmbedder::new(16);
    let leaf = node("a", None, 0, &[], (0, 1));
    let mut index = VectorIndex::for_embedder(&built_with);

    assert!(matches!(index.ensure_embedder(&other), Err(Error::EmbeddingModelMismatch { .. })));
    assert!(matches!(index.insert(&[&leaf], &other, 8), Err(Error::EmbeddingModelMismatch { .. })));
    assert!(matches!(index.search(&[0.0; 16], 3), Err(Error::EmbeddingModelMismatch { .. })));
}

#[test]
fn full_sibling_coverage_merges_into_parent() -> anyhow::Result<()> {
    let mut store = NodeStore::new();
    store.add_nodes(vec![
        node("p", None, 0, &["x", "y", "z"], (0, 30)),
        node("x", Some("p"), 1, &[], (0, 10)),
        node("y", Some("p"), 1, &[], (10, 20)),
        node("z", Some("p"), 1, &[], (20, 30)),
    ]);
    let merged = AutoMergingRetriever::new(&store).retrieve(vec![hit("x", 0.9), hit("y", 0.7), hit("z", 0.4)])?;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, "p");
    assert_eq!(merged[0].text, "text of p");
    assert!((merged[0].score - 0.9).abs() < 1e-6);
    assert_eq!(merged[0].level, 0);
    Ok(())
}

#[test]
fn sparse_sibling_coverage_stays_unmerged() -> anyhow::Result<()> {
    let mut store = NodeStore::new();
    store.add_nodes(vec![
        node("p", None, 0, &["w", "x", "y", "z"], (0, 40)),
        node("w", Some("p"), 1, &[], (0, 10)),
        node("x", Some("p"), 1, &[], (10, 20)),
        node("y", Some("p"), 1, &[], (20, 30)),
        node("z", Some("p"), 1, &[], (30, 40)),
    ]);
    let merged = AutoMergingRetriever::new(&store).retrieve(vec![hit("y", 0.8)])?;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, "y");
    Ok(())
}

#[test]
fn merging_repeats_up_the_tree() -> anyhow::Result<()> {
    let store = two_level_store();
    let retriever = AutoMergingRetriever::new(&store);

    let all = retriever.retrieve(vec![hit("a", 0.5), hit("b", 0.6), hit("c", 0.9), hit("d", 0.2)])?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, "root");
    assert!((all[0].score - 0.9).abs() < 1e-6);

    // Half of p2 is not strictly more than half.
    let partial = retriever.retrieve(vec![hit("c", 0.9), hit("a", 0.5), hit("b", 0.6)])?;
    let ids: Vec<&str> = partial.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["c", "p1"]);
    Ok(())
}

#[test]
fn lower_threshold_merges_half_covered_parents() -> anyhow::Result<()> {
    let store = two_level_store();
    let merged = AutoMergingRetriever::new(&store).with_threshold(0.4).retrieve(vec![hit("c", 0.3)])?;
    // p2 at 1/2, then root at 1/2.
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, "root");
    Ok(())
}

#[test]
fn equal_scores_keep_hit_order() -> anyhow::Result<()> {
    let store = two_level_store();
    let merged = AutoMergingRetriever::new(&store).retrieve(vec![hit("d", 0.5), hit("a", 0.5)])?;
    let ids: Vec<&str> = merged.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["d", "a"]);
    Ok(())
}

#[test]
fn missing_nodes_are_consistency_errors() {
    let mut store = NodeStore::new();
    store.add_nodes(vec![node("orphan", Some("gone"), 1, &[], (0, 5))]);
    let retriever = AutoMergingRetriever::new(&store);
    assert!(matches!(retriever.retrieve(vec![hit("orphan", 0.4)]), Err(Error::StoreConsistency(_))));
    assert!(matches!(retriever.retrieve(vec![hit("unknown", 0.4)]), Err(Error::StoreConsistency(_))));
}

#[test]
fn single_child_chain_keeps_the_leaf() -> anyhow::Result<()> {
    let chunker = HierarchicalChunker::new(ChunkSchedule::default())?;
    let tree = chunker.chunk(&Document::new("alice", "cat.txt", "The cat sat on the mat."))?;
    let leaf_id = tree.leaf_nodes().next().map(|n| n.id.clone()).expect("leaf");
    let mut store = NodeStore::new();
    store.add_nodes(tree.into_nodes());

    let merged = AutoMergingRetriever::new(&store).retrieve(vec![hit(&leaf_id, 0.8)])?;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, leaf_id);
    assert_eq!(merged[0].text, "The cat sat on the mat.");
    Ok(())
}

/// p -> a (a1, a2), b (b1 spanning all of b)
fn store_with_single_child_branch() -> NodeStore {
    let mut store = NodeStore::new();
    store.add_nodes(vec![
        node("p", None, 0, &["a", "b"], (0, 30)),
        node("a", Some("p"), 1, &["a1", "a2"], (0, 20)),
        node("b", Some("p"), 1, &["b1"], (20, 30)),
        node("a1", Some("a"), 2, &[], (0, 10)),
        node("a2", Some("a"), 2, &[], (10, 20)),
        node("b1", Some("b"), 2, &[], (20, 30)),
    ]);
    store
}

#[test]
fn single_child_branch_still_counts_toward_its_grandparent() -> anyhow::Result<()> {
    let store = store_with_single_child_branch();
    let retriever = AutoMergingRetriever::new(&store);

    let merged = retriever.retrieve(vec![hit("a1", 0.9), hit("a2", 0.8), hit("b1", 0.7)])?;
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].id, "p");
    assert!((merged[0].score - 0.9).abs() < 1e-6);

    // Without a1 the root sees one of two children; b1 is reported, not b.
    let partial = retriever.retrieve(vec![hit("b1", 0.7), hit("a2", 0.6)])?;
    let ids: Vec<&str> = partial.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["b1", "a2"]);
    assert_eq!(partial[0].text, "text of b1");
    assert_eq!(partial[0].level, 2);
    Ok(())
}
