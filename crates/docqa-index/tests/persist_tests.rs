use std::path::Path;

use docqa_core::chunker::HierarchicalChunker;
use docqa_core::types::{ChunkSchedule, Document};
use docqa_core::Error;
use docqa_embed::FakeEmbedder;
use docqa_index::persist::{STORE_FILE, VECTOR_FILE};
use docqa_index::{user_index_dir, UserIndex};

fn built_index(username: &str, embedder: &FakeEmbedder) -> anyhow::Result<UserIndex> {
    let schedule = ChunkSchedule::new(vec![30, 10, 4], 1)?;
    let chunker = HierarchicalChunker::new(schedule.clone())?;
    let mut index = UserIndex::new(username, schedule, embedder);
    let text = "Solar panels charge the battery bank. The inverter feeds the cabin. \
                Rainwater is filtered twice before drinking. The garden needs compost in spring.";
    let tree = chunker.chunk(&Document::new(username, "homestead.txt", text))?;
    let stats = index.ingest(tree, embedder, 8)?;
    assert!(stats.nodes_added > 0);
    assert!(stats.leaves_embedded > 0);
    Ok(index)
}

fn entries(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(root)
        .map(|rd| rd.filter_map(|e| e.ok()).map(|e| e.file_name().to_string_lossy().to_string()).collect())
        .unwrap_or_default();
    names.sort();
    names
}

#[test]
fn save_and_load_round_trip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(48);
    let index = built_index("dana", &embedder)?;
    let meta = index.save(tmp.path())?;

    assert_eq!(meta.username, "dana");
    assert_eq!(meta.embedder_id, "fake:xxhash:d48");
    assert_eq!(meta.dim, 48);
    assert_eq!(meta.document_count, 1);
    assert_eq!(meta.node_count, index.store().len());
    assert_eq!(meta.leaf_count, index.vectors().len());
    assert!(meta.updated_at >= meta.created_at);

    let loaded = UserIndex::load(tmp.path(), "dana")?;
    assert_eq!(loaded.username(), "dana");
    assert_eq!(loaded.store(), index.store());
    assert_eq!(loaded.vectors(), index.vectors());
    assert_eq!(loaded.schedule(), index.schedule());
    assert_eq!(UserIndex::load_meta(tmp.path(), "dana")?, meta);
    assert_eq!(entries(tmp.path()), vec!["dana_index".to_string()]);
    Ok(())
}

#[test]
fn missing_index_is_reported_as_missing() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let err = UserIndex::load(tmp.path(), "nobody").unwrap_err();
    assert!(err.is_missing_index(), "{err}");
    assert!(UserIndex::load_meta(tmp.path(), "nobody").unwrap_err().is_missing_index());
    Ok(())
}

#[test]
fn repeated_saves_leave_no_staging_or_backup() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    let index = built_index("erin", &embedder)?;
    let first = index.save(tmp.path())?;
    let second = index.save(tmp.path())?;
    assert_eq!(first.created_at, second.created_at);
    assert_eq!(first.store_checksum, second.store_checksum);
    assert_eq!(entries(tmp.path()), vec!["erin_index".to_string()]);
    Ok(())
}

#[test]
fn interrupted_swap_is_recovered_from_backup() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    let index = built_index("finn", &embedder)?;
    index.save(tmp.path())?;

    // State after the first rename of a save that never finished.
    let dir = user_index_dir(tmp.path(), "finn");
    std::fs::rename(&dir, tmp.path().join("finn_index.bak"))?;

    let loaded = UserIndex::load(tmp.path(), "finn")?;
    assert_eq!(loaded.store(), index.store());
    assert!(dir.exists());
    assert_eq!(entries(tmp.path()), vec!["finn_index".to_string()]);
    Ok(())
}

#[test]
fn unparsable_store_is_a_consistency_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    built_index("gail", &embedder)?.save(tmp.path())?;
    std::fs::write(user_index_dir(tmp.path(), "gail").join(STORE_FILE), b"garbage")?;

    let err = UserIndex::load(tmp.path(), "gail").unwrap_err();
    assert!(matches!(err, Error::StoreConsistency(_)), "{err}");
    Ok(())
}

#[test]
fn tampered_vectors_fail_the_checksum() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    built_index("hana", &embedder)?.save(tmp.path())?;
    let path = user_index_dir(tmp.path(), "hana").join(VECTOR_FILE);
    let mut bytes = std::fs::read(&path)?;
    bytes.push(b'\n');
    std::fs::write(&path, bytes)?;

    let err = UserIndex::load(tmp.path(), "hana").unwrap_err();
    assert!(matches!(&err, Error::StoreConsistency(msg) if msg.contains("checksum")), "{err}");
    Ok(())
}

#[test]
fn missing_file_inside_index_is_a_consistency_error() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    built_index("ivan", &embedder)?.save(tmp.path())?;
    std::fs::remove_file(user_index_dir(tmp.path(), "ivan").join(VECTOR_FILE))?;

    let err = UserIndex::load(tmp.path(), "ivan").unwrap_err();
    assert!(matches!(err, Error::StoreConsistency(_)), "{err}");
    Ok(())
}

#[test]
fn remove_deletes_persisted_state() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    built_index("jo", &embedder)?.save(tmp.path())?;
    built_index("jon", &embedder)?.save(tmp.path())?;

    assert!(UserIndex::remove(tmp.path(), "jo")?);
    assert!(!UserIndex::remove(tmp.path(), "jo")?);
    assert!(UserIndex::load(tmp.path(), "jo").unwrap_err().is_missing_index());
    UserIndex::load(tmp.path(), "jon")?;
    Ok(())
}

#[test]
fn concurrent_loads_share_one_backup_recovery() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = FakeEmbedder::new(16);
    let index = built_index("kim", &embedder)?;
    index.save(tmp.path())?;
    std::fs::rename(user_index_dir(tmp.path(), "kim"), tmp.path().join("kim_index.bak"))?;

    let root = tmp.path();
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8).map(|_| scope.spawn(move || UserIndex::load_meta(root, "kim"))).collect();
        handles.into_iter().map(|h| h.join().expect("loader thread panicked")).collect()
    });
    for result in results {
        assert_eq!(result?.username, "kim");
    }
    assert_eq!(entries(tmp.path()), vec!["kim_index".to_string()]);
    Ok(())
}
