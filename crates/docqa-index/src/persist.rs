//! On-disk layout of a user's index and the transactional save.
//!
//! ```text
//! <root>/<username>_index/
//!     docstore.json       every node of every level
//!     vector_store.json   leaf embeddings
//!     index_meta.json     counts, timestamps, checksums of the two files above
//! ```
//!
//! A save writes a complete new directory under a staging name, moves the
//! current directory aside to `<username>_index.bak`, renames the staging
//! directory into place and finally drops the backup. A process that dies
//! between the two renames leaves only the backup behind; the next access
//! renames it back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use docqa_core::chunker::NodeTree;
use docqa_core::traits::Embedder;
use docqa_core::types::{ChunkSchedule, Node};
use docqa_core::{Error, Result};

use crate::store::NodeStore;
use crate::vector::VectorIndex;

pub const STORE_FILE: &str = "docstore.json";
pub const VECTOR_FILE: &str = "vector_store.json";
pub const META_FILE: &str = "index_meta.json";
const FORMAT_VERSION: u32 = 1;

pub fn user_index_dir(root: &Path, username: &str) -> PathBuf {
    root.join(format!("{username}_index"))
}

fn backup_dir(root: &Path, username: &str) -> PathBuf {
    root.join(format!("{username}_index.bak"))
}

fn staging_prefix(username: &str) -> String {
    format!(".{username}_index.staging")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub format_version: u32,
    pub username: String,
    pub embedder_id: String,
    pub dim: usize,
    pub schedule: ChunkSchedule,
    pub document_count: usize,
    pub node_count: usize,
    pub leaf_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub store_checksum: String,
    pub vector_checksum: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub nodes_added: usize,
    pub leaves_embedded: usize,
}

/// Node store, vector index and bookkeeping for one user.
#[derive(Debug, Clone)]
pub struct UserIndex {
    username: String,
    schedule: ChunkSchedule,
    store: NodeStore,
    vectors: VectorIndex,
    created_at: DateTime<Utc>,
}

impl UserIndex {
    pub fn new(username: impl Into<String>, schedule: ChunkSchedule, embedder: &dyn Embedder) -> Self {
        Self {
            username: username.into(),
            schedule,
            store: NodeStore::new(),
            vectors: VectorIndex::for_embedder(embedder),
            created_at: Utc::now(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Schedule the index was first built with; later uploads reuse it so
    /// re-chunking a document yields the same node ids.
    pub fn schedule(&self) -> &ChunkSchedule {
        &self.schedule
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    pub fn vectors(&self) -> &VectorIndex {
        &self.vectors
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Add a chunked document. Only leaves not already indexed are embedded.
    pub fn ingest(&mut self, tree: NodeTree, embedder: &dyn Embedder, batch_size: usize) -> Result<IngestStats> {
        let leaves: Vec<&Node> = tree.leaf_nodes().collect();
        let leaves_embedded = self.vectors.insert(&leaves, embedder, batch_size)?;
        let nodes_added = self.store.add_nodes(tree.into_nodes());
        Ok(IngestStats { nodes_added, leaves_embedded })
    }

    fn leaf_count(&self) -> usize {
        self.store.all_nodes().filter(|n| n.is_leaf()).count()
    }

    /// Write the whole index atomically and return the metadata written.
    pub fn save(&self, root: &Path) -> Result<IndexMeta> {
        fs::create_dir_all(root)?;
        let final_dir = user_index_dir(root, &self.username);
        let backup = backup_dir(root, &self.username);

        let staging = tempfile::Builder::new().prefix(&staging_prefix(&self.username)).tempdir_in(root)?;
        let store_bytes = self.store.to_bytes()?;
        let vector_bytes = self.vectors.to_bytes()?;
        let meta = IndexMeta {
            format_version: FORMAT_VERSION,
            username: self.username.clone(),
            embedder_id: self.vectors.embedder_id().to_string(),
            dim: self.vectors.dim(),
            schedule: self.schedule.clone(),
            document_count: self.store.document_ids().len(),
            node_count: self.store.len(),
            leaf_count: self.leaf_count(),
            created_at: self.created_at,
            updated_at: Utc::now(),
            store_checksum: checksum(&store_bytes),
            vector_checksum: checksum(&vector_bytes),
        };
        fs::write(staging.path().join(STORE_FILE), &store_bytes)?;
        fs::write(staging.path().join(VECTOR_FILE), &vector_bytes)?;
        fs::write(staging.path().join(META_FILE), serde_json::to_vec_pretty(&meta)?)?;

        if final_dir.exists() {
            if backup.exists() {
                fs::remove_dir_all(&backup)?;
            }
            fs::rename(&final_dir, &backup)?;
        }
        // The staging TempDir only removes what is still at its path on drop.
        if let Err(e) = fs::rename(staging.path(), &final_dir) {
            if backup.exists() {
                fs::rename(&backup, &final_dir)?;
            }
            return Err(Error::Io(e));
        }
        if backup.exists() {
            if let Err(e) = fs::remove_dir_all(&backup) {
                warn!(path = %backup.display(), error = %e, "could not remove previous index copy");
            }
        }
        info!(
            username = %self.username,
            nodes = meta.node_count,
            leaves = meta.leaf_count,
            documents = meta.document_count,
            "index persisted"
        );
        Ok(meta)
    }

    /// Load a persisted index. A missing index is [`Error::IndexLoad`] with
    /// a *missing* failure; anything unreadable or inconsistent in an index
    /// that exists is [`Error::StoreConsistency`].
    pub fn load(root: &Path, username: &str) -> Result<Self> {
        let dir = locate(root, username)?;
        let meta = read_meta(&dir)?;
        if meta.username != username {
            return Err(Error::StoreConsistency(format!(
                "index at {} belongs to '{}'",
                dir.display(),
                meta.username
            )));
        }

        let store_bytes = read_checked(&dir.join(STORE_FILE), &meta.store_checksum)?;
        let vector_bytes = read_checked(&dir.join(VECTOR_FILE), &meta.vector_checksum)?;
        let store = NodeStore::from_bytes(&store_bytes)
            .map_err(|reason| Error::StoreConsistency(format!("{}: {reason}", dir.join(STORE_FILE).display())))?;
        let vectors = VectorIndex::from_bytes(&vector_bytes)
            .map_err(|reason| Error::StoreConsistency(format!("{}: {reason}", dir.join(VECTOR_FILE).display())))?;

        store.validate()?;
        if vectors.embedder_id() != meta.embedder_id || vectors.dim() != meta.dim {
            return Err(Error::StoreConsistency(format!(
                "vector store was written by '{}' ({} dims), metadata says '{}' ({} dims)",
                vectors.embedder_id(),
                vectors.dim(),
                meta.embedder_id,
                meta.dim
            )));
        }
        for id in vectors.node_ids() {
            let node = store
                .get_node(id)
                .map_err(|_| Error::StoreConsistency(format!("vector entry {id} has no node")))?;
            if !node.is_leaf() {
                return Err(Error::StoreConsistency(format!("vector entry {id} is not a leaf")));
            }
        }

        debug!(username, nodes = store.len(), leaves = vectors.len(), "index loaded");
        Ok(Self { username: username.to_string(), schedule: meta.schedule, store, vectors, created_at: meta.created_at })
    }

    /// Metadata only, without reading the stores.
    pub fn load_meta(root: &Path, username: &str) -> Result<IndexMeta> {
        let dir = locate(root, username)?;
        read_meta(&dir)
    }

    /// Delete everything persisted for `username`. Returns whether anything
    /// was there.
    pub fn remove(root: &Path, username: &str) -> Result<bool> {
        let mut removed = false;
        for dir in [user_index_dir(root, username), backup_dir(root, username)] {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
                removed = true;
            }
        }
        if root.exists() {
            let prefix = staging_prefix(username);
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with(&prefix) {
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }
        if removed {
            info!(username, "index removed");
        }
        Ok(removed)
    }
}

/// Resolve the index directory, restoring a backup left by an interrupted save.
fn locate(root: &Path, username: &str) -> Result<PathBuf> {
    let dir = user_index_dir(root, username);
    let backup = backup_dir(root, username);
    if !dir.exists() && backup.exists() {
        warn!(username, path = %backup.display(), "restoring index from interrupted save");
        match fs::rename(&backup, &dir) {
            Ok(()) => {}
            // Readers share the user's lock; another one may have restored it first.
            Err(e) if e.kind() == io::ErrorKind::NotFound && dir.exists() => {
                debug!(username, "backup already restored");
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    if !dir.exists() {
        return Err(Error::missing_index(dir));
    }
    Ok(dir)
}

fn read_meta(dir: &Path) -> Result<IndexMeta> {
    let path = dir.join(META_FILE);
    let bytes = read_existing(&path)?;
    let meta: IndexMeta = serde_json::from_slice(&bytes)
        .map_err(|e| Error::StoreConsistency(format!("{}: {e}", path.display())))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(Error::StoreConsistency(format!(
            "{}: unsupported format version {}",
            path.display(),
            meta.format_version
        )));
    }
    Ok(meta)
}

fn read_checked(path: &Path, expected: &str) -> Result<Vec<u8>> {
    let bytes = read_existing(path)?;
    let actual = checksum(&bytes);
    if actual != expected {
        return Err(Error::StoreConsistency(format!(
            "{}: checksum {actual} does not match metadata {expected}",
            path.display()
        )));
    }
    Ok(bytes)
}

/// Inside an existing index directory a missing file is corruption.
fn read_existing(path: &Path) -> Result<Vec<u8>> {
    crate::read_index_file(path).map_err(|e| match e {
        Error::IndexLoad { .. } => Error::StoreConsistency(format!("{} is missing", path.display())),
        other => other,
    })
}

fn checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
