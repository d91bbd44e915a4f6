//! Storage and retrieval for per-user document indexes.

pub mod persist;
pub mod retriever;
pub mod store;
pub mod vector;

use std::path::Path;

use docqa_core::{Error, Result};

pub use persist::{user_index_dir, IndexMeta, IngestStats, UserIndex};
pub use retriever::{AutoMergingRetriever, DEFAULT_MERGE_THRESHOLD};
pub use store::NodeStore;
pub use vector::VectorIndex;

/// Read a persisted index file, reporting absence as a *missing* load failure.
pub(crate) fn read_index_file(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::missing_index(path)),
        Err(e) => Err(Error::Io(e)),
    }
}
