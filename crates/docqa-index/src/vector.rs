//! Flat cosine-similarity index over leaf embeddings.
//!
//! Entries keep insertion order; search is exhaustive, so ties are broken by
//! that order. The index records which embedder produced its vectors.

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

use docqa_core::traits::Embedder;
use docqa_core::types::{Node, NodeId, SearchHit};
use docqa_core::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct VectorEntry {
    node_id: NodeId,
    vector: Vec<f32>,
}

/// Serialized form. `ids` is rebuilt from the entries on load.
#[derive(Serialize, Deserialize)]
struct VectorFile<'a> {
    embedder_id: Cow<'a, str>,
    dim: usize,
    entries: Cow<'a, [VectorEntry]>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    embedder_id: String,
    dim: usize,
    entries: Vec<VectorEntry>,
    ids: HashSet<NodeId>,
}

impl VectorIndex {
    pub fn new(embedder_id: impl Into<String>, dim: usize) -> Self {
        Self { embedder_id: embedder_id.into(), dim, entries: Vec::new(), ids: HashSet::new() }
    }

    pub fn for_embedder(embedder: &dyn Embedder) -> Self {
        Self::new(embedder.embedder_id(), embedder.dim())
    }

    pub fn embedder_id(&self) -> &str {
        &self.embedder_id
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Ids in insertion order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.entries.iter().map(|e| e.node_id.as_str())
    }

    pub fn ensure_embedder(&self, embedder: &dyn Embedder) -> Result<()> {
        if embedder.embedder_id() != self.embedder_id {
            return Err(Error::EmbeddingModelMismatch {
                expected: self.embedder_id.clone(),
                actual: embedder.embedder_id().to_string(),
            });
        }
        Ok(())
    }

    /// Embed and append leaves not yet indexed. Returns how many were added.
    pub fn insert(&mut self, leaves: &[&Node], embedder: &dyn Embedder, batch_size: usize) -> Result<usize> {
        self.ensure_embedder(embedder)?;
        let mut seen = HashSet::new();
        let pending: Vec<&Node> = leaves
            .iter()
            .copied()
            .filter(|n| !self.ids.contains(&n.id) && seen.insert(n.id.as_str()))
            .collect();
        if pending.is_empty() {
            debug!("no new leaves to embed");
            return Ok(0);
        }

        let pb = ProgressBar::new(pending.len() as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} leaves ({percent}%) {msg}")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        for batch in pending.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|n| n.text.clone()).collect();
            let vectors = embedder.embed_batch(&texts).map_err(|e| Error::Embedding(format!("{e:#}")))?;
            if vectors.len() != batch.len() {
                return Err(Error::Embedding(format!(
                    "embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (node, vector) in batch.iter().zip(vectors) {
                self.check_dim(vector.len())?;
                self.ids.insert(node.id.clone());
                self.entries.push(VectorEntry { node_id: node.id.clone(), vector });
            }
            pb.inc(batch.len() as u64);
        }
        pb.finish_with_message("embedded");
        debug!(added = pending.len(), total = self.entries.len(), "vector index extended");
        Ok(pending.len())
    }

    /// Top `k` leaves by cosine similarity, best first; equal scores keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        self.check_dim(query.len())?;
        let query_norm = norm(query);
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine(query, query_norm, &e.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| SearchHit { id: self.entries[i].node_id.clone(), score })
            .collect())
    }

    fn check_dim(&self, got: usize) -> Result<()> {
        if got != self.dim {
            return Err(Error::EmbeddingModelMismatch {
                expected: format!("{} ({} dims)", self.embedder_id, self.dim),
                actual: format!("vector with {got} dims"),
            });
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = VectorFile {
            embedder_id: Cow::Borrowed(&self.embedder_id),
            dim: self.dim,
            entries: Cow::Borrowed(&self.entries),
        };
        Ok(serde_json::to_vec(&file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        let file: VectorFile = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let mut index = Self::new(file.embedder_id.into_owned(), file.dim);
        index.entries = file.entries.into_owned();
        for entry in &index.entries {
            if entry.vector.len() != index.dim {
                return Err(format!("entry {} has {} dims, index has {}", entry.node_id, entry.vector.len(), index.dim));
            }
            if !index.ids.insert(entry.node_id.clone()) {
                return Err(format!("duplicate entry {}", entry.node_id));
            }
        }
        Ok(index)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    /// [`Error::IndexLoad`] with a missing or corrupt failure when `path`
    /// cannot be read back.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = crate::read_index_file(path)?;
        Self::from_bytes(&bytes).map_err(|reason| Error::corrupt_index(path, reason))
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine(query: &[f32], query_norm: f32, v: &[f32]) -> f32 {
    let denom = query_norm * norm(v);
    if denom <= f32::EPSILON {
        return 0.0;
    }
    query.iter().zip(v).map(|(a, b)| a * b).sum::<f32>() / denom
}
