//! Domain types shared by the chunker, the index and the service layer.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type NodeId = String;

/// One chunk of a document at a given level of the hierarchy.
///
/// - `level`: 0 is the coarsest level, the last level of the schedule holds leaves
/// - `parent`/`children`: links inside the same document tree
/// - `start`/`end`: byte span of `text` inside the source document
///
/// Nodes are immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub doc_id: String,
    pub text: String,
    pub level: usize,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub start: usize,
    pub end: usize,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// A document handed to the chunker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: String,
    pub username: String,
    pub text: String,
}

impl Document {
    pub fn new(username: &str, filename: &str, text: impl Into<String>) -> Self {
        Self { id: document_id(username, filename), username: username.to_string(), text: text.into() }
    }
}

/// Stable document identity for a user's upload.
pub fn document_id(username: &str, filename: &str) -> String {
    format!("doc_{username}_{filename}")
}

/// Decreasing chunk sizes (in word tokens) plus the overlap carried between
/// consecutive chunks of the same level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkSchedule {
    pub sizes: Vec<usize>,
    pub overlap: usize,
}

impl Default for ChunkSchedule {
    fn default() -> Self {
        Self { sizes: vec![2048, 512, 128], overlap: 20 }
    }
}

impl ChunkSchedule {
    pub fn new(sizes: Vec<usize>, overlap: usize) -> Result<Self> {
        let schedule = Self { sizes, overlap };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<()> {
        let Some(&smallest) = self.sizes.last() else {
            return Err(Error::InvalidConfig("chunk schedule needs at least one size".into()));
        };
        if self.sizes.iter().any(|&s| s == 0) {
            return Err(Error::InvalidConfig("chunk sizes must be positive".into()));
        }
        if self.sizes.windows(2).any(|w| w[0] <= w[1]) {
            return Err(Error::InvalidConfig(format!("chunk sizes must be strictly decreasing: {:?}", self.sizes)));
        }
        if self.overlap >= smallest {
            return Err(Error::InvalidConfig(format!(
                "chunk overlap {} must be smaller than the finest chunk size {}",
                self.overlap, smallest
            )));
        }
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.sizes.len()
    }

    pub fn leaf_level(&self) -> usize {
        self.sizes.len().saturating_sub(1)
    }
}

/// Raw similarity hit. Higher `score` is better.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub id: NodeId,
    pub score: f32,
}

/// A retrieval result resolved against the node store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedNode {
    pub id: NodeId,
    pub score: f32,
    pub text: String,
    pub level: usize,
    pub doc_id: String,
}
