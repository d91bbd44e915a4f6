//! Node store: every node of every level, keyed by id.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use docqa_core::types::{Node, NodeId};
use docqa_core::{Error, Result};

#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodeStore {
    nodes: BTreeMap<NodeId, Node>,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    nodes: Vec<Node>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by id. Ids already present keep their stored node untouched.
    /// Returns how many nodes were new.
    pub fn add_nodes<I>(&mut self, nodes: I) -> usize
    where
        I: IntoIterator<Item = Node>,
    {
        let mut added = 0;
        for node in nodes {
            if let std::collections::btree_map::Entry::Vacant(slot) = self.nodes.entry(node.id.clone()) {
                slot.insert(node);
                added += 1;
            }
        }
        added
    }

    pub fn get_node(&self, id: &str) -> Result<&Node> {
        self.nodes.get(id).ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    pub fn get_children(&self, id: &str) -> Result<Vec<&Node>> {
        let node = self.get_node(id)?;
        node.children
            .iter()
            .map(|child| {
                self.nodes
                    .get(child)
                    .ok_or_else(|| Error::StoreConsistency(format!("node {id} lists missing child {child}")))
            })
            .collect()
    }

    pub fn get_parent(&self, id: &str) -> Result<Option<&Node>> {
        let node = self.get_node(id)?;
        match &node.parent {
            None => Ok(None),
            Some(parent) => self
                .nodes
                .get(parent)
                .map(Some)
                .ok_or_else(|| Error::StoreConsistency(format!("node {id} points at missing parent {parent}"))),
        }
    }

    /// Iterates in id order; call again to restart.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.values()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn document_ids(&self) -> BTreeSet<&str> {
        self.nodes.values().map(|n| n.doc_id.as_str()).collect()
    }

    /// Set union on id; nodes already present win.
    pub fn merge(&mut self, other: NodeStore) -> usize {
        self.add_nodes(other.nodes.into_values())
    }

    /// Check that every parent/child link resolves and is reciprocal.
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            if let Some(parent_id) = &node.parent {
                let parent = self.nodes.get(parent_id).ok_or_else(|| {
                    Error::StoreConsistency(format!("node {} points at missing parent {parent_id}", node.id))
                })?;
                if !parent.children.contains(&node.id) {
                    return Err(Error::StoreConsistency(format!(
                        "parent {parent_id} does not list child {}",
                        node.id
                    )));
                }
            }
            for child_id in &node.children {
                let child = self.nodes.get(child_id).ok_or_else(|| {
                    Error::StoreConsistency(format!("node {} lists missing child {child_id}", node.id))
                })?;
                if child.parent.as_ref() != Some(&node.id) || child.level != node.level + 1 {
                    return Err(Error::StoreConsistency(format!(
                        "child {child_id} is not linked back to {}",
                        node.id
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let file = StoreFile { nodes: self.nodes.values().cloned().collect() };
        Ok(serde_json::to_vec(&file)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, String> {
        let file: StoreFile = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
        let mut store = Self::new();
        let count = file.nodes.len();
        if store.add_nodes(file.nodes) != count {
            return Err("duplicate node ids".to_string());
        }
        Ok(store)
    }

    pub fn persist(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = crate::read_index_file(path)?;
        Self::from_bytes(&bytes).map_err(|reason| Error::corrupt_index(path, reason))
    }
}
