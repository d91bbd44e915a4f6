//! Auto-merging retrieval.
//!
//! Leaf hits that cover enough of a parent's children are replaced by the
//! parent, repeatedly, so the answer context is a few coherent passages
//! instead of many overlapping fragments.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use docqa_core::types::{Node, NodeId, RetrievedNode, SearchHit};
use docqa_core::{Error, Result};

use crate::store::NodeStore;

pub const DEFAULT_MERGE_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
struct Candidate {
    id: NodeId,
    score: f32,
    /// Rank of the earliest raw hit this candidate stands for.
    order: usize,
    /// Node returned to the caller. Differs from `id` while the candidate is
    /// climbing through parents that wrap a single child of the same span.
    report: NodeId,
}

enum Step {
    Keep,
    Merge,
    /// The parent only repeats its child's span: group under it for the
    /// level above, but keep reporting the child.
    PassThrough,
}

pub struct AutoMergingRetriever<'a> {
    store: &'a NodeStore,
    threshold: f32,
}

impl<'a> AutoMergingRetriever<'a> {
    pub fn new(store: &'a NodeStore) -> Self {
        Self { store, threshold: DEFAULT_MERGE_THRESHOLD }
    }

    /// A parent absorbs its hit children when `hit children / children`
    /// is strictly greater than `threshold`.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn retrieve(&self, hits: Vec<SearchHit>) -> Result<Vec<RetrievedNode>> {
        let mut seen = HashSet::new();
        let mut current: Vec<Candidate> = hits
            .into_iter()
            .enumerate()
            .filter(|(_, h)| seen.insert(h.id.clone()))
            .map(|(order, h)| Candidate { report: h.id.clone(), id: h.id, score: h.score, order })
            .collect();

        // Every round moves at least one candidate a level up.
        let mut rounds = 0;
        while let Some(next) = self.merge_round(&current)? {
            rounds += 1;
            if rounds > self.store.len() {
                return Err(Error::StoreConsistency("parent links form a cycle".to_string()));
            }
            current = next;
        }

        current.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.order.cmp(&b.order)));
        current
            .into_iter()
            .map(|c| {
                let node = self.resolve(&c.report)?;
                Ok(RetrievedNode {
                    id: c.report,
                    score: c.score,
                    text: node.text.clone(),
                    level: node.level,
                    doc_id: node.doc_id.clone(),
                })
            })
            .collect()
    }

    /// One pass over the parents of the current candidates. `None` once no
    /// parent qualifies.
    fn merge_round(&self, current: &[Candidate]) -> Result<Option<Vec<Candidate>>> {
        let mut groups: Vec<(&NodeId, Vec<usize>)> = Vec::new();
        let mut group_of: HashMap<&NodeId, usize> = HashMap::new();
        for (i, candidate) in current.iter().enumerate() {
            let node = self.resolve(&candidate.id)?;
            if let Some(parent) = &node.parent {
                let g = *group_of.entry(parent).or_insert_with(|| {
                    groups.push((parent, Vec::new()));
                    groups.len() - 1
                });
                groups[g].1.push(i);
            }
        }

        let mut absorbed = HashSet::new();
        let mut promoted = Vec::new();
        for (parent_id, members) in groups {
            let parent = self.store.get_node(parent_id).map_err(|_| {
                Error::StoreConsistency(format!("parent {parent_id} of a retrieved node is missing from the store"))
            })?;
            let report = match self.step(parent, current, &members)? {
                Step::Keep => continue,
                Step::PassThrough => current[members[0]].report.clone(),
                Step::Merge => {
                    debug!(parent = %parent_id, merged = members.len(), children = parent.children.len(), "auto-merged hits into parent");
                    parent_id.clone()
                }
            };
            let score = members.iter().map(|&i| current[i].score).fold(f32::NEG_INFINITY, f32::max);
            let order = members.iter().map(|&i| current[i].order).min().unwrap_or(usize::MAX);
            absorbed.extend(members);
            promoted.push(Candidate { id: parent_id.clone(), score, order, report });
        }
        if promoted.is_empty() {
            return Ok(None);
        }

        let mut next: Vec<Candidate> = current
            .iter()
            .enumerate()
            .filter(|(i, _)| !absorbed.contains(i))
            .map(|(_, c)| c.clone())
            .collect();
        for candidate in promoted {
            match next.iter_mut().find(|c| c.id == candidate.id) {
                Some(existing) => {
                    existing.score = existing.score.max(candidate.score);
                    existing.order = existing.order.min(candidate.order);
                    if existing.report != candidate.report {
                        existing.report = existing.id.clone();
                    }
                }
                None => next.push(candidate),
            }
        }
        Ok(Some(next))
    }

    fn step(&self, parent: &Node, current: &[Candidate], members: &[usize]) -> Result<Step> {
        if parent.children.is_empty() {
            return Err(Error::StoreConsistency(format!("parent {} has no children", parent.id)));
        }
        if let ([only], 1) = (members, parent.children.len()) {
            let child = self.resolve(&current[*only].id)?;
            if child.start == parent.start && child.end == parent.end {
                return Ok(Step::PassThrough);
            }
        }
        let ratio = members.len() as f32 / parent.children.len() as f32;
        Ok(if ratio > self.threshold { Step::Merge } else { Step::Keep })
    }

    fn resolve(&self, id: &str) -> Result<&'a Node> {
        self.store
            .get_node(id)
            .map_err(|_| Error::StoreConsistency(format!("retrieved node {id} is missing from the store")))
    }
}
