//! Hierarchical chunking of documents into a tree of nodes.
//!
//! Every level of the [`ChunkSchedule`] re-splits the spans of the level
//! above with a smaller target size, so each child's text is a slice of its
//! parent's text. Boundaries fall between sentences (or paragraphs) whenever
//! possible; a sentence longer than the target size is cut between words.
//! Sizes and overlap count whitespace-delimited tokens.

use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{ChunkSchedule, Document, Node, NodeId};

/// All nodes produced for one document, parents before their children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTree {
    pub nodes: Vec<Node>,
    leaf_level: usize,
}

impl NodeTree {
    pub fn leaf_nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(move |n| n.level == self.leaf_level)
    }

    pub fn roots(&self) -> impl Iterator<Item = &Node> + '_ {
        self.nodes.iter().filter(|n| n.is_root())
    }

    pub fn into_nodes(self) -> Vec<Node> {
        self.nodes
    }
}

#[derive(Debug, Clone)]
pub struct HierarchicalChunker {
    schedule: ChunkSchedule,
}

impl HierarchicalChunker {
    pub fn new(schedule: ChunkSchedule) -> Result<Self> {
        schedule.validate()?;
        Ok(Self { schedule })
    }

    pub fn schedule(&self) -> &ChunkSchedule {
        &self.schedule
    }

    /// Split `doc` into a node tree. Empty or whitespace-only text is an
    /// [`Error::EmptyDocument`].
    pub fn chunk(&self, doc: &Document) -> Result<NodeTree> {
        if doc.text.trim().is_empty() {
            return Err(Error::EmptyDocument { doc_id: doc.id.clone() });
        }
        let mut nodes = Vec::new();
        self.split_level(doc, 0, None, 0, doc.text.len(), &mut nodes);
        debug!(doc_id = %doc.id, nodes = nodes.len(), "chunked document");
        Ok(NodeTree { nodes, leaf_level: self.schedule.leaf_level() })
    }

    fn split_level(
        &self,
        doc: &Document,
        level: usize,
        parent: Option<&NodeId>,
        start: usize,
        end: usize,
        out: &mut Vec<Node>,
    ) -> Vec<NodeId> {
        let size = self.schedule.sizes[level];
        let spans = split_spans(&doc.text[start..end], size, self.schedule.overlap);
        let mut ids = Vec::with_capacity(spans.len());
        for (ordinal, (s, e)) in spans.into_iter().enumerate() {
            let (abs_start, abs_end) = (start + s, start + e);
            let text = &doc.text[abs_start..abs_end];
            let id = node_id(&doc.id, parent, level, ordinal, abs_start, abs_end, text);
            let slot = out.len();
            out.push(Node {
                id: id.clone(),
                doc_id: doc.id.clone(),
                text: text.to_string(),
                level,
                parent: parent.cloned(),
                children: Vec::new(),
                start: abs_start,
                end: abs_end,
            });
            if level + 1 < self.schedule.depth() {
                let children = self.split_level(doc, level + 1, Some(&id), abs_start, abs_end, out);
                out[slot].children = children;
            }
            ids.push(id);
        }
        ids
    }
}

fn node_id(doc_id: &str, parent: Option<&NodeId>, level: usize, ordinal: usize, start: usize, end: usize, text: &str) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    for part in [doc_id.as_bytes(), parent.map_or(&b""[..], |p| p.as_bytes())] {
        hasher.update(part);
        hasher.update(&[0]);
    }
    for n in [level, ordinal, start, end] {
        hasher.update(&(n as u64).to_le_bytes());
    }
    hasher.update(text.as_bytes());
    hasher.finalize().to_hex().as_str()[..32].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: usize,
    end: usize,
    words: usize,
}

/// Byte ranges of the chunks of `text` for one level.
fn split_spans(text: &str, size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let segments = segment(text, size);
    let mut chunks = Vec::new();
    let mut first = 0;
    while first < segments.len() {
        let mut last = first;
        let mut words = segments[first].words;
        while last + 1 < segments.len() && words + segments[last + 1].words <= size {
            last += 1;
            words += segments[last].words;
        }
        chunks.push((segments[first].start, segments[last].end));
        if last + 1 >= segments.len() {
            break;
        }

        // Carry trailing segments into the next chunk, but leave room for at
        // least one new segment so every chunk advances.
        let incoming = segments[last + 1].words;
        let mut next = last + 1;
        let mut carried = 0;
        while next - 1 > first {
            let w = segments[next - 1].words;
            if carried + w > overlap || carried + w + incoming > size {
                break;
            }
            carried += w;
            next -= 1;
        }
        first = next;
    }
    chunks
}

/// Sentences of `text`; sentences longer than `size` words are broken into
/// single-word segments.
fn segment(text: &str, size: usize) -> Vec<Segment> {
    let mut out = Vec::new();
    for (start, end) in sentence_spans(text) {
        let words = text[start..end].split_whitespace().count();
        if words <= size {
            out.push(Segment { start, end, words });
        } else {
            out.extend(word_spans(text, start, end));
        }
    }
    out
}

fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    let mut last_end = 0;
    let mut pending_newline = false;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c.is_whitespace() {
            if c == '\n' {
                // blank line: paragraph break
                if pending_newline {
                    if let Some(s) = start.take() {
                        spans.push((s, last_end));
                    }
                }
                pending_newline = true;
            }
            continue;
        }
        pending_newline = false;
        start.get_or_insert(i);
        last_end = i + c.len_utf8();
        if matches!(c, '.' | '!' | '?') && chars.peek().map_or(true, |&(_, n)| n.is_whitespace()) {
            if let Some(s) = start.take() {
                spans.push((s, last_end));
            }
        }
    }
    if let Some(s) = start {
        spans.push((s, last_end));
    }
    spans
}

fn word_spans(text: &str, start: usize, end: usize) -> Vec<Segment> {
    let mut out = Vec::new();
    let mut word_start: Option<usize> = None;
    for (i, c) in text[start..end].char_indices() {
        let pos = start + i;
        if c.is_whitespace() {
            if let Some(s) = word_start.take() {
                out.push(Segment { start: s, end: pos, words: 1 });
            }
        } else {
            word_start.get_or_insert(pos);
        }
    }
    if let Some(s) = word_start {
        out.push(Segment { start: s, end, words: 1 });
    }
    out
}
