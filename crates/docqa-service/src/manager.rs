//! Per-user index lifecycle: upload, retrieve, ask, status, reset.
//!
//! Each username gets its own `RwLock` from the manager's registry. Writers
//! (upload, reset) are exclusive; readers (retrieve, ask, status) share the
//! lock while they load a snapshot. Guards are moved into the blocking task
//! so a dropped request cannot release the lock while its work still runs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use docqa_core::chunker::HierarchicalChunker;
use docqa_core::config::Settings;
use docqa_core::extract::PlainTextExtractor;
use docqa_core::traits::{AnswerSynthesizer, Credentials, DocumentExtractor, Embedder, GenerationRequest};
use docqa_core::types::{document_id, ChunkSchedule, Document, RetrievedNode};
use docqa_core::{Error, Result};
use docqa_index::{AutoMergingRetriever, IndexMeta, UserIndex};

const MAX_USERNAME_LEN: usize = 64;

/// Usernames become directory names: 1-64 chars of `[A-Za-z0-9_.-]`, no
/// leading dot.
pub fn validate_username(username: &str) -> Result<()> {
    let valid_chars = username.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if username.is_empty() || username.len() > MAX_USERNAME_LEN || !valid_chars || username.starts_with('.') {
        return Err(Error::InvalidRequest(format!("invalid username '{username}'")));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self { filename: filename.into(), bytes: bytes.into() }
    }
}

#[derive(Debug)]
pub enum FileOutcome {
    Indexed { doc_id: String, nodes_added: usize, leaves_embedded: usize },
    Rejected(Error),
}

#[derive(Debug)]
pub struct FileReport {
    pub filename: String,
    pub outcome: FileOutcome,
}

#[derive(Debug)]
pub struct UploadReport {
    pub username: String,
    pub files: Vec<FileReport>,
    pub nodes_added: usize,
    pub leaves_embedded: usize,
    /// `None` when no file could be indexed and nothing was written.
    pub meta: Option<IndexMeta>,
}

impl UploadReport {
    pub fn indexed(&self) -> usize {
        self.files.iter().filter(|f| matches!(f.outcome, FileOutcome::Indexed { .. })).count()
    }

    pub fn rejected(&self) -> impl Iterator<Item = (&str, &Error)> + '_ {
        self.files.iter().filter_map(|f| match &f.outcome {
            FileOutcome::Rejected(e) => Some((f.filename.as_str(), e)),
            FileOutcome::Indexed { .. } => None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AskOptions {
    /// Leaves to fetch before merging; configured default when `None`.
    pub top_k: Option<usize>,
    /// In `[0, 1]`; the model samples at `1 - confidence`.
    pub confidence: f32,
}

impl Default for AskOptions {
    fn default() -> Self {
        Self { top_k: None, confidence: 0.7 }
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<RetrievedNode>,
    pub temperature: f32,
}

/// What the blocking side of a request needs; cheap to clone.
#[derive(Clone)]
struct Worker {
    root: PathBuf,
    schedule: ChunkSchedule,
    batch_size: usize,
    merge_threshold: f32,
    embedder: Arc<dyn Embedder>,
    extractor: Arc<dyn DocumentExtractor>,
}

/// One `RwLock` per username. Entries nobody holds or waits on are dropped
/// the next time a lock is handed out.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl UserLocks {
    fn get(&self, username: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|name, lock| name == username || Arc::strong_count(lock) > 1);
        locks.entry(username.to_string()).or_default().clone()
    }
}

pub struct IndexManager {
    worker: Worker,
    default_top_k: usize,
    synthesizer: Arc<dyn AnswerSynthesizer>,
    locks: UserLocks,
}

impl IndexManager {
    pub fn new(settings: &Settings, embedder: Arc<dyn Embedder>, synthesizer: Arc<dyn AnswerSynthesizer>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            worker: Worker {
                root: settings.storage.root_path(),
                schedule: settings.chunking.schedule()?,
                batch_size: settings.embedding.batch_size,
                merge_threshold: settings.retrieval.merge_threshold,
                embedder,
                extractor: Arc::new(PlainTextExtractor),
            },
            default_top_k: settings.retrieval.similarity_top_k,
            synthesizer,
            locks: UserLocks::default(),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.worker.extractor = extractor;
        self
    }

    fn user_lock(&self, username: &str) -> Arc<RwLock<()>> {
        self.locks.get(username)
    }

    /// Index `files` for `username`, creating the index on first use.
    /// Unsupported or empty files are reported and skipped.
    pub async fn upload(&self, username: &str, files: Vec<UploadFile>) -> Result<UploadReport> {
        validate_username(username)?;
        info!(username, files = files.len(), "upload received");
        let guard = self.user_lock(username).write_owned().await;
        let worker = self.worker.clone();
        let username = username.to_string();
        run_blocking(move || {
            let _guard = guard;
            worker.upload(&username, files)
        })
        .await
    }

    /// Leaf search followed by auto-merging, best first.
    pub async fn retrieve(&self, username: &str, question: &str, top_k: Option<usize>) -> Result<Vec<RetrievedNode>> {
        validate_username(username)?;
        if question.trim().is_empty() {
            return Err(Error::InvalidRequest("question is empty".to_string()));
        }
        let k = top_k.unwrap_or(self.default_top_k);
        if k == 0 {
            return Err(Error::InvalidRequest("top_k must be positive".to_string()));
        }
        let guard = self.user_lock(username).read_owned().await;
        let worker = self.worker.clone();
        let username = username.to_string();
        let question = question.to_string();
        run_blocking(move || {
            let _guard = guard;
            worker.retrieve(&username, &question, k)
        })
        .await
    }

    /// Retrieve, then synthesize an answer at `1 - confidence` temperature.
    /// The user's lock is released before generation starts.
    pub async fn ask(&self, username: &str, question: &str, options: AskOptions, credentials: &Credentials) -> Result<Answer> {
        if !(0.0..=1.0).contains(&options.confidence) {
            return Err(Error::InvalidRequest(format!("confidence {} is outside [0, 1]", options.confidence)));
        }
        if credentials.api_key.trim().is_empty() {
            return Err(Error::InvalidRequest("API key is empty".to_string()));
        }
        let sources = self.retrieve(username, question, options.top_k).await?;
        let temperature = 1.0 - options.confidence;
        let context: Vec<String> = sources.iter().map(|s| s.text.clone()).collect();
        info!(username, sources = sources.len(), temperature, "synthesizing answer");
        let request = GenerationRequest { question, context: &context, temperature };
        let text = self.synthesizer.generate(&request, credentials).await?;
        Ok(Answer { text, sources, temperature })
    }

    pub async fn status(&self, username: &str) -> Result<IndexMeta> {
        validate_username(username)?;
        let guard = self.user_lock(username).read_owned().await;
        let root = self.worker.root.clone();
        let username = username.to_string();
        run_blocking(move || {
            let _guard = guard;
            UserIndex::load_meta(&root, &username).map_err(|e| not_found(e, &username))
        })
        .await
    }

    /// Drop everything persisted for `username`; the way out of a corrupt
    /// index. Returns whether an index existed.
    pub async fn reset(&self, username: &str) -> Result<bool> {
        validate_username(username)?;
        let guard = self.user_lock(username).write_owned().await;
        let root = self.worker.root.clone();
        let username = username.to_string();
        let removed = run_blocking(move || {
            let _guard = guard;
            UserIndex::remove(&root, &username)
        })
        .await?;
        Ok(removed)
    }
}

impl Worker {
    fn upload(&self, username: &str, files: Vec<UploadFile>) -> Result<UploadReport> {
        let mut index = match UserIndex::load(&self.root, username) {
            Ok(index) => {
                index.vectors().ensure_embedder(self.embedder.as_ref())?;
                index
            }
            Err(e) if e.is_missing_index() => {
                info!(username, "no index yet, creating one");
                UserIndex::new(username, self.schedule.clone(), self.embedder.as_ref())
            }
            Err(e) => return Err(e),
        };
        if index.schedule() != &self.schedule {
            warn!(username, stored = ?index.schedule().sizes, configured = ?self.schedule.sizes, "keeping the chunk schedule the index was built with");
        }
        let chunker = HierarchicalChunker::new(index.schedule().clone())?;

        let mut report = UploadReport { username: username.to_string(), files: Vec::new(), nodes_added: 0, leaves_embedded: 0, meta: None };
        for file in files {
            let chunked = self
                .extractor
                .extract(&file.bytes, &file.filename)
                .and_then(|text| chunker.chunk(&Document::new(username, &file.filename, text)));
            let outcome = match chunked {
                Ok(tree) => {
                    let stats = index.ingest(tree, self.embedder.as_ref(), self.batch_size)?;
                    report.nodes_added += stats.nodes_added;
                    report.leaves_embedded += stats.leaves_embedded;
                    info!(username, file = %file.filename, nodes = stats.nodes_added, leaves = stats.leaves_embedded, "document indexed");
                    FileOutcome::Indexed {
                        doc_id: document_id(username, &file.filename),
                        nodes_added: stats.nodes_added,
                        leaves_embedded: stats.leaves_embedded,
                    }
                }
                Err(e) => {
                    warn!(username, file = %file.filename, error = %e, "document skipped");
                    FileOutcome::Rejected(e)
                }
            };
            report.files.push(FileReport { filename: file.filename, outcome });
        }

        if report.indexed() == 0 {
            warn!(username, "no document could be indexed, nothing persisted");
            return Ok(report);
        }
        report.meta = Some(index.save(&self.root)?);
        Ok(report)
    }

    fn retrieve(&self, username: &str, question: &str, k: usize) -> Result<Vec<RetrievedNode>> {
        let index = UserIndex::load(&self.root, username).map_err(|e| not_found(e, username))?;
        index.vectors().ensure_embedder(self.embedder.as_ref())?;
        let query = self
            .embedder
            .embed_batch(&[question.to_string()])
            .map_err(|e| Error::Embedding(format!("{e:#}")))?
            .pop()
            .ok_or_else(|| Error::Embedding("embedder returned no vector for the question".to_string()))?;
        let hits = index.vectors().search(&query, k)?;
        let merged = AutoMergingRetriever::new(index.store()).with_threshold(self.merge_threshold).retrieve(hits)?;
        info!(username, hits = k.min(index.vectors().len()), results = merged.len(), "retrieved");
        Ok(merged)
    }
}

fn not_found(e: Error, username: &str) -> Error {
    if e.is_missing_index() {
        Error::IndexNotFound(username.to_string())
    } else {
        e
    }
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Task(format!("Task join failed: {e}")))?
}
