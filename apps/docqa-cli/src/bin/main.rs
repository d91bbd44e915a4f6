//! `docqa` command-line front end.
//!
//! ```bash
//! docqa upload alice notes/ manual.md
//! docqa ask alice "When should the coop door be closed?" --confidence 0.8
//! docqa status alice
//! docqa reset alice
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use docqa_core::config::{Config, Settings};
use docqa_core::traits::Credentials;
use docqa_embed::get_default_embedder;
use docqa_index::UserIndex;
use docqa_service::{validate_username, AskOptions, FileOutcome, IndexManager, OpenAiSynthesizer, UploadFile};

/// Per-user document question answering over a hierarchical index.
#[derive(Parser)]
#[command(name = "docqa", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index files (or every file under directories) for a user
    Upload {
        username: String,
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Answer a question from a user's documents
    Ask {
        username: String,
        question: String,
        /// How sure the answer should sound, in [0, 1]; temperature is 1 - confidence
        #[arg(long, default_value = "0.7")]
        confidence: f32,
        /// Leaves to retrieve before merging (default: retrieval.similarity_top_k)
        #[arg(long)]
        top_k: Option<usize>,
        /// API key for the answer provider (default: $OPENAI_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },
    /// Show a user's index metadata
    Status {
        username: String,
        /// Print the metadata as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a user's index
    Reset { username: String },
}

fn collect_files(paths: &[PathBuf]) -> Result<Vec<UploadFile>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in WalkDir::new(path).sort_by_file_name().into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    files.push(read_upload(entry.path())?);
                }
            }
        } else {
            files.push(read_upload(path)?);
        }
    }
    Ok(files)
}

fn read_upload(path: &Path) -> Result<UploadFile> {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    debug!(path = %path.display(), bytes = bytes.len(), "read upload");
    Ok(UploadFile::new(filename, bytes))
}

/// Loads the embedding model; only commands that embed text need it.
fn build_manager(settings: &Settings) -> Result<IndexManager> {
    let embedder = get_default_embedder(&settings.embedding)?;
    let synthesizer = Arc::new(OpenAiSynthesizer::new(&settings.generation)?);
    Ok(IndexManager::new(settings, embedder, synthesizer)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::load().map_err(|e| {
        eprintln!("Error loading config: {e}");
        e
    })?;
    let settings = config.settings()?;
    let root = settings.storage.root_path();

    match cli.command {
        Command::Upload { username, paths } => {
            let files = collect_files(&paths)?;
            if files.is_empty() {
                bail!("No files found under the given paths");
            }
            let manager = build_manager(&settings)?;
            let report = manager.upload(&username, files).await?;
            for file in &report.files {
                match &file.outcome {
                    FileOutcome::Indexed { nodes_added, leaves_embedded, .. } => {
                        println!("✅ {}: {nodes_added} nodes, {leaves_embedded} new leaves", file.filename);
                    }
                    FileOutcome::Rejected(e) => println!("⚠️  {}: {e}", file.filename),
                }
            }
            match &report.meta {
                Some(meta) => println!(
                    "📊 {username}: {} documents, {} nodes, {} leaves",
                    meta.document_count, meta.node_count, meta.leaf_count
                ),
                None => bail!("No document could be indexed; nothing was saved"),
            }
        }
        Command::Ask { username, question, confidence, top_k, api_key } => {
            let api_key = api_key
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .context("No API key: pass --api-key or set OPENAI_API_KEY")?;
            let options = AskOptions { top_k, confidence };
            let manager = build_manager(&settings)?;
            let answer = manager.ask(&username, &question, options, &Credentials::new(api_key)).await?;
            println!("{}\n", answer.text);
            println!("Sources (temperature {:.2}):", answer.temperature);
            for (i, source) in answer.sources.iter().enumerate() {
                let preview: String = source.text.chars().take(80).collect();
                println!("{:>2}. [{:.3}] {} (level {}) {}", i + 1, source.score, source.doc_id, source.level, preview.replace('\n', " "));
            }
        }
        Command::Status { username, json } => {
            validate_username(&username)?;
            let meta = match UserIndex::load_meta(&root, &username) {
                Ok(meta) => meta,
                Err(e) if e.is_missing_index() => bail!("No index for {username}"),
                Err(e) => return Err(e.into()),
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&meta)?);
            } else {
                println!("Index for {username}");
                println!("  documents:  {}", meta.document_count);
                println!("  nodes:      {}", meta.node_count);
                println!("  leaves:     {}", meta.leaf_count);
                println!("  embedder:   {} ({} dims)", meta.embedder_id, meta.dim);
                println!("  chunking:   {:?} overlap {}", meta.schedule.sizes, meta.schedule.overlap);
                println!("  created:    {}", meta.created_at.to_rfc3339());
                println!("  updated:    {}", meta.updated_at.to_rfc3339());
            }
        }
        Command::Reset { username } => {
            validate_username(&username)?;
            if UserIndex::remove(&root, &username)? {
                println!("🗑️  Removed index for {username}");
            } else {
                println!("No index for {username}");
            }
        }
    }
    Ok(())
}
