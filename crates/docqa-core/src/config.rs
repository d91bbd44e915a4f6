//! Configuration loader and path helpers.
//!
//! Uses Figment to layer built-in defaults, `config.toml`, `config.<env>.toml`
//! and `APP_*` env vars (`__` separates nested keys, e.g.
//! `APP_STORAGE__ROOT_DIR`).
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::types::ChunkSchedule;

pub struct Config {
    figment: Figment,
}

impl Config {
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());

        let mut figment = Figment::from(Serialized::defaults(Settings::default())).merge(Toml::file("config.toml"));
        match env_name.as_str() {
            "dev" | "development" => figment = figment.merge(Toml::file("config.dev.toml")),
            "prod" | "production" => figment = figment.merge(Toml::file("config.prod.toml")),
            "test" | "testing" => figment = figment.merge(Toml::file("config.test.toml")),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));

        let config = Self { figment };
        config.settings()?;
        Ok(config)
    }

    /// Build from an explicit figment; defaults are still layered underneath.
    pub fn from_figment(figment: Figment) -> Self {
        Self { figment: Figment::from(Serialized::defaults(Settings::default())).merge(figment) }
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::InvalidConfig(format!("Failed to get '{key}': {e}")))
    }

    pub fn settings(&self) -> Result<Settings> {
        let settings: Settings = self.figment.extract().map_err(|e| Error::InvalidConfig(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub storage: StorageSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub embedding: EmbeddingSettings,
    pub generation: GenerationSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.chunking.schedule()?;
        self.retrieval.validate()?;
        if self.embedding.batch_size == 0 {
            return Err(Error::InvalidConfig("embedding.batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory holding one `<username>_index` directory per user.
    pub root_dir: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { root_dir: "./indexes".to_string() }
    }
}

impl StorageSettings {
    pub fn root_path(&self) -> PathBuf {
        expand_path(&self.root_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub chunk_sizes: Vec<usize>,
    pub chunk_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        let ChunkSchedule { sizes, overlap } = ChunkSchedule::default();
        Self { chunk_sizes: sizes, chunk_overlap: overlap }
    }
}

impl ChunkingSettings {
    pub fn schedule(&self) -> Result<ChunkSchedule> {
        ChunkSchedule::new(self.chunk_sizes.clone(), self.chunk_overlap)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalSettings {
    pub similarity_top_k: usize,
    /// A parent replaces its hit children once `hits / children` exceeds this.
    pub merge_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { similarity_top_k: 6, merge_threshold: 0.5 }
    }
}

impl RetrievalSettings {
    pub fn validate(&self) -> Result<()> {
        if self.similarity_top_k == 0 {
            return Err(Error::InvalidConfig("retrieval.similarity_top_k must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.merge_threshold) {
            return Err(Error::InvalidConfig(format!(
                "retrieval.merge_threshold must be in [0, 1), got {}",
                self.merge_threshold
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    Local,
    Fake,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    pub provider: EmbeddingProviderKind,
    pub model_dir: String,
    pub max_len: usize,
    pub fake_dim: usize,
    pub batch_size: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Local,
            model_dir: "./models/paraphrase-multilingual-MiniLM-L12-v2".to_string(),
            max_len: 128,
            fake_dim: 384,
            batch_size: 32,
        }
    }
}

impl EmbeddingSettings {
    pub fn model_path(&self) -> PathBuf {
        expand_path(&self.model_dir)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self { base_url: "https://api.openai.com".to_string(), model: "gpt-3.5-turbo".to_string(), timeout_secs: 120 }
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}
