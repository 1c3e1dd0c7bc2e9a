use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("Invalid environment variable {name}={value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the whole chatbot backend.
///
/// Covers the LLM oracle, retrieval settings, vector storage, conversation
/// summarization, query rewriting, the socket server and logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which chat backend answers questions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    Ollama,
}

/// Configuration for the LLM oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: ProviderKind,
    pub model: String,
    pub base_url: String,
    /// Read from `ANTHROPIC_API_KEY` when absent from the file
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Upper bound for a single LLM call, in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

fn default_llm_timeout() -> u64 {
    60
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Checks that the oracle can actually be reached with this configuration.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.model is empty".to_string()));
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("llm.base_url is empty".to_string()));
        }
        if self.provider == ProviderKind::Anthropic
            && self.api_key.as_deref().map_or(true, |k| k.trim().is_empty())
        {
            return Err(ConfigError::MissingCredential("ANTHROPIC_API_KEY"));
        }
        Ok(())
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Anthropic,
            model: "claude-haiku-4-5-20251001".to_string(),
            base_url: "https://api.anthropic.com".to_string(),
            api_key: None,
            max_tokens: 4096,
            temperature: 0.7,
            timeout_secs: default_llm_timeout(),
        }
    }
}

/// Embedding backend settings.
///
/// The same model must be used at ingestion and query time, and `dimension`
/// must match what the model produces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub model: String,
    pub base_url: String,
    pub dimension: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "all-minilm".to_string(),
            base_url: "http://localhost:11434".to_string(),
            dimension: 384,
        }
    }
}

/// Configuration for retrieval: chunking, embedding and search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_separator")]
    pub markdown_separator: String,
    /// Directory scanned by `ctlchat ingest` when no directory is given
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub loader: LoaderConfig,
}

fn default_top_k() -> usize {
    5
}

fn default_search_timeout() -> u64 {
    10
}

fn default_separator() -> String {
    "##".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl RagConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            chunk_size: 1000,
            chunk_overlap: 200,
            top_k: default_top_k(),
            search_timeout_secs: default_search_timeout(),
            markdown_separator: default_separator(),
            data_dir: default_data_dir(),
            loader: LoaderConfig::default(),
        }
    }
}

/// Configuration for file discovery during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// File extensions to ingest, without the leading dot
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,

    /// Skips directories/files whose path contains any of these strings
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    ["txt", "md", "pdf", "docx"].iter().map(|e| e.to_string()).collect()
}

fn default_exclude_patterns() -> Vec<String> {
    [".git", ".DS_Store", "node_modules", "__pycache__"]
        .iter()
        .map(|p| p.to_string())
        .collect()
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

/// Vector database storage mode
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StorageMode {
    /// Embedded LanceDB table, runs in-process with zero setup (default)
    Embedded { path: String },
    /// Remote Qdrant server over gRPC
    Grpc { url: String },
    /// Process-local store, lost on exit
    Memory,
}

impl Default for StorageMode {
    fn default() -> Self {
        Self::Embedded {
            path: "./data/ctlchat_vectordb".to_string(),
        }
    }
}

/// Vector database configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub storage_mode: StorageMode,
    #[serde(default)]
    pub vector_db: VectorDbConfig,
}

/// Provider-agnostic collection settings shared by every backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDbConfig {
    pub collection_name: String,
}

impl Default for VectorDbConfig {
    fn default() -> Self {
        Self {
            collection_name: "ctl_chat_docs".to_string(),
        }
    }
}

/// Conversation history compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Messages per summarized batch
    pub batch_size: usize,
    /// Longest rendering of a single message in formatted context
    pub max_message_chars: usize,
    pub summary_max_tokens: u32,
    #[serde(default = "default_true")]
    pub cache_summaries: bool,
    #[serde(default = "default_cache_capacity")]
    pub summary_cache_capacity: usize,
}

fn default_true() -> bool {
    true
}

fn default_cache_capacity() -> usize {
    1024
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_message_chars: 500,
            summary_max_tokens: 256,
            cache_summaries: true,
            summary_cache_capacity: default_cache_capacity(),
        }
    }
}

/// Query rewriting before retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    pub enhance: bool,
    pub max_tokens: u32,
    pub related_terms_limit: usize,
    /// Organization name woven into rewriting and summary prompts
    #[serde(default)]
    pub org_name: Option<String>,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            enhance: true,
            max_tokens: 512,
            related_terms_limit: 5,
            org_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub socket_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/ctlchat.sock".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily-rotated log files are written here when set
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Load configuration from `config.yaml` if it exists, otherwise use defaults.
    ///
    /// Environment overrides are applied in both cases.
    pub fn load_or_default() -> Result<Self> {
        if Path::new("config.yaml").exists() {
            return Self::load("config.yaml");
        }
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies the process environment on top of the loaded values.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Some(model) = lookup("MODEL_NAME") {
            self.llm.model = model;
        }
        if let Some(v) = parse_env(&lookup, "MAX_TOKENS")? {
            self.llm.max_tokens = v;
        }
        if let Some(v) = parse_env(&lookup, "TEMPERATURE")? {
            self.llm.temperature = v;
        }
        if let Some(v) = parse_env(&lookup, "CHUNK_SIZE")? {
            self.rag.chunk_size = v;
        }
        if let Some(v) = parse_env(&lookup, "CHUNK_OVERLAP")? {
            self.rag.chunk_overlap = v;
        }
        if let Some(v) = parse_env(&lookup, "TOP_K_RESULTS")? {
            self.rag.top_k = v;
        }
        if let Some(model) = lookup("EMBEDDING_MODEL") {
            self.rag.embedding.model = model;
        }
        if let Some(name) = lookup("COLLECTION_NAME") {
            self.storage.vector_db.collection_name = name;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        Ok(())
    }

    /// Validates the whole configuration.
    ///
    /// Run at startup: a configuration error is fatal.
    pub fn validate(&self) -> Result<()> {
        self.llm.validate()?;
        if self.rag.chunk_size == 0 {
            return Err(ConfigError::Invalid("rag.chunk_size must be greater than 0".to_string()));
        }
        if self.rag.chunk_overlap >= self.rag.chunk_size {
            return Err(ConfigError::Invalid(format!(
                "rag.chunk_overlap ({}) must be less than rag.chunk_size ({})",
                self.rag.chunk_overlap, self.rag.chunk_size
            )));
        }
        if self.rag.embedding.dimension == 0 {
            return Err(ConfigError::Invalid("rag.embedding.dimension must be greater than 0".to_string()));
        }
        if self.rag.top_k == 0 {
            return Err(ConfigError::Invalid("rag.top_k must be greater than 0".to_string()));
        }
        if self.conversation.batch_size == 0 {
            return Err(ConfigError::Invalid("conversation.batch_size must be greater than 0".to_string()));
        }
        Ok(())
    }
}

fn parse_env<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { name, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with_key() -> Config {
        let mut config = Config::default();
        config.llm.api_key = Some("sk-test".to_string());
        config
    }

    #[test]
    fn test_rag_config_defaults() {
        let config = RagConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.chunk_overlap, 200);
        assert_eq!(config.top_k, 5);
        assert_eq!(config.markdown_separator, "##");
    }

    #[test]
    fn test_storage_config_defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.vector_db.collection_name, "ctl_chat_docs");
        assert!(matches!(config.storage_mode, StorageMode::Embedded { .. }));
    }

    #[test]
    fn test_missing_api_key_is_a_configuration_error() {
        let config = Config::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingCredential("ANTHROPIC_API_KEY"))
        ));
        assert!(with_key().validate().is_ok());
    }

    #[test]
    fn test_ollama_needs_no_key() {
        let mut config = Config::default();
        config.llm.provider = ProviderKind::Ollama;
        config.llm.base_url = "http://localhost:11434".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overlap_must_be_smaller_than_chunk() {
        let mut config = with_key();
        config.rag.chunk_overlap = config.rag.chunk_size;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ANTHROPIC_API_KEY", "sk-env"),
            ("CHUNK_SIZE", "400"),
            ("TOP_K_RESULTS", "3"),
            ("COLLECTION_NAME", "acme_docs"),
            ("LOG_LEVEL", "DEBUG"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.rag.chunk_size, 400);
        assert_eq!(config.rag.top_k, 3);
        assert_eq!(config.storage.vector_db.collection_name, "acme_docs");
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unparseable_env_value() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|name| (name == "TEMPERATURE").then(|| "warm".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { name: "TEMPERATURE", .. }));
    }

    #[test]
    fn test_yaml_round_trip_with_partial_file() {
        let yaml = r#"
llm:
  provider: ollama
  model: llama3.2
  base_url: http://localhost:11434
  max_tokens: 1024
  temperature: 0.2
storage:
  storage_mode:
    mode: memory
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.llm.provider, ProviderKind::Ollama);
        assert_eq!(config.llm.timeout_secs, 60);
        assert!(matches!(config.storage.storage_mode, StorageMode::Memory));
        assert_eq!(config.conversation.batch_size, 10);
    }
}
