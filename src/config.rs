use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub rerank: RerankConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Adaptive chunking: window size scales with document length between the
/// configured bounds, targeting roughly `target_chunks` windows per
/// document; overlap is a fixed fraction of the window.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_target_chunks")]
    pub target_chunks: usize,
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default = "default_overlap_divisor")]
    pub overlap_divisor: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_chunks: default_target_chunks(),
            min_chunk_chars: default_min_chunk_chars(),
            max_chunk_chars: default_max_chunk_chars(),
            overlap_divisor: default_overlap_divisor(),
        }
    }
}

fn default_target_chunks() -> usize {
    48
}
fn default_min_chunk_chars() -> usize {
    400
}
fn default_max_chunk_chars() -> usize {
    2400
}
fn default_overlap_divisor() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Lexical shortlist bound (stage one).
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: i64,
    /// Final result bound (reranker output).
    #[serde(default = "default_final_limit")]
    pub final_limit: i64,
    /// Chunk hits fetched from the vector store before document grouping.
    #[serde(default = "default_vector_k")]
    pub vector_k: i64,
    /// Weight of the vector signal in the hybrid score; lexical gets the rest.
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,
    /// Cold documents embedded per query, at most.
    #[serde(default = "default_max_embed_per_query")]
    pub max_embed_per_query: usize,
    /// How long a query waits on another query's in-flight claim.
    #[serde(default = "default_claim_wait_ms")]
    pub claim_wait_ms: u64,
    #[serde(default = "default_claim_poll_ms")]
    pub claim_poll_ms: u64,
    /// Claims older than this are presumed dead and may be taken over.
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: i64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            final_limit: default_final_limit(),
            vector_k: default_vector_k(),
            vector_weight: default_vector_weight(),
            max_embed_per_query: default_max_embed_per_query(),
            claim_wait_ms: default_claim_wait_ms(),
            claim_poll_ms: default_claim_poll_ms(),
            claim_ttl_secs: default_claim_ttl_secs(),
        }
    }
}

fn default_candidate_limit() -> i64 {
    20
}
fn default_final_limit() -> i64 {
    5
}
fn default_vector_k() -> i64 {
    40
}
fn default_vector_weight() -> f64 {
    0.7
}
fn default_max_embed_per_query() -> usize {
    5
}
fn default_claim_wait_ms() -> u64 {
    5_000
}
fn default_claim_poll_ms() -> u64 {
    100
}
fn default_claim_ttl_secs() -> i64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Enrichment strategy: `disabled` (heuristics only) or `model`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
    #[serde(default = "default_enrich_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            api_base: None,
            max_keywords: default_max_keywords(),
            timeout_secs: default_enrich_timeout_secs(),
        }
    }
}

fn default_max_keywords() -> usize {
    12
}
fn default_enrich_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankConfig {
    /// Scoring strategy: `lexical` (deterministic local) or `model`.
    #[serde(default = "default_lexical")]
    pub strategy: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default = "default_rerank_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            strategy: default_lexical(),
            model: None,
            api_base: None,
            timeout_secs: default_rerank_timeout_secs(),
        }
    }
}

fn default_lexical() -> String {
    "lexical".to_string()
}
fn default_rerank_timeout_secs() -> u64 {
    15
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `hash` (deterministic local projection), or `openai`.
    #[serde(default = "default_disabled")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_disabled(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

fn default_disabled() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    384
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.min_chunk_chars == 0 || config.chunking.target_chunks == 0 {
        anyhow::bail!("chunking.min_chunk_chars and chunking.target_chunks must be > 0");
    }
    if config.chunking.max_chunk_chars < config.chunking.min_chunk_chars {
        anyhow::bail!("chunking.max_chunk_chars must be >= chunking.min_chunk_chars");
    }
    if config.chunking.overlap_divisor < 2 {
        anyhow::bail!("chunking.overlap_divisor must be >= 2");
    }

    if config.retrieval.final_limit < 1 || config.retrieval.candidate_limit < 1 {
        anyhow::bail!("retrieval.candidate_limit and retrieval.final_limit must be >= 1");
    }
    if config.retrieval.final_limit > config.retrieval.candidate_limit {
        anyhow::bail!("retrieval.final_limit must not exceed retrieval.candidate_limit");
    }
    if !(0.0..=1.0).contains(&config.retrieval.vector_weight) {
        anyhow::bail!("retrieval.vector_weight must be in [0.0, 1.0]");
    }

    match config.extraction.provider.as_str() {
        "disabled" => {}
        "model" => {
            if config.extraction.model.is_none() {
                anyhow::bail!("extraction.model must be specified when provider is 'model'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be disabled or model.",
            other
        ),
    }

    match config.rerank.strategy.as_str() {
        "lexical" => {}
        "model" => {
            if config.rerank.model.is_none() {
                anyhow::bail!("rerank.model must be specified when strategy is 'model'");
            }
        }
        other => anyhow::bail!(
            "Unknown rerank strategy: '{}'. Must be lexical or model.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                anyhow::bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, or openai.",
            other
        ),
    }
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            db: DbConfig {
                path: PathBuf::from("/tmp/docgate.sqlite"),
            },
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            extraction: ExtractionConfig::default(),
            rerank: RerankConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_final_above_candidate() {
        let mut cfg = base_config();
        cfg.retrieval.final_limit = 50;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_unknown_providers() {
        let mut cfg = base_config();
        cfg.embedding.provider = "mystery".to_string();
        assert!(validate(&cfg).is_err());

        let mut cfg = base_config();
        cfg.rerank.strategy = "mystery".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn model_strategies_require_model_name() {
        let mut cfg = base_config();
        cfg.rerank.strategy = "model".to_string();
        assert!(validate(&cfg).is_err());
        cfg.rerank.model = Some("rerank-v2".to_string());
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg: Config = toml::from_str("[db]\npath = \"/tmp/x.sqlite\"\n").unwrap();
        assert_eq!(cfg.retrieval.candidate_limit, 20);
        assert_eq!(cfg.retrieval.final_limit, 5);
        assert!((cfg.retrieval.vector_weight - 0.7).abs() < 1e-9);
        assert_eq!(cfg.embedding.provider, "disabled");
    }
}
