use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::confidence::CombineRule;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KgasConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub scaling: ScalingConfig,
    pub cache: CacheConfig,
    pub confidence: ConfidenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub transport: String,
    pub log_level: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `"local"` (ONNX Runtime) or `"hash"` (deterministic feature hashing, no model files).
    pub backend: String,
    pub model: String,
    pub cache_dir: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_retries: usize,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Table column embedded by default.
    pub text_field: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScalingConfig {
    pub node_threshold_pagerank: usize,
    pub node_threshold_similarity: usize,
    pub top_k: usize,
    pub force_exact: bool,
    pub similarity_threshold: f64,
    pub pagerank_tolerance: f64,
    pub pagerank_max_iterations: usize,
    pub approx_pagerank_iterations: usize,
    pub betweenness: bool,
    pub betweenness_sample_size: usize,
    pub sample_seed: u64,
    /// Requests larger than this fail with `ResourceExceeded` before any work starts.
    pub hard_cap: usize,
    pub exact_chunk_rows: usize,
    pub lsh_tables: usize,
    pub lsh_bits: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound on cached conversion results.
    pub max_entries: usize,
    /// Bound on cached per-text embeddings, kept apart from conversion results.
    pub max_embeddings: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// Structural-computation confidence for approximate/sampled graph metrics.
    pub approx_discount: f64,
    /// Extra discount on edges found through the approximate neighbor index.
    pub similarity_discount: f64,
    /// Factor applied to rows whose embedding failed after all retries.
    pub failure_factor: f64,
    /// Factor applied to successfully embedded rows.
    pub embedding_factor: f64,
    /// `"min"` or `"product"`.
    pub propagation: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            transport: "stdio".into(),
            log_level: "info".into(),
            host: "127.0.0.1".into(),
            port: 8750,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_kgas_dir()
            .join("graph.db")
            .to_string_lossy()
            .into_owned();
        Self { db_path }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        let cache_dir = default_kgas_dir()
            .join("models")
            .to_string_lossy()
            .into_owned();
        Self {
            backend: "local".into(),
            model: "all-MiniLM-L6-v2".into(),
            cache_dir,
            dimensions: 384,
            batch_size: 64,
            concurrency: 4,
            max_retries: 3,
            retry_initial_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            text_field: "name".into(),
        }
    }
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            node_threshold_pagerank: 10_000,
            node_threshold_similarity: 5_000,
            top_k: 10,
            force_exact: false,
            similarity_threshold: 0.8,
            pagerank_tolerance: 1e-6,
            pagerank_max_iterations: 100,
            approx_pagerank_iterations: 20,
            betweenness: true,
            betweenness_sample_size: 500,
            sample_seed: 0x6b67_6173,
            hard_cap: 200_000,
            exact_chunk_rows: 256,
            lsh_tables: 8,
            lsh_bits: 12,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1024,
            max_embeddings: 100_000,
        }
    }
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            approx_discount: 0.85,
            similarity_discount: 0.9,
            failure_factor: 0.1,
            embedding_factor: 1.0,
            propagation: "min".into(),
        }
    }
}

impl ConfidenceConfig {
    /// Parsed propagation rule. Only rules that keep derived scores at or below their inputs.
    pub fn propagation_rule(&self) -> Result<CombineRule> {
        let rule: CombineRule = self
            .propagation
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        anyhow::ensure!(
            rule.preserves_min_bound(),
            "confidence.propagation must be \"min\" or \"product\", got \"{}\"",
            self.propagation
        );
        Ok(rule)
    }
}

/// Returns `~/.kgas/`
pub fn default_kgas_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".kgas")
}

/// Returns the default config file path: `~/.kgas/config.toml`
pub fn default_config_path() -> PathBuf {
    default_kgas_dir().join("config.toml")
}

impl KgasConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            KgasConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (KGAS_DB, KGAS_LOG_LEVEL, KGAS_FORCE_EXACT, KGAS_EMBEDDING_BACKEND).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("KGAS_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("KGAS_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("KGAS_FORCE_EXACT") {
            self.scaling.force_exact = matches!(val.as_str(), "1" | "true" | "yes");
        }
        if let Ok(val) = std::env::var("KGAS_EMBEDDING_BACKEND") {
            self.embedding.backend = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.confidence;
        for (name, value) in [
            ("confidence.approx_discount", c.approx_discount),
            ("confidence.similarity_discount", c.similarity_discount),
            ("confidence.failure_factor", c.failure_factor),
            ("confidence.embedding_factor", c.embedding_factor),
        ] {
            anyhow::ensure!(
                (0.0..=1.0).contains(&value),
                "{name} must be within [0, 1], got {value}"
            );
        }
        c.propagation_rule()?;

        let s = &self.scaling;
        anyhow::ensure!(
            (-1.0..=1.0).contains(&s.similarity_threshold),
            "scaling.similarity_threshold must be a cosine value in [-1, 1]"
        );
        anyhow::ensure!(s.top_k > 0, "scaling.top_k must be positive");
        anyhow::ensure!(s.pagerank_max_iterations > 0, "scaling.pagerank_max_iterations must be positive");
        anyhow::ensure!(s.approx_pagerank_iterations > 0, "scaling.approx_pagerank_iterations must be positive");
        anyhow::ensure!(s.pagerank_tolerance > 0.0, "scaling.pagerank_tolerance must be positive");
        anyhow::ensure!(s.betweenness_sample_size > 0, "scaling.betweenness_sample_size must be positive");
        anyhow::ensure!(s.exact_chunk_rows > 0, "scaling.exact_chunk_rows must be positive");
        anyhow::ensure!(
            s.lsh_tables > 0 && (1..=64).contains(&s.lsh_bits),
            "scaling.lsh_tables must be positive and scaling.lsh_bits within 1..=64"
        );

        let e = &self.embedding;
        anyhow::ensure!(e.batch_size > 0, "embedding.batch_size must be positive");
        anyhow::ensure!(e.concurrency > 0, "embedding.concurrency must be positive");
        anyhow::ensure!(e.dimensions > 0, "embedding.dimensions must be positive");

        anyhow::ensure!(self.cache.max_entries > 0, "cache.max_entries must be positive");
        anyhow::ensure!(
            self.cache.max_embeddings > 0,
            "cache.max_embeddings must be positive"
        );
        anyhow::ensure!(
            matches!(self.server.transport.as_str(), "stdio" | "http"),
            "server.transport must be \"stdio\" or \"http\", got \"{}\"",
            self.server.transport
        );
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = KgasConfig::default();
        config.validate().unwrap();
        assert_eq!(config.server.transport, "stdio");
        assert_eq!(config.scaling.node_threshold_pagerank, 10_000);
        assert_eq!(config.scaling.node_threshold_similarity, 5_000);
        assert_eq!(config.confidence.approx_discount, 0.85);
        assert_eq!(config.confidence.similarity_discount, 0.9);
        assert_eq!(config.embedding.max_retries, 3);
        assert!(config.storage.db_path.ends_with("graph.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[scaling]
node_threshold_pagerank = 500
top_k = 5
force_exact = true

[cache]
max_entries = 64
max_embeddings = 500

[embedding]
batch_size = 16
backend = "hash"

[confidence]
approx_discount = 0.7
"#;
        let config: KgasConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scaling.node_threshold_pagerank, 500);
        assert_eq!(config.scaling.top_k, 5);
        assert!(config.scaling.force_exact);
        assert_eq!(config.cache.max_entries, 64);
        assert_eq!(config.cache.max_embeddings, 500);
        assert_eq!(config.embedding.batch_size, 16);
        assert_eq!(config.embedding.backend, "hash");
        assert_eq!(config.confidence.approx_discount, 0.7);
        // defaults still apply for unset fields
        assert_eq!(config.scaling.node_threshold_similarity, 5_000);
        assert_eq!(config.embedding.concurrency, 4);
    }

    #[test]
    fn validate_rejects_out_of_range_discount() {
        let mut config = KgasConfig::default();
        config.confidence.approx_discount = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_weighted_average_propagation() {
        let mut config = KgasConfig::default();
        config.confidence.propagation = "weighted_average".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("confidence.propagation"));

        config.confidence.propagation = "product".into();
        assert_eq!(config.confidence.propagation_rule().unwrap(), CombineRule::Product);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = KgasConfig::default();
        std::env::set_var("KGAS_DB", "/tmp/override.db");
        std::env::set_var("KGAS_LOG_LEVEL", "trace");
        std::env::set_var("KGAS_FORCE_EXACT", "true");
        std::env::set_var("KGAS_EMBEDDING_BACKEND", "hash");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert!(config.scaling.force_exact);
        assert_eq!(config.embedding.backend, "hash");

        std::env::remove_var("KGAS_DB");
        std::env::remove_var("KGAS_LOG_LEVEL");
        std::env::remove_var("KGAS_FORCE_EXACT");
        std::env::remove_var("KGAS_EMBEDDING_BACKEND");
    }
}
