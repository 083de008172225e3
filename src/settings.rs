//! Tunable parameters, loaded from `<data_dir>/docrag.toml`.
//!
//! Every section is optional; a missing file or section yields defaults.
//!
//! ```toml
//! [chunking]
//! chunk_size = 800
//! chunk_overlap = 150
//!
//! [rerank]
//! hard_floor = 0.1
//! threshold = { policy = "percentile", p = 20.0 }
//!
//! [query.synonyms]
//! revenue = ["turnover", "sales"]
//! ```

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub chunking: ChunkingSettings,
    pub dense: DenseSettings,
    pub lexical: LexicalSettings,
    pub query: QuerySettings,
    pub fusion: FusionSettings,
    pub rerank: RerankSettings,
    pub cache: CacheSettings,
    pub ingestion: IngestionSettings,
    pub model: ModelSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    /// Upper bound for a chunk that absorbed a short trailing fragment.
    /// Defaults to `chunk_size + chunk_size / 2`.
    pub max_chunk_size: Option<usize>,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: 800,
            chunk_overlap: 150,
            min_chunk_size: 100,
            max_chunk_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DenseSettings {
    pub max_nb_connection: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
    pub max_layers: usize,
    /// Number of vectors per upsert batch checked for near-duplicates.
    pub dedup_window: usize,
    pub dedup_similarity: f32,
}

impl Default for DenseSettings {
    fn default() -> Self {
        Self {
            max_nb_connection: 32,
            ef_construction: 400,
            ef_search: 128,
            max_layers: 16,
            dedup_window: 5,
            dedup_similarity: 0.99,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StemLanguage {
    English,
    French,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LexicalSettings {
    pub language: StemLanguage,
    pub fuzzy: bool,
    pub writer_memory_bytes: usize,
}

impl Default for LexicalSettings {
    fn default() -> Self {
        Self {
            language: StemLanguage::English,
            fuzzy: true,
            writer_memory_bytes: 50_000_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuerySettings {
    pub max_variations: usize,
    pub primary_k: usize,
    pub variation_k: usize,
    pub spell_correction: bool,
    /// Language assumed when detection is inconclusive.
    pub default_language: StemLanguage,
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_variations: 3,
            primary_k: 20,
            variation_k: 10,
            spell_correction: true,
            default_language: StemLanguage::English,
            synonyms: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FusionSettings {
    pub rank_constant: f32,
    pub max_candidates: usize,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            rank_constant: 60.0,
            max_candidates: 40,
        }
    }
}

/// How the reranker derives its per-query cut-off from the survivors'
/// score distribution.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ThresholdPolicy {
    /// Keep scores at or above the `p`-th percentile.
    Percentile { p: f32 },
    /// Keep scores at or above `mean - alpha * std`.
    MeanStd { alpha: f32 },
    Off,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        ThresholdPolicy::MeanStd { alpha: 0.5 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RerankSettings {
    pub enabled: bool,
    pub hard_floor: f32,
    pub threshold: ThresholdPolicy,
    pub fallback_k: usize,
    pub final_k: usize,
    pub exact_match_boost: f32,
    pub max_exact_match_boost: f32,
    pub entity_overlap_weight: f32,
}

impl Default for RerankSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            hard_floor: 0.1,
            threshold: ThresholdPolicy::default(),
            fallback_k: 3,
            final_k: 8,
            exact_match_boost: 0.05,
            max_exact_match_boost: 0.3,
            entity_overlap_weight: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheSettings {
    pub embedding_capacity: u64,
    pub result_capacity: u64,
    pub result_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            embedding_capacity: 10_000,
            result_capacity: 500,
            result_ttl_secs: 3600,
        }
    }
}

impl CacheSettings {
    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub root: Option<PathBuf>,
    pub include: Vec<String>,
    /// Worker threads; `None` picks `min(cpus - 1, 4)`.
    pub workers: Option<usize>,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            root: None,
            include: ["**/*.md", "**/*.txt", "**/*.json", "**/*.csv"]
                .into_iter()
                .map(String::from)
                .collect(),
            workers: None,
        }
    }
}

impl IngestionSettings {
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus.saturating_sub(1).clamp(1, 4)
        })
        .max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelBackend {
    Colbert,
    Hashing,
}

impl std::str::FromStr for ModelBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "colbert" => Ok(ModelBackend::Colbert),
            "hashing" => Ok(ModelBackend::Hashing),
            other => Err(Error::Config(format!(
                "unknown model backend '{other}', expected colbert or hashing"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ModelSettings {
    pub backend: ModelBackend,
    pub model_id: String,
    pub hashing_dimension: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            backend: ModelBackend::Colbert,
            model_id: crate::model_manager::DEFAULT_MODEL_ID.to_string(),
            hashing_dimension: 256,
            retry_attempts: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

impl ModelSettings {
    pub fn retry_policy(&self) -> crate::model::RetryPolicy {
        crate::model::RetryPolicy {
            max_attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

impl Settings {
    /// Load settings from `path`, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<Settings>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.chunk_size == 0 {
            return Err(Error::Config("chunking.chunk_size must be > 0".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(Error::Config(
                "chunking.chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        if c.min_chunk_size > c.chunk_size {
            return Err(Error::Config(
                "chunking.min_chunk_size must not exceed chunk_size".into(),
            ));
        }
        if self.max_chunk_size() < c.chunk_size {
            return Err(Error::Config(
                "chunking.max_chunk_size must be at least chunk_size".into(),
            ));
        }
        if self.fusion.rank_constant <= 0.0 {
            return Err(Error::Config(
                "fusion.rank_constant must be > 0".into(),
            ));
        }
        if self.rerank.final_k == 0 {
            return Err(Error::Config("rerank.final_k must be >= 1".into()));
        }
        if let ThresholdPolicy::Percentile { p } = self.rerank.threshold
            && !(0.0..=100.0).contains(&p)
        {
            return Err(Error::Config(
                "rerank.threshold.p must be in [0, 100]".into(),
            ));
        }
        Ok(())
    }

    pub fn max_chunk_size(&self) -> usize {
        let c = &self.chunking;
        c.max_chunk_size.unwrap_or(c.chunk_size + c.chunk_size / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let s = Settings::load(&tmp.path().join("docrag.toml")).unwrap();
        assert_eq!(s.chunking.chunk_size, 800);
        assert_eq!(s.chunking.chunk_overlap, 150);
        assert_eq!(s.fusion.rank_constant, 60.0);
        assert_eq!(s.rerank.final_k, 8);
        assert_eq!(s.rerank.threshold, ThresholdPolicy::MeanStd { alpha: 0.5 });
        assert_eq!(s.cache.result_ttl(), Duration::from_secs(3600));
        assert_eq!(s.max_chunk_size(), 1200);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("docrag.toml");
        std::fs::write(
            &path,
            r#"
[chunking]
chunk_size = 400

[rerank]
threshold = { policy = "percentile", p = 20.0 }

[model]
backend = "hashing"

[query.synonyms]
revenue = ["turnover"]
"#,
        )
        .unwrap();

        let s = Settings::load(&path).unwrap();
        assert_eq!(s.chunking.chunk_size, 400);
        assert_eq!(s.chunking.chunk_overlap, 150);
        assert_eq!(s.rerank.threshold, ThresholdPolicy::Percentile { p: 20.0 });
        assert_eq!(s.model.backend, ModelBackend::Hashing);
        assert_eq!(s.query.synonyms["revenue"], vec!["turnover".to_string()]);
    }

    #[test]
    fn off_policy_parses() {
        let s: Settings =
            toml::from_str("[rerank]\nthreshold = { policy = \"off\" }\n")
                .unwrap();
        assert_eq!(s.rerank.threshold, ThresholdPolicy::Off);
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("docrag.toml");
        std::fs::write(&path, "[chunking]\nchunk_size = 100\nchunk_overlap = 100\n")
            .unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_file_is_a_settings_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("docrag.toml");
        std::fs::write(&path, "[chunking\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(Error::Settings(_))));
    }

    #[test]
    fn backend_from_str() {
        assert_eq!("HASHING".parse::<ModelBackend>().unwrap(), ModelBackend::Hashing);
        assert!("gpt".parse::<ModelBackend>().is_err());
    }

    #[test]
    fn worker_count_is_bounded() {
        let s = IngestionSettings::default();
        let n = s.worker_count();
        assert!((1..=4).contains(&n));
        let explicit = IngestionSettings {
            workers: Some(0),
            ..Default::default()
        };
        assert_eq!(explicit.worker_count(), 1);
    }
}
