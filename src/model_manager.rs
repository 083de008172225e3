use std::sync::{Arc, Mutex, MutexGuard};

use candle_core::{Device, Tensor};
use pylate_rs::ColBERT;

use crate::{
    model::{Embedder, HashingEmbedder, ModelError, OverlapScorer, Scorer, normalize},
    settings::{ModelBackend, ModelSettings},
};

pub const DEFAULT_MODEL_ID: &str = "lightonai/GTE-ModernColBERT-v1";

/// Select the best available compute device.
///
/// Uses CUDA when compiled with the `cuda` feature, Metal when compiled with
/// the `metal` feature, and falls back to CPU otherwise.
fn default_device() -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            return device;
        }
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            return device;
        }
    }

    Device::Cpu
}

fn candle_err(e: candle_core::Error) -> ModelError {
    ModelError::InvalidOutput(e.to_string())
}

/// ColBERT late-interaction model, loaded lazily on first use.
///
/// As an [`Embedder`] it mean-pools the token embeddings of a text into one
/// unit vector. As a [`Scorer`] it computes MaxSim between query and passage
/// tokens, divided by the number of query tokens so scores stay near
/// `[0, 1]`.
pub struct ColbertModel {
    model: Mutex<Option<ColBERT>>,
    model_id: String,
}

impl ColbertModel {
    /// The model is not loaded until the first embedding or scoring call.
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model: Mutex::new(None),
            model_id: model_id.into(),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Lock the model, downloading it from HuggingFace Hub if needed.
    fn loaded(&self) -> Result<MutexGuard<'_, Option<ColBERT>>, ModelError> {
        let mut guard = self
            .model
            .lock()
            .map_err(|_| ModelError::Failed("model lock poisoned".into()))?;
        if guard.is_none() {
            tracing::info!(model = %self.model_id, "loading ColBERT model");
            let colbert: ColBERT = ColBERT::from(&self.model_id)
                .with_device(default_device())
                .try_into()
                .map_err(|e| {
                    ModelError::Failed(format!(
                        "loading {}: {e}",
                        self.model_id
                    ))
                })?;
            *guard = Some(colbert);
        }
        Ok(guard)
    }

    /// Encode texts into token embeddings of shape `[B, T, D]`.
    fn encode(&self, texts: &[String], is_query: bool) -> Result<Tensor, ModelError> {
        let mut guard = self.loaded()?;
        let model = guard
            .as_mut()
            .ok_or_else(|| ModelError::Failed("model not loaded".into()))?;
        model
            .encode(texts, is_query)
            .map_err(|e| ModelError::Failed(e.to_string()))
    }
}

/// MaxSim between a query `[Q, D]` and a passage `[T, D]`: the sum over query
/// tokens of the best dot product with any passage token.
fn maxsim(query: &Tensor, passage: &Tensor) -> Result<f32, ModelError> {
    let sim = query
        .matmul(&passage.t().map_err(candle_err)?)
        .map_err(candle_err)?;
    sim.max(1)
        .map_err(candle_err)?
        .sum_all()
        .map_err(candle_err)?
        .to_scalar::<f32>()
        .map_err(candle_err)
}

impl Embedder for ColbertModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError> {
        let mut out = self.embed_batch(&[text.to_string()])?;
        out.pop()
            .ok_or_else(|| ModelError::InvalidOutput("empty embedding batch".into()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let tokens = self.encode(texts, false)?;
        let pooled = tokens.mean(1).map_err(candle_err)?;
        let mut vectors = pooled.to_vec2::<f32>().map_err(candle_err)?;
        for v in vectors.iter_mut() {
            normalize(v);
        }
        Ok(vectors)
    }
}

impl Scorer for ColbertModel {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn score(&self, query: &str, passage: &str) -> Result<f32, ModelError> {
        let mut scores = self.score_batch(query, &[passage])?;
        scores
            .pop()
            .ok_or_else(|| ModelError::InvalidOutput("empty score batch".into()))
    }

    fn score_batch(&self, query: &str, passages: &[&str]) -> Result<Vec<f32>, ModelError> {
        if passages.is_empty() {
            return Ok(Vec::new());
        }
        let query_tokens = self
            .encode(&[query.to_string()], true)?
            .squeeze(0)
            .map_err(candle_err)?;
        let (query_len, _) = query_tokens.dims2().map_err(candle_err)?;

        let texts: Vec<String> = passages.iter().map(|p| p.to_string()).collect();
        let passage_tokens = self.encode(&texts, false)?;

        (0..passages.len())
            .map(|i| {
                let passage = passage_tokens.get(i).map_err(candle_err)?;
                Ok(maxsim(&query_tokens, &passage)? / query_len.max(1) as f32)
            })
            .collect()
    }
}

/// Build the embedder and scorer selected by `settings`.
///
/// The ColBERT backend shares one lazily loaded model between both roles.
pub fn load_models(settings: &ModelSettings) -> (Arc<dyn Embedder>, Arc<dyn Scorer>) {
    match settings.backend {
        ModelBackend::Colbert => {
            let model = Arc::new(ColbertModel::new(settings.model_id.clone()));
            let embedder: Arc<dyn Embedder> = model.clone();
            let scorer: Arc<dyn Scorer> = model;
            (embedder, scorer)
        }
        ModelBackend::Hashing => {
            let embedder: Arc<dyn Embedder> =
                Arc::new(HashingEmbedder::new(settings.hashing_dimension));
            let scorer: Arc<dyn Scorer> = Arc::new(OverlapScorer);
            (embedder, scorer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_is_not_loaded_on_construction() {
        let model = ColbertModel::new("custom/model");
        assert_eq!(Embedder::model_id(&model), "custom/model");
        assert!(!model.is_loaded());
    }

    #[test]
    fn empty_batches_do_not_load_the_model() {
        let model = ColbertModel::new(DEFAULT_MODEL_ID);
        assert!(model.embed_batch(&[]).unwrap().is_empty());
        assert!(model.score_batch("q", &[]).unwrap().is_empty());
        assert!(!model.is_loaded());
    }

    #[test]
    fn hashing_backend_is_offline() {
        let settings = ModelSettings {
            backend: ModelBackend::Hashing,
            hashing_dimension: 16,
            ..ModelSettings::default()
        };
        let (embedder, scorer) = load_models(&settings);
        assert_eq!(embedder.model_id(), "hashing-16");
        assert_eq!(scorer.model_id(), "overlap");
        assert_eq!(embedder.embed("hello").unwrap().len(), 16);
    }

    #[test]
    fn maxsim_sums_best_matches() {
        let q = Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let p = Tensor::new(&[[1.0f32, 0.0], [0.5, 0.5]], &Device::Cpu).unwrap();
        let score = maxsim(&q, &p).unwrap();
        assert!((score - 1.5).abs() < 1e-6);
    }
}
