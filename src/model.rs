//! Model roles used by the pipeline.
//!
//! The pipeline only ever talks to an [`Embedder`] (text to unit vector) and a
//! [`Scorer`] (query/passage pair to relevance). Concrete models live behind
//! these traits: the ColBERT backend in [`crate::model_manager`] and the
//! deterministic [`HashingEmbedder`] / [`OverlapScorer`] pair defined here.
//!
//! Calls go through [`retry_with_backoff`], which retries transient failures
//! with bounded exponential backoff and honours a [`Cancellation`].

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    text_util,
};

/// Typed failure of a model invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("model authentication failed: {0}")]
    Authentication(String),

    /// Rate limits, timeouts and other conditions worth retrying.
    #[error("transient model failure: {0}")]
    Transient(String),

    #[error("model returned invalid output: {0}")]
    InvalidOutput(String),

    #[error("model call failed: {0}")]
    Failed(String),
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_))
    }

    /// An actionable message for whoever presents this to a user.
    pub fn user_message(&self) -> &'static str {
        match self {
            ModelError::QuotaExceeded(_) => {
                "The model quota is exhausted. Wait for it to reset or raise the limit."
            }
            ModelError::Authentication(_) => {
                "The model rejected its credentials. Check the configured API key."
            }
            ModelError::Transient(_) => {
                "The model is temporarily unavailable. Try again shortly."
            }
            ModelError::InvalidOutput(_) | ModelError::Failed(_) => {
                "The model failed to process the request."
            }
        }
    }
}

/// Maps text to a unit-normalized dense vector.
pub trait Embedder: Send + Sync {
    /// Identifier used to key the embedding cache.
    fn model_id(&self) -> &str;

    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ModelError>;

    fn embed_batch(
        &self,
        texts: &[String],
    ) -> std::result::Result<Vec<Vec<f32>>, ModelError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Scores a (query, passage) pair jointly.
pub trait Scorer: Send + Sync {
    fn model_id(&self) -> &str;

    fn score(
        &self,
        query: &str,
        passage: &str,
    ) -> std::result::Result<f32, ModelError>;

    fn score_batch(
        &self,
        query: &str,
        passages: &[&str],
    ) -> std::result::Result<Vec<f32>, ModelError> {
        passages.iter().map(|p| self.score(query, p)).collect()
    }
}

/// Cooperative cancellation signal, optionally with a deadline.
///
/// Clones share the same flag, so a client-disconnect handler can cancel a
/// request that is running on another thread.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that reports cancellation once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns `Err(Error::Cancelled)` if cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, waking early if cancelled.
    fn sleep(&self, duration: Duration) -> Result<()> {
        let slice = Duration::from_millis(25);
        let until = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            std::thread::sleep(slice.min(until - now));
        }
    }
}

/// Retry schedule for model calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts with 1s, 2s, 4s between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
///
/// Only [`ModelError::Transient`] is retried. Cancellation is checked before
/// each attempt and while backing off.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    cancel: &Cancellation,
    what: &str,
    mut op: impl FnMut() -> std::result::Result<T, ModelError>,
) -> Result<T> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        cancel.check()?;
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying model call"
                );
                cancel.sleep(delay)?;
                attempt += 1;
            }
            Err(e) => return Err(Error::Model(e)),
        }
    }
}

/// Scale `v` to unit length in place. Zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each content word and each character trigram of the lowercased text is
/// hashed into one of `dimension` buckets; counts are damped with `sqrt` and
/// the result is L2-normalized. Buckets come from SHA-256, so vectors stay
/// valid in the persisted index across builds and toolchains.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(8);
        Self {
            dimension,
            model_id: format!("hashing-{dimension}"),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn bucket(&self, feature: &str, salt: u8) -> usize {
        let mut hasher = Sha256::new();
        hasher.update([salt]);
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_le_bytes(head) % self.dimension as u64) as usize
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ModelError> {
        let mut counts = vec![0.0f32; self.dimension];

        for word in text_util::words(text) {
            let word = word.to_lowercase();
            if !text_util::is_stopword(&word) {
                counts[self.bucket(&word, 0)] += 2.0;
            }
            let padded: Vec<char> =
                format!(" {word} ").chars().collect::<Vec<_>>();
            for tri in padded.windows(3) {
                let tri: String = tri.iter().collect();
                counts[self.bucket(&tri, 1)] += 1.0;
            }
        }

        for c in counts.iter_mut() {
            *c = c.sqrt();
        }
        normalize(&mut counts);
        Ok(counts)
    }
}

/// Deterministic pairwise scorer based on query term coverage.
///
/// `0.8 * unigram_coverage + 0.2 * bigram_coverage`, in `[0, 1]`, computed on
/// lowercased, plural-folded, stopword-free terms.
#[derive(Debug, Clone, Default)]
pub struct OverlapScorer;

impl OverlapScorer {
    fn terms(text: &str) -> Vec<String> {
        text_util::words(text)
            .map(|w| text_util::fold_plural(&w.to_lowercase()))
            .filter(|w| !text_util::is_stopword(w))
            .collect()
    }
}

impl Scorer for OverlapScorer {
    fn model_id(&self) -> &str {
        "overlap"
    }

    fn score(
        &self,
        query: &str,
        passage: &str,
    ) -> std::result::Result<f32, ModelError> {
        let q = Self::terms(query);
        if q.is_empty() {
            return Ok(0.0);
        }
        let p = Self::terms(passage);
        let present: HashSet<&str> = p.iter().map(String::as_str).collect();

        let matched = q.iter().filter(|t| present.contains(t.as_str())).count();
        let unigram = matched as f32 / q.len() as f32;

        let bigram = if q.len() < 2 {
            unigram
        } else {
            let passage_bigrams: HashSet<(&str, &str)> = p
                .windows(2)
                .map(|w| (w[0].as_str(), w[1].as_str()))
                .collect();
            let hits = q
                .windows(2)
                .filter(|w| {
                    passage_bigrams.contains(&(w[0].as_str(), w[1].as_str()))
                })
                .count();
            hits as f32 / (q.len() - 1) as f32
        };

        Ok(0.8 * unigram + 0.2 * bigram)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn hashing_embedder_is_unit_norm_and_deterministic() {
        let e = HashingEmbedder::new(64);
        let a = e.embed("TechCorp was founded in 2015").unwrap();
        let b = e.embed("TechCorp was founded in 2015").unwrap();
        assert_eq!(a.len(), 64);
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashing_buckets_are_fixed() {
        let e = HashingEmbedder::new(64);
        assert_eq!(e.bucket("techcorp", 0), 28);
        assert_eq!(e.bucket(" te", 1), 15);
    }

    #[test]
    fn hashing_embedder_similar_texts_are_closer() {
        let e = HashingEmbedder::default();
        let q = e.embed("when was techcorp founded").unwrap();
        let near = e.embed("TechCorp was founded in 2015").unwrap();
        let far = e.embed("Our catalog lists chairs and tables").unwrap();
        let dot =
            |a: &[f32], b: &[f32]| a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>();
        assert!(dot(&q, &near) > dot(&q, &far));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let e = HashingEmbedder::new(16);
        let v = e.embed("").unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn overlap_scorer_rewards_coverage() {
        let s = OverlapScorer;
        let full = s
            .score("When was TechCorp founded?", "TechCorp was founded in 2015.")
            .unwrap();
        let none = s
            .score("When was TechCorp founded?", "Chairs and tables for sale.")
            .unwrap();
        assert!(full > 0.9, "full coverage scored {full}");
        assert_eq!(none, 0.0);
    }

    #[test]
    fn overlap_scorer_stopword_only_query_scores_zero() {
        assert_eq!(OverlapScorer.score("what is the", "anything").unwrap(), 0.0);
    }

    #[test]
    fn retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(
            &fast_policy(),
            &Cancellation::new(),
            "test",
            || {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ModelError::Transient("busy".into()))
                } else {
                    Ok(7)
                }
            },
        )
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff::<()>(
            &fast_policy(),
            &Cancellation::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::Transient("timeout".into()))
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_does_not_repeat_permanent_failures() {
        let calls = AtomicU32::new(0);
        let err = retry_with_backoff::<()>(
            &fast_policy(),
            &Cancellation::new(),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ModelError::QuotaExceeded("monthly".into()))
            },
        )
        .unwrap_err();
        assert!(matches!(err, Error::Model(ModelError::QuotaExceeded(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_token_aborts_before_call() {
        let cancel = Cancellation::new();
        cancel.cancel();
        let err = retry_with_backoff(&fast_policy(), &cancel, "test", || Ok(1))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn expired_deadline_counts_as_cancelled() {
        let cancel = Cancellation::with_timeout(Duration::ZERO);
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn model_error_messages_distinguish_classes() {
        assert_ne!(
            ModelError::QuotaExceeded(String::new()).user_message(),
            ModelError::Authentication(String::new()).user_message()
        );
        assert!(ModelError::Transient(String::new()).is_transient());
        assert!(!ModelError::Failed(String::new()).is_transient());
    }
}
