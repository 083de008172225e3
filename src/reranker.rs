//! Pairwise reranking of fused candidates.
//!
//! Every candidate is scored jointly with the query by a [`Scorer`], boosted
//! for literal matches of salient query tokens, and then filtered twice: a
//! fixed hard floor followed by a per-query threshold derived from the score
//! distribution. If the second filter would leave nothing, the best few
//! hard-floor survivors are kept instead.

use std::collections::HashSet;

use crate::{
    error::Result,
    fusion::FusedCandidate,
    model::{Cancellation, ModelError, RetryPolicy, Scorer, retry_with_backoff},
    settings::{RerankSettings, ThresholdPolicy},
    tantivy_index::StoredPassage,
    text_util,
};

/// A candidate together with its stored text.
#[derive(Debug, Clone)]
pub struct RerankInput {
    pub candidate: FusedCandidate,
    pub passage: StoredPassage,
}

#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub candidate: FusedCandidate,
    pub passage: StoredPassage,
    /// Raw model score.
    pub model_score: f32,
    /// Exact-match and overlap bonus added to the model score.
    pub boost: f32,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub enum RerankOutcome {
    Passages {
        passages: Vec<ScoredPassage>,
        /// The dynamic threshold removed everything and the top hard-floor
        /// survivors were kept instead.
        fallback_used: bool,
    },
    NoRelevantPassages {
        candidates: usize,
        best_score: Option<f32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Salience {
    /// Proper nouns, numbers and identifiers.
    Strong,
    Content,
}

/// Query tokens worth looking for verbatim in a passage.
fn salient_tokens(query: &str) -> Vec<(String, Salience)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for token in text_util::raw_tokens(query) {
        let lower = token.to_lowercase();
        if text_util::is_stopword(&lower) || !seen.insert(lower.clone()) {
            continue;
        }
        let has_digit = token.chars().any(|c| c.is_ascii_digit());
        let is_identifier = has_digit || token.contains(['-', '_']);
        let is_proper = token.chars().next().is_some_and(char::is_uppercase);

        let salience = if is_identifier || is_proper {
            Salience::Strong
        } else if token.chars().count() >= 3 {
            Salience::Content
        } else {
            continue;
        };
        out.push((lower, salience));
    }
    out
}

/// Linear-interpolated percentile of `values`, `p` in `[0, 100]`.
fn percentile(values: &[f32], p: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f32::total_cmp);
    let pos = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f32;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f32))
}

fn mean_std(values: &[f32]) -> Option<(f32, f32)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f32;
    let mean = values.iter().sum::<f32>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    Some((mean, var.sqrt()))
}

/// Threshold the survivors must reach, or `None` when the policy is off.
fn dynamic_threshold(policy: ThresholdPolicy, scores: &[f32]) -> Option<f32> {
    match policy {
        ThresholdPolicy::Percentile { p } => percentile(scores, p),
        ThresholdPolicy::MeanStd { alpha } => {
            mean_std(scores).map(|(mean, std)| mean - alpha * std)
        }
        ThresholdPolicy::Off => None,
    }
}

fn by_score(a: &ScoredPassage, b: &ScoredPassage) -> std::cmp::Ordering {
    b.score
        .total_cmp(&a.score)
        .then(a.candidate.fusion_rank.cmp(&b.candidate.fusion_rank))
}

pub struct Reranker<'a> {
    scorer: &'a dyn Scorer,
    settings: &'a RerankSettings,
    retry: RetryPolicy,
}

impl<'a> Reranker<'a> {
    pub fn new(
        scorer: &'a dyn Scorer,
        settings: &'a RerankSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            scorer,
            settings,
            retry,
        }
    }

    /// Bonus for salient query tokens that occur in `text` as whole words.
    pub fn exact_match_boost(&self, query: &str, text: &str) -> f32 {
        let salient = salient_tokens(query);
        if salient.is_empty() {
            return 0.0;
        }
        let mut boost = 0.0;
        let mut matched = 0usize;
        for (token, salience) in &salient {
            if text_util::contains_word(text, token) {
                matched += 1;
                boost += match salience {
                    Salience::Strong => 2.0 * self.settings.exact_match_boost,
                    Salience::Content => self.settings.exact_match_boost,
                };
            }
        }
        let overlap = matched as f32 / salient.len() as f32;
        boost.min(self.settings.max_exact_match_boost)
            + overlap * self.settings.entity_overlap_weight
    }

    pub fn rerank(
        &self,
        query: &str,
        inputs: Vec<RerankInput>,
        cancel: &Cancellation,
    ) -> Result<RerankOutcome> {
        let total = inputs.len();
        if total == 0 {
            return Ok(RerankOutcome::NoRelevantPassages {
                candidates: 0,
                best_score: None,
            });
        }

        if !self.settings.enabled {
            let mut passages: Vec<ScoredPassage> = inputs
                .into_iter()
                .map(|input| ScoredPassage {
                    model_score: input.candidate.fused_score,
                    boost: 0.0,
                    score: input.candidate.fused_score,
                    candidate: input.candidate,
                    passage: input.passage,
                })
                .collect();
            passages.sort_by(by_score);
            passages.truncate(self.settings.final_k);
            return Ok(RerankOutcome::Passages {
                passages,
                fallback_used: false,
            });
        }

        let texts: Vec<&str> = inputs.iter().map(|i| i.passage.text.as_str()).collect();
        let model_scores = retry_with_backoff(&self.retry, cancel, "rerank", || {
            self.scorer.score_batch(query, &texts)
        })?;
        if model_scores.len() != total {
            return Err(ModelError::InvalidOutput(format!(
                "expected {total} scores, got {}",
                model_scores.len()
            ))
            .into());
        }
        cancel.check()?;

        let mut scored: Vec<ScoredPassage> = inputs
            .into_iter()
            .zip(model_scores)
            .map(|(input, model_score)| {
                let boost = self.exact_match_boost(query, &input.passage.text);
                ScoredPassage {
                    model_score,
                    boost,
                    score: model_score + boost,
                    candidate: input.candidate,
                    passage: input.passage,
                }
            })
            .collect();
        scored.sort_by(by_score);
        let best_score = scored.first().map(|s| s.score);

        let survivors: Vec<ScoredPassage> = scored
            .into_iter()
            .filter(|s| s.score >= self.settings.hard_floor)
            .collect();
        if survivors.is_empty() {
            tracing::debug!(candidates = total, ?best_score, "no passage cleared the hard floor");
            return Ok(RerankOutcome::NoRelevantPassages {
                candidates: total,
                best_score,
            });
        }

        let scores: Vec<f32> = survivors.iter().map(|s| s.score).collect();
        let threshold = dynamic_threshold(self.settings.threshold, &scores);
        let (mut passages, fallback_used) = match threshold {
            Some(t) => {
                let kept: Vec<ScoredPassage> =
                    survivors.iter().filter(|s| s.score >= t).cloned().collect();
                if kept.is_empty() {
                    let mut fallback = survivors;
                    fallback.truncate(self.settings.fallback_k.max(1));
                    (fallback, true)
                } else {
                    (kept, false)
                }
            }
            None => (survivors, false),
        };

        passages.sort_by(by_score);
        passages.truncate(self.settings.final_k);
        tracing::debug!(
            candidates = total,
            kept = passages.len(),
            ?threshold,
            fallback_used,
            "reranked"
        );
        Ok(RerankOutcome::Passages {
            passages,
            fallback_used,
        })
    }
}
