//! Hybrid retrieval: dense and lexical lists merged with Reciprocal Rank
//! Fusion, then unioned across the query variations.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::{
    cache::EmbeddingCache,
    dense_index::DenseIndex,
    error::Result,
    model::{Cancellation, Embedder, RetryPolicy},
    query_enhancer::EnhancedQuery,
    settings::{FusionSettings, QuerySettings},
    tantivy_index::LexicalIndex,
};

/// A passage after fusion, before reranking.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub passage_id: u64,
    /// Similarity from the dense index, if it returned this passage.
    pub dense_score: Option<f32>,
    /// BM25 score from the lexical index, if it returned this passage.
    pub sparse_score: Option<f32>,
    pub fused_score: f32,
    /// 1-based position after fusion.
    pub fusion_rank: usize,
}

fn merge_max(slot: &mut Option<f32>, value: Option<f32>) {
    if let Some(v) = value {
        *slot = Some(slot.map_or(v, |s| s.max(v)));
    }
}

/// Sort by fused score descending (ties on passage id) and number the ranks.
fn rank(candidates: impl IntoIterator<Item = FusedCandidate>) -> Vec<FusedCandidate> {
    let mut out: Vec<FusedCandidate> = candidates.into_iter().collect();
    out.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then(a.passage_id.cmp(&b.passage_id))
    });
    for (i, c) in out.iter_mut().enumerate() {
        c.fusion_rank = i + 1;
    }
    out
}

/// Fuse two ranked lists of `(passage_id, score)`, best first.
///
/// `fused(p) = Σ 1 / (rank_constant + rank)` over the lists containing `p`,
/// with 1-based ranks.
pub fn reciprocal_rank_fusion(
    dense: &[(u64, f32)],
    sparse: &[(u64, f32)],
    rank_constant: f32,
) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<u64, FusedCandidate> = HashMap::new();

    // A passage listed twice in one list only counts at its best rank.
    for (i, &(id, score)) in dense.iter().enumerate() {
        let c = by_id.entry(id).or_insert_with(|| empty_candidate(id));
        if c.dense_score.is_none() {
            c.fused_score += 1.0 / (rank_constant + (i + 1) as f32);
        }
        merge_max(&mut c.dense_score, Some(score));
    }
    for (i, &(id, score)) in sparse.iter().enumerate() {
        let c = by_id.entry(id).or_insert_with(|| empty_candidate(id));
        if c.sparse_score.is_none() {
            c.fused_score += 1.0 / (rank_constant + (i + 1) as f32);
        }
        merge_max(&mut c.sparse_score, Some(score));
    }

    rank(by_id.into_values())
}

fn empty_candidate(passage_id: u64) -> FusedCandidate {
    FusedCandidate {
        passage_id,
        dense_score: None,
        sparse_score: None,
        fused_score: 0.0,
        fusion_rank: 0,
    }
}

/// Union per-query fusion results by passage id, keeping the best scores.
pub fn union_candidates(
    lists: Vec<Vec<FusedCandidate>>,
    max_candidates: usize,
) -> Vec<FusedCandidate> {
    let mut by_id: HashMap<u64, FusedCandidate> = HashMap::new();
    for candidate in lists.into_iter().flatten() {
        match by_id.get_mut(&candidate.passage_id) {
            Some(existing) => {
                existing.fused_score = existing.fused_score.max(candidate.fused_score);
                merge_max(&mut existing.dense_score, candidate.dense_score);
                merge_max(&mut existing.sparse_score, candidate.sparse_score);
            }
            None => {
                by_id.insert(candidate.passage_id, candidate);
            }
        }
    }
    let mut ranked = rank(by_id.into_values());
    ranked.truncate(max_candidates);
    ranked
}

/// Runs dense and lexical retrieval for every query of an
/// [`EnhancedQuery`] and fuses the results.
pub struct HybridRetriever<'a> {
    pub dense: &'a DenseIndex,
    pub lexical: &'a LexicalIndex,
    pub embeddings: &'a EmbeddingCache,
    pub embedder: &'a dyn Embedder,
    pub retry: RetryPolicy,
    pub query: &'a QuerySettings,
    pub fusion: &'a FusionSettings,
}

impl HybridRetriever<'_> {
    pub fn retrieve(
        &self,
        enhanced: &EnhancedQuery,
        cancel: &Cancellation,
    ) -> Result<Vec<FusedCandidate>> {
        let queries: Vec<(&str, usize)> = enhanced
            .all_queries()
            .enumerate()
            .map(|(i, q)| {
                let k = if i == 0 {
                    self.query.primary_k
                } else {
                    self.query.variation_k
                };
                (q, k)
            })
            .filter(|(q, _)| !q.trim().is_empty())
            .collect();

        let lists = queries
            .par_iter()
            .map(|&(text, k)| self.retrieve_one(text, k, cancel))
            .collect::<Result<Vec<_>>>()?;

        let fused = union_candidates(lists, self.fusion.max_candidates);
        tracing::debug!(
            queries = queries.len(),
            candidates = fused.len(),
            "fused candidates"
        );
        Ok(fused)
    }

    fn retrieve_one(
        &self,
        text: &str,
        k: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<FusedCandidate>> {
        cancel.check()?;
        let (dense, sparse) = rayon::join(
            || self.dense_search(text, k, cancel),
            || self.lexical.query(text, k),
        );
        let dense = dense?;
        let sparse = sparse?;
        Ok(reciprocal_rank_fusion(
            &dense,
            &sparse,
            self.fusion.rank_constant,
        ))
    }

    fn dense_search(
        &self,
        text: &str,
        k: usize,
        cancel: &Cancellation,
    ) -> Result<Vec<(u64, f32)>> {
        if self.dense.is_empty() {
            return Ok(Vec::new());
        }
        let vector =
            self.embeddings
                .get_or_embed(text, self.embedder, &self.retry, cancel)?;
        Ok(self
            .dense
            .query(&vector, k)?
            .into_iter()
            .map(|(id, distance)| (id, DenseIndex::score(distance)))
            .collect())
    }
}
