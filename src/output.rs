//! Terminal and JSON rendering of pipeline results.

use std::fmt::Write as _;

use serde::Serialize;

use crate::{
    error::Result,
    pipeline::{Outcome, ReindexReport, Retrieval, Status},
};

const PREVIEW_CHARS: usize = 400;

fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let mut out: String = flat.chars().take(PREVIEW_CHARS).collect();
    out.push_str("...");
    out
}

pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

/// One line per passage: rank, relevance and source.
pub fn retrieval_summary(retrieval: &Retrieval) -> String {
    let mut out = String::new();
    if let Some(suggestion) = &retrieval.spelling_suggestion {
        let _ = writeln!(out, "Did you mean: {suggestion}");
    }
    match &retrieval.outcome {
        Outcome::Passages(passages) => {
            let suffix = if passages.len() == 1 { "" } else { "s" };
            let _ = write!(
                out,
                "Found {} passage{suffix} for \"{}\":",
                passages.len(),
                retrieval.query
            );
            for (i, p) in passages.iter().enumerate() {
                let _ = write!(
                    out,
                    "\n{:>2}. {:.3} {}#{}",
                    i + 1,
                    p.relevance,
                    p.source,
                    p.chunk_index
                );
            }
        }
        Outcome::NoRelevantPassages {
            candidates_considered,
            best_score,
        } => {
            let _ = write!(
                out,
                "No relevant passages for \"{}\" ({candidates_considered} candidates considered",
                retrieval.query
            );
            if let Some(best) = best_score {
                let _ = write!(out, ", best score {best:.3}");
            }
            out.push(')');
        }
    }
    out
}

/// The summary followed by a preview of each passage.
pub fn retrieval_human(retrieval: &Retrieval) -> String {
    let mut out = retrieval_summary(retrieval);
    for (i, p) in retrieval.passages().iter().enumerate() {
        let _ = write!(
            out,
            "\n\n[{}] {} (chunk {}, fusion rank {})\n{}",
            i + 1,
            p.source,
            p.chunk_index,
            p.fusion_rank,
            preview(&p.text)
        );
    }
    out
}

pub fn reindex_human(report: &ReindexReport) -> String {
    let mut out = format!(
        "Processed {}, skipped {}, removed {}, failed {} ({} passages) in {} ms",
        report.processed,
        report.skipped,
        report.removed,
        report.failed.len(),
        report.passages_written,
        report.elapsed_ms
    );
    for failure in &report.failed {
        let _ = write!(out, "\n  {}: {}", failure.path.display(), failure.reason);
    }
    out
}

pub fn status_human(status: &Status) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Root:              {}", status.root.display());
    let _ = writeln!(out, "Documents:         {}", status.documents_tracked);
    let _ = writeln!(out, "Passages:          {}", status.passages_indexed);
    let _ = writeln!(out, "Dense vectors:     {}", status.dense_vectors);
    let _ = writeln!(out, "Vocabulary terms:  {}", status.vocabulary_terms);
    let _ = writeln!(out, "Embedder:          {}", status.embedder);
    let _ = writeln!(out, "Scorer:            {}", status.scorer);
    let _ = writeln!(
        out,
        "Embedding cache:   {}/{} entries, {} hits, {} misses",
        status.embedding_cache.entries,
        status.embedding_cache.capacity,
        status.embedding_cache.hits,
        status.embedding_cache.misses
    );
    let _ = writeln!(
        out,
        "Result cache:      {}/{} entries, {} hits, {} misses",
        status.result_cache.entries,
        status.result_cache.capacity,
        status.result_cache.hits,
        status.result_cache.misses
    );
    let _ = writeln!(
        out,
        "Last reindex:      {} unchanged, {} changed",
        status.change_cache_hits, status.change_cache_misses
    );
    let _ = write!(
        out,
        "Last updated:      {}",
        status.last_updated.as_deref().unwrap_or("never")
    );
    out
}
