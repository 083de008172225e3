use std::{
    collections::{HashMap, VecDeque},
    io::Read,
    path::PathBuf,
};

use rayon::prelude::*;

use crate::{
    cache::EmbeddingCache,
    chunking::{Chunker, chunk_doc_id},
    doc_id::DocumentId,
    error::{Error, Result},
    incremental::Fingerprint,
    model::{Cancellation, Embedder, RetryPolicy},
    tantivy_index::StoredPassage,
    text_util,
    walker::{self, DiscoveredFile},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

/// One unit of ingestion work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestTask {
    pub path: PathBuf,
    pub change: ChangeKind,
}

impl IngestTask {
    pub fn new(path: impl Into<PathBuf>, change: ChangeKind) -> Self {
        Self {
            path: path.into(),
            change,
        }
    }
}

/// FIFO of pending ingestion tasks.
#[derive(Debug, Default)]
pub struct IngestQueue {
    tasks: VecDeque<IngestTask>,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: IngestTask) {
        self.tasks.push_back(task);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Take every pending task. When a path was queued more than once only
    /// its latest change is kept, at the position of its first appearance.
    pub fn drain(&mut self) -> Vec<IngestTask> {
        let mut position: HashMap<PathBuf, usize> = HashMap::new();
        let mut out: Vec<IngestTask> = Vec::with_capacity(self.tasks.len());
        for task in self.tasks.drain(..) {
            match position.get(&task.path) {
                Some(&i) => out[i].change = task.change,
                None => {
                    position.insert(task.path.clone(), out.len());
                    out.push(task);
                }
            }
        }
        out
    }
}

/// Everything one document contributes to the indexes.
#[derive(Debug, Clone)]
pub struct ProcessedDocument {
    pub file: DiscoveredFile,
    pub fingerprint: Fingerprint,
    pub doc_id: DocumentId,
    pub passages: Vec<StoredPassage>,
    /// One vector per passage, keyed by passage id.
    pub vectors: Vec<(u64, Vec<f32>)>,
    /// Distinct lowercase terms, for the spell-correction vocabulary.
    pub terms: Vec<String>,
}

/// Shared, read-only inputs for [`process_document`].
pub struct DocumentProcessor<'a> {
    pub chunker: &'a Chunker,
    pub embeddings: &'a EmbeddingCache,
    pub embedder: &'a dyn Embedder,
    pub retry: RetryPolicy,
    pub cancel: &'a Cancellation,
}

fn vocabulary_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = text_util::words(text)
        .filter(|w| w.chars().count() >= 3 && w.chars().all(char::is_alphabetic))
        .map(str::to_lowercase)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

/// Read, normalize, chunk and embed one document.
///
/// The file is read once. The returned fingerprint describes exactly the
/// bytes that were chunked. Runs entirely outside the index writer lock.
pub fn process_document(
    processor: &DocumentProcessor<'_>,
    file: DiscoveredFile,
) -> Result<ProcessedDocument> {
    processor.cancel.check()?;

    let mut handle = std::fs::File::open(&file.absolute_path)?;
    let meta = handle.metadata()?;
    let mut contents = Vec::with_capacity(meta.len() as usize);
    handle.read_to_end(&mut contents)?;
    let fingerprint = Fingerprint::from_contents(&file.absolute_path, &contents, &meta);

    let raw = walker::extract_text(&file.absolute_path, &contents)?;
    let chunks = processor.chunker.chunk(&raw);
    let doc_id = DocumentId::from_path(&file.absolute_path);
    let source = file.absolute_path.to_string_lossy().to_string();

    let passages: Vec<StoredPassage> = chunks
        .iter()
        .map(|chunk| StoredPassage {
            passage_id: chunk_doc_id(doc_id.numeric, chunk.index),
            doc_num_id: doc_id.numeric,
            source: source.clone(),
            chunk_index: chunk.index as u64,
            start: chunk.start as u64,
            end: chunk.end as u64,
            text: chunk.text.clone(),
        })
        .collect();

    let texts: Vec<String> = passages.iter().map(|p| p.text.clone()).collect();
    let vectors = processor.embeddings.get_or_embed_batch(
        &texts,
        processor.embedder,
        &processor.retry,
        processor.cancel,
    )?;
    let vectors = passages
        .iter()
        .zip(vectors)
        .map(|(p, v)| (p.passage_id, v.as_ref().clone()))
        .collect();

    let terms = passages
        .iter()
        .flat_map(|p| vocabulary_terms(&p.text))
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    tracing::debug!(
        path = %file.relative_path.display(),
        doc = %doc_id,
        passages = passages.len(),
        "processed document"
    );

    Ok(ProcessedDocument {
        file,
        fingerprint,
        doc_id,
        passages,
        vectors,
        terms,
    })
}

/// Fixed-size rayon pool for document processing.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("docrag-ingest-{i}"))
            .build()
            .map_err(|e| Error::Config(format!("cannot start worker pool: {e}")))?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Apply `f` to every item on the pool, preserving order.
    pub fn map<T, R, F>(&self, items: Vec<T>, f: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool.install(|| items.into_par_iter().map(f).collect())
    }
}
