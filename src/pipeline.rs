//! The retrieval pipeline: ingestion into both indexes and query resolution
//! through enhancement, hybrid fusion and reranking.

use std::{
    collections::HashSet,
    hash::{DefaultHasher, Hash, Hasher},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Instant,
};

use globset::GlobSet;
use serde::Serialize;

use crate::{
    cache::{CacheStats, EmbeddingCache, ResultCache},
    catalog::Catalog,
    chunking::Chunker,
    data_dir::DataDir,
    dense_index::DenseIndex,
    doc_id::DocumentId,
    error::{Error, Result},
    fusion::HybridRetriever,
    incremental::{ChangeCache, ChangeDecision, FingerprintRecord},
    ingestion::{
        ChangeKind, DocumentProcessor, IngestQueue, IngestTask, ProcessedDocument,
        WorkerPool, process_document,
    },
    model::{Cancellation, Embedder, Scorer},
    query_enhancer::{Language, QueryEnhancer, normalize_query},
    reranker::{RerankInput, RerankOutcome, Reranker},
    settings::Settings,
    tantivy_index::LexicalIndex,
    walker::{self, DiscoveredFile},
};

const LAST_UPDATED: &str = "last_updated";

/// One passage of a successful retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedPassage {
    pub passage_id: u64,
    pub text: String,
    pub source: String,
    pub chunk_index: u64,
    /// Reranker score including the exact-match boost.
    pub relevance: f32,
    pub fusion_rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Passages(Vec<RankedPassage>),
    /// Nothing cleared the reranker's hard floor.
    NoRelevantPassages {
        candidates_considered: usize,
        best_score: Option<f32>,
    },
}

/// The result of [`Pipeline::retrieve_passages`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Retrieval {
    pub query: String,
    pub spelling_suggestion: Option<String>,
    pub language: Language,
    pub outcome: Outcome,
}

impl Retrieval {
    pub fn passages(&self) -> &[RankedPassage] {
        match &self.outcome {
            Outcome::Passages(passages) => passages,
            Outcome::NoRelevantPassages { .. } => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReindexReport {
    pub processed: usize,
    pub skipped: usize,
    pub removed: usize,
    pub failed: Vec<FailedDocument>,
    pub passages_written: usize,
    pub elapsed_ms: u64,
}

impl ReindexReport {
    fn changed_anything(&self) -> bool {
        self.processed > 0 || self.removed > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub root: PathBuf,
    pub documents_tracked: u64,
    pub passages_indexed: u64,
    pub dense_vectors: usize,
    pub vocabulary_terms: usize,
    pub embedder: String,
    pub scorer: String,
    pub embedding_cache: CacheStats,
    pub result_cache: CacheStats,
    /// Fingerprint matches during the last reindex.
    pub change_cache_hits: u64,
    /// Fingerprint misses during the last reindex.
    pub change_cache_misses: u64,
    pub last_updated: Option<String>,
}

pub struct Pipeline {
    settings: Settings,
    root: PathBuf,
    include: GlobSet,
    catalog: Arc<Catalog>,
    changes: ChangeCache,
    dense: DenseIndex,
    lexical: LexicalIndex,
    embeddings: EmbeddingCache,
    results: ResultCache,
    embedder: Arc<dyn Embedder>,
    scorer: Arc<dyn Scorer>,
    chunker: Chunker,
    workers: WorkerPool,
    enhancer: RwLock<Arc<QueryEnhancer>>,
    queue: Mutex<IngestQueue>,
    /// Serializes index writes.
    write_lock: Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| Error::Config("pipeline lock poisoned".into()))
}

/// Fingerprint of everything that changes what a query returns, so result
/// caches built under other settings or models never collide.
fn settings_generation(settings: &Settings, embedder: &str, scorer: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(settings)
        .unwrap_or_default()
        .hash(&mut hasher);
    embedder.hash(&mut hasher);
    scorer.hash(&mut hasher);
    hasher.finish()
}

/// Canonical form of a path that may no longer exist: the parent directory
/// is resolved and the file name re-attached.
fn canonical_removed(path: &Path) -> PathBuf {
    path.canonicalize()
        .ok()
        .or_else(|| {
            let parent = path.parent()?.canonicalize().ok()?;
            Some(parent.join(path.file_name()?))
        })
        .unwrap_or_else(|| path.to_path_buf())
}

impl Pipeline {
    /// Open every store under `data_dir`, creating them on first run.
    #[tracing::instrument(skip_all, fields(data_dir = %data_dir.root().display()))]
    pub fn open(
        data_dir: &DataDir,
        settings: Settings,
        root: PathBuf,
        embedder: Arc<dyn Embedder>,
        scorer: Arc<dyn Scorer>,
    ) -> Result<Self> {
        settings.validate()?;
        let catalog = Arc::new(Catalog::open(&data_dir.catalog_db())?);
        let dense = DenseIndex::open(&data_dir.embeddings_db(), settings.dense.clone())?;
        let lexical = LexicalIndex::open(&data_dir.tantivy_dir()?, &settings.lexical)?;

        let generation =
            settings_generation(&settings, embedder.model_id(), scorer.model_id());
        let embeddings = EmbeddingCache::new(settings.cache.embedding_capacity);
        let results = ResultCache::new(
            settings.cache.result_capacity,
            settings.cache.result_ttl(),
            generation,
        );
        let enhancer = QueryEnhancer::new(settings.query.clone(), catalog.vocabulary()?);
        let workers = WorkerPool::new(settings.ingestion.worker_count())?;

        tracing::debug!(
            root = %root.display(),
            workers = workers.threads(),
            dense_vectors = dense.len(),
            "opened pipeline"
        );

        Ok(Self {
            include: walker::build_globset(&settings.ingestion.include)?,
            chunker: Chunker::from_settings(&settings),
            changes: ChangeCache::new(Arc::clone(&catalog)),
            enhancer: RwLock::new(Arc::new(enhancer)),
            queue: Mutex::new(IngestQueue::new()),
            write_lock: Mutex::new(()),
            settings,
            root,
            catalog,
            dense,
            lexical,
            embeddings,
            results,
            embedder,
            scorer,
            workers,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn enhancer(&self) -> Result<Arc<QueryEnhancer>> {
        self.enhancer
            .read()
            .map(|e| Arc::clone(&e))
            .map_err(|_| Error::Config("query enhancer lock poisoned".into()))
    }

    fn refresh_enhancer(&self) -> Result<()> {
        let fresh = QueryEnhancer::new(self.settings.query.clone(), self.catalog.vocabulary()?);
        let mut slot = self
            .enhancer
            .write()
            .map_err(|_| Error::Config("query enhancer lock poisoned".into()))?;
        *slot = Arc::new(fresh);
        Ok(())
    }

    /// Scan the document root and bring both indexes up to date.
    ///
    /// With `clear_cache` every store and cache is emptied first, so all
    /// documents are reprocessed.
    pub fn reindex(&self, clear_cache: bool) -> Result<ReindexReport> {
        self.reindex_with(clear_cache, &Cancellation::new())
    }

    /// [`Pipeline::reindex`], stopping with `Error::Cancelled` if `cancel`
    /// fires before the index writes begin. A cancelled reindex writes
    /// nothing, so the change cache and both indexes stay in agreement.
    #[tracing::instrument(skip(self, cancel))]
    pub fn reindex_with(&self, clear_cache: bool, cancel: &Cancellation) -> Result<ReindexReport> {
        let started = Instant::now();

        if clear_cache {
            let _write = lock(&self.write_lock)?;
            self.changes.clear()?;
            self.results.invalidate_all();
            self.embeddings.clear();
            let mut writer = self.lexical.writer(self.settings.lexical.writer_memory_bytes)?;
            self.lexical.clear(&writer)?;
            writer.commit()?;
            self.dense.clear()?;
            tracing::info!("cleared indexes and caches");
        }
        self.changes.reset_counters();

        let files = walker::discover_files(&self.root, &self.settings.ingestion.include)?;
        let deleted = self.changes.deleted_since(&files)?;
        let mut report = ReindexReport::default();
        let pending = self.classify(&files, &mut report);
        let processed = self.process(pending, &mut report, cancel)?;

        let _write = lock(&self.write_lock)?;
        let mut removals = Vec::with_capacity(deleted.len());
        for seen in deleted {
            // A record rewritten since the scan belongs to another writer.
            if self.changes.lookup(&seen.path)?.as_ref() == Some(&seen) {
                removals.push(seen);
            }
        }
        self.write(processed, removals, &mut report)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            processed = report.processed,
            skipped = report.skipped,
            removed = report.removed,
            failed = report.failed.len(),
            passages = report.passages_written,
            elapsed_ms = report.elapsed_ms,
            "reindex finished"
        );
        Ok(report)
    }

    /// Queue a change for [`Pipeline::process_queue`].
    pub fn enqueue(&self, task: IngestTask) -> Result<()> {
        lock(&self.queue)?.push(task);
        Ok(())
    }

    /// Apply every queued change.
    pub fn process_queue(&self) -> Result<ReindexReport> {
        self.process_queue_with(&Cancellation::new())
    }

    /// [`Pipeline::process_queue`] under an external cancellation signal.
    /// Tasks drained by a cancelled call are not requeued.
    #[tracing::instrument(skip(self, cancel))]
    pub fn process_queue_with(&self, cancel: &Cancellation) -> Result<ReindexReport> {
        let started = Instant::now();
        let tasks = lock(&self.queue)?.drain();
        if tasks.is_empty() {
            return Ok(ReindexReport::default());
        }
        self.changes.reset_counters();

        let root = self.root.canonicalize()?;
        let mut report = ReindexReport::default();
        let mut files = Vec::new();
        let mut removed_paths = Vec::new();

        for task in tasks {
            let path = if task.path.is_relative() {
                root.join(&task.path)
            } else {
                task.path.clone()
            };
            if task.change == ChangeKind::Removed || !path.is_file() {
                removed_paths.push(canonical_removed(&path));
                continue;
            }

            match DiscoveredFile::from_path(&root, &path) {
                Ok(file) if self.include.is_match(&file.relative_path) => files.push(file),
                Ok(file) => {
                    tracing::debug!(path = %file.relative_path.display(), "ignoring unsupported file");
                }
                Err(e) => report.failed.push(FailedDocument {
                    path,
                    reason: e.to_string(),
                }),
            }
        }

        let pending = self.classify(&files, &mut report);
        let processed = self.process(pending, &mut report, cancel)?;

        let _write = lock(&self.write_lock)?;
        let mut removals = Vec::new();
        for path in &removed_paths {
            if let Some(record) = self.changes.lookup(path)? {
                removals.push(record);
            }
        }
        self.write(processed, removals, &mut report)?;
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Files whose fingerprint differs from the stored record.
    fn classify(&self, files: &[DiscoveredFile], report: &mut ReindexReport) -> Vec<DiscoveredFile> {
        let mut pending = Vec::new();
        for file in files {
            match self.changes.should_process(file) {
                Ok(ChangeDecision::Skip) => report.skipped += 1,
                Ok(_) => pending.push(file.clone()),
                Err(e) => {
                    tracing::warn!(path = %file.absolute_path.display(), error = %e, "cannot fingerprint document");
                    report.failed.push(FailedDocument {
                        path: file.absolute_path.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }
        pending
    }

    /// Read, chunk and embed pending documents on the worker pool. Takes no
    /// lock.
    fn process(
        &self,
        pending: Vec<DiscoveredFile>,
        report: &mut ReindexReport,
        cancel: &Cancellation,
    ) -> Result<Vec<ProcessedDocument>> {
        let processor = DocumentProcessor {
            chunker: &self.chunker,
            embeddings: &self.embeddings,
            embedder: self.embedder.as_ref(),
            retry: self.settings.model.retry_policy(),
            cancel,
        };

        let outcomes = self.workers.map(pending, |file| {
            let path = file.absolute_path.clone();
            (path, process_document(&processor, file))
        });
        cancel.check()?;

        let mut done = Vec::with_capacity(outcomes.len());
        for (path, result) in outcomes {
            match result {
                Ok(doc) => done.push(doc),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping document");
                    report.failed.push(FailedDocument {
                        path,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(done)
    }

    /// Write processed documents and removals to every store. The caller
    /// holds the write lock.
    ///
    /// Previous passages are looked up here rather than at classify time, so
    /// a writer that finished in between is accounted for.
    fn write(
        &self,
        done: Vec<ProcessedDocument>,
        removals: Vec<FingerprintRecord>,
        report: &mut ReindexReport,
    ) -> Result<()> {
        if done.is_empty() && removals.is_empty() {
            return Ok(());
        }

        let mut stale_vectors: Vec<u64> = Vec::new();
        let mut terms_added: Vec<String> = Vec::new();
        let mut terms_removed: Vec<String> = Vec::new();
        let mut vectors: Vec<(u64, Vec<f32>)> = Vec::new();
        let mut records = Vec::with_capacity(done.len());

        let mut writer = self.lexical.writer(self.settings.lexical.writer_memory_bytes)?;

        for record in &removals {
            let doc = record.doc_id();
            let mut ids = record.passage_ids.clone();
            ids.extend(self.lexical.passage_ids_for_document(doc.numeric)?);
            self.lexical.delete_document(&writer, doc.numeric);
            stale_vectors.extend(ids);
            terms_removed.extend(record.terms.iter().cloned());
            tracing::debug!(path = %record.path.display(), doc = %doc, "removing document");
        }

        for doc in done {
            let previous = self.changes.lookup(&doc.file.absolute_path)?;
            if previous.as_ref().is_some_and(|r| r.fingerprint == doc.fingerprint) {
                tracing::debug!(path = %doc.file.relative_path.display(), "already indexed by another writer");
                report.skipped += 1;
                continue;
            }

            let mut previous_ids = self.lexical.passage_ids_for_document(doc.doc_id.numeric)?;
            if let Some(record) = previous {
                previous_ids.extend(record.passage_ids);
                terms_removed.extend(record.terms);
            }
            let new_ids: HashSet<u64> = doc.passages.iter().map(|p| p.passage_id).collect();
            stale_vectors.extend(previous_ids.into_iter().filter(|id| !new_ids.contains(id)));

            self.lexical.delete_document(&writer, doc.doc_id.numeric);
            self.lexical.upsert(&writer, &doc.passages)?;

            report.processed += 1;
            report.passages_written += doc.passages.len();
            terms_added.extend(doc.terms.iter().cloned());
            records.push(ChangeCache::record(
                &doc.file,
                &doc.fingerprint,
                doc.passages.iter().map(|p| p.passage_id).collect(),
                doc.terms,
            ));
            vectors.extend(doc.vectors);
        }

        writer.commit()?;
        drop(writer);

        stale_vectors.sort_unstable();
        stale_vectors.dedup();
        self.dense.remove(&stale_vectors)?;
        let upserted = self.dense.upsert(&vectors)?;
        if upserted.skipped_duplicates > 0 {
            tracing::debug!(
                skipped = upserted.skipped_duplicates,
                superseded = upserted.superseded,
                "near-duplicate vectors not indexed"
            );
        }

        self.catalog.update_vocabulary(&terms_added, &terms_removed)?;
        self.changes.commit_batch(records)?;
        self.changes.forget_batch(&removals)?;
        report.removed += removals.len();

        if report.changed_anything() {
            self.results.invalidate_all();
            self.refresh_enhancer()?;
            self.catalog
                .set_setting(LAST_UPDATED, &chrono::Utc::now().to_rfc3339())?;
        }
        Ok(())
    }

    pub fn retrieve_passages(&self, query: &str) -> Result<Retrieval> {
        self.retrieve_passages_with(query, &Cancellation::new())
    }

    /// Resolve a query, honouring `cancel` between stages and while retrying
    /// model calls.
    #[tracing::instrument(skip(self, cancel))]
    pub fn retrieve_passages_with(&self, query: &str, cancel: &Cancellation) -> Result<Retrieval> {
        let normalized = normalize_query(query);
        if normalized.is_empty() {
            return Ok(Retrieval {
                query: query.to_string(),
                spelling_suggestion: None,
                language: Language::Unknown,
                outcome: Outcome::NoRelevantPassages {
                    candidates_considered: 0,
                    best_score: None,
                },
            });
        }
        let epoch = self.results.epoch();
        if let Some(hit) = self.results.get(epoch, &normalized) {
            tracing::debug!("result cache hit");
            let mut retrieval = hit.as_ref().clone();
            retrieval.query = query.to_string();
            return Ok(retrieval);
        }

        cancel.check()?;
        let enhanced = self.enhancer()?.enhance(&normalized);

        let retriever = HybridRetriever {
            dense: &self.dense,
            lexical: &self.lexical,
            embeddings: &self.embeddings,
            embedder: self.embedder.as_ref(),
            retry: self.settings.model.retry_policy(),
            query: &self.settings.query,
            fusion: &self.settings.fusion,
        };
        let fused = retriever.retrieve(&enhanced, cancel)?;
        cancel.check()?;

        let mut inputs = Vec::with_capacity(fused.len());
        for candidate in fused {
            match self.lexical.passage(candidate.passage_id)? {
                Some(passage) => inputs.push(RerankInput { candidate, passage }),
                None => tracing::debug!(passage_id = candidate.passage_id, "candidate has no stored passage"),
            }
        }

        let reranker = Reranker::new(
            self.scorer.as_ref(),
            &self.settings.rerank,
            self.settings.model.retry_policy(),
        );
        let outcome = match reranker.rerank(&enhanced.primary, inputs, cancel)? {
            RerankOutcome::Passages {
                passages,
                fallback_used,
            } => {
                if fallback_used {
                    tracing::debug!("dynamic threshold fell back to top survivors");
                }
                Outcome::Passages(
                    passages
                        .into_iter()
                        .map(|s| RankedPassage {
                            passage_id: s.passage.passage_id,
                            text: s.passage.text,
                            source: s.passage.source,
                            chunk_index: s.passage.chunk_index,
                            relevance: s.score,
                            fusion_rank: s.candidate.fusion_rank,
                        })
                        .collect(),
                )
            }
            RerankOutcome::NoRelevantPassages {
                candidates,
                best_score,
            } => Outcome::NoRelevantPassages {
                candidates_considered: candidates,
                best_score,
            },
        };

        let retrieval = Retrieval {
            query: query.to_string(),
            spelling_suggestion: enhanced.spelling_suggestion,
            language: enhanced.language,
            outcome,
        };
        self.results.insert(epoch, &normalized, Arc::new(retrieval.clone()));
        Ok(retrieval)
    }

    pub fn status(&self) -> Result<Status> {
        Ok(Status {
            root: self.root.clone(),
            documents_tracked: self.catalog.count_documents()?,
            passages_indexed: self.lexical.num_passages()?,
            dense_vectors: self.dense.len(),
            vocabulary_terms: self.enhancer()?.vocabulary_len(),
            embedder: self.embedder.model_id().to_string(),
            scorer: self.scorer.model_id().to_string(),
            embedding_cache: self.embeddings.stats(),
            result_cache: self.results.stats(),
            change_cache_hits: self.changes.hits(),
            change_cache_misses: self.changes.misses(),
            last_updated: self.catalog.get_setting(LAST_UPDATED)?,
        })
    }

    /// Passages currently indexed for a document, in chunk order.
    pub fn document_passages(&self, path: &Path) -> Result<Vec<crate::tantivy_index::StoredPassage>> {
        let doc = DocumentId::from_path(&path.canonicalize()?);
        let mut passages = Vec::new();
        for id in self.lexical.passage_ids_for_document(doc.numeric)? {
            if let Some(p) = self.lexical.passage(id)? {
                passages.push(p);
            }
        }
        passages.sort_by_key(|p| p.chunk_index);
        Ok(passages)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}
