//! Change detection for incremental reindexing.
//!
//! Every indexed document has a [`FingerprintRecord`] in the catalog. A
//! document is reprocessed unless its freshly computed [`Fingerprint`]
//! (content hash, size and mtime) matches the stored one exactly.

use std::{
    collections::HashSet,
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    catalog::Catalog,
    doc_id::{DocumentId, hex},
    error::Result,
    walker::DiscoveredFile,
};

const READ_BUFFER: usize = 8 * 1024;

/// Content identity of a source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// SHA-256 of the file contents, lowercase hex.
    pub hash: String,
    pub size: u64,
    pub mtime: u64,
    /// Lowercase file extension, empty when there is none.
    pub file_type: String,
}

impl Fingerprint {
    /// Stream the file through SHA-256 and capture its metadata.
    pub fn compute(path: &Path) -> Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let meta = file.metadata()?;

        let mut hasher = Sha256::new();
        let mut buf = [0u8; READ_BUFFER];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(Self::assemble(path, hex(&hasher.finalize()), meta.len(), &meta))
    }

    /// Fingerprint of `contents` already read from `path`. `meta` must be
    /// taken from the same open handle before the read.
    pub fn from_contents(path: &Path, contents: &[u8], meta: &std::fs::Metadata) -> Self {
        Self::assemble(
            path,
            hex(&Sha256::digest(contents)),
            contents.len() as u64,
            meta,
        )
    }

    fn assemble(path: &Path, hash: String, size: u64, meta: &std::fs::Metadata) -> Self {
        Self {
            hash,
            size,
            mtime: meta
                .modified()
                .unwrap_or(SystemTime::UNIX_EPOCH)
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            file_type: path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_ascii_lowercase)
                .unwrap_or_default(),
        }
    }
}

/// What the catalog remembers about an indexed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    pub path: PathBuf,
    #[serde(flatten)]
    pub fingerprint: Fingerprint,
    /// Ids of the passages currently indexed for this document.
    pub passage_ids: Vec<u64>,
    /// Distinct lowercase words of the document, for vocabulary upkeep.
    #[serde(default)]
    pub terms: Vec<String>,
    /// Seconds since the Unix epoch at which the record was written.
    pub indexed_at: u64,
}

impl FingerprintRecord {
    pub fn doc_id(&self) -> DocumentId {
        DocumentId::from_path(&self.path)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Outcome of [`ChangeCache::should_process`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeDecision {
    /// Stored fingerprint matches; nothing to do.
    Skip,
    /// No record exists for this path.
    New { fingerprint: Fingerprint },
    /// The content differs from the stored record.
    Changed {
        fingerprint: Fingerprint,
        previous: FingerprintRecord,
    },
    /// A record exists but could not be decoded. Treated as a miss; the
    /// document's old passages must be located without the record.
    Unreadable { fingerprint: Fingerprint },
}

impl ChangeDecision {
    pub fn needs_processing(&self) -> bool {
        !matches!(self, ChangeDecision::Skip)
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match self {
            ChangeDecision::Skip => None,
            ChangeDecision::New { fingerprint }
            | ChangeDecision::Changed { fingerprint, .. }
            | ChangeDecision::Unreadable { fingerprint } => Some(fingerprint),
        }
    }
}

/// Fingerprint store with hit/miss accounting for the last reindex.
#[derive(Debug)]
pub struct ChangeCache {
    catalog: Arc<Catalog>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl ChangeCache {
    pub fn new(catalog: Arc<Catalog>) -> Self {
        Self {
            catalog,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Compare `file` against its stored record.
    pub fn should_process(
        &self,
        file: &DiscoveredFile,
    ) -> Result<ChangeDecision> {
        let fingerprint = Fingerprint::compute(&file.absolute_path)?;
        let doc_id = DocumentId::from_path(&file.absolute_path);

        let decision = match self.catalog.get_document(doc_id.numeric)? {
            None => ChangeDecision::New { fingerprint },
            Some(bytes) => {
                match serde_json::from_slice::<FingerprintRecord>(&bytes) {
                    Ok(previous) if previous.fingerprint == fingerprint => {
                        ChangeDecision::Skip
                    }
                    Ok(previous) => ChangeDecision::Changed {
                        fingerprint,
                        previous,
                    },
                    Err(e) => {
                        tracing::warn!(
                            path = %file.absolute_path.display(),
                            error = %e,
                            "corrupt fingerprint record, reprocessing"
                        );
                        ChangeDecision::Unreadable { fingerprint }
                    }
                }
            }
        };

        if decision.needs_processing() {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(decision)
    }

    /// Record a document as indexed with the given passages.
    pub fn commit(
        &self,
        file: &DiscoveredFile,
        fingerprint: &Fingerprint,
        passage_ids: Vec<u64>,
        terms: Vec<String>,
    ) -> Result<()> {
        self.commit_batch(vec![Self::record(
            file,
            fingerprint,
            passage_ids,
            terms,
        )])
    }

    pub fn record(
        file: &DiscoveredFile,
        fingerprint: &Fingerprint,
        passage_ids: Vec<u64>,
        terms: Vec<String>,
    ) -> FingerprintRecord {
        FingerprintRecord {
            path: file.absolute_path.clone(),
            fingerprint: fingerprint.clone(),
            passage_ids,
            terms,
            indexed_at: now_secs(),
        }
    }

    /// Write several records in one transaction.
    pub fn commit_batch(&self, records: Vec<FingerprintRecord>) -> Result<()> {
        let entries = records
            .iter()
            .map(|r| Ok((r.doc_id().numeric, r.encode()?)))
            .collect::<Result<Vec<_>>>()?;
        self.catalog.batch_set_documents(&entries)
    }

    /// Drop every stored fingerprint so the next reindex processes all files.
    pub fn clear(&self) -> Result<()> {
        self.catalog.clear_documents()
    }

    /// The stored record for `path`, if present and readable.
    pub fn lookup(&self, path: &Path) -> Result<Option<FingerprintRecord>> {
        let doc_id = DocumentId::from_path(path);
        Ok(self
            .catalog
            .get_document(doc_id.numeric)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok()))
    }

    /// Remove the record for `path`, returning it if it was readable.
    pub fn forget(&self, path: &Path) -> Result<Option<FingerprintRecord>> {
        let doc_id = DocumentId::from_path(path);
        let previous = self
            .catalog
            .get_document(doc_id.numeric)?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        self.catalog.remove_document(doc_id.numeric)?;
        Ok(previous)
    }

    pub fn forget_batch(&self, records: &[FingerprintRecord]) -> Result<()> {
        let ids: Vec<u64> = records.iter().map(|r| r.doc_id().numeric).collect();
        self.catalog.batch_remove_documents(&ids)
    }

    /// All readable records. Corrupt entries are logged and skipped.
    pub fn tracked(&self) -> Result<Vec<FingerprintRecord>> {
        let mut records = Vec::new();
        for (doc_id, bytes) in self.catalog.list_documents()? {
            match serde_json::from_slice::<FingerprintRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(doc_id, error = %e, "skipping corrupt fingerprint record");
                }
            }
        }
        Ok(records)
    }

    /// Records whose path is no longer among `discovered`.
    pub fn deleted_since(
        &self,
        discovered: &[DiscoveredFile],
    ) -> Result<Vec<FingerprintRecord>> {
        let present: HashSet<&Path> =
            discovered.iter().map(|f| f.absolute_path.as_path()).collect();
        Ok(self
            .tracked()?
            .into_iter()
            .filter(|r| !present.contains(r.path.as_path()))
            .collect())
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}
