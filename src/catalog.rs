use std::{collections::HashMap, path::Path};

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};

use crate::error::Result;

/// Fingerprint records, JSON-encoded, keyed by document numeric id.
const DOCUMENTS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("documents");
/// Lowercase corpus term -> number of documents containing it.
const VOCABULARY: TableDefinition<&str, u64> =
    TableDefinition::new("vocabulary");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

pub struct Catalog {
    db: Database,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Ensure all tables exist by opening them in a write transaction.
        let txn = db.begin_write()?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(VOCABULARY)?;
        txn.open_table(SETTINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    // -- Documents --

    pub fn get_document(&self, doc_id: u64) -> Result<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.get(doc_id)?.map(|v| v.value().to_vec()))
    }

    pub fn set_document(&self, doc_id: u64, data: &[u8]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.insert(doc_id, data)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Set multiple document records in a single transaction.
    pub fn batch_set_documents(&self, entries: &[(u64, Vec<u8>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            for (doc_id, data) in entries {
                table.insert(*doc_id, data.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn remove_document(&self, doc_id: u64) -> Result<bool> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(DOCUMENTS)?;
            table.remove(doc_id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Remove multiple document records in a single transaction.
    pub fn batch_remove_documents(&self, doc_ids: &[u64]) -> Result<()> {
        if doc_ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(DOCUMENTS)?;
            for &doc_id in doc_ids {
                table.remove(doc_id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Return all (doc_id, record_bytes) pairs in a single read transaction.
    pub fn list_documents(&self) -> Result<Vec<(u64, Vec<u8>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.push((k.value(), v.value().to_vec()));
        }
        Ok(result)
    }

    pub fn count_documents(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(DOCUMENTS)?;
        Ok(table.len()?)
    }

    /// Drop every document record and the vocabulary derived from them.
    pub fn clear_documents(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(DOCUMENTS)?;
        txn.delete_table(VOCABULARY)?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(VOCABULARY)?;
        txn.commit()?;
        Ok(())
    }

    // -- Vocabulary --

    /// Apply per-document term changes to the document-frequency table.
    ///
    /// Each entry of `added` increments its term once; each entry of
    /// `removed` decrements it, dropping the term when it reaches zero.
    pub fn update_vocabulary(
        &self,
        added: &[String],
        removed: &[String],
    ) -> Result<()> {
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(VOCABULARY)?;
            for term in removed {
                let current =
                    table.get(term.as_str())?.map(|v| v.value()).unwrap_or(0);
                if current <= 1 {
                    table.remove(term.as_str())?;
                } else {
                    table.insert(term.as_str(), current - 1)?;
                }
            }
            for term in added {
                let current =
                    table.get(term.as_str())?.map(|v| v.value()).unwrap_or(0);
                table.insert(term.as_str(), current + 1)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn vocabulary(&self) -> Result<HashMap<String, u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(VOCABULARY)?;
        let mut result = HashMap::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            result.insert(k.value().to_string(), v.value());
        }
        Ok(result)
    }

    // -- Settings --

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(SETTINGS)?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(SETTINGS)?;
        Ok(table.get(key)?.map(|v| v.value().to_string()))
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, Catalog) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Catalog::open(&tmp.path().join("catalog.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn documents_crud() {
        let (_tmp, db) = test_db();

        db.set_document(42, b"record").unwrap();
        assert_eq!(db.get_document(42).unwrap().unwrap(), b"record");
        assert_eq!(db.count_documents().unwrap(), 1);

        assert!(db.remove_document(42).unwrap());
        assert!(!db.remove_document(42).unwrap());
        assert_eq!(db.get_document(42).unwrap(), None);
    }

    #[test]
    fn batch_documents() {
        let (_tmp, db) = test_db();
        db.batch_set_documents(&[(1, b"a".to_vec()), (2, b"b".to_vec())])
            .unwrap();
        assert_eq!(db.list_documents().unwrap().len(), 2);
        db.batch_remove_documents(&[1]).unwrap();
        assert_eq!(db.list_documents().unwrap(), vec![(2, b"b".to_vec())]);
    }

    #[test]
    fn vocabulary_counts_documents() {
        let (_tmp, db) = test_db();
        db.update_vocabulary(&["alpha".into(), "beta".into()], &[]).unwrap();
        db.update_vocabulary(&["alpha".into()], &[]).unwrap();

        let vocab = db.vocabulary().unwrap();
        assert_eq!(vocab["alpha"], 2);
        assert_eq!(vocab["beta"], 1);

        db.update_vocabulary(&[], &["alpha".into(), "beta".into()]).unwrap();
        let vocab = db.vocabulary().unwrap();
        assert_eq!(vocab["alpha"], 1);
        assert!(!vocab.contains_key("beta"));
    }

    #[test]
    fn clear_documents_empties_vocabulary_but_keeps_settings() {
        let (_tmp, db) = test_db();
        db.set_document(7, b"x").unwrap();
        db.update_vocabulary(&["gamma".into()], &[]).unwrap();
        db.set_setting("last_updated", "now").unwrap();

        db.clear_documents().unwrap();
        assert_eq!(db.count_documents().unwrap(), 0);
        assert!(db.vocabulary().unwrap().is_empty());
        assert_eq!(db.get_setting("last_updated").unwrap().as_deref(), Some("now"));
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("catalog.redb");

        {
            let db = Catalog::open(&path).unwrap();
            db.set_document(1, b"one").unwrap();
            db.set_setting("version", "1").unwrap();
        }

        {
            let db = Catalog::open(&path).unwrap();
            assert_eq!(db.get_document(1).unwrap().unwrap(), b"one");
            assert_eq!(db.get_setting("version").unwrap(), Some("1".to_string()));
        }
    }
}
