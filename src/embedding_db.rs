use std::path::Path;

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata,
    TableDefinition,
};

use crate::error::{Error, Result};

const EMBEDDINGS: TableDefinition<u64, &[u8]> =
    TableDefinition::new("embeddings");

/// Header size: 4 bytes dimension.
const HEADER_SIZE: usize = 4;

/// Stores one dense vector per passage, keyed by passage id.
///
/// Binary format per entry:
/// - 4 bytes: embedding dimension D (u32 LE)
/// - D * 4 bytes: f32 LE values
pub struct EmbeddingDb {
    db: Database,
}

impl EmbeddingDb {
    /// Open or create an embeddings database at the given path.
    ///
    /// # Examples
    ///
    /// ```
    /// # let tmp = tempfile::tempdir().unwrap();
    /// use docrag::EmbeddingDb;
    ///
    /// let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
    /// assert!(db.list_ids().unwrap().is_empty());
    /// ```
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(EMBEDDINGS)?;
        txn.commit()?;

        Ok(Self { db })
    }

    /// Store a single vector. Uses `insert_reserve` for zero-copy writes.
    pub fn store(&self, passage_id: u64, vector: &[f32]) -> Result<()> {
        self.batch_store(&[(passage_id, vector.to_vec())])
    }

    /// Store multiple vectors in a single transaction.
    pub fn batch_store(&self, entries: &[(u64, Vec<f32>)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            for (passage_id, vector) in entries {
                let dimension = u32::try_from(vector.len()).map_err(|_| {
                    Error::Config(format!(
                        "vector of {} dimensions is too large to store",
                        vector.len()
                    ))
                })?;
                let byte_len =
                    HEADER_SIZE + std::mem::size_of_val(vector.as_slice());
                let mut guard = table.insert_reserve(*passage_id, byte_len)?;
                let dest = guard.as_mut();

                dest[0..HEADER_SIZE].copy_from_slice(&dimension.to_le_bytes());
                dest[HEADER_SIZE..]
                    .copy_from_slice(bytemuck::cast_slice(vector.as_slice()));
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Retrieve the vector for a passage. Malformed entries read as `None`.
    pub fn load(&self, passage_id: u64) -> Result<Option<Vec<f32>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.get(passage_id)?.and_then(|guard| decode(guard.value())))
    }

    /// Load every stored vector in a single read transaction.
    pub fn load_all(&self) -> Result<Vec<(u64, Vec<f32>)>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, v) = entry?;
            match decode(v.value()) {
                Some(vector) => result.push((k.value(), vector)),
                None => tracing::warn!(
                    passage_id = k.value(),
                    "skipping malformed embedding record"
                ),
            }
        }
        Ok(result)
    }

    /// Remove multiple entries in a single transaction.
    pub fn batch_remove(&self, passage_ids: &[u64]) -> Result<()> {
        if passage_ids.is_empty() {
            return Ok(());
        }
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(EMBEDDINGS)?;
            for &id in passage_ids {
                table.remove(id)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        txn.delete_table(EMBEDDINGS)?;
        txn.open_table(EMBEDDINGS)?;
        txn.commit()?;
        Ok(())
    }

    /// List all stored passage IDs.
    pub fn list_ids(&self) -> Result<Vec<u64>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _) = entry?;
            result.push(k.value());
        }
        Ok(result)
    }

    pub fn len(&self) -> Result<u64> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(EMBEDDINGS)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn decode(bytes: &[u8]) -> Option<Vec<f32>> {
    let header: [u8; HEADER_SIZE] = bytes.get(..HEADER_SIZE)?.try_into().ok()?;
    let dimension = u32::from_le_bytes(header) as usize;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != dimension * 4 {
        return None;
    }
    // redb values carry no alignment guarantee, so copy rather than cast.
    Some(bytemuck::pod_collect_to_vec::<u8, f32>(payload))
}

impl std::fmt::Debug for EmbeddingDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingDb").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> (tempfile::TempDir, EmbeddingDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = EmbeddingDb::open(&tmp.path().join("embeddings.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn store_and_load() {
        let (_tmp, db) = test_db();
        let data: Vec<f32> = (0..12).map(|i| i as f32 * 0.1).collect();
        db.store(42, &data).unwrap();
        assert_eq!(db.load(42).unwrap().unwrap(), data);
    }

    #[test]
    fn load_missing_returns_none() {
        let (_tmp, db) = test_db();
        assert!(db.load(999).unwrap().is_none());
    }

    #[test]
    fn batch_store_and_remove() {
        let (_tmp, db) = test_db();
        db.batch_store(&[
            (10, vec![1.0, 0.0]),
            (20, vec![0.0, 1.0]),
            (30, vec![0.6, 0.8]),
        ])
        .unwrap();
        assert_eq!(db.len().unwrap(), 3);

        db.batch_remove(&[20]).unwrap();
        let mut ids = db.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![10, 30]);
    }

    #[test]
    fn load_all_returns_every_vector() {
        let (_tmp, db) = test_db();
        db.batch_store(&[(1, vec![1.0]), (2, vec![2.0])]).unwrap();
        let all = db.load_all().unwrap();
        assert_eq!(all, vec![(1, vec![1.0]), (2, vec![2.0])]);
    }

    #[test]
    fn overwrite_entry() {
        let (_tmp, db) = test_db();
        db.store(42, &[1.0, 2.0]).unwrap();
        db.store(42, &[3.0, 4.0, 5.0]).unwrap();
        assert_eq!(db.load(42).unwrap().unwrap(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn clear_removes_everything() {
        let (_tmp, db) = test_db();
        db.store(1, &[1.0]).unwrap();
        db.clear().unwrap();
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn malformed_payload_decodes_to_none() {
        assert!(decode(&[1, 0]).is_none());
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0; 4]);
        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("embeddings.redb");

        {
            let db = EmbeddingDb::open(&path).unwrap();
            db.store(42, &[1.0, 2.0]).unwrap();
        }

        {
            let db = EmbeddingDb::open(&path).unwrap();
            assert_eq!(db.load(42).unwrap().unwrap(), vec![1.0, 2.0]);
        }
    }
}
