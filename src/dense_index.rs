//! Approximate nearest-neighbour search over passage embeddings.
//!
//! Vectors are persisted in [`EmbeddingDb`] and mirrored into an in-memory
//! HNSW graph that is rebuilt from the store on open. The graph cannot delete
//! points, so removed or replaced passages become tombstones that queries skip
//! until the next rebuild.

use std::{collections::HashMap, path::Path, sync::RwLock};

use hnsw_rs::prelude::*;

use crate::{
    embedding_db::EmbeddingDb,
    error::{Error, Result},
    model::normalize,
    settings::DenseSettings,
};

/// Smallest graph capacity allocated on (re)build.
const MIN_CAPACITY: usize = 1024;

struct Graph {
    hnsw: Hnsw<'static, f32, DistL2>,
    capacity: usize,
    /// HNSW point id -> passage id.
    points: Vec<u64>,
    /// Passage id -> its current (live) point id.
    live: HashMap<u64, usize>,
    dimension: Option<usize>,
}

impl Graph {
    fn empty(settings: &DenseSettings, capacity: usize) -> Self {
        let mut hnsw = Hnsw::<'static, f32, DistL2>::new(
            settings.max_nb_connection,
            capacity,
            settings.max_layers.min(16),
            settings.ef_construction,
            DistL2 {},
        );
        hnsw.set_searching_mode(true);
        Self {
            hnsw,
            capacity,
            points: Vec::new(),
            live: HashMap::new(),
            dimension: None,
        }
    }

    fn tombstones(&self) -> usize {
        self.points.len() - self.live.len()
    }

    fn is_live(&self, point: usize) -> bool {
        self.points
            .get(point)
            .is_some_and(|id| self.live.get(id) == Some(&point))
    }

    /// Append vectors; the caller has already checked capacity.
    fn insert(&mut self, entries: &[(u64, Vec<f32>)]) {
        let base = self.points.len();
        for (offset, (id, _)) in entries.iter().enumerate() {
            self.points.push(*id);
            self.live.insert(*id, base + offset);
        }

        if entries.len() == 1 {
            self.hnsw.insert_slice((entries[0].1.as_slice(), base));
        } else {
            let batch: Vec<(&[f32], usize)> = entries
                .iter()
                .enumerate()
                .map(|(offset, (_, v))| (v.as_slice(), base + offset))
                .collect();
            self.hnsw.parallel_insert_slice(&batch);
        }
    }

    /// Nearest live points as `(passage_id, distance)`.
    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(u64, f32)> {
        if self.live.is_empty() || k == 0 {
            return Vec::new();
        }
        let want = (k + self.tombstones()).min(self.points.len());
        self.hnsw
            .search(query, want, ef.max(want))
            .into_iter()
            .filter(|n| self.is_live(n.d_id))
            .map(|n| (self.points[n.d_id], n.distance))
            .take(k)
            .collect()
    }
}

/// Counts from one [`DenseIndex::upsert`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: usize,
    pub skipped_duplicates: usize,
    /// Passages whose previous vector was dropped because their new vector
    /// was skipped as a near-duplicate.
    pub superseded: usize,
}

pub struct DenseIndex {
    store: EmbeddingDb,
    settings: DenseSettings,
    graph: RwLock<Graph>,
}

impl DenseIndex {
    /// Open the vector store at `path` and build the graph from its contents.
    pub fn open(path: &Path, settings: DenseSettings) -> Result<Self> {
        let store = EmbeddingDb::open(path)?;
        let index = Self {
            graph: RwLock::new(Graph::empty(&settings, MIN_CAPACITY)),
            store,
            settings,
        };
        index.rebuild()?;
        Ok(index)
    }

    /// Similarity in `(0, 1]` for an L2 distance between unit vectors.
    pub fn score(distance: f32) -> f32 {
        1.0 / (1.0 + distance.max(0.0))
    }

    pub fn len(&self) -> usize {
        self.read_graph().map(|g| g.live.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, passage_id: u64) -> bool {
        self.read_graph()
            .map(|g| g.live.contains_key(&passage_id))
            .unwrap_or(false)
    }

    pub fn dimension(&self) -> Option<usize> {
        self.read_graph().ok().and_then(|g| g.dimension)
    }

    fn read_graph(&self) -> Result<std::sync::RwLockReadGuard<'_, Graph>> {
        self.graph
            .read()
            .map_err(|_| Error::Config("dense index lock poisoned".into()))
    }

    fn write_graph(&self) -> Result<std::sync::RwLockWriteGuard<'_, Graph>> {
        self.graph
            .write()
            .map_err(|_| Error::Config("dense index lock poisoned".into()))
    }

    /// Insert or replace vectors for the given passages.
    ///
    /// The first `dedup_window` vectors of the batch are skipped when a
    /// different live passage is already a near-exact match. A skipped
    /// passage loses any vector it had before, so it never answers for
    /// content it no longer holds.
    pub fn upsert(&self, entries: &[(u64, Vec<f32>)]) -> Result<UpsertReport> {
        if entries.is_empty() {
            return Ok(UpsertReport::default());
        }

        let mut normalized: Vec<(u64, Vec<f32>)> = entries.to_vec();
        for (_, v) in normalized.iter_mut() {
            normalize(v);
        }

        let mut graph = self.write_graph()?;

        let dimension = graph.dimension.unwrap_or(normalized[0].1.len());
        if let Some((id, v)) =
            normalized.iter().find(|(_, v)| v.len() != dimension)
        {
            return Err(Error::Config(format!(
                "passage {id}: vector has {} dimensions, index expects {dimension}",
                v.len()
            )));
        }

        let mut report = UpsertReport::default();
        let mut superseded = Vec::new();
        let mut accepted = Vec::with_capacity(normalized.len());
        for (i, (id, v)) in normalized.into_iter().enumerate() {
            if i < self.settings.dedup_window
                && let Some(existing) = self.near_duplicate(&graph, id, &v)
            {
                tracing::debug!(
                    passage_id = id,
                    existing,
                    "skipping near-duplicate embedding"
                );
                report.skipped_duplicates += 1;
                if graph.live.contains_key(&id) {
                    superseded.push(id);
                }
                continue;
            }
            accepted.push((id, v));
        }

        if !superseded.is_empty() {
            self.store.batch_remove(&superseded)?;
            for id in &superseded {
                graph.live.remove(id);
            }
            report.superseded = superseded.len();
        }

        if accepted.is_empty() {
            if graph.tombstones() * 4 > graph.points.len() {
                drop(graph);
                self.rebuild()?;
            }
            return Ok(report);
        }

        self.store.batch_store(&accepted)?;
        report.inserted = accepted.len();

        let replaced = accepted
            .iter()
            .filter(|(id, _)| graph.live.contains_key(id))
            .count();
        let tombstones_after = graph.tombstones() + replaced;
        let points_after = graph.points.len() + accepted.len();

        if points_after > graph.capacity
            || tombstones_after * 4 > points_after
        {
            drop(graph);
            self.rebuild()?;
        } else {
            graph.insert(&accepted);
            graph.dimension = Some(dimension);
        }

        Ok(report)
    }

    fn near_duplicate(&self, graph: &Graph, id: u64, v: &[f32]) -> Option<u64> {
        let (other, distance) =
            graph.search(v, 2, self.settings.ef_search).into_iter().find(|(other, _)| *other != id)?;
        // For unit vectors: cos = 1 - d^2 / 2.
        let cosine = 1.0 - distance * distance / 2.0;
        (cosine >= self.settings.dedup_similarity).then_some(other)
    }

    /// Tombstone the given passages and drop their stored vectors.
    pub fn remove(&self, passage_ids: &[u64]) -> Result<usize> {
        if passage_ids.is_empty() {
            return Ok(0);
        }
        self.store.batch_remove(passage_ids)?;

        let mut graph = self.write_graph()?;
        let removed = passage_ids
            .iter()
            .filter(|id| graph.live.remove(*id).is_some())
            .count();

        if graph.tombstones() * 4 > graph.points.len() {
            drop(graph);
            self.rebuild()?;
        }
        Ok(removed)
    }

    /// The `k` nearest live passages as `(passage_id, distance)`, closest
    /// first.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(u64, f32)>> {
        let graph = self.read_graph()?;
        if graph.live.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(dimension) = graph.dimension
            && vector.len() != dimension
        {
            return Err(Error::Config(format!(
                "query vector has {} dimensions, index expects {dimension}",
                vector.len()
            )));
        }

        let mut query = vector.to_vec();
        normalize(&mut query);
        Ok(graph.search(&query, k, self.settings.ef_search))
    }

    /// Drop every vector from the store and the graph.
    pub fn clear(&self) -> Result<()> {
        self.store.clear()?;
        let mut graph = self.write_graph()?;
        *graph = Graph::empty(&self.settings, MIN_CAPACITY);
        Ok(())
    }

    /// Recreate the graph from the persisted vectors, discarding tombstones.
    pub fn rebuild(&self) -> Result<()> {
        let vectors = self.store.load_all()?;
        let capacity = (vectors.len() * 2).max(MIN_CAPACITY);
        let mut fresh = Graph::empty(&self.settings, capacity);
        fresh.dimension = vectors.first().map(|(_, v)| v.len());
        if !vectors.is_empty() {
            fresh.insert(&vectors);
        }
        tracing::debug!(vectors = vectors.len(), capacity, "rebuilt dense graph");

        *self.write_graph()? = fresh;
        Ok(())
    }
}

impl std::fmt::Debug for DenseIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseIndex")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(tmp: &tempfile::TempDir) -> DenseIndex {
        DenseIndex::open(&tmp.path().join("embeddings.redb"), DenseSettings::default())
            .unwrap()
    }

    fn axis(dim: usize, i: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[i] = 1.0;
        v
    }

    #[test]
    fn empty_index_returns_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        assert!(index.query(&[1.0, 0.0], 5).unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn nearest_neighbour_comes_first() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index
            .upsert(&[(1, axis(4, 0)), (2, axis(4, 1)), (3, axis(4, 2))])
            .unwrap();

        let hits = index.query(&[0.9, 0.1, 0.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].0, 1);
        assert!(DenseIndex::score(hits[0].1) > DenseIndex::score(hits[1].1));
    }

    #[test]
    fn vectors_are_normalized_before_storage() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index.upsert(&[(1, vec![3.0, 4.0])]).unwrap();
        let hits = index.query(&[0.6, 0.8], 1).unwrap();
        assert!(hits[0].1 < 1e-3);
        assert!((DenseIndex::score(hits[0].1) - 1.0).abs() < 1e-3);
    }

    #[test]
    fn removed_passages_are_not_returned() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index.upsert(&[(1, axis(3, 0)), (2, axis(3, 1))]).unwrap();
        assert_eq!(index.remove(&[1]).unwrap(), 1);

        let hits = index.query(&axis(3, 0), 5).unwrap();
        assert_eq!(hits.iter().map(|h| h.0).collect::<Vec<_>>(), vec![2]);
        assert!(!index.contains(1));
    }

    #[test]
    fn replacing_a_passage_keeps_only_the_new_vector() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index
            .upsert(&[(1, axis(3, 0)), (2, axis(3, 1)), (3, axis(3, 2))])
            .unwrap();
        index.upsert(&[(1, vec![0.0, 0.7, 0.7])]).unwrap();

        assert_eq!(index.len(), 3);
        let hits = index.query(&axis(3, 0), 3).unwrap();
        assert!(hits.iter().filter(|h| h.0 == 1).count() <= 1);
    }

    #[test]
    fn near_duplicates_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index.upsert(&[(1, vec![1.0, 0.0, 0.0])]).unwrap();
        let report = index.upsert(&[(2, vec![1.0, 0.001, 0.0])]).unwrap();
        assert_eq!(report.skipped_duplicates, 1);
        assert!(!index.contains(2));
    }

    #[test]
    fn skipped_duplicate_drops_the_old_vector_of_that_passage() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index
            .upsert(&[(1, axis(4, 0)), (2, axis(4, 1)), (3, axis(4, 2))])
            .unwrap();

        // Passage 1 now holds the same text as passage 2.
        let report = index.upsert(&[(1, axis(4, 1))]).unwrap();
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.superseded, 1);
        assert!(!index.contains(1));

        let hits = index.query(&axis(4, 0), 3).unwrap();
        assert!(hits.iter().all(|h| h.0 != 1));
        drop(index);

        let reopened = open(&tmp);
        assert!(!reopened.contains(1));
        assert_eq!(reopened.len(), 2);
    }

    #[test]
    fn dimension_mismatch_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index.upsert(&[(1, axis(3, 0))]).unwrap();
        assert!(matches!(index.upsert(&[(2, axis(4, 0))]), Err(Error::Config(_))));
        assert!(matches!(index.query(&axis(4, 0), 1), Err(Error::Config(_))));
    }

    #[test]
    fn reopen_rebuilds_from_store() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let index = open(&tmp);
            index.upsert(&[(7, axis(3, 0)), (8, axis(3, 1))]).unwrap();
            index.remove(&[8]).unwrap();
        }
        let index = open(&tmp);
        assert_eq!(index.len(), 1);
        assert_eq!(index.query(&axis(3, 1), 5).unwrap()[0].0, 7);
    }

    #[test]
    fn heavy_removal_triggers_rebuild() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        let entries: Vec<(u64, Vec<f32>)> =
            (0..8).map(|i| (i as u64, axis(8, i))).collect();
        index.upsert(&entries).unwrap();
        index.remove(&[0, 1, 2]).unwrap();

        let graph = index.graph.read().unwrap();
        assert_eq!(graph.tombstones(), 0);
        assert_eq!(graph.points.len(), 5);
    }

    #[test]
    fn clear_empties_index() {
        let tmp = tempfile::tempdir().unwrap();
        let index = open(&tmp);
        index.upsert(&[(1, axis(2, 0))]).unwrap();
        index.clear().unwrap();
        assert!(index.is_empty());
        assert!(index.query(&axis(2, 0), 1).unwrap().is_empty());
    }
}
