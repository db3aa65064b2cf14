//! In-memory vector index with per-document visibility.
//!
//! Chunk embeddings are grouped per document behind an `Arc`; writers build
//! a fresh per-document entry set and swap the `Arc` under the write lock,
//! so a concurrent search observes either the pre- or post-insert state of
//! any given document, never a partial one. Searches clone the `Arc`s and
//! score outside the lock (scoring is CPU-bound; no await is held across
//! the lock).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::IndexError;
use crate::types::{Chunk, Embedding, RetrievalResult, ScoredChunk};

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// One indexed chunk with its embedding.
#[derive(Debug, Clone)]
struct IndexedChunk {
    chunk: Chunk,
    embedding: Embedding,
}

/// Similarity store over chunk embeddings, partitioned by document.
#[derive(Debug)]
pub struct VectorIndex {
    dimensions: usize,
    documents: RwLock<HashMap<String, Arc<Vec<IndexedChunk>>>>,
}

impl VectorIndex {
    /// Create an index for vectors of the given dimensionality.
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Insert a single chunk embedding for a document.
    ///
    /// The document's entry set is rebuilt and swapped atomically; readers
    /// never see it half-updated.
    pub fn insert(&self, chunk: Chunk, embedding: Embedding) -> Result<(), IndexError> {
        self.check_dimension(&embedding)?;
        let mut docs = self.documents.write().expect("index lock poisoned");
        let entries = docs.entry(chunk.document_id.clone()).or_default();
        let mut updated: Vec<IndexedChunk> = entries.as_ref().clone();
        updated.retain(|e| e.chunk.seq != chunk.seq);
        updated.push(IndexedChunk { chunk, embedding });
        *entries = Arc::new(updated);
        Ok(())
    }

    /// Replace a document's entries wholesale.
    ///
    /// Used by the orchestrator to make an entire document visible at once:
    /// until this call returns, searches see the previous state (or nothing,
    /// for a new document).
    pub fn insert_document(
        &self,
        document_id: &str,
        entries: Vec<(Chunk, Embedding)>,
    ) -> Result<(), IndexError> {
        for (_, embedding) in &entries {
            self.check_dimension(embedding)?;
        }
        let indexed: Vec<IndexedChunk> = entries
            .into_iter()
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();
        let mut docs = self.documents.write().expect("index lock poisoned");
        docs.insert(document_id.to_string(), Arc::new(indexed));
        Ok(())
    }

    /// Remove a document and all of its chunks. Idempotent: removing an
    /// absent document is a no-op.
    pub fn remove(&self, document_id: &str) {
        let mut docs = self.documents.write().expect("index lock poisoned");
        docs.remove(document_id);
    }

    /// Whether the index holds entries for the given document.
    pub fn contains(&self, document_id: &str) -> bool {
        let docs = self.documents.read().expect("index lock poisoned");
        docs.contains_key(document_id)
    }

    /// Number of indexed documents.
    pub fn document_count(&self) -> usize {
        let docs = self.documents.read().expect("index lock poisoned");
        docs.len()
    }

    /// Total number of indexed chunks across all documents.
    pub fn chunk_count(&self) -> usize {
        let docs = self.documents.read().expect("index lock poisoned");
        docs.values().map(|entries| entries.len()).sum()
    }

    /// Search the given documents for the `top_k` chunks nearest to
    /// `query`, by cosine similarity.
    ///
    /// Candidates are restricted to `document_ids`; ids with no indexed
    /// entries contribute nothing. Ordering is descending similarity, ties
    /// broken by ascending document id then ascending chunk sequence.
    pub fn search(
        &self,
        query: &[f32],
        document_ids: &[String],
        top_k: usize,
    ) -> Result<RetrievalResult, IndexError> {
        if top_k == 0 {
            return Err(IndexError::InvalidTopK);
        }
        self.check_dimension(query)?;

        // Snapshot the candidate documents, then score lock-free.
        let candidates: Vec<Arc<Vec<IndexedChunk>>> = {
            let docs = self.documents.read().expect("index lock poisoned");
            document_ids
                .iter()
                .filter_map(|id| docs.get(id).cloned())
                .collect()
        };

        let mut hits: Vec<ScoredChunk> = candidates
            .iter()
            .flat_map(|entries| entries.iter())
            .map(|entry| ScoredChunk {
                chunk: entry.chunk.clone(),
                score: cosine_similarity(query, &entry.embedding),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.document_id.cmp(&b.chunk.document_id))
                .then_with(|| a.chunk.seq.cmp(&b.chunk.seq))
        });
        hits.truncate(top_k);

        Ok(RetrievalResult { hits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, seq: usize, text: &str) -> Chunk {
        Chunk {
            document_id: doc.to_string(),
            seq,
            text: text.to_string(),
            start: 0,
            end: text.chars().count(),
            overlap: 0,
        }
    }

    fn unit(dims: usize, hot: usize) -> Embedding {
        let mut v = vec![0.0; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn search_respects_document_filter() {
        let index = VectorIndex::new(4);
        index.insert(chunk("a", 0, "alpha"), unit(4, 0)).unwrap();
        index.insert(chunk("b", 0, "beta"), unit(4, 0)).unwrap();

        let result = index.search(&unit(4, 0), &["a".to_string()], 10).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result.hits[0].chunk.document_id, "a");
    }

    #[test]
    fn ties_break_by_document_then_sequence() {
        let index = VectorIndex::new(4);
        index.insert(chunk("b", 0, "x"), unit(4, 1)).unwrap();
        index.insert(chunk("a", 1, "y"), unit(4, 1)).unwrap();
        index.insert(chunk("a", 0, "z"), unit(4, 1)).unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let result = index.search(&unit(4, 1), &ids, 10).unwrap();
        let order: Vec<(String, usize)> = result
            .hits
            .iter()
            .map(|h| (h.chunk.document_id.clone(), h.chunk.seq))
            .collect();
        assert_eq!(
            order,
            vec![
                ("a".to_string(), 0),
                ("a".to_string(), 1),
                ("b".to_string(), 0)
            ]
        );
    }

    #[test]
    fn dimension_mismatch_is_fatal() {
        let index = VectorIndex::new(4);
        let err = index.insert(chunk("a", 0, "x"), vec![1.0; 3]).unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));

        index.insert(chunk("a", 0, "x"), unit(4, 0)).unwrap();
        let err = index
            .search(&[1.0; 5], &["a".to_string()], 1)
            .unwrap_err();
        assert!(matches!(err, IndexError::DimensionMismatch { .. }));
    }

    #[test]
    fn remove_is_idempotent() {
        let index = VectorIndex::new(4);
        index.insert(chunk("a", 0, "x"), unit(4, 0)).unwrap();
        index.remove("a");
        index.remove("a");
        index.remove("never-existed");
        assert_eq!(index.document_count(), 0);
    }

    #[test]
    fn fewer_chunks_than_top_k_is_not_an_error() {
        let index = VectorIndex::new(4);
        index.insert(chunk("a", 0, "x"), unit(4, 0)).unwrap();
        let result = index.search(&unit(4, 0), &["a".to_string()], 5).unwrap();
        assert_eq!(result.len(), 1);
    }

    #[test]
    fn top_k_zero_rejected() {
        let index = VectorIndex::new(4);
        assert!(matches!(
            index.search(&unit(4, 0), &["a".to_string()], 0),
            Err(IndexError::InvalidTopK)
        ));
    }

    #[test]
    fn insert_document_replaces_previous_entries() {
        let index = VectorIndex::new(4);
        index
            .insert_document(
                "a",
                vec![
                    (chunk("a", 0, "old"), unit(4, 0)),
                    (chunk("a", 1, "old"), unit(4, 1)),
                ],
            )
            .unwrap();
        index
            .insert_document("a", vec![(chunk("a", 0, "new"), unit(4, 2))])
            .unwrap();
        assert_eq!(index.chunk_count(), 1);

        let result = index.search(&unit(4, 2), &["a".to_string()], 5).unwrap();
        assert_eq!(result.hits[0].chunk.text, "new");
    }

    #[test]
    fn reinserting_a_sequence_does_not_duplicate() {
        let index = VectorIndex::new(4);
        index.insert(chunk("a", 0, "v1"), unit(4, 0)).unwrap();
        index.insert(chunk("a", 0, "v2"), unit(4, 0)).unwrap();
        assert_eq!(index.chunk_count(), 1);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
