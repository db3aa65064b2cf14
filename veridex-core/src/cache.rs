//! Semantic answer cache.
//!
//! Caches produced answers keyed by (query embedding, document id set).
//! A lookup hits only when the document set matches exactly and the query
//! embedding is at least `similarity_threshold`-close to a cached query;
//! anything below the threshold is a miss, never a degraded answer.
//!
//! Entries expire by TTL and are dropped eagerly whenever a referenced
//! document leaves the Indexed state (`invalidate`), so a reader can never
//! observe an answer built from a re-indexed or failed document.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use crate::error::IndexError;
use crate::index::cosine_similarity;
use crate::types::{Answer, CacheEntry, Embedding};

/// Nearest-neighbor store over past query embeddings, bucketed by the
/// exact (sorted) document id set.
#[derive(Debug)]
pub struct SemanticCache {
    dimensions: usize,
    buckets: RwLock<HashMap<Vec<String>, Vec<CacheEntry>>>,
}

/// Sort and deduplicate a document id set into a stable bucket key.
fn bucket_key(document_ids: &[String]) -> Vec<String> {
    let mut key: Vec<String> = document_ids.to_vec();
    key.sort();
    key.dedup();
    key
}

fn is_live(entry: &CacheEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    let age = now.signed_duration_since(entry.created_at);
    age.to_std().map(|age| age < ttl).unwrap_or(true)
}

impl SemanticCache {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            buckets: RwLock::new(HashMap::new()),
        }
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

    /// Return the highest-similarity live entry for this exact document set
    /// whose similarity is at least `similarity_threshold`.
    pub fn lookup(
        &self,
        query: &[f32],
        document_ids: &[String],
        similarity_threshold: f32,
        ttl: Duration,
    ) -> Result<Option<CacheEntry>, IndexError> {
        self.check_dimension(query)?;
        let key = bucket_key(document_ids);
        let now = Utc::now();

        let buckets = self.buckets.read().expect("cache lock poisoned");
        let Some(entries) = buckets.get(&key) else {
            return Ok(None);
        };

        let best = entries
            .iter()
            .filter(|entry| is_live(entry, ttl, now))
            .map(|entry| (cosine_similarity(query, &entry.query_embedding), entry))
            .filter(|(similarity, _)| *similarity >= similarity_threshold)
            .max_by(|(a, _), (b, _)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(_, entry)| entry.clone()))
    }

    /// Store an answer for this query embedding and document set.
    ///
    /// Expired entries in the same bucket are pruned on the way in.
    pub fn store(
        &self,
        query: Embedding,
        document_ids: &[String],
        answer: Answer,
        similarity_threshold: f32,
        ttl: Duration,
    ) -> Result<(), IndexError> {
        self.check_dimension(&query)?;
        let key = bucket_key(document_ids);
        let now = Utc::now();

        let mut buckets = self.buckets.write().expect("cache lock poisoned");
        let entries = buckets.entry(key.clone()).or_default();
        entries.retain(|entry| is_live(entry, ttl, now));
        entries.push(CacheEntry {
            query_embedding: query,
            document_ids: key,
            answer,
            created_at: now,
            threshold: similarity_threshold,
        });
        Ok(())
    }

    /// Drop every entry whose document set references `document_id`.
    ///
    /// Called by the orchestrator whenever a document transitions out of
    /// the Indexed state; this is a hard invariant, not best-effort.
    pub fn invalidate(&self, document_id: &str) {
        let mut buckets = self.buckets.write().expect("cache lock poisoned");
        buckets.retain(|key, _| !key.iter().any(|id| id == document_id));
    }

    /// Number of live-or-expired entries currently held.
    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().expect("cache lock poisoned");
        buckets.values().map(|entries| entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
