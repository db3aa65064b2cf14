//! Core type definitions for the Veridex pipeline.
//!
//! Defines the fundamental data structures used throughout the system:
//! documents, chunks, retrieval results, answers, cache entries, and
//! conversation turns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A fixed-dimension embedding vector.
pub type Embedding = Vec<f32>;

/// Processing status of a document in the pipeline state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DocumentStatus {
    /// Text extracted, not yet chunked.
    Pending,
    /// All chunks produced, embeddings not yet indexed.
    Chunked,
    /// Every chunk embedded and inserted into the vector index.
    Indexed,
    /// An unrecoverable step failed; the index holds nothing for this document.
    Failed { cause: String },
}

impl std::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocumentStatus::Pending => write!(f, "pending"),
            DocumentStatus::Chunked => write!(f, "chunked"),
            DocumentStatus::Indexed => write!(f, "indexed"),
            DocumentStatus::Failed { cause } => write!(f, "failed: {cause}"),
        }
    }
}

/// A contiguous passage of a document's text, possibly overlapping neighbors.
///
/// Chunks are owned by exactly one document and never mutated after creation.
/// `start`/`end` are character offsets into the normalized source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    /// Position of this chunk in the document's chunk sequence.
    pub seq: usize,
    pub text: String,
    /// Character span into the source text (inclusive start, exclusive end).
    pub start: usize,
    pub end: usize,
    /// Number of characters shared with the preceding chunk.
    pub overlap: usize,
}

/// A chunk scored against a query embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Cosine similarity against the query embedding.
    pub score: f32,
}

/// Ordered retrieval output: descending similarity, ties broken by
/// ascending document id then ascending chunk sequence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Distinct document ids present in the hits, in first-seen order.
    pub fn document_ids(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for hit in &self.hits {
            let id = hit.chunk.document_id.as_str();
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

/// A reference to the place an answer drew evidence from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub chunk_seq: usize,
}

/// One side of a detected cross-document disagreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictingClaim {
    pub claim: String,
    pub source: SourceRef,
}

/// A detected disagreement between sources on the same topic.
///
/// `topic` is a free-form string label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub topic: String,
    pub claims: Vec<ConflictingClaim>,
}

/// Token accounting for a generation call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A synthesized, confidence-scored answer. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// The primary response text. Replaced by the low-confidence marker when
    /// the synthesizer's confidence gate trips.
    pub primary_response: String,
    /// Supporting details, in the order the synthesizer produced them.
    #[serde(default)]
    pub supporting_details: Vec<String>,
    /// Synthesizer-reported confidence in [0.0, 1.0]. A value of 0.0 means
    /// the context was empty or wholly contradictory.
    pub confidence: f32,
    /// Where the evidence came from.
    #[serde(default)]
    pub references: Vec<SourceRef>,
    /// Cross-document contradictions. Always present (possibly empty) in
    /// multi-document mode; always empty in single-document mode.
    #[serde(default)]
    pub contradictions: Vec<Contradiction>,
    /// Whether this answer was served from the semantic cache.
    #[serde(default)]
    pub served_from_cache: bool,
    pub usage: TokenUsage,
    /// Wall-clock time spent producing this answer, in milliseconds.
    pub latency_ms: u64,
}

impl Answer {
    /// Return a copy annotated as served from the semantic cache.
    pub fn as_cached(&self, latency_ms: u64) -> Self {
        let mut cached = self.clone();
        cached.served_from_cache = true;
        cached.latency_ms = latency_ms;
        cached
    }
}

/// A cached answer keyed by query embedding and document id set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub query_embedding: Embedding,
    /// Sorted for key stability; the set is order-independent.
    pub document_ids: Vec<String>,
    pub answer: Answer,
    pub created_at: DateTime<Utc>,
    /// Similarity threshold that was in force when the entry was written.
    pub threshold: f32,
}

/// Participant role in a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One turn of prior conversation, passed in by the caller on each request.
/// The core never retains history between calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_result_document_ids_dedup() {
        let chunk = |doc: &str, seq: usize| ScoredChunk {
            chunk: Chunk {
                document_id: doc.to_string(),
                seq,
                text: String::new(),
                start: 0,
                end: 0,
                overlap: 0,
            },
            score: 1.0,
        };
        let result = RetrievalResult {
            hits: vec![chunk("a", 0), chunk("b", 0), chunk("a", 1)],
        };
        assert_eq!(result.document_ids(), vec!["a", "b"]);
    }

    #[test]
    fn cached_annotation_preserves_content() {
        let answer = Answer {
            primary_response: "the deductible is $500".into(),
            supporting_details: vec![],
            confidence: 0.9,
            references: vec![],
            contradictions: vec![],
            served_from_cache: false,
            usage: TokenUsage::default(),
            latency_ms: 1200,
        };
        let cached = answer.as_cached(3);
        assert!(cached.served_from_cache);
        assert_eq!(cached.latency_ms, 3);
        assert_eq!(cached.primary_response, answer.primary_response);
    }

    #[test]
    fn status_display() {
        assert_eq!(DocumentStatus::Indexed.to_string(), "indexed");
        let failed = DocumentStatus::Failed {
            cause: "embedding outage".into(),
        };
        assert!(failed.to_string().contains("embedding outage"));
    }
}
