//! Pipeline orchestration.
//!
//! [`Pipeline`] wires the chunker, embedder, index, cache, retriever, and
//! synthesizer into the two public operations: ingesting a document and
//! answering a question over a set of indexed documents.
//!
//! Ingestion is single-flight per document id and atomic from a reader's
//! point of view: until a document reaches the Indexed state, queries see
//! either its previous indexed form or nothing. Any ingestion failure rolls
//! the document back out of the index and cache and records the cause.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::cache::SemanticCache;
use crate::chunker::{chunk, normalize_text};
use crate::config::PipelineConfig;
use crate::embedder::Embedder;
use crate::error::{GatewayError, InputError, Result, VeridexError};
use crate::gateway::ResilientGateway;
use crate::index::VectorIndex;
use crate::provider::GenerationProvider;
use crate::retriever::Retriever;
use crate::synthesizer::AnswerSynthesizer;
use crate::types::{Answer, Chunk, DocumentStatus, Embedding, Turn};

/// Tracks per-document lifecycle state.
///
/// The pipeline treats this as the source of truth for whether a document
/// may be queried; the vector index only stores what is searchable.
pub trait DocumentStore: Send + Sync {
    fn status(&self, document_id: &str) -> Option<DocumentStatus>;
    fn set_status(&self, document_id: &str, status: DocumentStatus);
    /// Ids of all documents currently in the Indexed state.
    fn indexed_ids(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    statuses: RwLock<HashMap<String, DocumentStatus>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn status(&self, document_id: &str) -> Option<DocumentStatus> {
        let statuses = self.statuses.read().expect("status lock poisoned");
        statuses.get(document_id).cloned()
    }

    fn set_status(&self, document_id: &str, status: DocumentStatus) {
        let mut statuses = self.statuses.write().expect("status lock poisoned");
        statuses.insert(document_id.to_string(), status);
    }

    fn indexed_ids(&self) -> Vec<String> {
        let statuses = self.statuses.read().expect("status lock poisoned");
        let mut ids: Vec<String> = statuses
            .iter()
            .filter(|(_, status)| matches!(status, DocumentStatus::Indexed))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Aggregate counters, for logging and health endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub documents_indexed: usize,
    pub total_chunks: usize,
    pub cache_entries: usize,
    pub answers_served: u64,
    pub cache_hits: u64,
}

pub struct Pipeline {
    config: PipelineConfig,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    retriever: Retriever,
    cache: Arc<SemanticCache>,
    synthesizer: AnswerSynthesizer,
    embedding_gateway: Arc<ResilientGateway>,
    documents: Arc<dyn DocumentStore>,
    doc_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    answers_served: AtomicU64,
    cache_hits: AtomicU64,
}

impl Pipeline {
    /// Build a pipeline from a validated config and the two external
    /// dependencies. Embedding and generation get independent gateways so
    /// one dependency's circuit does not gate the other.
    pub fn new(
        config: PipelineConfig,
        embedder: Arc<dyn Embedder>,
        provider: Arc<dyn GenerationProvider>,
    ) -> Result<Self> {
        config.validate()?;

        let index = Arc::new(VectorIndex::new(config.embedding_dimensions));
        let cache = Arc::new(SemanticCache::new(config.embedding_dimensions));

        let gateway_for = |dependency: &'static str| {
            Arc::new(ResilientGateway::new(
                dependency,
                config.circuit_failure_threshold as u32,
                config.circuit_cooldown(),
                config.retry_max_attempts as u32,
                std::time::Duration::from_millis(config.retry_backoff_base_ms),
                config.attempt_timeout(),
            ))
        };
        let embedding_gateway = gateway_for("embedding");
        let generation_gateway = gateway_for("generation");

        let synthesizer = AnswerSynthesizer::new(
            provider,
            generation_gateway,
            config.confidence_threshold,
            config.max_context_chars,
        );

        Ok(Self {
            retriever: Retriever::new(Arc::clone(&index)),
            config,
            embedder,
            index,
            cache,
            synthesizer,
            embedding_gateway,
            documents: Arc::new(InMemoryDocumentStore::new()),
            doc_locks: Mutex::new(HashMap::new()),
            answers_served: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn document_status(&self, document_id: &str) -> Option<DocumentStatus> {
        self.documents.status(document_id)
    }

    pub fn indexed_documents(&self) -> Vec<String> {
        self.documents.indexed_ids()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            documents_indexed: self.index.document_count(),
            total_chunks: self.index.chunk_count(),
            cache_entries: self.cache.len(),
            answers_served: self.answers_served.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    fn document_lock(&self, document_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.doc_locks.lock().expect("doc lock table poisoned");
        Arc::clone(
            locks
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Ingest (or re-ingest) a document. Returns the number of chunks
    /// indexed.
    ///
    /// Concurrent calls for the same id serialize; calls for different ids
    /// proceed in parallel. Re-ingesting an Indexed document first drops its
    /// cached answers, then replaces its index entries in one atomic swap.
    /// On failure the document ends in `Failed` with the cause, with no
    /// entries left in the index or cache.
    #[instrument(skip(self, text))]
    pub async fn process_document(&self, document_id: &str, text: &str) -> Result<usize> {
        let lock = self.document_lock(document_id);
        let _guard = lock.lock().await;

        // The document is leaving Indexed (if it was there); cached answers
        // built on its old content must not survive.
        self.cache.invalidate(document_id);
        self.documents
            .set_status(document_id, DocumentStatus::Pending);

        match self.index_document(document_id, text).await {
            Ok(count) => {
                self.documents
                    .set_status(document_id, DocumentStatus::Indexed);
                info!(document_id, chunks = count, "document indexed");
                Ok(count)
            }
            Err(err) => {
                self.index.remove(document_id);
                self.cache.invalidate(document_id);
                self.documents.set_status(
                    document_id,
                    DocumentStatus::Failed {
                        cause: err.to_string(),
                    },
                );
                warn!(document_id, error = %err, "ingestion failed, rolled back");
                Err(err)
            }
        }
    }

    async fn index_document(&self, document_id: &str, text: &str) -> Result<usize> {
        if text.trim().is_empty() {
            return Err(InputError::EmptyDocument {
                id: document_id.to_string(),
            }
            .into());
        }

        let normalized = normalize_text(text);
        let chunks: Vec<Chunk> = chunk(
            &normalized,
            document_id,
            self.config.chunk_size,
            self.config.chunk_overlap,
        )?
        .collect();
        self.documents
            .set_status(document_id, DocumentStatus::Chunked);

        let mut entries: Vec<(Chunk, Embedding)> = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.config.embedding_batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            // embed_batch is all-or-nothing and order-preserving.
            let embeddings = self
                .embedding_gateway
                .call(|| self.embedder.embed_batch(&texts))
                .await?;
            entries.extend(batch.iter().cloned().zip(embeddings));
        }

        let count = entries.len();
        // Single swap: readers see the old document in full until here.
        self.index.insert_document(document_id, entries)?;
        Ok(count)
    }

    /// Answer `query` over the given indexed documents.
    ///
    /// The query is embedded once; that embedding drives both the semantic
    /// cache lookup and, on a miss, the index search. Cache hits come back
    /// flagged with `served_from_cache`.
    pub async fn answer(&self, query: &str, document_ids: &[String]) -> Result<Answer> {
        self.answer_with_history(query, document_ids, &[]).await
    }

    /// Answer with caller-supplied conversation history.
    ///
    /// History is passed through to the synthesizer and never retained.
    /// History-conditioned answers bypass the semantic cache in both
    /// directions: the cache key carries no history, so a hit could replay
    /// an answer whose conversation no longer matches.
    #[instrument(
        skip(self, query, history),
        fields(query_id = %uuid::Uuid::new_v4(), targets = document_ids.len())
    )]
    pub async fn answer_with_history(
        &self,
        query: &str,
        document_ids: &[String],
        history: &[Turn],
    ) -> Result<Answer> {
        let started = Instant::now();

        if query.trim().is_empty() {
            return Err(InputError::EmptyQuery.into());
        }
        if document_ids.is_empty() {
            return Err(InputError::NoTargetDocuments.into());
        }
        for id in document_ids {
            match self.documents.status(id) {
                Some(DocumentStatus::Indexed) => {}
                Some(status) => {
                    return Err(InputError::DocumentNotIndexed {
                        id: id.clone(),
                        status: status.to_string(),
                    }
                    .into());
                }
                None => {
                    return Err(InputError::UnknownDocument { id: id.clone() }.into());
                }
            }
        }

        let query_embedding = self
            .embedding_gateway
            .call(|| self.embedder.embed(query))
            .await?;

        if history.is_empty() {
            if let Some(entry) = self.cache.lookup(
                &query_embedding,
                document_ids,
                self.config.cache_similarity_threshold,
                self.config.cache_ttl(),
            )? {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.answers_served.fetch_add(1, Ordering::Relaxed);
                info!("answer served from cache");
                return Ok(entry.answer.as_cached(started.elapsed().as_millis() as u64));
            }
        }

        let retrieval =
            self.retriever
                .retrieve(&query_embedding, document_ids, self.config.top_k)?;
        let mut answer = self.synthesizer.synthesize(query, &retrieval, history).await?;
        answer.latency_ms = started.elapsed().as_millis() as u64;

        if history.is_empty() {
            // Synchronous store: once synthesis succeeds there is no await
            // between here and returning, so cancellation cannot leave a
            // half-written entry.
            self.cache.store(
                query_embedding,
                document_ids,
                answer.clone(),
                self.config.cache_similarity_threshold,
                self.config.cache_ttl(),
            )?;
        }
        self.answers_served.fetch_add(1, Ordering::Relaxed);
        Ok(answer)
    }

    /// Like [`Pipeline::answer`], abandoned cleanly when `cancel` fires.
    ///
    /// Cancellation drops the in-flight work at its next await point; no
    /// partial state is published because both the index swap and the cache
    /// store are synchronous.
    pub async fn answer_with_cancel(
        &self,
        query: &str,
        document_ids: &[String],
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        match cancel
            .run_until_cancelled(self.answer(query, document_ids))
            .await
        {
            Some(result) => result,
            None => Err(VeridexError::Gateway(GatewayError::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::HashEmbedder;
    use crate::provider::MockGenerationProvider;

    const DIMS: usize = 64;

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            chunk_size: 120,
            chunk_overlap: 20,
            embedding_dimensions: DIMS,
            retry_backoff_base_ms: 1,
            ..PipelineConfig::default()
        }
    }

    fn pipeline_with(provider: Arc<MockGenerationProvider>) -> Pipeline {
        Pipeline::new(test_config(), Arc::new(HashEmbedder::new(DIMS)), provider).unwrap()
    }

    fn good_reply() -> &'static str {
        r#"{"answer": "Thirty days.", "confidence": 0.9, "sources": [], "contradictions": []}"#
    }

    const DOC: &str = "The grace period for premium payment is thirty days. \
        After the grace period lapses, the policy terminates. \
        A terminated policy can be reinstated within ninety days.";

    #[tokio::test]
    async fn document_lifecycle_reaches_indexed() {
        let pipeline = pipeline_with(Arc::new(MockGenerationProvider::new()));
        let chunks = pipeline.process_document("doc-a", DOC).await.unwrap();

        assert!(chunks >= 1);
        assert_eq!(
            pipeline.document_status("doc-a"),
            Some(DocumentStatus::Indexed)
        );
        assert_eq!(pipeline.indexed_documents(), vec!["doc-a".to_string()]);
        assert_eq!(pipeline.stats().total_chunks, chunks);
    }

    #[tokio::test]
    async fn empty_document_fails_with_rollback() {
        let pipeline = pipeline_with(Arc::new(MockGenerationProvider::new()));
        let err = pipeline.process_document("doc-a", "   \n ").await.unwrap_err();

        assert!(matches!(
            err,
            VeridexError::Input(InputError::EmptyDocument { .. })
        ));
        assert!(matches!(
            pipeline.document_status("doc-a"),
            Some(DocumentStatus::Failed { .. })
        ));
        assert_eq!(pipeline.stats().documents_indexed, 0);
    }

    #[tokio::test]
    async fn answer_requires_indexed_targets() {
        let provider = Arc::new(MockGenerationProvider::new());
        let pipeline = pipeline_with(provider);

        let err = pipeline
            .answer("query", &["ghost".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VeridexError::Input(InputError::UnknownDocument { .. })
        ));

        let err = pipeline.answer("query", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            VeridexError::Input(InputError::NoTargetDocuments)
        ));
    }

    #[tokio::test]
    async fn repeated_question_is_served_from_cache() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(good_reply());
        let pipeline = pipeline_with(provider.clone());

        pipeline.process_document("doc-a", DOC).await.unwrap();
        let targets = vec!["doc-a".to_string()];

        let first = pipeline
            .answer("What is the grace period?", &targets)
            .await
            .unwrap();
        assert!(!first.served_from_cache);

        // Same question again: no new provider call, cached flag set.
        let second = pipeline
            .answer("What is the grace period?", &targets)
            .await
            .unwrap();
        assert!(second.served_from_cache);
        assert_eq!(second.primary_response, first.primary_response);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(pipeline.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn reingestion_invalidates_cached_answers() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(good_reply());
        provider.queue_text(
            r#"{"answer": "Sixty days.", "confidence": 0.9, "sources": [], "contradictions": []}"#,
        );
        let pipeline = pipeline_with(provider.clone());

        pipeline.process_document("doc-a", DOC).await.unwrap();
        let targets = vec!["doc-a".to_string()];
        pipeline
            .answer("What is the grace period?", &targets)
            .await
            .unwrap();
        assert_eq!(pipeline.stats().cache_entries, 1);

        // Re-ingest with changed content; the cached answer must not survive.
        pipeline
            .process_document("doc-a", "The grace period is sixty days.")
            .await
            .unwrap();
        assert_eq!(pipeline.stats().cache_entries, 0);

        let fresh = pipeline
            .answer("What is the grace period?", &targets)
            .await
            .unwrap();
        assert!(!fresh.served_from_cache);
        assert_eq!(fresh.primary_response, "Sixty days.");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn history_conditioned_answers_bypass_the_cache() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(good_reply());
        provider.queue_text(good_reply());
        let pipeline = pipeline_with(provider.clone());
        pipeline.process_document("doc-a", DOC).await.unwrap();
        let targets = vec!["doc-a".to_string()];

        let history = vec![Turn::user("Earlier question.")];
        pipeline
            .answer_with_history("What is the grace period?", &targets, &history)
            .await
            .unwrap();
        assert_eq!(pipeline.stats().cache_entries, 0);

        // Same query with history again: no cache hit, a fresh generation.
        let again = pipeline
            .answer_with_history("What is the grace period?", &targets, &history)
            .await
            .unwrap();
        assert!(!again.served_from_cache);
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_answer_returns_cancelled_error() {
        let provider = Arc::new(MockGenerationProvider::new());
        let pipeline = pipeline_with(provider);
        pipeline.process_document("doc-a", DOC).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline
            .answer_with_cancel("query", &["doc-a".to_string()], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VeridexError::Gateway(GatewayError::Cancelled)
        ));
    }
}
