//! # Veridex Core
//!
//! Orchestration core for retrieval-augmented question answering over a
//! fixed document corpus. Provides the ingestion pipeline (normalize,
//! chunk, embed, index), semantic answer caching, retrieval scoped to an
//! explicit document set, grounded answer synthesis with a confidence
//! gate, and resilient access to the embedding and generation providers.

pub mod cache;
pub mod chunker;
pub mod config;
pub mod embedder;
pub mod error;
pub mod gateway;
pub mod index;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod retriever;
pub mod synthesizer;
pub mod types;

// Re-export commonly used types at the crate root.
pub use cache::SemanticCache;
pub use chunker::{chunk, normalize_text, ChunkIter};
pub use config::{load_config, PipelineConfig};
pub use embedder::{Embedder, HashEmbedder, HttpEmbedder};
pub use error::{
    ConfigError, GatewayError, IndexError, InputError, ProviderError, Result, SynthesisError,
    VeridexError,
};
pub use gateway::{CircuitBreaker, ResilientGateway};
pub use index::{cosine_similarity, VectorIndex};
pub use pipeline::{DocumentStore, InMemoryDocumentStore, Pipeline, PipelineStats};
pub use prompt::QueryKind;
pub use provider::{GenerationOutput, GenerationProvider, MockGenerationProvider, OpenAiCompatProvider};
pub use retriever::Retriever;
pub use synthesizer::{AnswerSynthesizer, LOW_CONFIDENCE_MARKER};
pub use types::{
    Answer, CacheEntry, Chunk, ConflictingClaim, Contradiction, DocumentStatus, Embedding,
    RetrievalResult, Role, ScoredChunk, SourceRef, TokenUsage, Turn,
};
