//! Query-time retrieval over the vector index.

use std::sync::Arc;
use tracing::debug;

use crate::error::{InputError, VeridexError};
use crate::index::VectorIndex;
use crate::types::RetrievalResult;

/// Scopes index searches to an explicit target document set.
///
/// An empty target set is an input error, never an empty result: silently
/// searching nothing would produce a confident-looking empty answer.
#[derive(Debug, Clone)]
pub struct Retriever {
    index: Arc<VectorIndex>,
}

impl Retriever {
    pub fn new(index: Arc<VectorIndex>) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// Top-k search with a pre-computed query embedding.
    pub fn retrieve(
        &self,
        query_embedding: &[f32],
        document_ids: &[String],
        top_k: usize,
    ) -> Result<RetrievalResult, VeridexError> {
        if document_ids.is_empty() {
            return Err(InputError::NoTargetDocuments.into());
        }
        for id in document_ids {
            if !self.index.contains(id) {
                return Err(InputError::UnknownDocument { id: id.clone() }.into());
            }
        }

        let result = self.index.search(query_embedding, document_ids, top_k)?;
        debug!(
            targets = document_ids.len(),
            hits = result.len(),
            "retrieval complete"
        );
        Ok(result)
    }
}
