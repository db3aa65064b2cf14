//! Pluggable embedding providers.
//!
//! Provides a trait-based abstraction over embedding models, with a local
//! hashing TF embedder (always available, deterministic) and an
//! OpenAI-compatible HTTP embedder. Embedding is an I/O suspension point,
//! so the trait is async; retry and circuit-breaking are the gateway's
//! job, never the embedder's.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::ProviderError;
use crate::types::Embedding;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError>;

    /// Generate embeddings for a batch of texts, preserving input order.
    ///
    /// A batch either fully succeeds or fails as a unit; implementations
    /// must never drop or reorder entries on partial provider failure.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, ProviderError>;

    /// Dimensionality of the produced vectors.
    fn dimensions(&self) -> usize;

    /// Provider name, used as the gateway dependency label.
    fn provider_name(&self) -> &str;
}

/// Local term-frequency embedder using hashed bag-of-words.
///
/// Deterministic and dependency-free: each term is hashed to a dimension,
/// term frequencies are accumulated, and the vector is L2-normalized.
/// Useful as a fallback provider and for tests.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    fn embed_sync(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimensions];

        let lowered = text.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty());

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in words {
            *tf.entry(word).or_insert(0) += 1;
        }
        if tf.is_empty() {
            return vector;
        }

        for (term, count) in &tf {
            let idx = term_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

/// djb2 over the term bytes.
fn term_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "hash-tf"
    }
}

/// OpenAI-compatible `/v1/embeddings` provider.
pub struct HttpEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl HttpEmbedder {
    /// Create an embedder against an OpenAI-compatible endpoint.
    ///
    /// `base_url` is the API root without the `/v1/embeddings` suffix.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        }
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Embedding>, ProviderError> {
        let url = format!("{}/v1/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": inputs,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: format!("embedding request failed: {e}"),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth {
                provider: "embeddings".into(),
            });
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ProviderError::Unavailable {
                message: format!("embedding endpoint returned {status}"),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let payload: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::Malformed {
                    message: format!("embedding response is not JSON: {e}"),
                })?;

        let data = payload["data"]
            .as_array()
            .ok_or_else(|| ProviderError::Malformed {
                message: "embedding response missing 'data' array".into(),
            })?;
        if data.len() != inputs.len() {
            return Err(ProviderError::Malformed {
                message: format!(
                    "embedding response has {} vectors for {} inputs",
                    data.len(),
                    inputs.len()
                ),
            });
        }

        let mut vectors = Vec::with_capacity(data.len());
        for item in data {
            let values =
                item["embedding"]
                    .as_array()
                    .ok_or_else(|| ProviderError::Malformed {
                        message: "embedding entry missing 'embedding' array".into(),
                    })?;
            let vector: Embedding = values
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            if vector.len() != self.dimensions {
                return Err(ProviderError::Malformed {
                    message: format!(
                        "provider returned {}-dimensional vector, expected {}",
                        vector.len(),
                        self.dimensions
                    ),
                });
            }
            vectors.push(vector);
        }
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, ProviderError> {
        let input = [text.to_string()];
        let mut vectors = self.request(&input).await?;
        Ok(vectors.remove(0))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "embeddings-http"
    }
}
