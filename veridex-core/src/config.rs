//! Configuration for the Veridex pipeline.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment variables (prefixed with `VERIDEX_`). Every option has a
//! documented default; invalid values fail fast at construction time via
//! [`PipelineConfig::validate`], never per-request.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;

/// Pipeline-wide configuration. See the field docs for defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Target chunk size in characters (default: 800).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Characters of overlap between neighboring chunks (default: 120).
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Number of chunks retrieved per query (default: 5).
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Embedding dimensionality; shared by the vector index and the
    /// semantic cache (default: 384).
    #[serde(default = "default_dimensions")]
    pub embedding_dimensions: usize,
    /// Texts embedded per batch call during indexing (default: 32).
    #[serde(default = "default_batch_size")]
    pub embedding_batch_size: usize,
    /// Minimum query-embedding similarity for a semantic cache hit
    /// (default: 0.98). Independent of `confidence_threshold`.
    #[serde(default = "default_cache_similarity_threshold")]
    pub cache_similarity_threshold: f32,
    /// Cache entry time-to-live in seconds (default: 3600).
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Answers with synthesizer-reported confidence below this are replaced
    /// by the insufficient-evidence marker (default: 0.5).
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Consecutive failures before a dependency's circuit opens (default: 5).
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: usize,
    /// Seconds an open circuit waits before admitting a trial call
    /// (default: 30).
    #[serde(default = "default_circuit_cooldown_secs")]
    pub circuit_cooldown_secs: u64,
    /// Maximum attempts per external call, including the first (default: 3).
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: usize,
    /// Base backoff in milliseconds; doubles per attempt (default: 250).
    #[serde(default = "default_retry_backoff_base_ms")]
    pub retry_backoff_base_ms: u64,
    /// Per-attempt deadline for external calls, in seconds (default: 60).
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Upper bound on assembled context size, in characters (default: 16000).
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    120
}
fn default_top_k() -> usize {
    5
}
fn default_dimensions() -> usize {
    384
}
fn default_batch_size() -> usize {
    32
}
fn default_cache_similarity_threshold() -> f32 {
    0.98
}
fn default_cache_ttl_secs() -> u64 {
    3600
}
fn default_confidence_threshold() -> f32 {
    0.5
}
fn default_circuit_failure_threshold() -> usize {
    5
}
fn default_circuit_cooldown_secs() -> u64 {
    30
}
fn default_retry_max_attempts() -> usize {
    3
}
fn default_retry_backoff_base_ms() -> u64 {
    250
}
fn default_attempt_timeout_secs() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    16_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            top_k: default_top_k(),
            embedding_dimensions: default_dimensions(),
            embedding_batch_size: default_batch_size(),
            cache_similarity_threshold: default_cache_similarity_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            confidence_threshold: default_confidence_threshold(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_secs: default_circuit_cooldown_secs(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_base_ms: default_retry_backoff_base_ms(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl PipelineConfig {
    /// Validate the configuration, failing fast on any invalid value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "chunk_size",
                value: self.chunk_size,
            });
        }
        if self.chunk_overlap == 0 {
            return Err(ConfigError::NonPositive {
                field: "chunk_overlap",
                value: self.chunk_overlap,
            });
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(ConfigError::InvalidChunking {
                chunk_size: self.chunk_size,
                overlap: self.chunk_overlap,
            });
        }
        if self.top_k == 0 {
            return Err(ConfigError::NonPositive {
                field: "top_k",
                value: self.top_k,
            });
        }
        if self.embedding_dimensions == 0 {
            return Err(ConfigError::NonPositive {
                field: "embedding_dimensions",
                value: self.embedding_dimensions,
            });
        }
        if self.embedding_batch_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "embedding_batch_size",
                value: self.embedding_batch_size,
            });
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::NonPositive {
                field: "retry_max_attempts",
                value: self.retry_max_attempts,
            });
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::NonPositive {
                field: "circuit_failure_threshold",
                value: self.circuit_failure_threshold,
            });
        }
        for (field, value) in [
            (
                "cache_similarity_threshold",
                self.cache_similarity_threshold,
            ),
            ("confidence_threshold", self.confidence_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) || !value.is_finite() {
                return Err(ConfigError::OutOfRange {
                    field,
                    value: value as f64,
                });
            }
        }
        Ok(())
    }

    /// Cache TTL as a [`Duration`].
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Circuit breaker cooldown as a [`Duration`].
    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_secs)
    }

    /// Per-attempt call deadline as a [`Duration`].
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

/// Load the pipeline configuration.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `VERIDEX_`)
/// 2. Config file (if given and present)
/// 3. Built-in defaults
///
/// The result is validated before being returned.
pub fn load_config(config_file: Option<&Path>) -> Result<PipelineConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(PipelineConfig::default()));

    if let Some(path) = config_file
        && path.exists()
    {
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("VERIDEX_"));

    let config: PipelineConfig = figment.extract().map_err(|e| ConfigError::LoadFailed {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}
