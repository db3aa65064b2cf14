//! Error types for the Veridex pipeline core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering configuration, caller input, dependency gateways, the vector
//! index, and answer synthesis.

/// Top-level error type for the Veridex core library.
#[derive(Debug, thiserror::Error)]
pub enum VeridexError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    Input(#[from] InputError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Synthesis error: {0}")]
    Synthesis(#[from] SynthesisError),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VeridexError>;

/// Fatal, startup-time configuration errors.
///
/// A pipeline is never constructed from an invalid configuration; these
/// surface from [`crate::config::PipelineConfig::validate`] before any
/// request is served.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("chunk_overlap ({overlap}) must be smaller than chunk_size ({chunk_size})")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    #[error("{field} must be positive (got {value})")]
    NonPositive { field: &'static str, value: usize },

    #[error("{field} must lie in [0.0, 1.0] (got {value})")]
    OutOfRange { field: &'static str, value: f64 },

    #[error("Failed to load configuration: {message}")]
    LoadFailed { message: String },
}

/// Caller errors — surfaced to the caller, never retried.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("No target documents given; refusing to search the whole corpus")]
    NoTargetDocuments,

    #[error("Unknown document: {id}")]
    UnknownDocument { id: String },

    #[error("Document '{id}' is not indexed (status: {status})")]
    DocumentNotIndexed { id: String, status: String },

    #[error("Document '{id}' has no extractable text")]
    EmptyDocument { id: String },

    #[error("Query text is empty")]
    EmptyQuery,
}

/// Errors returned by an embedding or generation provider for a single call.
///
/// The resilient gateway decides which of these are worth retrying; see
/// [`ProviderError::is_transient`].
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("Provider call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Provider rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Authentication failed for provider {provider}")]
    Auth { provider: String },

    #[error("Provider returned a malformed response: {message}")]
    Malformed { message: String },
}

impl ProviderError {
    /// Whether this failure is transient and worth retrying.
    ///
    /// Outages and timeouts are retried; rejected requests, auth failures,
    /// and malformed payloads are not (retrying cannot help, and malformed
    /// output has its own single-retry policy in the synthesizer).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable { .. } | ProviderError::Timeout { .. }
        )
    }
}

/// Errors from the resilient gateway wrapping every external call.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// All retry attempts failed; the dependency is considered down.
    #[error("Dependency '{dependency}' unavailable after {attempts} attempts: {message}")]
    DependencyUnavailable {
        dependency: String,
        attempts: u32,
        message: String,
    },

    /// The circuit is open; the call was refused without touching the network.
    #[error("Circuit open for dependency '{dependency}'")]
    CircuitOpen { dependency: String },

    /// A non-transient provider error, passed through without retries.
    #[error("Dependency '{dependency}' failed: {source}")]
    Provider {
        dependency: String,
        #[source]
        source: ProviderError,
    },

    /// The caller cancelled the in-flight request.
    #[error("Request cancelled by caller")]
    Cancelled,
}

/// Internal invariant violations in the vector index or semantic cache.
///
/// Always fatal to the operation; never silently coerced.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("top_k must be at least 1")]
    InvalidTopK,
}

/// Errors from answer synthesis.
#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    /// The generation output failed schema validation even after the
    /// stricter-formatting retry.
    #[error("Generation output failed schema validation: {message}")]
    Malformed { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(
            ProviderError::Unavailable {
                message: "503".into()
            }
            .is_transient()
        );
        assert!(ProviderError::Timeout { timeout_ms: 100 }.is_transient());
        assert!(
            !ProviderError::Malformed {
                message: "not json".into()
            }
            .is_transient()
        );
        assert!(
            !ProviderError::Rejected {
                status: 400,
                message: "bad request".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn errors_compose_into_top_level() {
        let e: VeridexError = InputError::NoTargetDocuments.into();
        assert!(matches!(e, VeridexError::Input(_)));

        let e: VeridexError = IndexError::InvalidTopK.into();
        assert!(e.to_string().contains("top_k"));
    }
}
