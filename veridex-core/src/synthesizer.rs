//! Answer synthesis over retrieved context.
//!
//! Turns a ranked retrieval result into a structured [`Answer`]: builds the
//! prompt, calls the generation provider through the gateway, parses the
//! JSON reply, and applies the confidence gate. A malformed reply earns
//! exactly one retry with a stricter format instruction; a second malformed
//! reply is a synthesis error.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{GatewayError, ProviderError, SynthesisError, VeridexError};
use crate::gateway::ResilientGateway;
use crate::prompt::{
    build_user_prompt, extract_json, RawAnswer, STRICT_FORMAT_INSTRUCTION, SYSTEM_PROMPT,
};
use crate::provider::{GenerationOutput, GenerationProvider};
use crate::types::{
    Answer, ConflictingClaim, Contradiction, RetrievalResult, SourceRef, TokenUsage, Turn,
};

/// Standardized response body for answers whose reported confidence falls
/// below the configured threshold. The model's original answer text moves
/// to the supporting details, so a low-confidence claim is never surfaced
/// as a confident one.
pub const LOW_CONFIDENCE_MARKER: &str =
    "Insufficient evidence in the provided documents to answer this question.";

pub struct AnswerSynthesizer {
    provider: Arc<dyn GenerationProvider>,
    gateway: Arc<ResilientGateway>,
    confidence_threshold: f32,
    max_context_chars: usize,
}

impl AnswerSynthesizer {
    pub fn new(
        provider: Arc<dyn GenerationProvider>,
        gateway: Arc<ResilientGateway>,
        confidence_threshold: f32,
        max_context_chars: usize,
    ) -> Self {
        Self {
            provider,
            gateway,
            confidence_threshold,
            max_context_chars,
        }
    }

    /// Synthesize an answer for `query` from `retrieval`, optionally
    /// conditioned on caller-supplied conversation history.
    ///
    /// An empty retrieval short-circuits to an insufficient-evidence answer
    /// without touching the provider.
    pub async fn synthesize(
        &self,
        query: &str,
        retrieval: &RetrievalResult,
        history: &[Turn],
    ) -> Result<Answer, VeridexError> {
        if retrieval.is_empty() {
            debug!("no hits, skipping generation");
            return Ok(Self::no_evidence_answer());
        }

        let user_prompt =
            build_user_prompt(query, history, &retrieval.hits, self.max_context_chars);
        let mut usage = TokenUsage::default();

        match self.attempt(SYSTEM_PROMPT, &user_prompt, &mut usage).await? {
            Ok(raw) => Ok(self.finish(raw, retrieval, usage)),
            Err(first_failure) => {
                warn!(error = %first_failure, "malformed model output, retrying with strict format");
                let strict = format!("{SYSTEM_PROMPT}{STRICT_FORMAT_INSTRUCTION}");
                match self.attempt(&strict, &user_prompt, &mut usage).await? {
                    Ok(raw) => Ok(self.finish(raw, retrieval, usage)),
                    Err(second_failure) => Err(SynthesisError::Malformed {
                        message: second_failure,
                    }
                    .into()),
                }
            }
        }
    }

    /// One gateway-mediated generation attempt.
    ///
    /// The outer `Result` carries hard failures (circuit open, retries
    /// exhausted); the inner one distinguishes a parsed answer from a
    /// malformed reply that the caller may retry once.
    async fn attempt(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        usage: &mut TokenUsage,
    ) -> Result<Result<RawAnswer, String>, VeridexError> {
        let outcome = self
            .gateway
            .call(|| self.provider.generate(system_prompt, user_prompt))
            .await;

        let output: GenerationOutput = match outcome {
            Ok(output) => output,
            Err(GatewayError::Provider {
                source: ProviderError::Malformed { message },
                ..
            }) => return Ok(Err(message)),
            Err(err) => return Err(err.into()),
        };

        usage.input_tokens += output.usage.input_tokens;
        usage.output_tokens += output.usage.output_tokens;

        Ok(Self::parse(&output.text))
    }

    fn parse(text: &str) -> Result<RawAnswer, String> {
        let json = extract_json(text).ok_or_else(|| "no JSON object in reply".to_string())?;
        serde_json::from_str::<RawAnswer>(json).map_err(|err| err.to_string())
    }

    /// Map the raw reply onto the public answer shape and apply the
    /// confidence gate.
    fn finish(&self, raw: RawAnswer, retrieval: &RetrievalResult, usage: TokenUsage) -> Answer {
        let confidence = raw.confidence.clamp(0.0, 1.0);

        let mut references = Self::parse_source_tags(&raw.sources, retrieval);
        if references.is_empty() {
            // Model cited nothing usable; fall back to the retrieved set.
            references = retrieval
                .hits
                .iter()
                .map(|hit| SourceRef {
                    document_id: hit.chunk.document_id.clone(),
                    chunk_seq: hit.chunk.seq,
                })
                .collect();
        }

        // Contradictions are a multi-document concept; with a single source
        // document there is nothing to disagree across, whatever the model
        // claims. Claim sources resolve against the retrieved set the same
        // way answer sources do; claims citing nothing retrieved are dropped.
        let contradictions = if retrieval.document_ids().len() <= 1 {
            Vec::new()
        } else {
            raw.contradictions
                .into_iter()
                .filter_map(|c| {
                    let claims: Vec<ConflictingClaim> = c
                        .claims
                        .into_iter()
                        .filter_map(|claim| {
                            Self::resolve_source_tag(&claim.source, retrieval).map(|source| {
                                ConflictingClaim {
                                    claim: claim.claim,
                                    source,
                                }
                            })
                        })
                        .collect();
                    (!claims.is_empty()).then(|| Contradiction {
                        topic: c.topic,
                        claims,
                    })
                })
                .collect()
        };

        let mut supporting_details = raw.supporting_details;
        let primary_response = if confidence < self.confidence_threshold {
            // Gate: the original text survives only as a supporting detail.
            supporting_details.insert(0, raw.answer);
            LOW_CONFIDENCE_MARKER.to_string()
        } else {
            raw.answer
        };

        Answer {
            primary_response,
            supporting_details,
            confidence,
            references,
            contradictions,
            served_from_cache: false,
            usage,
            latency_ms: 0,
        }
    }

    /// Parse "doc#seq" tags, keeping only those that name a retrieved chunk.
    fn parse_source_tags(tags: &[String], retrieval: &RetrievalResult) -> Vec<SourceRef> {
        tags.iter()
            .filter_map(|tag| Self::resolve_source_tag(tag, retrieval))
            .collect()
    }

    /// Resolve one "doc#seq" tag against the retrieved set.
    fn resolve_source_tag(tag: &str, retrieval: &RetrievalResult) -> Option<SourceRef> {
        let (doc, seq) = tag.rsplit_once('#')?;
        let seq: usize = seq.trim().parse().ok()?;
        let doc = doc.trim();
        retrieval
            .hits
            .iter()
            .any(|hit| hit.chunk.document_id == doc && hit.chunk.seq == seq)
            .then(|| SourceRef {
                document_id: doc.to_string(),
                chunk_seq: seq,
            })
    }

    fn no_evidence_answer() -> Answer {
        Answer {
            primary_response: LOW_CONFIDENCE_MARKER.to_string(),
            supporting_details: vec![
                "No relevant context was found in the target documents.".to_string(),
            ],
            confidence: 0.0,
            references: Vec::new(),
            contradictions: Vec::new(),
            served_from_cache: false,
            usage: TokenUsage::default(),
            latency_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockGenerationProvider;
    use crate::types::{Chunk, ScoredChunk};
    use std::time::Duration;

    fn gateway() -> Arc<ResilientGateway> {
        Arc::new(ResilientGateway::new(
            "generation",
            5,
            Duration::from_secs(30),
            3,
            Duration::from_millis(1),
            Duration::from_secs(5),
        ))
    }

    fn retrieval() -> RetrievalResult {
        RetrievalResult {
            hits: vec![ScoredChunk {
                chunk: Chunk {
                    document_id: "doc-a".to_string(),
                    seq: 0,
                    text: "The grace period is thirty days.".to_string(),
                    start: 0,
                    end: 32,
                    overlap: 0,
                },
                score: 0.95,
            }],
        }
    }

    fn synthesizer(provider: Arc<MockGenerationProvider>) -> AnswerSynthesizer {
        AnswerSynthesizer::new(provider, gateway(), 0.5, 16_000)
    }

    fn good_reply() -> &'static str {
        r#"{"answer": "Thirty days.", "supporting_details": ["The grace period is thirty days."], "confidence": 0.95, "sources": ["doc-a#0"], "contradictions": []}"#
    }

    #[tokio::test]
    async fn parses_well_formed_reply() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(good_reply());

        let answer = synthesizer(provider.clone())
            .synthesize("What is the grace period?", &retrieval(), &[])
            .await
            .unwrap();

        assert_eq!(answer.primary_response, "Thirty days.");
        assert_eq!(answer.references.len(), 1);
        assert_eq!(answer.references[0].chunk_seq, 0);
        assert!(answer.contradictions.is_empty());
        assert!(!answer.served_from_cache);
        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn low_confidence_answer_is_marked() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(
            r#"{"answer": "Possibly thirty days.", "confidence": 0.3, "sources": [], "contradictions": []}"#,
        );

        let answer = synthesizer(provider)
            .synthesize("What is the grace period?", &retrieval(), &[])
            .await
            .unwrap();

        assert_eq!(answer.primary_response, LOW_CONFIDENCE_MARKER);
        // The original claim survives in the supporting details.
        assert_eq!(answer.supporting_details[0], "Possibly thirty days.");
        assert!((answer.confidence - 0.3).abs() < 1e-6);
    }

    #[tokio::test]
    async fn malformed_reply_gets_one_strict_retry() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text("Sure! The answer is thirty days.");
        provider.queue_text(good_reply());

        let synthesizer = synthesizer(provider.clone());
        let answer = synthesizer
            .synthesize("What is the grace period?", &retrieval(), &[])
            .await
            .unwrap();

        assert_eq!(answer.primary_response, "Thirty days.");
        let prompts = provider.recorded_prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].0.contains("ONLY the JSON object"));
    }

    #[tokio::test]
    async fn second_malformed_reply_is_an_error() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text("not json");
        provider.queue_text("still not json");

        let err = synthesizer(provider.clone())
            .synthesize("query", &retrieval(), &[])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            VeridexError::Synthesis(SynthesisError::Malformed { .. })
        ));
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn empty_retrieval_skips_the_provider() {
        let provider = Arc::new(MockGenerationProvider::new());
        let answer = synthesizer(provider.clone())
            .synthesize("query", &RetrievalResult { hits: vec![] }, &[])
            .await
            .unwrap();

        assert!(answer.primary_response.starts_with(LOW_CONFIDENCE_MARKER));
        assert_eq!(answer.confidence, 0.0);
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn conversation_history_reaches_the_prompt() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(good_reply());

        let history = vec![
            Turn::user("What is covered?"),
            Turn::assistant("Hospitalization and surgery."),
        ];
        synthesizer(provider.clone())
            .synthesize("And the grace period?", &retrieval(), &history)
            .await
            .unwrap();

        let (_, user_prompt) = provider.recorded_prompts().pop().unwrap();
        assert!(user_prompt.contains("user: What is covered?"));
        assert!(user_prompt.contains("assistant: Hospitalization and surgery."));
    }

    fn two_document_retrieval() -> RetrievalResult {
        let mut result = retrieval();
        result.hits.push(ScoredChunk {
            chunk: Chunk {
                document_id: "doc-b".to_string(),
                seq: 1,
                text: "The grace period is sixty days.".to_string(),
                start: 0,
                end: 31,
                overlap: 0,
            },
            score: 0.9,
        });
        result
    }

    #[tokio::test]
    async fn contradiction_claims_resolve_to_source_refs() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(
            r#"{"answer": "Sources disagree.", "confidence": 0.8, "sources": ["doc-a#0"],
                "contradictions": [{"topic": "grace period length",
                  "claims": [{"claim": "thirty days", "source": "doc-a#0"},
                             {"claim": "sixty days", "source": "doc-b#1"},
                             {"claim": "ninety days", "source": "not-retrieved#9"}]}]}"#,
        );

        let answer = synthesizer(provider)
            .synthesize("query", &two_document_retrieval(), &[])
            .await
            .unwrap();

        assert_eq!(answer.contradictions.len(), 1);
        assert_eq!(answer.contradictions[0].topic, "grace period length");
        // The unresolvable third claim is dropped; the rest carry refs.
        let claims = &answer.contradictions[0].claims;
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[0].source.document_id, "doc-a");
        assert_eq!(claims[0].source.chunk_seq, 0);
        assert_eq!(claims[1].source.document_id, "doc-b");
        assert_eq!(claims[1].source.chunk_seq, 1);
    }

    #[tokio::test]
    async fn single_document_answers_carry_no_contradictions() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(
            r#"{"answer": "Thirty days.", "confidence": 0.9, "sources": ["doc-a#0"],
                "contradictions": [{"topic": "invented",
                  "claims": [{"claim": "thirty days", "source": "doc-a#0"}]}]}"#,
        );

        let answer = synthesizer(provider)
            .synthesize("query", &retrieval(), &[])
            .await
            .unwrap();

        assert!(answer.contradictions.is_empty());
    }

    #[tokio::test]
    async fn unknown_source_tags_fall_back_to_retrieved_set() {
        let provider = Arc::new(MockGenerationProvider::new());
        provider.queue_text(
            r#"{"answer": "Thirty days.", "confidence": 0.9, "sources": ["made-up#7"], "contradictions": []}"#,
        );

        let answer = synthesizer(provider)
            .synthesize("query", &retrieval(), &[])
            .await
            .unwrap();

        assert_eq!(answer.references.len(), 1);
        assert_eq!(answer.references[0].document_id, "doc-a");
    }
}
