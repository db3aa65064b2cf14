//! Prompt construction and model-output parsing.
//!
//! The synthesizer talks to the model in a fixed JSON protocol: the system
//! prompt pins the output schema and a confidence rubric, the user prompt
//! carries the query and the retrieved context tagged by source, and
//! [`extract_json`] digs the JSON object back out of whatever the model
//! wrapped it in.

use serde::Deserialize;
use std::fmt;

use crate::types::{ScoredChunk, Turn};

/// System prompt for grounded answering. Output schema and confidence
/// rubric are spelled out so parsing stays mechanical.
pub const SYSTEM_PROMPT: &str = r#"You are a grounded question-answering assistant. Answer using ONLY the provided context sources. Never use outside knowledge.

Respond with a single JSON object, no prose before or after:
{
  "answer": "direct answer to the question",
  "supporting_details": ["verbatim or near-verbatim evidence from the sources"],
  "confidence": 0.0,
  "sources": ["source tags you relied on, e.g. doc-1#3"],
  "contradictions": [
    {"topic": "what the sources disagree about",
     "claims": [{"claim": "...", "source": "doc-1#3"}]}
  ]
}

Confidence rubric:
- 0.9-1.0: the context states the answer explicitly.
- 0.7-0.89: the answer follows from the context with minor inference.
- 0.5-0.69: partially supported; material gaps remain.
- 0.3-0.49: only tangentially related context was found.
- 0.0-0.29: the context does not contain the answer.

If sources from different documents disagree on a point relevant to the question, you MUST list every side in "contradictions" with its source tag. If there is no disagreement, use an empty list. Never silently pick one side."#;

/// Appended to the system prompt on the single malformed-output retry.
pub const STRICT_FORMAT_INSTRUCTION: &str = "\n\nIMPORTANT: your previous reply was not valid JSON. Reply with ONLY the JSON object described above. No markdown fences, no commentary, no text outside the braces.";

/// Coarse shape of a query, used to steer the answer instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// "what is", "define", "meaning of"
    Definition,
    /// "how do", "steps", "process"
    Procedural,
    /// "how many", "how much", amounts and limits
    Quantitative,
    /// "when", "how long", durations and deadlines
    Temporal,
    Comparative,
    General,
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryKind::Definition => "definition",
            QueryKind::Procedural => "procedural",
            QueryKind::Quantitative => "quantitative",
            QueryKind::Temporal => "temporal",
            QueryKind::Comparative => "comparative",
            QueryKind::General => "general",
        };
        f.write_str(name)
    }
}

impl QueryKind {
    pub fn classify(query: &str) -> Self {
        let lower = query.to_lowercase();
        let has = |needle: &str| lower.contains(needle);

        if has("compare") || has("difference between") || has(" versus ") || has(" vs ") {
            QueryKind::Comparative
        } else if has("how many") || has("how much") || has("maximum") || has("minimum") || has("limit") {
            QueryKind::Quantitative
        } else if has("when ") || has("how long") || has("deadline") || has("duration") || has("until") {
            QueryKind::Temporal
        } else if has("how do") || has("how to") || has("how can") || has("steps") || has("process for") {
            QueryKind::Procedural
        } else if has("what is") || has("what are") || has("define") || has("meaning of") {
            QueryKind::Definition
        } else {
            QueryKind::General
        }
    }

    /// Extra guidance injected into the user prompt per query shape.
    fn instruction(self) -> &'static str {
        match self {
            QueryKind::Definition => "Give the definition exactly as the sources state it.",
            QueryKind::Procedural => "Lay out the steps in order, citing the source for each.",
            QueryKind::Quantitative => {
                "State the exact figures, units, and any conditions attached to them."
            }
            QueryKind::Temporal => {
                "State the exact time periods or deadlines and what triggers them."
            }
            QueryKind::Comparative => {
                "Address each side of the comparison separately before concluding."
            }
            QueryKind::General => "Answer directly and concisely.",
        }
    }
}

/// Render a source tag the model can echo back in "sources".
pub fn source_tag(document_id: &str, seq: usize) -> String {
    format!("{document_id}#{seq}")
}

/// Build the user prompt: prior turns (if any), tagged context blocks,
/// then the question.
///
/// Hits are emitted in ranked order and the context section is cut off at
/// `max_context_chars`; a hit that would cross the limit is dropped rather
/// than truncated mid-chunk. History is caller-owned state, passed through
/// verbatim and never retained.
pub fn build_user_prompt(
    query: &str,
    history: &[Turn],
    hits: &[ScoredChunk],
    max_context_chars: usize,
) -> String {
    let kind = QueryKind::classify(query);
    let mut prompt = String::new();

    if !history.is_empty() {
        prompt.push_str("Conversation so far:\n");
        for turn in history {
            prompt.push_str(&format!("{}: {}\n", turn.role, turn.text));
        }
        prompt.push('\n');
    }

    let mut context = String::new();
    for hit in hits {
        let block = format!(
            "[source: {}]\n{}\n\n",
            source_tag(&hit.chunk.document_id, hit.chunk.seq),
            hit.chunk.text
        );
        if context.len() + block.len() > max_context_chars && !context.is_empty() {
            break;
        }
        context.push_str(&block);
    }

    prompt.push_str(&format!(
        "Context sources:\n\n{context}Question ({kind}): {query}\n\n{}",
        kind.instruction()
    ));
    prompt
}

/// Wire shape of the model's JSON reply.
#[derive(Debug, Deserialize)]
pub struct RawAnswer {
    pub answer: String,
    #[serde(default)]
    pub supporting_details: Vec<String>,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<RawContradiction>,
}

#[derive(Debug, Deserialize)]
pub struct RawContradiction {
    pub topic: String,
    #[serde(default)]
    pub claims: Vec<RawClaim>,
}

#[derive(Debug, Deserialize)]
pub struct RawClaim {
    pub claim: String,
    #[serde(default)]
    pub source: String,
}

/// Pull the first JSON object out of a model reply.
///
/// Tries a fenced ```json block first, then falls back to scanning for a
/// brace-balanced object anywhere in the text. String literals are skipped
/// so braces inside answer text do not confuse the balance count.
pub fn extract_json(text: &str) -> Option<&str> {
    if let Some(fenced) = extract_fenced(text) {
        if balanced_object(fenced).is_some() {
            return balanced_object(fenced);
        }
    }
    balanced_object(text)
}

fn extract_fenced(text: &str) -> Option<&str> {
    let start = text.find("```json").map(|i| i + "```json".len()).or_else(|| {
        text.find("```").map(|i| i + "```".len())
    })?;
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim())
}

fn balanced_object(text: &str) -> Option<&str> {
    let open = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(open) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[open..=i]);
                }
            }
            _ => {}
        }
    }
    None
}
