//! Boundary to the external answer generator.
//!
//! Producing answer text is not this crate's job; the [`Generator`] trait is the seam. What
//! is enforced here is the refusal contract: no valid context means no answer, and an
//! answer whose citations are missing or point outside the admitted passages is replaced
//! by [`REFUSAL_TEXT`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::citations::extract_citation_ids;
use crate::claims::{segment_answer, AnswerSentence};
use crate::context::{ContextPack, INVALID_EMPTY_CONTEXT};
use crate::GateError;

pub const REFUSAL_TEXT: &str = "I don't have enough information to answer.";
pub const REFUSAL_MISSING_OR_INVALID_CITATIONS: &str = "missing_or_invalid_citations";
pub const REFUSAL_GENERATION_FAILED: &str = "generation_failed";

const MODEL_REFUSAL_MARKER: &str = "don't have enough information";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationPolicy {
    pub max_answer_tokens: u32,
    pub temperature: f32,
    pub refuse_if_no_context: bool,
    pub require_citations: bool,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            max_answer_tokens: 300,
            temperature: 0.2,
            refuse_if_no_context: true,
            require_citations: true,
        }
    }
}

impl GenerationPolicy {
    /// # Errors
    /// Returns [`GateError::Validation`] for a zero token limit or a temperature outside
    /// `0.0..=2.0`.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_answer_tokens == 0 {
            return Err(GateError::Validation("max_answer_tokens MUST be > 0".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(GateError::Validation(
                "temperature MUST be within 0.0..=2.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
}

/// Raw generator output before any refusal checks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Completion {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

pub trait Generator: Send + Sync {
    /// # Errors
    /// Returns [`GateError`] when the generator could not produce any text.
    fn generate(&self, prompt: &str, policy: &GenerationPolicy) -> Result<Completion, GateError>;
}

/// Generator that returns an answer produced elsewhere, ignoring the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PregeneratedAnswer {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

impl PregeneratedAnswer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), usage: None }
    }
}

impl Generator for PregeneratedAnswer {
    fn generate(&self, _prompt: &str, _policy: &GenerationPolicy) -> Result<Completion, GateError> {
        Ok(Completion { text: self.text.clone(), usage: self.usage })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    /// Distinct cited passage ids in first-seen order.
    pub citations: Vec<String>,
    pub sentences: Vec<AnswerSentence>,
    pub refusal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl GeneratedAnswer {
    #[must_use]
    pub fn refused(reason: impl Into<String>) -> Self {
        Self {
            text: REFUSAL_TEXT.to_string(),
            citations: Vec::new(),
            sentences: Vec::new(),
            refusal_reason: Some(reason.into()),
            usage: None,
        }
    }

    #[must_use]
    pub fn is_refused(&self) -> bool {
        self.refusal_reason.is_some()
    }
}

/// True iff the text cites at least one id and every cited id is admitted.
#[must_use]
pub fn validate_citations(answer_text: &str, admitted_ids: &BTreeSet<&str>) -> bool {
    let cited = extract_citation_ids(answer_text);
    !cited.is_empty() && cited.iter().all(|id| admitted_ids.contains(id.as_str()))
}

/// Prompt handed to the generator: rules, allowed source ids, admitted passages, question.
#[must_use]
pub fn render_generation_prompt(pack: &ContextPack) -> String {
    let sources_block = pack
        .approved_chunks
        .iter()
        .map(|chunk| format!("- {}", chunk.chunk_id()))
        .collect::<Vec<_>>()
        .join("\n");
    let context_block = pack
        .approved_chunks
        .iter()
        .map(|chunk| format!("[{}]\n{}", chunk.chunk_id(), chunk.text().trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are a question-answering system.

You must follow ALL rules below:
- Use ONLY the provided context.
- Every factual statement MUST include at least one citation.
- Citations must be copied EXACTLY from the allowed sources list.
- Use citation format: [source_id]
- If the answer is not present in the context, say:
  \"{REFUSAL_TEXT}\"

Allowed sources:
---------------
{sources_block}
---------------

Context:
---------
{context_block}
---------

Question:
{query}

Answer:
",
        query = pack.query
    )
}

fn distinct_ids(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    extract_citation_ids(text)
        .into_iter()
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Ask `generator` for an answer and apply the refusal contract.
pub fn generate_answer(
    pack: &ContextPack,
    generator: &dyn Generator,
    policy: &GenerationPolicy,
) -> GeneratedAnswer {
    if policy.refuse_if_no_context && (!pack.is_valid || pack.approved_chunks.is_empty()) {
        let reason = pack.invalid_reason.as_deref().unwrap_or(INVALID_EMPTY_CONTEXT);
        tracing::debug!(reason, "generation refused before calling the generator");
        return GeneratedAnswer::refused(reason);
    }

    let prompt = render_generation_prompt(pack);
    let completion = match generator.generate(&prompt, policy) {
        Ok(completion) => completion,
        Err(err) => {
            tracing::warn!(error = %err, "answer generation failed");
            return GeneratedAnswer::refused(REFUSAL_GENERATION_FAILED);
        }
    };
    let text = completion.text.trim().to_string();

    if text.to_lowercase().contains(MODEL_REFUSAL_MARKER) {
        return GeneratedAnswer {
            sentences: segment_answer(&text),
            text,
            citations: Vec::new(),
            refusal_reason: None,
            usage: completion.usage,
        };
    }

    if policy.require_citations && !validate_citations(&text, &pack.approved_ids()) {
        tracing::debug!("generated answer has missing or unadmitted citations");
        let mut refused = GeneratedAnswer::refused(REFUSAL_MISSING_OR_INVALID_CITATIONS);
        refused.usage = completion.usage;
        return refused;
    }

    GeneratedAnswer {
        citations: distinct_ids(&text),
        sentences: segment_answer(&text),
        text,
        refusal_reason: None,
        usage: completion.usage,
    }
}
