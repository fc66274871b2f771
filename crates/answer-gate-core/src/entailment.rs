//! Claim-by-claim entailment against admitted context through an external judge.
//!
//! The judge is a text-in/text-out collaborator speaking a three-field reply protocol:
//!
//! ```text
//! LABEL: <ENTAILED | NOT_ENTAILED | UNKNOWN>
//! RATIONALE: <one sentence>
//! SUPPORTING_CHUNKS: <comma-separated chunk_ids or NONE>
//! ```
//!
//! Verification fails closed (anything but an exact `ENTAILED` verdict fails) and fails
//! fast (evaluation stops at the first failing claim).

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::citations::normalize_for_match;
use crate::claims::Claim;
use crate::context::{ContextChunk, ContextPack};

pub const RATIONALE_NO_CONTEXT: &str = "no approved context available";

const CLAIM_HEADER: &str = "\n\nCLAIM:\n";
const CONTEXT_HEADER: &str = "CONTEXT:\n";
const FORMAT_HEADER: &str = "\n\nRESPONSE FORMAT";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum JudgeError {
    #[error("judge transport error: {0}")]
    Transport(String),
    #[error("judge rejected the request: {0}")]
    Rejected(String),
}

/// External entailment judge. Implementations must be safe to share across threads.
pub trait Judge: Send + Sync {
    /// Answer one entailment prompt with a reply in the three-field protocol.
    ///
    /// # Errors
    /// Returns [`JudgeError`] when no reply could be obtained.
    fn judge(&self, prompt: &str) -> Result<String, JudgeError>;
}

type JudgeFn = Box<dyn Fn(&str) -> Result<String, JudgeError> + Send + Sync>;

/// Judge backed by a caller-supplied closure.
pub struct FnJudge {
    judge_fn: JudgeFn,
}

impl FnJudge {
    pub fn new(
        judge_fn: impl Fn(&str) -> Result<String, JudgeError> + Send + Sync + 'static,
    ) -> Self {
        Self { judge_fn: Box::new(judge_fn) }
    }
}

impl Judge for FnJudge {
    fn judge(&self, prompt: &str) -> Result<String, JudgeError> {
        (self.judge_fn)(prompt)
    }
}

/// Replays fixed replies in order, then a fallback reply once the script runs out.
pub struct ScriptedJudge {
    replies: Mutex<VecDeque<String>>,
    fallback: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedJudge {
    #[must_use]
    pub fn new(replies: Vec<String>) -> Self {
        let fallback = format_reply(EntailmentLabel::Unknown, "script exhausted", &[]);
        Self::with_fallback(replies, fallback)
    }

    #[must_use]
    pub fn with_fallback(replies: Vec<String>, fallback: impl Into<String>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: fallback.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Always answer with `label`.
    #[must_use]
    pub fn always(label: EntailmentLabel) -> Self {
        Self::with_fallback(Vec::new(), format_reply(label, "scripted verdict", &[]))
    }

    /// Prompts received so far, oldest first.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

impl Judge for ScriptedJudge {
    fn judge(&self, prompt: &str) -> Result<String, JudgeError> {
        self.prompts.lock().push(prompt.to_string());
        Ok(self.replies.lock().pop_front().unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Offline judge: a claim is entailed iff its normalized text occurs literally in at least
/// one normalized context passage of the prompt.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiteralJudge;

impl Judge for LiteralJudge {
    fn judge(&self, prompt: &str) -> Result<String, JudgeError> {
        let (passages, claim) = parse_prompt(prompt).ok_or_else(|| {
            JudgeError::Rejected("prompt MUST contain CONTEXT and CLAIM sections".to_string())
        })?;
        let normalized_claim = normalize_for_match(&claim);
        let supporting = passages
            .iter()
            .filter(|(_, text)| normalize_for_match(text).contains(&normalized_claim))
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();

        if normalized_claim.is_empty() || supporting.is_empty() {
            return Ok(format_reply(
                EntailmentLabel::NotEntailed,
                "The claim does not appear in the context.",
                &[],
            ));
        }
        Ok(format_reply(
            EntailmentLabel::Entailed,
            "The claim appears verbatim in the context.",
            &supporting,
        ))
    }
}

fn parse_prompt(prompt: &str) -> Option<(Vec<(String, String)>, String)> {
    let format_at = prompt.rfind(FORMAT_HEADER)?;
    let claim_at = prompt[..format_at].rfind(CLAIM_HEADER)?;
    let claim = prompt[claim_at + CLAIM_HEADER.len()..format_at].trim().to_string();
    let context_at = prompt[..claim_at].find(CONTEXT_HEADER)?;
    let block = &prompt[context_at + CONTEXT_HEADER.len()..claim_at];

    let mut passages: Vec<(String, String)> = Vec::new();
    for line in block.lines() {
        let trimmed = line.trim();
        let header = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .filter(|id| !id.is_empty() && !id.contains(['[', ']']));
        if let Some(id) = header {
            passages.push((id.to_string(), String::new()));
            continue;
        }
        if let Some((_, text)) = passages.last_mut() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(line);
        }
    }
    Some((passages, claim))
}

fn format_reply(label: EntailmentLabel, rationale: &str, supporting: &[String]) -> String {
    let supporting = if supporting.is_empty() { "NONE".to_string() } else { supporting.join(", ") };
    format!(
        "LABEL: {}\nRATIONALE: {rationale}\nSUPPORTING_CHUNKS: {supporting}",
        label.verdict()
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntailmentLabel {
    Entailed,
    NotEntailed,
    Unknown,
}

impl EntailmentLabel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entailed => "entailed",
            Self::NotEntailed => "not_entailed",
            Self::Unknown => "unknown",
        }
    }

    /// Verdict token used on the judge wire protocol.
    #[must_use]
    pub fn verdict(self) -> &'static str {
        match self {
            Self::Entailed => "ENTAILED",
            Self::NotEntailed => "NOT_ENTAILED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Exact verdict match; anything else is `Unknown`.
    #[must_use]
    pub fn from_verdict(raw: &str) -> Self {
        match raw.trim() {
            "ENTAILED" => Self::Entailed,
            "NOT_ENTAILED" => Self::NotEntailed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntailmentResult {
    pub claim_text: String,
    pub label: EntailmentLabel,
    pub rationale: String,
    pub supporting_chunk_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationReport {
    pub passed: bool,
    pub claims: Vec<Claim>,
    pub claim_results: Vec<EntailmentResult>,
    pub failure_reason: Option<String>,
}

impl VerificationReport {
    /// Label of the failing result when verification did not pass.
    #[must_use]
    pub fn failing_label(&self) -> Option<EntailmentLabel> {
        if self.passed {
            return None;
        }
        self.claim_results.last().map(|result| result.label)
    }

    #[must_use]
    pub fn entailed_count(&self) -> usize {
        self.claim_results
            .iter()
            .filter(|result| result.label == EntailmentLabel::Entailed)
            .count()
    }
}

#[must_use]
pub fn build_entailment_prompt(claim_text: &str, chunks: &[ContextChunk]) -> String {
    let context_block = chunks
        .iter()
        .map(|chunk| format!("[{}]\n{}", chunk.chunk_id(), chunk.text()))
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "You are a strict factual verifier.

TASK:
Determine whether the CLAIM is fully supported by the CONTEXT.

RULES:
- Use ONLY the information in the context
- Do NOT use prior knowledge
- If the context does not clearly support the claim, answer NOT_ENTAILED
- Do NOT explain beyond the required format

CONTEXT:
{context_block}

CLAIM:
{claim_text}

RESPONSE FORMAT (must be exact):
LABEL: <ENTAILED | NOT_ENTAILED | UNKNOWN>
RATIONALE: <one sentence>
SUPPORTING_CHUNKS: <comma-separated chunk_ids or NONE>"
    )
}

/// Parse a judge reply. Lines are `KEY: value` with case-insensitive keys; a later
/// duplicate key wins. A verdict other than the three exact tokens becomes `Unknown`.
#[must_use]
pub fn parse_entailment_response(claim_text: &str, response: &str) -> EntailmentResult {
    let fields = response
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(key, value)| (key.trim().to_uppercase(), value.trim().to_string()))
        .collect::<BTreeMap<_, _>>();

    let label = EntailmentLabel::from_verdict(fields.get("LABEL").map_or("", String::as_str));
    let rationale = fields.get("RATIONALE").cloned().unwrap_or_default();
    let supporting_chunk_ids = match fields.get("SUPPORTING_CHUNKS") {
        Some(raw) if !raw.is_empty() && !raw.eq_ignore_ascii_case("NONE") => raw
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    EntailmentResult {
        claim_text: claim_text.to_string(),
        label,
        rationale,
        supporting_chunk_ids,
    }
}

/// Judge one claim. Empty context is `NotEntailed` without calling the judge; a judge
/// failure is `Unknown`.
pub fn check_entailment(
    claim_text: &str,
    chunks: &[ContextChunk],
    judge: &dyn Judge,
) -> EntailmentResult {
    if chunks.is_empty() {
        return EntailmentResult {
            claim_text: claim_text.to_string(),
            label: EntailmentLabel::NotEntailed,
            rationale: RATIONALE_NO_CONTEXT.to_string(),
            supporting_chunk_ids: Vec::new(),
        };
    }

    let prompt = build_entailment_prompt(claim_text, chunks);
    match judge.judge(&prompt) {
        Ok(reply) => parse_entailment_response(claim_text, &reply),
        Err(err) => {
            tracing::warn!(error = %err, "entailment judge call failed");
            EntailmentResult {
                claim_text: claim_text.to_string(),
                label: EntailmentLabel::Unknown,
                rationale: format!("judge call failed: {err}"),
                supporting_chunk_ids: Vec::new(),
            }
        }
    }
}

/// Verify claims in order against every approved passage, stopping at the first claim
/// that is not entailed.
pub fn verify_claims(
    claims: &[Claim],
    pack: &ContextPack,
    judge: &dyn Judge,
) -> VerificationReport {
    let mut claim_results = Vec::with_capacity(claims.len());
    for claim in claims {
        let result = check_entailment(&claim.text, &pack.approved_chunks, judge);
        let label = result.label;
        claim_results.push(result);
        if label == EntailmentLabel::Entailed {
            continue;
        }

        let failure_reason = if pack.approved_chunks.is_empty() {
            format!("No approved context for claim: '{}'", claim.text)
        } else {
            format!("Claim not entailed: '{}' (label={})", claim.text, label.verdict())
        };
        tracing::debug!(claim_id = claim.claim_id, label = label.as_str(), "verification failed");
        return VerificationReport {
            passed: false,
            claims: claims.to_vec(),
            claim_results,
            failure_reason: Some(failure_reason),
        };
    }

    VerificationReport {
        passed: true,
        claims: claims.to_vec(),
        claim_results,
        failure_reason: None,
    }
}
