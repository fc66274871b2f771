//! Answer verification and disclosure gate.
//!
//! Stages run in a fixed order for each query: context admission, (external) generation,
//! entailment verification, citation alignment, presentation, and trace recording. Each
//! stage reports its outcome as data; only malformed caller input is an error.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub mod audit;
pub mod citations;
pub mod claims;
pub mod config;
pub mod context;
pub mod entailment;
pub mod generation;
pub mod pipeline;
pub mod presentation;
pub mod trace;

pub use audit::{AuditSink, InMemoryAuditSink, JsonLinesAuditSink};
pub use citations::{
    align_claims_to_citations, build_claim_citation_report, extract_citation_ids,
    normalize_for_match, parse_citations, resolve_citations, AlignmentPolicy, AlignmentStatus,
    CitationEntry, CitationMap, CitationResolution, ClaimCitationReport, ClaimCitationResult,
    ExtraneousCitationPolicy,
};
pub use claims::{
    citation_map_from_segments, claims_from_segments, extract_claims, segment_answer,
    AnswerSentence, Claim, HEDGE_PREFIXES,
};
pub use config::{GateConfig, JudgeConfig};
pub use context::{
    build_context_pack, enforce_context_budget, expand_with_neighbors, is_boilerplate,
    looks_like_header, order_chunks, render_context, select_chunks, BudgetStats,
    CandidatePassage, ChunkMetadata, ContextChunk, ContextPack, ContextPolicy, ContextStats,
    BOILERPLATE_MARKERS,
};
pub use entailment::{
    build_entailment_prompt, check_entailment, parse_entailment_response, verify_claims,
    EntailmentLabel, EntailmentResult, FnJudge, Judge, JudgeError, LiteralJudge, ScriptedJudge,
    VerificationReport,
};
pub use generation::{
    generate_answer, render_generation_prompt, validate_citations, Completion, GeneratedAnswer,
    GenerationPolicy, Generator, PregeneratedAnswer, TokenUsage,
    REFUSAL_MISSING_OR_INVALID_CITATIONS, REFUSAL_TEXT,
};
pub use pipeline::{AnswerGate, FinalAnswerResponse, GateOutcome, GateRequest};
pub use presentation::{
    decide_presentation, PresentationDecision, PresentationMode, PresentationPolicy,
    SuppressionCode,
};
pub use trace::{
    build_decision_trace, log_trace_summary, trace_summary_line, DecisionTrace,
    FailureAttribution, FailureCode, LayerSignal, PipelineLayer, PipelineStats, TraceInput,
    TraceTimestamps,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GateError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("judge error: {0}")]
    Judge(String),
    #[error("audit error: {0}")]
    Audit(String),
}

/// Identity of one gated query; also the primary key of its audit trace.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct QueryId(pub Ulid);

impl QueryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a query id from its canonical ULID text.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when `raw` is not a valid ULID.
    pub fn parse(raw: &str) -> Result<Self, GateError> {
        Ulid::from_string(raw.trim())
            .map(Self)
            .map_err(|err| GateError::Validation(format!("query_id MUST be a ULID: {err}")))
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
