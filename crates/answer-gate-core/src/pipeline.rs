//! End-to-end orchestration of one gated query.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::audit::AuditSink;
use crate::citations::{
    align_claims_to_citations, build_claim_citation_report, ClaimCitationReport,
};
use crate::claims::{citation_map_from_segments, claims_from_segments};
use crate::config::GateConfig;
use crate::context::{build_context_pack, CandidatePassage, ContextPack};
use crate::entailment::{verify_claims, Judge, VerificationReport};
use crate::generation::{generate_answer, GeneratedAnswer, Generator};
use crate::presentation::{decide_presentation, PresentationDecision, PresentationMode};
use crate::trace::{
    build_decision_trace, log_trace_summary, DecisionTrace, PipelineStats, TraceInput,
    TraceTimestamps,
};
use crate::{GateError, QueryId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRequest {
    #[serde(default)]
    pub query_id: QueryId,
    pub query: String,
    #[serde(default)]
    pub candidates: Vec<CandidatePassage>,
    /// Fixed clock for replays; both trace timestamps take this value when set.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

/// What the end user may see. Answer text and citations are withheld unless allowed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FinalAnswerResponse {
    pub allowed: bool,
    pub mode: PresentationMode,
    pub answer_text: Option<String>,
    pub citations: Option<Vec<String>>,
    pub refusal_reason: Option<String>,
    pub presentation_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateOutcome {
    pub response: FinalAnswerResponse,
    pub trace: DecisionTrace,
    pub context: ContextPack,
    pub answer: GeneratedAnswer,
    pub verification: Option<VerificationReport>,
    pub alignment: Option<ClaimCitationReport>,
    pub presentation: Option<PresentationDecision>,
}

pub struct AnswerGate {
    config: GateConfig,
    judge: Box<dyn Judge>,
}

impl AnswerGate {
    /// # Errors
    /// Returns [`GateError::Validation`] when `config` is inconsistent.
    pub fn new(config: GateConfig, judge: Box<dyn Judge>) -> Result<Self, GateError> {
        config.validate()?;
        Ok(Self { config, judge })
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Admit context, gate the generated answer, record the trace into `sink`.
    ///
    /// A sink failure is logged and does not change the outcome.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when the request is malformed.
    pub fn run(
        &self,
        request: GateRequest,
        generator: &dyn Generator,
        sink: &dyn AuditSink,
    ) -> Result<GateOutcome, GateError> {
        if request.query.trim().is_empty() {
            return Err(GateError::Validation("query MUST be non-empty".to_string()));
        }
        let started_at = request.as_of.unwrap_or_else(OffsetDateTime::now_utc);
        let pack = build_context_pack(&request.query, request.candidates, &self.config.context)?;
        let outcome = self.evaluate(request.query_id, pack, generator, started_at, request.as_of);

        if let Err(err) = sink.record(&outcome.trace) {
            tracing::warn!(
                query_id = %outcome.trace.query_id,
                error = %err,
                "failed to record decision trace"
            );
        }
        log_trace_summary(&outcome.trace);
        Ok(outcome)
    }

    /// Gate an answer against an already admitted context pack. Pure apart from the judge
    /// and generator calls.
    pub fn evaluate(
        &self,
        query_id: QueryId,
        pack: ContextPack,
        generator: &dyn Generator,
        started_at: OffsetDateTime,
        finished_at: Option<OffsetDateTime>,
    ) -> GateOutcome {
        let answer = generate_answer(&pack, generator, &self.config.generation);
        let mut stats = PipelineStats::from_context(&pack.stats);
        if let Some(usage) = &answer.usage {
            stats.record_usage(usage);
        }

        if answer.is_refused() {
            let timestamps = TraceTimestamps {
                started_at,
                finished_at: finished_at.unwrap_or_else(OffsetDateTime::now_utc),
            };
            let trace = build_decision_trace(&TraceInput {
                refusal_reason: answer.refusal_reason.as_deref(),
                stats,
                attribution: self.config.attribution,
                alignment_policy: self.config.alignment,
                ..TraceInput::for_context(query_id, &pack, timestamps)
            });
            let response = FinalAnswerResponse {
                allowed: false,
                mode: PresentationMode::Suppressed,
                answer_text: None,
                citations: None,
                refusal_reason: answer.refusal_reason.clone(),
                presentation_reason: None,
            };
            return GateOutcome {
                response,
                trace,
                context: pack,
                answer,
                verification: None,
                alignment: None,
                presentation: None,
            };
        }

        let claims = claims_from_segments(&answer.sentences);
        let citation_map = citation_map_from_segments(&answer.sentences);
        let verification = verify_claims(&claims, &pack, self.judge.as_ref());
        let alignment = build_claim_citation_report(
            align_claims_to_citations(&claims, &citation_map, &pack),
            &self.config.alignment,
        );
        let decision = decide_presentation(
            &self.config.presentation,
            &verification.claim_results,
            &alignment.results,
        );
        stats.record_verification(&verification);
        stats.record_alignment(&alignment);

        let timestamps = TraceTimestamps {
            started_at,
            finished_at: finished_at.unwrap_or_else(OffsetDateTime::now_utc),
        };
        let trace = build_decision_trace(&TraceInput {
            verification: Some(&verification),
            alignment: Some(&alignment),
            presentation: Some(&decision),
            stats,
            attribution: self.config.attribution,
            alignment_policy: self.config.alignment,
            ..TraceInput::for_context(query_id, &pack, timestamps)
        });

        let response = if decision.allowed {
            FinalAnswerResponse {
                allowed: true,
                mode: decision.mode,
                answer_text: Some(answer.text.clone()),
                citations: Some(answer.citations.clone()),
                refusal_reason: None,
                presentation_reason: decision.reason.clone(),
            }
        } else {
            FinalAnswerResponse {
                allowed: false,
                mode: decision.mode,
                answer_text: None,
                citations: None,
                refusal_reason: None,
                presentation_reason: decision.reason.clone(),
            }
        };

        GateOutcome {
            response,
            trace,
            context: pack,
            answer,
            verification: Some(verification),
            alignment: Some(alignment),
            presentation: Some(decision),
        }
    }
}
