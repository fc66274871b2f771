//! Per-query decision trace.
//!
//! The builder only records outcomes that were already computed; it makes no decisions
//! and cannot change any. Signals are appended in pipeline order and a stage that did not
//! run contributes no signal at all.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::citations::{AlignmentPolicy, AlignmentStatus, ClaimCitationReport};
use crate::context::{ContextPack, ContextStats, INVALID_INSUFFICIENT_CONTEXT};
use crate::entailment::{EntailmentLabel, VerificationReport};
use crate::generation::TokenUsage;
use crate::presentation::{PresentationDecision, PresentationMode};
use crate::{GateError, QueryId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineLayer {
    Context,
    Generation,
    Entailment,
    CitationAlignment,
    Presentation,
}

impl PipelineLayer {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "context",
            Self::Generation => "generation",
            Self::Entailment => "entailment",
            Self::CitationAlignment => "citation_alignment",
            Self::Presentation => "presentation",
        }
    }

    /// # Errors
    /// Returns [`GateError::Validation`] when `raw` is not a known layer.
    pub fn parse(raw: &str) -> Result<Self, GateError> {
        match raw.trim() {
            "context" => Ok(Self::Context),
            "generation" => Ok(Self::Generation),
            "entailment" => Ok(Self::Entailment),
            "citation_alignment" => Ok(Self::CitationAlignment),
            "presentation" => Ok(Self::Presentation),
            other => Err(GateError::Validation(format!("unknown pipeline layer: {other}"))),
        }
    }
}

impl Display for PipelineLayer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    EmptyContext,
    InsufficientContext,
    MissingCitation,
    InvalidCitation,
    NotEntailed,
    UnknownEntailment,
    MisalignedCitation,
    ExtraneousCitation,
    SuppressedByPolicy,
}

impl FailureCode {
    pub const ALL: [Self; 9] = [
        Self::EmptyContext,
        Self::InsufficientContext,
        Self::MissingCitation,
        Self::InvalidCitation,
        Self::NotEntailed,
        Self::UnknownEntailment,
        Self::MisalignedCitation,
        Self::ExtraneousCitation,
        Self::SuppressedByPolicy,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmptyContext => "empty_context",
            Self::InsufficientContext => "insufficient_context",
            Self::MissingCitation => "missing_citation",
            Self::InvalidCitation => "invalid_citation",
            Self::NotEntailed => "not_entailed",
            Self::UnknownEntailment => "unknown_entailment",
            Self::MisalignedCitation => "misaligned_citation",
            Self::ExtraneousCitation => "extraneous_citation",
            Self::SuppressedByPolicy => "suppressed_by_policy",
        }
    }

    /// # Errors
    /// Returns [`GateError::Validation`] when `raw` is not a known failure code.
    pub fn parse(raw: &str) -> Result<Self, GateError> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == raw.trim())
            .ok_or_else(|| GateError::Validation(format!("unknown failure code: {raw}")))
    }

    /// The only layer allowed to report this code.
    #[must_use]
    pub fn layer(self) -> PipelineLayer {
        match self {
            Self::EmptyContext | Self::InsufficientContext => PipelineLayer::Context,
            Self::MissingCitation | Self::InvalidCitation => PipelineLayer::Generation,
            Self::NotEntailed | Self::UnknownEntailment => PipelineLayer::Entailment,
            Self::MisalignedCitation | Self::ExtraneousCitation => PipelineLayer::CitationAlignment,
            Self::SuppressedByPolicy => PipelineLayer::Presentation,
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::EmptyContext => "No admissible context was available after judgment.",
            Self::InsufficientContext => "Context was present but insufficient to answer safely.",
            Self::MissingCitation => "Answer did not contain required citations.",
            Self::InvalidCitation => "Answer referenced sources not present in context.",
            Self::NotEntailed => "At least one factual claim was not supported by context.",
            Self::UnknownEntailment => "Entailment could not be determined with confidence.",
            Self::MisalignedCitation => "Claim meaning did not align with cited source.",
            Self::ExtraneousCitation => "Citation present but not supporting any claim.",
            Self::SuppressedByPolicy => "Answer was suppressed by presentation policy.",
        }
    }
}

impl Display for FailureCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which failing layer fills the trace's single failure slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureAttribution {
    /// Every failing layer overwrites the slot; the last one to run wins.
    #[default]
    LastFailing,
    /// The earliest failing layer keeps the slot.
    FirstFailing,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LayerSignal {
    pub layer: PipelineLayer,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl LayerSignal {
    fn pass(layer: PipelineLayer) -> Self {
        Self { layer, passed: true, failure_code: None, reason: None }
    }

    fn fail(layer: PipelineLayer, code: FailureCode, reason: Option<String>) -> Self {
        Self { layer, passed: false, failure_code: Some(code), reason }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PipelineStats {
    pub retrieved_chunks: Option<usize>,
    pub approved_chunks: Option<usize>,
    pub dropped_chunks: Option<usize>,
    pub total_context_chars: Option<usize>,
    pub claim_count: Option<usize>,
    pub entailed_claims: Option<usize>,
    pub aligned_citations: Option<usize>,
    pub misaligned_citations: Option<usize>,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub cost_usd: Option<f64>,
}

impl PipelineStats {
    #[must_use]
    pub fn from_context(stats: &ContextStats) -> Self {
        Self {
            retrieved_chunks: Some(stats.retrieved_count),
            approved_chunks: Some(stats.approved_count),
            dropped_chunks: Some(stats.dropped_count),
            total_context_chars: Some(stats.total_chars),
            ..Self::default()
        }
    }

    pub fn record_verification(&mut self, report: &VerificationReport) {
        self.claim_count = Some(report.claims.len());
        self.entailed_claims = Some(report.entailed_count());
    }

    /// Aligned counts every claim with at least one supporting citation.
    pub fn record_alignment(&mut self, report: &ClaimCitationReport) {
        let aligned = report
            .results
            .iter()
            .filter(|result| {
                matches!(
                    result.status,
                    AlignmentStatus::Aligned | AlignmentStatus::ExtraneousCitation
                )
            })
            .count();
        self.aligned_citations = Some(aligned);
        self.misaligned_citations = Some(report.results.len() - aligned);
    }

    pub fn record_usage(&mut self, usage: &TokenUsage) {
        self.prompt_tokens = Some(usage.prompt_tokens);
        self.completion_tokens = Some(usage.completion_tokens);
        self.total_tokens = Some(usage.total_tokens);
        self.cost_usd = usage.cost_usd;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceTimestamps {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
}

impl TraceTimestamps {
    #[must_use]
    pub fn at(instant: OffsetDateTime) -> Self {
        Self { started_at: instant, finished_at: instant }
    }
}

/// Outcomes of one query, as already decided by each stage.
#[derive(Debug, Clone)]
pub struct TraceInput<'a> {
    pub query_id: QueryId,
    pub query_text: &'a str,
    pub context_valid: bool,
    pub context_failure_reason: Option<&'a str>,
    pub refusal_reason: Option<&'a str>,
    pub verification: Option<&'a VerificationReport>,
    pub alignment: Option<&'a ClaimCitationReport>,
    pub alignment_policy: AlignmentPolicy,
    pub presentation: Option<&'a PresentationDecision>,
    pub stats: PipelineStats,
    pub timestamps: TraceTimestamps,
    pub attribution: FailureAttribution,
}

impl<'a> TraceInput<'a> {
    /// Input with only the context outcome filled in; later stages default to "did not run".
    #[must_use]
    pub fn for_context(
        query_id: QueryId,
        pack: &'a ContextPack,
        timestamps: TraceTimestamps,
    ) -> Self {
        Self {
            query_id,
            query_text: &pack.query,
            context_valid: pack.is_valid,
            context_failure_reason: pack.invalid_reason.as_deref(),
            refusal_reason: None,
            verification: None,
            alignment: None,
            alignment_policy: AlignmentPolicy::default(),
            presentation: None,
            stats: PipelineStats::from_context(&pack.stats),
            timestamps,
            attribution: FailureAttribution::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTrace {
    pub query_id: QueryId,
    pub query_text: String,
    pub layer_signals: Vec<LayerSignal>,
    pub allowed: bool,
    pub presentation_mode: Option<PresentationMode>,
    pub failure_layer: Option<PipelineLayer>,
    pub failure_code: Option<FailureCode>,
    pub refusal_reason: Option<String>,
    pub presentation_reason: Option<String>,
    pub stats: PipelineStats,
    pub timestamps: TraceTimestamps,
}

impl DecisionTrace {
    /// Check the structural invariants every recorded trace must hold.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] naming the first violated invariant.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.layer_signals.first().map(|signal| signal.layer) != Some(PipelineLayer::Context) {
            return Err(GateError::Validation("first signal MUST be the context layer".to_string()));
        }
        for pair in self.layer_signals.windows(2) {
            if pair[0].layer >= pair[1].layer {
                return Err(GateError::Validation(format!(
                    "signals MUST be in pipeline order ({} before {})",
                    pair[0].layer, pair[1].layer
                )));
            }
        }
        for signal in &self.layer_signals {
            match (signal.passed, signal.failure_code) {
                (true, Some(code)) => {
                    return Err(GateError::Validation(format!(
                        "passing {} signal MUST NOT carry failure code {code}",
                        signal.layer
                    )));
                }
                (false, None) => {
                    return Err(GateError::Validation(format!(
                        "failing {} signal MUST carry a failure code",
                        signal.layer
                    )));
                }
                (false, Some(code)) if code.layer() != signal.layer => {
                    return Err(GateError::Validation(format!(
                        "failure code {code} MUST NOT be reported by the {} layer",
                        signal.layer
                    )));
                }
                _ => {}
            }
        }

        let failing = self
            .layer_signals
            .iter()
            .filter_map(|signal| signal.failure_code.map(|code| (signal.layer, code)))
            .collect::<Vec<_>>();
        match (self.failure_layer, self.failure_code) {
            (Some(layer), Some(code)) => {
                if !failing.contains(&(layer, code)) {
                    return Err(GateError::Validation(
                        "failure slot MUST name a failing signal".to_string(),
                    ));
                }
            }
            (None, None) => {
                if !failing.is_empty() {
                    return Err(GateError::Validation(
                        "failure slot MUST be set when a signal failed".to_string(),
                    ));
                }
            }
            _ => {
                return Err(GateError::Validation(
                    "failure_layer and failure_code MUST be set together".to_string(),
                ));
            }
        }

        if self.refusal_reason.is_some() {
            let last_layer = self.layer_signals.last().map(|signal| signal.layer);
            if last_layer != Some(PipelineLayer::Generation) {
                return Err(GateError::Validation(
                    "a refused trace MUST end at the generation layer".to_string(),
                ));
            }
            if self.allowed {
                return Err(GateError::Validation(
                    "a refused trace MUST NOT be allowed".to_string(),
                ));
            }
        }
        if self.allowed != self.presentation_mode.is_some_and(PresentationMode::is_shown) {
            return Err(GateError::Validation(
                "allowed MUST match the presentation mode".to_string(),
            ));
        }
        Ok(())
    }

    /// The failing signal a reader should look at first.
    #[must_use]
    pub fn first_failure(&self) -> Option<&LayerSignal> {
        self.layer_signals.iter().find(|signal| !signal.passed)
    }
}

fn context_failure_code(reason: Option<&str>) -> FailureCode {
    if reason == Some(INVALID_INSUFFICIENT_CONTEXT) {
        FailureCode::InsufficientContext
    } else {
        FailureCode::EmptyContext
    }
}

fn alignment_failure_code(report: &ClaimCitationReport, policy: &AlignmentPolicy) -> FailureCode {
    if report.worst_status(policy) == Some(AlignmentStatus::ExtraneousCitation) {
        FailureCode::ExtraneousCitation
    } else {
        FailureCode::MisalignedCitation
    }
}

struct SignalLog {
    signals: Vec<LayerSignal>,
    failure: Option<(PipelineLayer, FailureCode)>,
    attribution: FailureAttribution,
}

impl SignalLog {
    fn push(&mut self, signal: LayerSignal) {
        if let Some(code) = signal.failure_code {
            let keep_existing =
                self.attribution == FailureAttribution::FirstFailing && self.failure.is_some();
            if !keep_existing {
                self.failure = Some((signal.layer, code));
            }
        }
        self.signals.push(signal);
    }
}

/// Record one query's outcomes as a trace.
#[must_use]
pub fn build_decision_trace(input: &TraceInput<'_>) -> DecisionTrace {
    let mut log =
        SignalLog { signals: Vec::with_capacity(5), failure: None, attribution: input.attribution };

    if input.context_valid {
        log.push(LayerSignal::pass(PipelineLayer::Context));
    } else {
        log.push(LayerSignal::fail(
            PipelineLayer::Context,
            context_failure_code(input.context_failure_reason),
            input.context_failure_reason.map(str::to_string),
        ));
    }

    let finish = |log: SignalLog,
                  allowed: bool,
                  presentation: Option<&PresentationDecision>,
                  refusal_reason: Option<&str>| DecisionTrace {
        query_id: input.query_id,
        query_text: input.query_text.to_string(),
        layer_signals: log.signals,
        allowed,
        presentation_mode: presentation.map(|decision| decision.mode),
        failure_layer: log.failure.map(|(layer, _)| layer),
        failure_code: log.failure.map(|(_, code)| code),
        refusal_reason: refusal_reason.map(str::to_string),
        presentation_reason: presentation.and_then(|decision| decision.reason.clone()),
        stats: input.stats,
        timestamps: input.timestamps,
    };

    if let Some(refusal) = input.refusal_reason {
        log.push(LayerSignal::fail(
            PipelineLayer::Generation,
            FailureCode::MissingCitation,
            Some(refusal.to_string()),
        ));
        return finish(log, false, None, Some(refusal));
    }
    log.push(LayerSignal::pass(PipelineLayer::Generation));

    if let Some(report) = input.verification {
        if report.passed {
            log.push(LayerSignal::pass(PipelineLayer::Entailment));
        } else {
            let code = match report.failing_label() {
                Some(EntailmentLabel::Unknown) => FailureCode::UnknownEntailment,
                _ => FailureCode::NotEntailed,
            };
            let reason = report.failure_reason.clone();
            log.push(LayerSignal::fail(PipelineLayer::Entailment, code, reason));
        }
    }

    if let Some(report) = input.alignment {
        if report.passed {
            log.push(LayerSignal::pass(PipelineLayer::CitationAlignment));
        } else {
            log.push(LayerSignal::fail(
                PipelineLayer::CitationAlignment,
                alignment_failure_code(report, &input.alignment_policy),
                report.failure_reason.clone(),
            ));
        }
    }

    let allowed = input.presentation.is_some_and(|decision| decision.mode.is_shown());
    if let Some(decision) = input.presentation {
        let signal = if decision.mode == PresentationMode::Suppressed {
            LayerSignal::fail(
                PipelineLayer::Presentation,
                FailureCode::SuppressedByPolicy,
                decision.reason.clone(),
            )
        } else {
            LayerSignal {
                reason: decision.reason.clone(),
                ..LayerSignal::pass(PipelineLayer::Presentation)
            }
        };
        log.push(signal);
    }

    finish(log, allowed, input.presentation, None)
}

fn or_none<T: Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |value| value.to_string())
}

/// One-line summary of a trace.
#[must_use]
pub fn trace_summary_line(trace: &DecisionTrace) -> String {
    format!(
        "RAG_TRACE | allowed={} | failure_layer={} | failure_code={} | mode={}",
        trace.allowed,
        or_none(trace.failure_layer),
        or_none(trace.failure_code),
        or_none(trace.presentation_mode.map(PresentationMode::as_str)),
    )
}

pub fn log_trace_summary(trace: &DecisionTrace) {
    tracing::info!(query_id = %trace.query_id, "{}", trace_summary_line(trace));
}
