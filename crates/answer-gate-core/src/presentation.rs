use serde::{Deserialize, Serialize};

use crate::citations::{AlignmentStatus, ClaimCitationResult};
use crate::entailment::{EntailmentLabel, EntailmentResult};

pub const REASON_DEBUG: &str = "debug mode enabled";
pub const REASON_UNVERIFIED: &str = "unverified factual claims";
pub const REASON_WARNINGS_DISALLOWED: &str = "policy disallows warnings";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct PresentationPolicy {
    pub allow_partial: bool,
    pub allow_warnings: bool,
    pub debug_mode: bool,
}

impl Default for PresentationPolicy {
    fn default() -> Self {
        Self { allow_partial: false, allow_warnings: true, debug_mode: false }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PresentationMode {
    Full,
    Warning,
    Suppressed,
    Debug,
}

impl PresentationMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Warning => "warning",
            Self::Suppressed => "suppressed",
            Self::Debug => "debug",
        }
    }

    /// # Errors
    /// Returns an error message when `raw` is not a known mode.
    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim() {
            "full" => Ok(Self::Full),
            "warning" => Ok(Self::Warning),
            "suppressed" => Ok(Self::Suppressed),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown presentation mode: {other}")),
        }
    }

    /// Whether the answer is shown at all in this mode.
    #[must_use]
    pub fn is_shown(self) -> bool {
        !matches!(self, Self::Suppressed)
    }
}

/// Audit-only code explaining a suppression; never shown to end users.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SuppressionCode {
    UnverifiedClaims,
    PolicyDisallowsWarnings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresentationDecision {
    pub allowed: bool,
    pub mode: PresentationMode,
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression: Option<SuppressionCode>,
}

impl PresentationDecision {
    fn shown(mode: PresentationMode, reason: Option<String>) -> Self {
        Self { allowed: true, mode, reason, suppression: None }
    }

    fn suppressed(reason: &str, code: SuppressionCode) -> Self {
        Self {
            allowed: false,
            mode: PresentationMode::Suppressed,
            reason: Some(reason.to_string()),
            suppression: Some(code),
        }
    }
}

fn warning_reason(unverified: bool, misaligned: bool) -> String {
    let signal = match (unverified, misaligned) {
        (true, true) => "unverified claims and misaligned citations",
        (true, false) => "unverified claims",
        _ => "misaligned citations",
    };
    format!("some claims or citations could not be fully verified ({signal})")
}

/// Decide how much of the answer to disclose.
///
/// Evaluation order is fixed: debug override, hard block on unverified claims without
/// partial answers, then warning-or-suppress on any remaining signal, else full.
#[must_use]
pub fn decide_presentation(
    policy: &PresentationPolicy,
    claim_results: &[EntailmentResult],
    citation_results: &[ClaimCitationResult],
) -> PresentationDecision {
    if policy.debug_mode {
        return PresentationDecision::shown(PresentationMode::Debug, Some(REASON_DEBUG.to_string()));
    }

    let unverified = claim_results.iter().any(|result| result.label != EntailmentLabel::Entailed);
    let misaligned = citation_results
        .iter()
        .any(|result| result.status != AlignmentStatus::Aligned);

    let decision = if unverified && !policy.allow_partial {
        PresentationDecision::suppressed(REASON_UNVERIFIED, SuppressionCode::UnverifiedClaims)
    } else if unverified || misaligned {
        if policy.allow_warnings {
            PresentationDecision::shown(
                PresentationMode::Warning,
                Some(warning_reason(unverified, misaligned)),
            )
        } else {
            PresentationDecision::suppressed(
                REASON_WARNINGS_DISALLOWED,
                SuppressionCode::PolicyDisallowsWarnings,
            )
        }
    } else {
        PresentationDecision::shown(PresentationMode::Full, None)
    };

    tracing::debug!(
        mode = decision.mode.as_str(),
        unverified,
        misaligned,
        "presentation decided"
    );
    decision
}
