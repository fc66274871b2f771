//! Citation markers: parsing them out of answer text, resolving them against admitted
//! context, and checking that each claim's cited passages actually contain it.
//!
//! Markers look like `[c1]` or `[c1, c2]`. Resolution is exact on the passage id; support
//! is literal substring containment after [`normalize_for_match`].

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::claims::Claim;
use crate::context::{ContextChunk, ContextPack};

#[allow(clippy::expect_used)]
static CITATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]").expect("citation pattern is a valid literal"));

#[allow(clippy::expect_used)]
static CITATION_ONLY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\[[^\]]+\]\s*)+$").expect("citation-only pattern is a valid literal")
});

#[allow(clippy::expect_used)]
static LEADING_CITATION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^((?:\[[^\]]+\]\s*)+)(\S.*)$")
        .expect("leading citation pattern is a valid literal")
});

#[allow(clippy::expect_used)]
static NEWLINE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*\n\s*").expect("newline pattern is a valid literal"));

pub const REASON_NO_CITATIONS: &str = "Claim has no citations.";
pub const REASON_NO_SUPPORT: &str = "None of the cited chunks support this claim.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentStatus {
    Aligned,
    MissingCitation,
    InvalidCitation,
    Misaligned,
    ExtraneousCitation,
}

impl AlignmentStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aligned => "aligned",
            Self::MissingCitation => "missing_citation",
            Self::InvalidCitation => "invalid_citation",
            Self::Misaligned => "misaligned",
            Self::ExtraneousCitation => "extraneous_citation",
        }
    }

    /// Whether this status fails the alignment report under `policy`.
    #[must_use]
    pub fn is_blocking(self, policy: &AlignmentPolicy) -> bool {
        match self {
            Self::Aligned => false,
            Self::MissingCitation | Self::InvalidCitation | Self::Misaligned => true,
            Self::ExtraneousCitation => policy.extraneous == ExtraneousCitationPolicy::Fail,
        }
    }
}

/// Treatment of cited passages that do not contain the claim when at least one other
/// cited passage does.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExtraneousCitationPolicy {
    /// Soft pass; the result stays visible as `extraneous_citation`.
    #[default]
    Allow,
    Fail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(default)]
pub struct AlignmentPolicy {
    pub extraneous: ExtraneousCitationPolicy,
}

/// Sentences and the citation ids attached to them.
///
/// Entries built by [`parse_citations`] are keyed by sentence text. Entries built from the
/// unified segmentation also carry a sentence id, which takes precedence for claims that
/// know their sentence id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CitationMap {
    pub entries: Vec<CitationEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CitationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_id: Option<usize>,
    pub sentence: String,
    pub citation_ids: Vec<String>,
}

impl CitationMap {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Citation ids recorded for an exact sentence text.
    #[must_use]
    pub fn get(&self, sentence: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|entry| entry.sentence == sentence)
            .map(|entry| entry.citation_ids.as_slice())
    }

    /// Citation ids for `claim`: by sentence id when the claim has one, else by its exact
    /// source sentence text. Empty when nothing matches.
    #[must_use]
    pub fn citations_for(&self, claim: &Claim) -> &[String] {
        let found = match claim.sentence_id {
            Some(sentence_id) => self
                .entries
                .iter()
                .find(|entry| entry.sentence_id == Some(sentence_id))
                .map(|entry| entry.citation_ids.as_slice()),
            None => self.get(&claim.source_sentence),
        };
        found.unwrap_or(&[])
    }

    /// All distinct cited ids in first-seen order.
    #[must_use]
    pub fn all_citation_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.entries
            .iter()
            .flat_map(|entry| entry.citation_ids.iter())
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    fn insert_text(&mut self, sentence: String, citation_ids: Vec<String>) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.sentence == sentence) {
            for id in citation_ids {
                if !entry.citation_ids.contains(&id) {
                    entry.citation_ids.push(id);
                }
            }
            return;
        }
        self.entries.push(CitationEntry { sentence_id: None, sentence, citation_ids });
    }

    pub(crate) fn insert_identified(
        &mut self,
        sentence_id: usize,
        sentence: &str,
        citation_ids: Vec<String>,
    ) {
        self.entries.push(CitationEntry {
            sentence_id: Some(sentence_id),
            sentence: sentence.to_string(),
            citation_ids,
        });
    }
}

/// Comma-separated ids from every bracketed marker in `text`, in order of appearance.
#[must_use]
pub fn extract_citation_ids(text: &str) -> Vec<String> {
    CITATION_PATTERN
        .captures_iter(text)
        .filter_map(|captures| captures.get(1))
        .flat_map(|inner| inner.as_str().split(','))
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Remove citation markers and tidy the whitespace they leave behind.
pub(crate) fn strip_citation_markers(text: &str) -> String {
    let stripped = CITATION_PATTERN.replace_all(text, " ");
    let mut collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    for punctuation in [".", ",", "!", "?", ";", ":"] {
        collapsed = collapsed.replace(&format!(" {punctuation}"), punctuation);
    }
    collapsed.trim().to_string()
}

fn split_after_terminators(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut previous = None;
    let mut chars = text.char_indices().peekable();
    while let Some((index, ch)) = chars.next() {
        if ch.is_whitespace() && matches!(previous, Some('.' | '!' | '?')) {
            parts.push(&text[start..index]);
            let mut end = index + ch.len_utf8();
            while let Some(&(next_index, next)) = chars.peek() {
                if !next.is_whitespace() {
                    break;
                }
                end = next_index + next.len_utf8();
                chars.next();
            }
            start = end;
            previous = None;
            continue;
        }
        previous = Some(ch);
    }
    parts.push(&text[start..]);
    parts
}

/// Sentence boundaries used for citation attachment: split after `.`, `!` or `?` followed
/// by whitespace; a marker-only token joins the previous sentence; leading markers on a
/// token move to the previous sentence and the rest starts a new one.
pub(crate) fn split_sentences(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let normalized = NEWLINE_PATTERN.replace_all(trimmed, " ");

    let mut sentences: Vec<String> = Vec::new();
    for part in split_after_terminators(&normalized) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if let Some(previous) = sentences.last_mut() {
            if CITATION_ONLY_PATTERN.is_match(part) {
                previous.push(' ');
                previous.push_str(part);
                continue;
            }
            if let Some(captures) = LEADING_CITATION_PATTERN.captures(part) {
                if let (Some(markers), Some(rest)) = (captures.get(1), captures.get(2)) {
                    previous.push(' ');
                    previous.push_str(markers.as_str().trim());
                    sentences.push(rest.as_str().to_string());
                    continue;
                }
            }
        }
        sentences.push(part.to_string());
    }
    sentences
}

/// Map each cited sentence's exact text to its citation ids.
///
/// Sentences without markers are omitted. The parser does not validate ids.
#[must_use]
pub fn parse_citations(answer: &str) -> CitationMap {
    let mut map = CitationMap::default();
    for sentence in split_sentences(answer) {
        let ids = extract_citation_ids(&sentence);
        if !ids.is_empty() {
            map.insert_text(sentence, ids);
        }
    }
    map
}

/// Outcome of resolving one citation id against a context pack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CitationResolution<'a> {
    Resolved(&'a ContextChunk),
    /// The id names a passage that admission rejected.
    Dropped,
    /// The id names no passage at all.
    Invalid,
}

impl CitationResolution<'_> {
    #[must_use]
    pub fn failure_description(&self, citation_id: &str) -> Option<String> {
        match self {
            Self::Resolved(_) => None,
            Self::Dropped => {
                Some(format!("Citation '{citation_id}' refers to a dropped context chunk."))
            }
            Self::Invalid => {
                Some(format!("Citation '{citation_id}' does not exist in approved context."))
            }
        }
    }
}

/// Resolve every id in order. Matching is exact; approved passages win over dropped ones.
#[must_use]
pub fn resolve_citations<'a>(
    citation_ids: &[String],
    pack: &'a ContextPack,
) -> Vec<(String, CitationResolution<'a>)> {
    citation_ids
        .iter()
        .map(|id| {
            let resolution = match pack.find_approved(id) {
                Some(chunk) => CitationResolution::Resolved(chunk),
                None if pack.is_dropped(id) => CitationResolution::Dropped,
                None => CitationResolution::Invalid,
            };
            (id.clone(), resolution)
        })
        .collect()
}

/// Lowercase, drop periods and commas, trim.
#[must_use]
pub fn normalize_for_match(text: &str) -> String {
    text.to_lowercase().replace(['.', ','], "").trim().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimCitationResult {
    pub claim_text: String,
    pub sentence_index: usize,
    pub cited_ids: Vec<String>,
    pub status: AlignmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supporting_citation_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraneous_citation_ids: Option<Vec<String>>,
}

impl ClaimCitationResult {
    fn failed(
        claim: &Claim,
        cited_ids: Vec<String>,
        status: AlignmentStatus,
        reason: String,
    ) -> Self {
        Self {
            claim_text: claim.text.clone(),
            sentence_index: claim.claim_id,
            cited_ids,
            status,
            reason: Some(reason),
            supporting_citation_ids: None,
            extraneous_citation_ids: None,
        }
    }
}

fn align_claim(claim: &Claim, citations: &CitationMap, pack: &ContextPack) -> ClaimCitationResult {
    let cited_ids = citations.citations_for(claim).to_vec();
    if cited_ids.is_empty() {
        return ClaimCitationResult::failed(
            claim,
            cited_ids,
            AlignmentStatus::MissingCitation,
            REASON_NO_CITATIONS.to_string(),
        );
    }

    let mut resolved: Vec<(String, &ContextChunk)> = Vec::with_capacity(cited_ids.len());
    for (id, resolution) in resolve_citations(&cited_ids, pack) {
        if let Some(description) = resolution.failure_description(&id) {
            return ClaimCitationResult::failed(
                claim,
                cited_ids,
                AlignmentStatus::InvalidCitation,
                description,
            );
        }
        if let CitationResolution::Resolved(chunk) = resolution {
            if !resolved.iter().any(|(seen, _)| *seen == id) {
                resolved.push((id, chunk));
            }
        }
    }

    let normalized_claim = normalize_for_match(&claim.text);
    let (supporting, extraneous): (Vec<_>, Vec<_>) = resolved
        .into_iter()
        .partition(|(_, chunk)| normalize_for_match(chunk.text()).contains(&normalized_claim));
    let supporting = supporting.into_iter().map(|(id, _)| id).collect::<Vec<_>>();
    let extraneous = extraneous.into_iter().map(|(id, _)| id).collect::<Vec<_>>();

    if supporting.is_empty() {
        return ClaimCitationResult::failed(
            claim,
            cited_ids,
            AlignmentStatus::Misaligned,
            REASON_NO_SUPPORT.to_string(),
        );
    }

    let status = if extraneous.is_empty() {
        AlignmentStatus::Aligned
    } else {
        AlignmentStatus::ExtraneousCitation
    };
    ClaimCitationResult {
        claim_text: claim.text.clone(),
        sentence_index: claim.claim_id,
        cited_ids,
        status,
        reason: None,
        supporting_citation_ids: Some(supporting),
        extraneous_citation_ids: (!extraneous.is_empty()).then_some(extraneous),
    }
}

/// Align every claim with its citations. Never short-circuits: one result per claim.
#[must_use]
pub fn align_claims_to_citations(
    claims: &[Claim],
    citations: &CitationMap,
    pack: &ContextPack,
) -> Vec<ClaimCitationResult> {
    let results = claims
        .iter()
        .map(|claim| align_claim(claim, citations, pack))
        .collect::<Vec<_>>();
    tracing::debug!(
        claims = claims.len(),
        aligned = results.iter().filter(|result| result.status == AlignmentStatus::Aligned).count(),
        "citation alignment complete"
    );
    results
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClaimCitationReport {
    pub passed: bool,
    pub results: Vec<ClaimCitationResult>,
    /// First blocking failure, if any.
    pub failure_reason: Option<String>,
    pub failures: Vec<String>,
}

impl ClaimCitationReport {
    /// Most severe status present: the first blocking one, else extraneous, else aligned.
    #[must_use]
    pub fn worst_status(&self, policy: &AlignmentPolicy) -> Option<AlignmentStatus> {
        let mut statuses = self.results.iter().map(|result| result.status);
        if let Some(blocking) = statuses.find(|status| status.is_blocking(policy)) {
            return Some(blocking);
        }
        self.results.iter().map(|result| result.status).max_by_key(|status| {
            u8::from(*status == AlignmentStatus::ExtraneousCitation)
        })
    }
}

/// Aggregate alignment results. Zero results pass.
#[must_use]
pub fn build_claim_citation_report(
    results: Vec<ClaimCitationResult>,
    policy: &AlignmentPolicy,
) -> ClaimCitationReport {
    let failures = results
        .iter()
        .filter(|result| result.status.is_blocking(policy))
        .map(|result| {
            let status = result.status.as_str();
            format!("Claim at sentence {} failed: {status}", result.sentence_index)
        })
        .collect::<Vec<_>>();
    ClaimCitationReport {
        passed: failures.is_empty(),
        failure_reason: failures.first().cloned(),
        failures,
        results,
    }
}
