use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::GateError;

/// Markers that identify boilerplate passages; matched against the uppercased text.
pub const BOILERPLATE_MARKERS: [&str; 4] =
    ["DOCUMENT_START", "TABLE OF CONTENTS", "COPYRIGHT", "ALL RIGHTS RESERVED"];

pub const REASON_EMPTY_TEXT: &str = "empty text";
pub const REASON_BOILERPLATE: &str = "boilerplate detected";
pub const REASON_STRUCTURAL_HEADER: &str = "structural header";
pub const REASON_DUPLICATE_ID: &str = "duplicate chunk_id";
pub const REASON_MAX_COUNT: &str = "max count limit reached";
pub const REASON_BUDGET_EXCEEDED: &str = "context budget exceeded";

pub const INVALID_EMPTY_CONTEXT: &str = "empty_context";
pub const INVALID_INSUFFICIENT_CONTEXT: &str = "insufficient_context";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContextPolicy {
    pub max_chunks: usize,
    pub max_chars: usize,
    pub min_chunks: usize,
    pub min_chars: usize,
    pub header_max_chars: usize,
    pub uppercase_header_max_chars: usize,
    pub expand_neighbors: bool,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            max_chunks: 5,
            max_chars: 3000,
            min_chunks: 1,
            min_chars: 100,
            header_max_chars: 40,
            uppercase_header_max_chars: 80,
            expand_neighbors: false,
        }
    }
}

impl ContextPolicy {
    /// Check that the thresholds are mutually satisfiable.
    ///
    /// # Errors
    /// Returns [`GateError::Validation`] when a minimum exceeds its maximum.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.min_chunks > self.max_chunks {
            return Err(GateError::Validation(
                "min_chunks MUST be <= max_chunks".to_string(),
            ));
        }
        if self.min_chars > self.max_chars {
            return Err(GateError::Validation("min_chars MUST be <= max_chars".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ChunkMetadata {
    pub doc_id: Option<String>,
    pub chunk_index: Option<i64>,
    pub source: Option<String>,
}

/// One retrieved passage as handed over by the retriever. Every field except the id is
/// optional on the wire; absent text is treated as empty and absent distance as infinite.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidatePassage {
    pub chunk_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default)]
    pub metadata: ChunkMetadata,
}

impl CandidatePassage {
    #[must_use]
    pub fn effective_distance(&self) -> f64 {
        match self.distance {
            Some(distance) if !distance.is_nan() => distance,
            _ => f64::INFINITY,
        }
    }

    #[must_use]
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// A passage after admission, carrying the reason it was admitted or rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextChunk {
    #[serde(flatten)]
    pub passage: CandidatePassage,
    pub reason: String,
}

impl ContextChunk {
    #[must_use]
    pub fn new(passage: CandidatePassage, reason: impl Into<String>) -> Self {
        Self { passage, reason: reason.into() }
    }

    #[must_use]
    pub fn chunk_id(&self) -> &str {
        &self.passage.chunk_id
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.passage.text
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BudgetStats {
    pub max_chars: usize,
    pub used_chars: usize,
    pub remaining_chars: usize,
    pub budget_exhausted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextStats {
    pub retrieved_count: usize,
    pub approved_count: usize,
    pub dropped_count: usize,
    pub total_chars: usize,
    pub avg_chunk_length: f64,
    pub budget: BudgetStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextPack {
    pub query: String,
    pub policy: ContextPolicy,
    pub approved_chunks: Vec<ContextChunk>,
    pub dropped_chunks: Vec<ContextChunk>,
    pub is_valid: bool,
    pub invalid_reason: Option<String>,
    pub stats: ContextStats,
}

impl ContextPack {
    #[must_use]
    pub fn approved_ids(&self) -> BTreeSet<&str> {
        self.approved_chunks.iter().map(ContextChunk::chunk_id).collect()
    }

    #[must_use]
    pub fn find_approved(&self, chunk_id: &str) -> Option<&ContextChunk> {
        self.approved_chunks.iter().find(|chunk| chunk.chunk_id() == chunk_id)
    }

    #[must_use]
    pub fn is_dropped(&self, chunk_id: &str) -> bool {
        self.dropped_chunks.iter().any(|chunk| chunk.chunk_id() == chunk_id)
    }
}

#[must_use]
pub fn is_boilerplate(text: &str) -> bool {
    let upper = text.to_uppercase();
    BOILERPLATE_MARKERS.iter().any(|marker| upper.contains(marker))
}

fn is_all_caps(text: &str) -> bool {
    let mut has_cased = false;
    for ch in text.chars() {
        if ch.is_lowercase() {
            return false;
        }
        if ch.is_uppercase() {
            has_cased = true;
        }
    }
    has_cased
}

/// A single short line, or an all-caps block under the larger uppercase threshold.
#[must_use]
pub fn looks_like_header(text: &str, policy: &ContextPolicy) -> bool {
    let length = text.chars().count();
    let non_empty_lines = text.lines().filter(|line| !line.trim().is_empty()).count();
    if non_empty_lines == 1 && length <= policy.header_max_chars {
        return true;
    }
    is_all_caps(text) && length <= policy.uppercase_header_max_chars
}

fn admitted_reason(passage: &CandidatePassage) -> String {
    let distance = passage.distance.map_or_else(|| "none".to_string(), |value| value.to_string());
    format!("passed boilerplate filter; passed header filter; semantic distance={distance}")
}

fn cmp_by_distance(lhs: &CandidatePassage, rhs: &CandidatePassage) -> Ordering {
    lhs.effective_distance().total_cmp(&rhs.effective_distance())
}

/// Stable-sort candidates by distance and split them into admitted and dropped passages.
/// Every candidate lands in exactly one of the two lists.
#[must_use]
pub fn select_chunks(
    candidates: Vec<CandidatePassage>,
    policy: &ContextPolicy,
) -> (Vec<ContextChunk>, Vec<ContextChunk>) {
    let mut sorted = candidates;
    sorted.sort_by(cmp_by_distance);

    let mut approved: Vec<ContextChunk> = Vec::new();
    let mut dropped: Vec<ContextChunk> = Vec::new();
    let mut seen_ids: BTreeSet<String> = BTreeSet::new();

    for passage in sorted {
        let first_sighting = seen_ids.insert(passage.chunk_id.clone());
        let text = passage.text.trim();

        let drop_reason = if text.is_empty() {
            Some(REASON_EMPTY_TEXT)
        } else if is_boilerplate(text) {
            Some(REASON_BOILERPLATE)
        } else if looks_like_header(text, policy) {
            Some(REASON_STRUCTURAL_HEADER)
        } else if !first_sighting {
            Some(REASON_DUPLICATE_ID)
        } else if approved.len() >= policy.max_chunks {
            Some(REASON_MAX_COUNT)
        } else {
            None
        };

        match drop_reason {
            Some(reason) => dropped.push(ContextChunk::new(passage, reason)),
            None => {
                let reason = admitted_reason(&passage);
                approved.push(ContextChunk::new(passage, reason));
            }
        }
    }

    (approved, dropped)
}

fn is_adjacent(anchor: &ChunkMetadata, other: &ChunkMetadata) -> bool {
    let (Some(doc_id), Some(index)) = (&anchor.doc_id, anchor.chunk_index) else {
        return false;
    };
    let Some(other_index) = other.chunk_index else {
        return false;
    };
    other.doc_id.as_deref() == Some(doc_id.as_str()) && other_index.abs_diff(index) == 1
}

/// Pull immediate same-document neighbors of admitted passages out of the dropped list.
///
/// Admitted passages are always kept; neighbors fill only the room left under
/// `max_chunks`. Empty and boilerplate neighbors are never pulled in.
#[must_use]
pub fn expand_with_neighbors(
    approved: Vec<ContextChunk>,
    dropped: Vec<ContextChunk>,
    policy: &ContextPolicy,
) -> (Vec<ContextChunk>, Vec<ContextChunk>) {
    let mut capacity = policy.max_chunks.saturating_sub(approved.len());
    let mut seen: BTreeSet<String> =
        approved.iter().map(|chunk| chunk.chunk_id().to_string()).collect();
    let mut pool: Vec<Option<ContextChunk>> = dropped.into_iter().map(Some).collect();
    let mut expanded: Vec<ContextChunk> = Vec::with_capacity(approved.len());

    for anchor in approved {
        let anchor_meta = anchor.passage.metadata.clone();
        expanded.push(anchor);

        for slot in &mut pool {
            if capacity == 0 {
                break;
            }
            let Some(candidate) = slot.as_ref() else {
                continue;
            };
            if !is_adjacent(&anchor_meta, &candidate.passage.metadata)
                || seen.contains(candidate.chunk_id())
            {
                continue;
            }
            let text = candidate.text().trim();
            if text.is_empty() || is_boilerplate(text) {
                continue;
            }

            if let Some(neighbor) = slot.take() {
                let anchor_index =
                    anchor_meta.chunk_index.map_or_else(|| "none".to_string(), |i| i.to_string());
                seen.insert(neighbor.chunk_id().to_string());
                let reason = format!("neighbor of chunk_index={anchor_index}");
                expanded.push(neighbor.with_reason(reason));
                capacity -= 1;
            }
        }
    }

    (expanded, pool.into_iter().flatten().collect())
}

/// Accept whole passages in order while the running character total stays within budget.
#[must_use]
pub fn enforce_context_budget(
    chunks: Vec<ContextChunk>,
    policy: &ContextPolicy,
) -> (Vec<ContextChunk>, Vec<ContextChunk>, BudgetStats) {
    let mut used_chars = 0_usize;
    let mut kept = Vec::new();
    let mut dropped = Vec::new();

    for chunk in chunks {
        let length = chunk.passage.char_len();
        if used_chars + length <= policy.max_chars {
            used_chars += length;
            kept.push(chunk);
        } else {
            dropped.push(chunk.with_reason(REASON_BUDGET_EXCEEDED));
        }
    }

    let stats = BudgetStats {
        max_chars: policy.max_chars,
        used_chars,
        remaining_chars: policy.max_chars.saturating_sub(used_chars),
        budget_exhausted: used_chars >= policy.max_chars,
    };
    (kept, dropped, stats)
}

fn cmp_reading_order(lhs: &ContextChunk, rhs: &ContextChunk) -> Ordering {
    match (lhs.passage.metadata.chunk_index, rhs.passage.metadata.chunk_index) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => cmp_by_distance(&lhs.passage, &rhs.passage),
    }
}

/// Document position first when known, then relevance distance. Stable.
#[must_use]
pub fn order_chunks(mut chunks: Vec<ContextChunk>) -> Vec<ContextChunk> {
    chunks.sort_by(cmp_reading_order);
    chunks
}

fn invalid_reason(count: usize, total_chars: usize, policy: &ContextPolicy) -> Option<String> {
    if count >= policy.min_chunks && total_chars >= policy.min_chars {
        return None;
    }
    if count == 0 {
        Some(INVALID_EMPTY_CONTEXT.to_string())
    } else {
        Some(INVALID_INSUFFICIENT_CONTEXT.to_string())
    }
}

/// Run admission end to end: select, optionally expand, budget, order, validate.
///
/// # Errors
/// Returns [`GateError::Validation`] when the policy thresholds are inconsistent.
pub fn build_context_pack(
    query: &str,
    candidates: Vec<CandidatePassage>,
    policy: &ContextPolicy,
) -> Result<ContextPack, GateError> {
    policy.validate()?;
    let retrieved_count = candidates.len();

    let (approved, dropped) = select_chunks(candidates, policy);
    let (approved, mut dropped) = if policy.expand_neighbors {
        expand_with_neighbors(approved, dropped, policy)
    } else {
        (approved, dropped)
    };

    let (kept, over_budget, budget) = enforce_context_budget(approved, policy);
    dropped.extend(over_budget);
    let approved = order_chunks(kept);

    let total_chars = budget.used_chars;
    let invalid_reason = invalid_reason(approved.len(), total_chars, policy);
    let avg_chunk_length = if approved.is_empty() {
        0.0
    } else {
        let total = f64::from(u32::try_from(total_chars).unwrap_or(u32::MAX));
        let count = f64::from(u32::try_from(approved.len()).unwrap_or(u32::MAX));
        total / count
    };

    tracing::debug!(
        approved = approved.len(),
        dropped = dropped.len(),
        total_chars,
        invalid_reason = invalid_reason.as_deref().unwrap_or("none"),
        "context admission complete"
    );

    Ok(ContextPack {
        query: query.to_string(),
        policy: policy.clone(),
        stats: ContextStats {
            retrieved_count,
            approved_count: approved.len(),
            dropped_count: dropped.len(),
            total_chars,
            avg_chunk_length,
            budget,
        },
        approved_chunks: approved,
        dropped_chunks: dropped,
        is_valid: invalid_reason.is_none(),
        invalid_reason,
    })
}

/// Render admitted passages as numbered blocks for a generator prompt.
#[must_use]
pub fn render_context(pack: &ContextPack) -> String {
    pack.approved_chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            format!("[CONTEXT {}]\nReason: {}\n\n{}", index + 1, chunk.reason, chunk.text().trim())
        })
        .collect::<Vec<_>>()
        .join("\n\n---\n\n")
}
