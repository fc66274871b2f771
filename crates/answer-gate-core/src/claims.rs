use serde::{Deserialize, Serialize};

use crate::citations::{extract_citation_ids, split_sentences, strip_citation_markers, CitationMap};

/// Leading phrases that mark a sentence as an explicit opinion rather than a factual claim.
pub const HEDGE_PREFIXES: [&str; 4] = ["i think", "i believe", "in my opinion", "it seems to me"];

/// One atomic factual sentence taken from a generated answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claim {
    /// 1-based position among surviving claims.
    pub claim_id: usize,
    pub text: String,
    /// Sentence text the claim came from; the join key for text-keyed citation maps.
    pub source_sentence: String,
    /// Set when the claim was derived from [`segment_answer`]; citation lookup then uses
    /// the sentence id instead of the sentence text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_id: Option<usize>,
}

/// A sentence produced by the unified segmentation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerSentence {
    pub sentence_id: usize,
    /// Sentence text with citation markers removed.
    pub text: String,
    pub citation_ids: Vec<String>,
}

fn is_hedged(fragment: &str) -> bool {
    let lowered = fragment.trim().to_lowercase();
    HEDGE_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix))
}

/// Split an answer into claims on the literal period only.
///
/// Over-splitting (abbreviations, decimals) is accepted. A fragment is discarded only when
/// it opens with one of [`HEDGE_PREFIXES`].
#[must_use]
pub fn extract_claims(answer: &str) -> Vec<Claim> {
    answer
        .split('.')
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(|fragment| format!("{fragment}."))
        .filter(|sentence| !is_hedged(sentence))
        .enumerate()
        .map(|(index, sentence)| Claim {
            claim_id: index + 1,
            text: sentence.clone(),
            source_sentence: sentence,
            sentence_id: None,
        })
        .collect()
}

/// Segment an answer once, keeping each sentence's citation ids next to its clean text.
#[must_use]
pub fn segment_answer(answer: &str) -> Vec<AnswerSentence> {
    split_sentences(answer)
        .into_iter()
        .filter_map(|raw| {
            let text = strip_citation_markers(&raw);
            if text.is_empty() {
                return None;
            }
            Some((text, extract_citation_ids(&raw)))
        })
        .enumerate()
        .map(|(index, (text, citation_ids))| AnswerSentence {
            sentence_id: index + 1,
            text,
            citation_ids,
        })
        .collect()
}

#[must_use]
pub fn claims_from_segments(sentences: &[AnswerSentence]) -> Vec<Claim> {
    sentences
        .iter()
        .filter(|sentence| !is_hedged(&sentence.text))
        .enumerate()
        .map(|(index, sentence)| Claim {
            claim_id: index + 1,
            text: sentence.text.clone(),
            source_sentence: sentence.text.clone(),
            sentence_id: Some(sentence.sentence_id),
        })
        .collect()
}

#[must_use]
pub fn citation_map_from_segments(sentences: &[AnswerSentence]) -> CitationMap {
    let mut map = CitationMap::default();
    for sentence in sentences.iter().filter(|sentence| !sentence.citation_ids.is_empty()) {
        map.insert_identified(sentence.sentence_id, &sentence.text, sentence.citation_ids.clone());
    }
    map
}
