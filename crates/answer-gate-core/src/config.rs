use serde::{Deserialize, Serialize};

use crate::citations::AlignmentPolicy;
use crate::context::ContextPolicy;
use crate::generation::GenerationPolicy;
use crate::presentation::PresentationPolicy;
use crate::trace::FailureAttribution;
use crate::GateError;

pub const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 30;

fn default_timeout_secs() -> u64 {
    DEFAULT_JUDGE_TIMEOUT_SECS
}

/// Which judge answers entailment prompts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JudgeConfig {
    /// Offline literal-containment judge.
    #[default]
    Literal,
    /// Fixed replies in order; `fallback` once they run out.
    Scripted {
        replies: Vec<String>,
        #[serde(default)]
        fallback: Option<String>,
    },
    /// OpenAI-compatible chat completions endpoint.
    Http {
        endpoint: String,
        model: String,
        #[serde(default)]
        api_key_env: Option<String>,
        #[serde(default = "default_timeout_secs")]
        timeout_secs: u64,
    },
}

impl JudgeConfig {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Literal => "literal",
            Self::Scripted { .. } => "scripted",
            Self::Http { .. } => "http",
        }
    }
}

/// Every policy the gate consults, loaded once per process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct GateConfig {
    pub context: ContextPolicy,
    pub generation: GenerationPolicy,
    pub alignment: AlignmentPolicy,
    pub presentation: PresentationPolicy,
    pub attribution: FailureAttribution,
    pub judge: JudgeConfig,
}

impl GateConfig {
    /// # Errors
    /// Returns [`GateError::Validation`] naming the first inconsistent setting.
    pub fn validate(&self) -> Result<(), GateError> {
        self.context.validate()?;
        self.generation.validate()?;
        if let JudgeConfig::Http { endpoint, model, timeout_secs, .. } = &self.judge {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(GateError::Validation(
                    "judge.endpoint MUST be an http(s) URL".to_string(),
                ));
            }
            if model.trim().is_empty() {
                return Err(GateError::Validation("judge.model MUST be non-empty".to_string()));
            }
            if *timeout_secs == 0 {
                return Err(GateError::Validation("judge.timeout_secs MUST be > 0".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::citations::ExtraneousCitationPolicy;

    // Test IDs: TCFG-001
    #[test]
    fn empty_document_yields_defaults() {
        let config: GateConfig = match serde_json::from_str("{}") {
            Ok(config) => config,
            Err(err) => panic!("empty config should parse: {err}"),
        };
        assert_eq!(config, GateConfig::default());
        assert_eq!(config.context.max_chunks, 5);
        assert_eq!(config.generation.max_answer_tokens, 300);
        assert!(config.presentation.allow_warnings);
        assert_eq!(config.attribution, FailureAttribution::LastFailing);
        assert_eq!(config.judge, JudgeConfig::Literal);
        assert!(config.validate().is_ok());
    }

    // Test IDs: TCFG-002
    #[test]
    fn partial_sections_merge_with_defaults() {
        let raw = r#"{
            "context": {"max_chunks": 8},
            "alignment": {"extraneous": "fail"},
            "attribution": "first_failing",
            "judge": {"kind": "http", "endpoint": "https://judge.internal/v1/chat/completions", "model": "verifier"}
        }"#;
        let config: GateConfig = match serde_json::from_str(raw) {
            Ok(config) => config,
            Err(err) => panic!("config should parse: {err}"),
        };
        assert_eq!(config.context.max_chunks, 8);
        assert_eq!(config.context.max_chars, 3000);
        assert_eq!(config.alignment.extraneous, ExtraneousCitationPolicy::Fail);
        assert_eq!(config.attribution, FailureAttribution::FirstFailing);
        assert_eq!(
            config.judge,
            JudgeConfig::Http {
                endpoint: "https://judge.internal/v1/chat/completions".to_string(),
                model: "verifier".to_string(),
                api_key_env: None,
                timeout_secs: DEFAULT_JUDGE_TIMEOUT_SECS,
            }
        );
        assert!(config.validate().is_ok());
    }

    // Test IDs: TCFG-003
    #[test]
    fn validate_rejects_inconsistent_settings() {
        let mut config = GateConfig::default();
        config.context.min_chunks = 9;
        assert!(config.validate().is_err());

        let config = GateConfig {
            judge: JudgeConfig::Http {
                endpoint: "judge.internal".to_string(),
                model: "verifier".to_string(),
                api_key_env: None,
                timeout_secs: 30,
            },
            ..GateConfig::default()
        };
        let err = match config.validate() {
            Ok(()) => panic!("expected invalid endpoint"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("judge.endpoint MUST be an http(s) URL"));
    }
}
