use std::path::{Path, PathBuf};

use answer_gate_core::{
    build_context_pack, AnswerGate, CandidatePassage, ContextPack, DecisionTrace, GateConfig,
    GateOutcome, GateRequest, Judge, JudgeConfig, LiteralJudge, PregeneratedAnswer, QueryId,
    ScriptedJudge, TokenUsage,
};
use answer_gate_judge::HttpJudge;
use answer_gate_store_sqlite::{
    AuditSummary, ExportManifest, ImportSummary, IntegrityReport, SchemaStatus, SqliteAuditStore,
    TraceFilter,
};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextBuildRequest {
    pub query: String,
    #[serde(default)]
    pub candidates: Vec<CandidatePassage>,
}

/// One query to gate: retrieved candidates plus the answer a generator already produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GateRunRequest {
    #[serde(default)]
    pub query_id: Option<QueryId>,
    pub query: String,
    #[serde(default)]
    pub candidates: Vec<CandidatePassage>,
    pub answer: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub as_of: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct AnswerGateApi {
    db_path: PathBuf,
    config: GateConfig,
}

impl AnswerGateApi {
    #[must_use]
    pub fn new(db_path: PathBuf, config: GateConfig) -> Self {
        Self { db_path, config }
    }

    #[must_use]
    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteAuditStore> {
        SqliteAuditStore::open(&self.db_path)
    }

    fn open_migrated_store(&self) -> Result<SqliteAuditStore> {
        let store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Run context admission only. Touches no storage.
    ///
    /// # Errors
    /// Returns an error when the configured context policy is inconsistent.
    pub fn build_context(&self, input: ContextBuildRequest) -> Result<ContextPack> {
        Ok(build_context_pack(&input.query, input.candidates, &self.config.context)?)
    }

    /// Gate a pregenerated answer and record its decision trace.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened, the judge cannot be built, or the
    /// request is malformed.
    pub fn run_gate(&self, input: GateRunRequest) -> Result<GateOutcome> {
        let store = self.open_migrated_store()?;
        let gate = AnswerGate::new(self.config.clone(), build_judge(&self.config.judge)?)?;
        let generator = PregeneratedAnswer { text: input.answer, usage: input.usage };
        let request = GateRequest {
            query_id: input.query_id.unwrap_or_default(),
            query: input.query,
            candidates: input.candidates,
            as_of: input.as_of,
        };
        Ok(gate.run(request, &generator, &store)?)
    }

    /// # Errors
    /// Returns an error when the store cannot be read.
    pub fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<DecisionTrace>> {
        self.open_migrated_store()?.list_traces(filter)
    }

    /// # Errors
    /// Returns an error when the id is malformed or lookup fails.
    pub fn find_trace(&self, query_id: &str) -> Result<Option<DecisionTrace>> {
        let query_id = QueryId::parse(query_id)?;
        self.open_migrated_store()?.get_trace(query_id)
    }

    /// Fetch one recorded trace by query id.
    ///
    /// # Errors
    /// Returns an error when the id is malformed, lookup fails, or no trace exists.
    pub fn show_trace(&self, query_id: &str) -> Result<DecisionTrace> {
        self.find_trace(query_id)?
            .ok_or_else(|| anyhow!("decision trace not found: {}", query_id.trim()))
    }

    /// # Errors
    /// Returns an error when the aggregate queries fail.
    pub fn audit_summary(&self) -> Result<AuditSummary> {
        self.open_migrated_store()?.summary()
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_traces(&self) -> Result<usize> {
        self.open_migrated_store()?.clear_traces()
    }

    /// # Errors
    /// Returns an error when export files cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.open_migrated_store()?.export_snapshot(out_dir)
    }

    /// # Errors
    /// Returns an error when manifest verification or any import write fails.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.open_store()?.import_snapshot(in_dir, skip_existing)
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        self.open_migrated_store()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or restore fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        self.open_store()?.restore_database(in_file)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }
}

/// Load a gate configuration from YAML (`.yaml`/`.yml`) or JSON (`.json`) and validate it.
///
/// # Errors
/// Returns an error for unreadable files, unknown extensions, parse failures, or settings
/// that fail validation.
pub fn load_config(path: &Path) -> Result<GateConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
    let config: GateConfig = match extension.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?,
        "json" => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?,
        other => {
            return Err(anyhow!(
                "unsupported config extension `{other}` for {}; expected yaml, yml, or json",
                path.display()
            ));
        }
    };
    config.validate().with_context(|| format!("invalid config {}", path.display()))?;
    tracing::debug!(path = %path.display(), judge = config.judge.kind(), "loaded gate config");
    Ok(config)
}

/// Construct the judge named by `config`.
///
/// # Errors
/// Returns an error when an `http` judge cannot be configured.
pub fn build_judge(config: &JudgeConfig) -> Result<Box<dyn Judge>> {
    let judge: Box<dyn Judge> = match config {
        JudgeConfig::Literal => Box::new(LiteralJudge),
        JudgeConfig::Scripted { replies, fallback: Some(fallback) } => {
            Box::new(ScriptedJudge::with_fallback(replies.clone(), fallback.clone()))
        }
        JudgeConfig::Scripted { replies, fallback: None } => {
            Box::new(ScriptedJudge::new(replies.clone()))
        }
        JudgeConfig::Http { .. } => Box::new(HttpJudge::from_config(config)?),
    };
    Ok(judge)
}
