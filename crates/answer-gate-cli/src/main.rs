use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use answer_gate_api::{load_config, AnswerGateApi, ContextBuildRequest, GateRunRequest};
use answer_gate_core::{
    citation_map_from_segments, claims_from_segments, extract_claims, parse_citations,
    segment_answer, GateConfig, PipelineLayer,
};
use answer_gate_store_sqlite::TraceFilter;
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ag")]
#[command(about = "Answer Gate CLI")]
struct Cli {
    #[arg(long, default_value = "./answer_gate.sqlite3")]
    db: PathBuf,

    /// Gate configuration file (`.yaml`, `.yml` or `.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[arg(long, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Context {
        #[command(subcommand)]
        command: ContextCommand,
    },
    Claims {
        #[command(subcommand)]
        command: ClaimsCommand,
    },
    Citations {
        #[command(subcommand)]
        command: CitationsCommand,
    },
    Gate {
        #[command(subcommand)]
        command: GateCommand,
    },
    Audit {
        #[command(subcommand)]
        command: AuditCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ContextCommand {
    Build(InputArgs),
}

#[derive(Debug, Subcommand)]
enum ClaimsCommand {
    Extract(AnswerTextArgs),
}

#[derive(Debug, Subcommand)]
enum CitationsCommand {
    Parse(AnswerTextArgs),
}

#[derive(Debug, Subcommand)]
enum GateCommand {
    Run(GateRunArgs),
}

#[derive(Debug, Args)]
struct InputArgs {
    /// JSON request file, or `-` for stdin.
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct AnswerTextArgs {
    #[arg(long)]
    answer: String,
    /// Segment with citation-aware sentence boundaries instead of splitting on periods.
    #[arg(long, default_value_t = false)]
    segmented: bool,
}

#[derive(Debug, Args)]
struct GateRunArgs {
    #[command(flatten)]
    input: InputArgs,
    /// Pin both trace timestamps (RFC3339 UTC).
    #[arg(long)]
    as_of: Option<String>,
}

#[derive(Debug, Subcommand)]
enum AuditCommand {
    List(AuditListArgs),
    Show(AuditShowArgs),
    Summary,
    Clear,
}

#[derive(Debug, Args)]
struct AuditListArgs {
    #[arg(long)]
    allowed: Option<bool>,
    #[arg(long, value_enum)]
    failure_layer: Option<LayerArg>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Args)]
struct AuditShowArgs {
    #[arg(long)]
    query_id: String,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayerArg {
    Context,
    Generation,
    Entailment,
    CitationAlignment,
    Presentation,
}

impl LayerArg {
    fn into_layer(self) -> PipelineLayer {
        match self {
            Self::Context => PipelineLayer::Context,
            Self::Generation => PipelineLayer::Generation,
            Self::Entailment => PipelineLayer::Entailment,
            Self::CitationAlignment => PipelineLayer::CitationAlignment,
            Self::Presentation => PipelineLayer::Presentation,
        }
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .with_context(|| format!("invalid --log-level filter: {level}"))?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    let installed = if json { builder.json().try_init() } else { builder.try_init() };
    installed.map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json)?;

    let config = match cli.config.as_deref() {
        Some(path) => load_config(path)?,
        None => GateConfig::default(),
    };
    let api = AnswerGateApi::new(cli.db, config);

    match cli.command {
        Command::Context { command: ContextCommand::Build(args) } => run_context_build(&api, &args),
        Command::Claims { command: ClaimsCommand::Extract(args) } => run_claims_extract(&args),
        Command::Citations { command: CitationsCommand::Parse(args) } => run_citations_parse(&args),
        Command::Gate { command: GateCommand::Run(args) } => run_gate(&api, &args),
        Command::Audit { command } => run_audit(&api, command),
        Command::Db { command } => run_db(&api, command),
    }
}

fn run_context_build(api: &AnswerGateApi, args: &InputArgs) -> Result<()> {
    let request: ContextBuildRequest = read_json_input(&args.input)?;
    let pack = api.build_context(request)?;
    emit_json(serde_json::to_value(&pack).context("failed to serialize context pack")?)
}

fn run_claims_extract(args: &AnswerTextArgs) -> Result<()> {
    let claims = if args.segmented {
        claims_from_segments(&segment_answer(&args.answer))
    } else {
        extract_claims(&args.answer)
    };
    emit_json(serde_json::json!({
        "segmented": args.segmented,
        "claim_count": claims.len(),
        "claims": claims
    }))
}

fn run_citations_parse(args: &AnswerTextArgs) -> Result<()> {
    let map = if args.segmented {
        citation_map_from_segments(&segment_answer(&args.answer))
    } else {
        parse_citations(&args.answer)
    };
    emit_json(serde_json::json!({
        "segmented": args.segmented,
        "entries": map.entries
    }))
}

fn run_gate(api: &AnswerGateApi, args: &GateRunArgs) -> Result<()> {
    let mut request: GateRunRequest = read_json_input(&args.input.input)?;
    if let Some(raw) = args.as_of.as_deref() {
        request.as_of = Some(parse_rfc3339(raw)?);
    }
    let outcome = api.run_gate(request)?;
    emit_json(serde_json::json!({
        "response": outcome.response,
        "trace": outcome.trace
    }))
}

fn run_audit(api: &AnswerGateApi, command: AuditCommand) -> Result<()> {
    match command {
        AuditCommand::List(args) => {
            let filter = TraceFilter {
                allowed: args.allowed,
                failure_layer: args.failure_layer.map(LayerArg::into_layer),
                limit: args.limit,
            };
            let traces = api.list_traces(&filter)?;
            emit_json(serde_json::json!({
                "count": traces.len(),
                "traces": traces
            }))
        }
        AuditCommand::Show(args) => {
            let trace = api.show_trace(&args.query_id)?;
            emit_json(serde_json::to_value(&trace).context("failed to serialize decision trace")?)
        }
        AuditCommand::Summary => {
            let summary = api.audit_summary()?;
            emit_json(serde_json::to_value(&summary).context("failed to serialize audit summary")?)
        }
        AuditCommand::Clear => {
            let deleted = api.clear_traces()?;
            emit_json(serde_json::json!({ "deleted_traces": deleted }))
        }
    }
}

fn run_db(api: &AnswerGateApi, command: DbCommand) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Export(args) => {
            let manifest = api.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "out_dir": args.out,
                "manifest": manifest
            }))
        }
        DbCommand::Import(args) => {
            let summary = api.import_snapshot(&args.input, args.skip_existing)?;
            emit_json(serde_json::json!({
                "in_dir": args.input,
                "skip_existing": args.skip_existing,
                "summary": summary
            }))
        }
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            api.restore_database(&args.input)?;
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let value =
                serde_json::to_value(&report).context("failed to serialize integrity report")?;
            emit_json(value)
        }
    }
}

fn read_json_input<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = if path == Path::new("-") {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer).context("failed to read request from stdin")?;
        buffer
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read request file {}", path.display()))?
    };
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse request JSON from {}", path.display()))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 UTC timestamp: {value}"))?;

    if parsed.offset() != time::UtcOffset::UTC {
        return Err(anyhow!("timestamp MUST use UTC offset Z (received: {value})"));
    }

    Ok(parsed)
}
