use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use answer_gate_core::{AuditSink, DecisionTrace, GateError, LayerSignal, PipelineLayer, QueryId};
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 2;
const TRACES_FILE: &str = "decision_traces.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS decision_traces (
  query_id TEXT PRIMARY KEY,
  query_text TEXT NOT NULL,
  allowed INTEGER NOT NULL CHECK (allowed IN (0, 1)),
  presentation_mode TEXT CHECK (presentation_mode IS NULL OR presentation_mode IN ('full','warning','suppressed','debug')),
  failure_layer TEXT CHECK (failure_layer IS NULL OR failure_layer IN ('context','generation','entailment','citation_alignment','presentation')),
  failure_code TEXT,
  refusal_reason TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  recorded_at TEXT NOT NULL,
  trace_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_decision_traces_started_at ON decision_traces(started_at);
CREATE INDEX IF NOT EXISTS idx_decision_traces_failure_layer ON decision_traces(failure_layer);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS layer_signals (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  query_id TEXT NOT NULL,
  position INTEGER NOT NULL CHECK (position >= 0),
  layer TEXT NOT NULL CHECK (layer IN ('context','generation','entailment','citation_alignment','presentation')),
  passed INTEGER NOT NULL CHECK (passed IN (0, 1)),
  failure_code TEXT,
  reason TEXT,
  UNIQUE(query_id, position),
  FOREIGN KEY (query_id) REFERENCES decision_traces(query_id)
);

CREATE INDEX IF NOT EXISTS idx_layer_signals_layer ON layer_signals(layer, passed);
";

/// Append-only `SQLite` store of decision traces.
///
/// The connection sits behind a mutex so one store can serve as a shared [`AuditSink`].
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_traces: usize,
    pub skipped_existing_traces: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

/// Optional narrowing for [`SqliteAuditStore::list_traces`]. Newest traces come first.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TraceFilter {
    pub allowed: Option<bool>,
    pub failure_layer: Option<PipelineLayer>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditSummary {
    pub total_traces: usize,
    pub allowed_traces: usize,
    pub withheld_traces: usize,
    /// Keyed by presentation mode; refused traces count under `none`.
    pub by_mode: BTreeMap<String, usize>,
    pub by_failure_code: BTreeMap<String, usize>,
    /// Every failing signal, not only the one in each trace's failure slot.
    pub failing_signals_by_layer: BTreeMap<String, usize>,
}

impl SqliteAuditStore {
    /// Open the trace database at `path` with WAL journaling and foreign keys on.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or a pragma is rejected.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Where the trace schema stands relative to this build.
    ///
    /// # Errors
    /// Returns an error when the migrations table cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        schema_status(&self.conn.lock())
    }

    /// Bring the trace schema up to date. Already-applied versions are skipped.
    ///
    /// # Errors
    /// Returns an error when a migration statement or its version record fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&conn)?;
        if version == 0 {
            version = bootstrap_schema_version(&conn)?;
        }

        if version < 2 {
            apply_migration_2(&mut conn)?;
            version = current_schema_version(&conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Append one validated trace and its per-layer signal rows.
    ///
    /// # Errors
    /// Returns an error when the trace is structurally invalid, its query id was already
    /// recorded, or any write in the transaction fails.
    pub fn record_trace(&self, trace: &DecisionTrace) -> Result<()> {
        trace.validate().map_err(|err| anyhow!("trace validation failed: {err}"))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start transaction")?;
        if trace_exists(&tx, trace.query_id)? {
            return Err(anyhow!("trace already recorded for query_id {}", trace.query_id));
        }
        insert_trace(&tx, trace)?;
        tx.commit().context("failed to commit trace transaction")?;

        tracing::debug!(
            query_id = %trace.query_id,
            allowed = trace.allowed,
            "decision trace recorded"
        );
        Ok(())
    }

    /// Retrieve one trace by the query it belongs to.
    ///
    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_trace(&self, query_id: QueryId) -> Result<Option<DecisionTrace>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT trace_json FROM decision_traces WHERE query_id = ?1")?;
        let value = stmt
            .query_row(params![query_id.to_string()], |row| row.get::<_, String>(0))
            .optional()?;

        match value {
            Some(json) => {
                let trace =
                    serde_json::from_str(&json).context("failed to deserialize stored trace")?;
                Ok(Some(trace))
            }
            None => Ok(None),
        }
    }

    /// List recorded traces, newest first.
    ///
    /// # Errors
    /// Returns an error when the query or JSON deserialization fails.
    pub fn list_traces(&self, filter: &TraceFilter) -> Result<Vec<DecisionTrace>> {
        let limit = filter.limit.map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trace_json FROM decision_traces
             WHERE (?1 IS NULL OR allowed = ?1)
               AND (?2 IS NULL OR failure_layer = ?2)
             ORDER BY started_at DESC, query_id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![
                filter.allowed.map(i64::from),
                filter.failure_layer.map(PipelineLayer::as_str),
                limit
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut traces = Vec::new();
        for row in rows {
            let raw = row?;
            let parsed = serde_json::from_str::<DecisionTrace>(&raw)
                .context("failed to deserialize trace row")?;
            traces.push(parsed);
        }
        Ok(traces)
    }

    /// Aggregate counts over every recorded trace.
    ///
    /// # Errors
    /// Returns an error when any aggregate query fails.
    pub fn summary(&self) -> Result<AuditSummary> {
        let conn = self.conn.lock();
        let (total, allowed): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(allowed), 0) FROM decision_traces",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("failed to count decision traces")?;
        let total_traces = to_count(total)?;
        let allowed_traces = to_count(allowed)?;

        Ok(AuditSummary {
            total_traces,
            allowed_traces,
            withheld_traces: total_traces - allowed_traces,
            by_mode: grouped_counts(
                &conn,
                "SELECT COALESCE(presentation_mode, 'none'), COUNT(*)
                 FROM decision_traces GROUP BY 1",
            )?,
            by_failure_code: grouped_counts(
                &conn,
                "SELECT failure_code, COUNT(*) FROM decision_traces
                 WHERE failure_code IS NOT NULL GROUP BY failure_code",
            )?,
            failing_signals_by_layer: grouped_counts(
                &conn,
                "SELECT layer, COUNT(*) FROM layer_signals WHERE passed = 0 GROUP BY layer",
            )?,
        })
    }

    /// Delete every recorded trace. Returns how many traces were removed.
    ///
    /// # Errors
    /// Returns an error when the delete transaction fails.
    pub fn clear_traces(&self) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start transaction")?;
        tx.execute("DELETE FROM layer_signals", []).context("failed to clear layer signals")?;
        let removed = tx
            .execute("DELETE FROM decision_traces", [])
            .context("failed to clear decision traces")?;
        tx.commit().context("failed to commit clear transaction")?;
        Ok(removed)
    }

    /// Write `decision_traces.ndjson` (newest first) and a digest manifest into `out_dir`.
    ///
    /// # Errors
    /// Returns an error when a trace cannot be serialized or a file cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let traces = self.list_traces(&TraceFilter::default())?;
        let traces_path = out_dir.join(TRACES_FILE);
        let (sha256, records) = write_ndjson_file(&traces_path, &traces)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest { path: TRACES_FILE.to_string(), sha256, records }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database in one transaction.
    ///
    /// # Errors
    /// Returns an error when migration, manifest verification, parsing, duplicate handling,
    /// or writes fail.
    pub fn import_snapshot(&self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;
        let traces = read_ndjson_file::<DecisionTrace>(&in_dir.join(TRACES_FILE))?;

        let mut summary = ImportSummary { imported_traces: 0, skipped_existing_traces: 0 };
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start import transaction")?;

        for trace in traces {
            if trace_exists(&tx, trace.query_id)? {
                if skip_existing {
                    summary.skipped_existing_traces += 1;
                    continue;
                }
                return Err(anyhow!("trace already exists for query_id {}", trace.query_id));
            }
            trace
                .validate()
                .map_err(|err| anyhow!("imported trace {} is invalid: {err}", trace.query_id))?;
            insert_trace(&tx, &trace)?;
            summary.imported_traces += 1;
        }

        tx.commit().context("failed to commit import transaction")?;
        Ok(summary)
    }

    /// Copy the live trace database to `out_file` through the online backup API.
    ///
    /// # Errors
    /// Returns an error when the parent directory or the backup copy fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .lock()
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Replace the trace database with the contents of `in_file` and migrate it.
    ///
    /// # Errors
    /// Returns an error when `in_file` does not exist or the restore or migration fails.
    pub fn restore_database(&self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .lock()
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Health probes over the trace database: `quick_check`, foreign keys, schema version.
    ///
    /// # Errors
    /// Returns an error when a probe query itself fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status: schema_status(&conn)?,
        })
    }
}

impl AuditSink for SqliteAuditStore {
    fn record(&self, trace: &DecisionTrace) -> std::result::Result<(), GateError> {
        self.record_trace(trace).map_err(|err| GateError::Audit(format!("{err:#}")))
    }
}

fn insert_trace(conn: &Connection, trace: &DecisionTrace) -> Result<()> {
    conn.execute(
        "INSERT INTO decision_traces(
            query_id, query_text, allowed, presentation_mode, failure_layer, failure_code,
            refusal_reason, started_at, finished_at, recorded_at, trace_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            trace.query_id.to_string(),
            trace.query_text,
            i64::from(trace.allowed),
            trace.presentation_mode.map(|mode| mode.as_str()),
            trace.failure_layer.map(PipelineLayer::as_str),
            trace.failure_code.map(|code| code.as_str()),
            trace.refusal_reason,
            rfc3339(trace.timestamps.started_at)?,
            rfc3339(trace.timestamps.finished_at)?,
            now_rfc3339()?,
            serde_json::to_string(trace).context("failed to serialize decision trace")?,
        ],
    )
    .context("failed to insert decision trace")?;

    insert_signals(conn, trace.query_id, &trace.layer_signals)
}

fn insert_signals(conn: &Connection, query_id: QueryId, signals: &[LayerSignal]) -> Result<()> {
    for (position, signal) in signals.iter().enumerate() {
        conn.execute(
            "INSERT INTO layer_signals(query_id, position, layer, passed, failure_code, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                query_id.to_string(),
                i64::try_from(position).context("signal position out of range")?,
                signal.layer.as_str(),
                i64::from(signal.passed),
                signal.failure_code.map(|code| code.as_str()),
                signal.reason,
            ],
        )
        .context("failed to insert layer signal")?;
    }
    Ok(())
}

fn trace_exists(conn: &Connection, query_id: QueryId) -> Result<bool> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM decision_traces WHERE query_id = ?1)",
        params![query_id.to_string()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn grouped_counts(conn: &Connection, sql: &str) -> Result<BTreeMap<String, usize>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
    let mut counts = BTreeMap::new();
    for row in rows {
        let (key, count) = row?;
        counts.insert(key, to_count(count)?);
    }
    Ok(counts)
}

fn to_count(raw: i64) -> Result<usize> {
    usize::try_from(raw).with_context(|| format!("invalid row count: {raw}"))
}

fn schema_status(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let (current_version, inferred_from_legacy) = detect_effective_schema_version(conn)?;
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
    })
}

fn bootstrap_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "decision_traces")? {
        conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
        record_schema_version(conn, 1)?;
        return Ok(1);
    }

    // Tables exist without migration records; infer the version from their shape.
    record_schema_version(conn, 1)?;
    if table_exists(conn, "layer_signals")? {
        record_schema_version(conn, 2)?;
        return Ok(2);
    }
    Ok(1)
}

/// Add the per-layer signal table and backfill it from stored trace JSON.
fn apply_migration_2(conn: &mut Connection) -> Result<()> {
    if table_exists(conn, "layer_signals")? {
        return record_schema_version(conn, 2);
    }

    let tx = conn.transaction().context("failed to start migration v2 transaction")?;
    tx.execute_batch(MIGRATION_002_SQL).context("failed to create layer_signals table")?;

    let stored = {
        let mut stmt =
            tx.prepare("SELECT trace_json FROM decision_traces ORDER BY query_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut stored = Vec::new();
        for row in rows {
            stored.push(row?);
        }
        stored
    };

    for raw in &stored {
        let trace = serde_json::from_str::<DecisionTrace>(raw)
            .context("failed to deserialize trace during migration v2")?;
        insert_signals(&tx, trace.query_id, &trace.layer_signals)?;
    }

    tx.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![2_i64, now_rfc3339()?],
    )
    .context("failed to record migration version 2")?;
    tx.commit().context("failed to commit migration v2")?;

    tracing::info!(backfilled_traces = stored.len(), "applied schema migration v2");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }
    if !table_exists(conn, "decision_traces")? {
        return Ok((0, false));
    }
    if table_exists(conn, "layer_signals")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now_rfc3339()?],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;
    Ok((hex::encode(hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut values = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((hex::encode(hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version <= 0 || manifest.schema_version > LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; supported range is 1..={}",
            manifest.schema_version,
            LATEST_SCHEMA_VERSION
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    let Some(expected) = by_path.get(TRACES_FILE) else {
        return Err(anyhow!("manifest is missing required file entry: {TRACES_FILE}"));
    };
    let file_path = in_dir.join(TRACES_FILE);
    if !file_path.exists() {
        return Err(anyhow!("manifest references missing file {}", file_path.display()));
    }

    let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
    if actual_sha256 != expected.sha256 {
        return Err(anyhow!(
            "manifest digest mismatch for {TRACES_FILE}: expected {}, got {}",
            expected.sha256,
            actual_sha256
        ));
    }
    if actual_records != expected.records {
        return Err(anyhow!(
            "manifest record count mismatch for {TRACES_FILE}: expected {}, got {}",
            expected.records,
            actual_records
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use answer_gate_core::{
        AnswerGate, CandidatePassage, ChunkMetadata, ContextPolicy, EntailmentLabel, FailureCode,
        GateConfig, GateRequest, InMemoryAuditSink, PregeneratedAnswer, ScriptedJudge,
    };
    use time::Duration;
    use ulid::Ulid;

    use super::*;

    const REFUND_TEXT: &str = "Refunds are processed within five business days of approval.";

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn refund_passage() -> CandidatePassage {
        CandidatePassage {
            chunk_id: "c1".to_string(),
            text: REFUND_TEXT.to_string(),
            distance: Some(0.1),
            metadata: ChunkMetadata::default(),
        }
    }

    fn gate(label: EntailmentLabel) -> Result<AnswerGate> {
        let config = GateConfig {
            context: ContextPolicy { min_chars: 20, ..ContextPolicy::default() },
            ..GateConfig::default()
        };
        Ok(AnswerGate::new(config, Box::new(ScriptedJudge::always(label)))?)
    }

    fn gate_trace(
        label: EntailmentLabel,
        answer: &str,
        candidates: Vec<CandidatePassage>,
        offset_secs: i64,
    ) -> Result<DecisionTrace> {
        let request = GateRequest {
            query_id: QueryId::new(),
            query: "How long do refunds take?".to_string(),
            candidates,
            as_of: Some(fixture_time() + Duration::seconds(offset_secs)),
        };
        let outcome =
            gate(label)?.run(request, &PregeneratedAnswer::new(answer), &InMemoryAuditSink::new())?;
        Ok(outcome.trace)
    }

    fn allowed_trace(offset_secs: i64) -> Result<DecisionTrace> {
        gate_trace(
            EntailmentLabel::Entailed,
            "Refunds are processed within five business days of approval [c1].",
            vec![refund_passage()],
            offset_secs,
        )
    }

    fn suppressed_trace(offset_secs: i64) -> Result<DecisionTrace> {
        gate_trace(
            EntailmentLabel::NotEntailed,
            "Refunds are instant [c1].",
            vec![refund_passage()],
            offset_secs,
        )
    }

    fn refused_trace(offset_secs: i64) -> Result<DecisionTrace> {
        gate_trace(EntailmentLabel::Entailed, "Refunds are instant [c1].", Vec::new(), offset_secs)
    }

    fn migrated_store() -> Result<SqliteAuditStore> {
        let store = SqliteAuditStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn count_rows(store: &SqliteAuditStore, table: &str) -> Result<i64> {
        let conn = store.conn.lock();
        Ok(conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
    }

    // Test IDs: TDB-001
    #[test]
    fn record_and_get_trace_round_trip() -> Result<()> {
        let store = migrated_store()?;
        let trace = suppressed_trace(0)?;
        store.record_trace(&trace)?;

        let loaded = store.get_trace(trace.query_id)?;
        assert_eq!(loaded.as_ref(), Some(&trace));
        assert_eq!(
            count_rows(&store, "layer_signals")?,
            i64::try_from(trace.layer_signals.len())?
        );
        assert!(store.get_trace(QueryId::new())?.is_none());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn record_rejects_duplicate_query_and_invalid_trace() -> Result<()> {
        let store = migrated_store()?;
        let trace = allowed_trace(0)?;
        store.record_trace(&trace)?;

        let Err(err) = store.record_trace(&trace) else {
            return Err(anyhow!("expected duplicate trace to be rejected"));
        };
        assert!(err.to_string().contains("trace already recorded"));

        let mut broken = allowed_trace(1)?;
        broken.allowed = false;
        let Err(err) = store.record_trace(&broken) else {
            return Err(anyhow!("expected invalid trace to be rejected"));
        };
        assert!(err.to_string().contains("trace validation failed"));
        assert_eq!(count_rows(&store, "decision_traces")?, 1);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn sqlite_constraints_enforce_checks_and_foreign_keys() -> Result<()> {
        let store = migrated_store()?;
        let conn = store.conn.lock();

        let check_result = conn.execute(
            "INSERT INTO decision_traces(
                query_id, query_text, allowed, presentation_mode, failure_layer, failure_code,
                refusal_reason, started_at, finished_at, recorded_at, trace_json
            ) VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, ?5, ?5, ?5, '{}')",
            params![
                Ulid::new().to_string(),
                "query",
                1_i64,
                "not_a_mode",
                "2026-01-01T00:00:00Z",
            ],
        );
        assert!(check_result.is_err());

        let fk_result = conn.execute(
            "INSERT INTO layer_signals(query_id, position, layer, passed) VALUES (?1, 0, 'context', 1)",
            params![Ulid::new().to_string()],
        );
        assert!(fk_result.is_err());
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn list_traces_filters_and_orders_newest_first() -> Result<()> {
        let store = migrated_store()?;
        let oldest = allowed_trace(0)?;
        let middle = suppressed_trace(10)?;
        let newest = refused_trace(20)?;
        for trace in [&oldest, &middle, &newest] {
            store.record_trace(trace)?;
        }

        let all = store.list_traces(&TraceFilter::default())?;
        let ids = all.iter().map(|trace| trace.query_id).collect::<Vec<_>>();
        assert_eq!(ids, vec![newest.query_id, middle.query_id, oldest.query_id]);

        let allowed = store.list_traces(&TraceFilter { allowed: Some(true), ..TraceFilter::default() })?;
        assert_eq!(allowed.len(), 1);
        assert_eq!(allowed[0].query_id, oldest.query_id);

        let generation = store.list_traces(&TraceFilter {
            failure_layer: Some(PipelineLayer::Generation),
            ..TraceFilter::default()
        })?;
        assert_eq!(generation.len(), 1);
        assert_eq!(generation[0].query_id, newest.query_id);

        let limited = store.list_traces(&TraceFilter { limit: Some(2), ..TraceFilter::default() })?;
        assert_eq!(limited.len(), 2);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn summary_counts_modes_codes_and_failing_layers() -> Result<()> {
        let store = migrated_store()?;
        store.record_trace(&allowed_trace(0)?)?;
        store.record_trace(&allowed_trace(1)?)?;
        store.record_trace(&suppressed_trace(2)?)?;
        store.record_trace(&refused_trace(3)?)?;

        let summary = store.summary()?;
        assert_eq!(summary.total_traces, 4);
        assert_eq!(summary.allowed_traces, 2);
        assert_eq!(summary.withheld_traces, 2);
        assert_eq!(summary.by_mode.get("full"), Some(&2));
        assert_eq!(summary.by_mode.get("suppressed"), Some(&1));
        assert_eq!(summary.by_mode.get("none"), Some(&1));
        assert_eq!(summary.by_failure_code.get(FailureCode::SuppressedByPolicy.as_str()), Some(&1));
        assert_eq!(summary.by_failure_code.get(FailureCode::MissingCitation.as_str()), Some(&1));
        assert_eq!(summary.failing_signals_by_layer.get("entailment"), Some(&1));
        assert_eq!(summary.failing_signals_by_layer.get("context"), Some(&1));
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn migration_v2_backfills_signals_for_legacy_v1_rows() -> Result<()> {
        let store = SqliteAuditStore::open(Path::new(":memory:"))?;
        let trace = suppressed_trace(0)?;
        {
            let conn = store.conn.lock();
            conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
            conn.execute_batch(MIGRATION_001_SQL)?;
            conn.execute(
                "INSERT INTO decision_traces(
                    query_id, query_text, allowed, presentation_mode, failure_layer, failure_code,
                    refusal_reason, started_at, finished_at, recorded_at, trace_json
                ) VALUES (?1, ?2, 0, 'suppressed', 'presentation', 'suppressed_by_policy', NULL, ?3, ?3, ?3, ?4)",
                params![
                    trace.query_id.to_string(),
                    trace.query_text,
                    "2023-11-14T22:13:20Z",
                    serde_json::to_string(&trace)?,
                ],
            )?;
        }

        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert_eq!(status.pending_versions, vec![2]);
        assert!(status.inferred_from_legacy);

        store.migrate()?;
        assert_eq!(store.schema_status()?.current_version, 2);
        assert_eq!(
            count_rows(&store, "layer_signals")?,
            i64::try_from(trace.layer_signals.len())?
        );
        assert_eq!(store.summary()?.failing_signals_by_layer.get("presentation"), Some(&1));
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn export_and_import_snapshot_round_trip() -> Result<()> {
        let source = migrated_store()?;
        let traces = vec![allowed_trace(0)?, suppressed_trace(1)?, refused_trace(2)?];
        for trace in &traces {
            source.record_trace(trace)?;
        }

        let export_dir = std::env::temp_dir().join(format!("answer-gate-export-{}", Ulid::new()));
        let manifest = source.export_snapshot(&export_dir)?;
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 3);
        assert!(export_dir.join("manifest.json").exists());

        let target = SqliteAuditStore::open(Path::new(":memory:"))?;
        let summary = target.import_snapshot(&export_dir, true)?;
        assert_eq!(summary.imported_traces, 3);
        assert_eq!(target.list_traces(&TraceFilter::default())?, source.list_traces(&TraceFilter::default())?);

        let again = target.import_snapshot(&export_dir, true)?;
        assert_eq!(again.imported_traces, 0);
        assert_eq!(again.skipped_existing_traces, 3);
        assert!(target.import_snapshot(&export_dir, false).is_err());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn import_rejects_manifest_digest_mismatch() -> Result<()> {
        use std::io::Write as _;

        let source = migrated_store()?;
        source.record_trace(&allowed_trace(0)?)?;
        let export_dir = std::env::temp_dir().join(format!("answer-gate-export-{}", Ulid::new()));
        source.export_snapshot(&export_dir)?;

        let mut tampered = fs::OpenOptions::new().append(true).open(export_dir.join(TRACES_FILE))?;
        writeln!(tampered, "{{\"tampered\":true}}")?;

        let target = SqliteAuditStore::open(Path::new(":memory:"))?;
        let Err(err) = target.import_snapshot(&export_dir, true) else {
            return Err(anyhow!("expected import failure for mismatched manifest digest"));
        };
        assert!(err.to_string().contains("manifest digest mismatch for decision_traces.ndjson"));
        assert!(target.list_traces(&TraceFilter::default())?.is_empty());

        fs::remove_dir_all(&export_dir).with_context(|| {
            format!("failed to cleanup temp export dir {}", export_dir.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn backup_and_restore_database_round_trip() -> Result<()> {
        let source = migrated_store()?;
        let trace = allowed_trace(0)?;
        source.record_trace(&trace)?;

        let backup_file =
            std::env::temp_dir().join(format!("answer-gate-backup-{}.sqlite3", Ulid::new()));
        source.backup_database(&backup_file)?;

        let target = SqliteAuditStore::open(Path::new(":memory:"))?;
        target.restore_database(&backup_file)?;
        assert_eq!(target.get_trace(trace.query_id)?, Some(trace));

        fs::remove_file(&backup_file).with_context(|| {
            format!("failed to cleanup temp backup file {}", backup_file.display())
        })?;
        Ok(())
    }

    // Test IDs: TDB-010
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let store = migrated_store()?;
        store.record_trace(&suppressed_trace(0)?)?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, 2);
        assert!(report.schema_status.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-011
    #[test]
    fn clear_traces_removes_traces_and_signals() -> Result<()> {
        let store = migrated_store()?;
        store.record_trace(&allowed_trace(0)?)?;
        store.record_trace(&refused_trace(1)?)?;

        assert_eq!(store.clear_traces()?, 2);
        assert_eq!(count_rows(&store, "decision_traces")?, 0);
        assert_eq!(count_rows(&store, "layer_signals")?, 0);
        assert_eq!(store.summary()?.total_traces, 0);
        Ok(())
    }

    // Test IDs: TDB-012
    #[test]
    fn store_records_gate_runs_as_audit_sink() -> Result<()> {
        let store = migrated_store()?;
        let gate = gate(EntailmentLabel::Entailed)?;
        let request = GateRequest {
            query_id: QueryId::new(),
            query: "How long do refunds take?".to_string(),
            candidates: vec![refund_passage()],
            as_of: None,
        };
        let query_id = request.query_id;
        let outcome = gate.run(
            request,
            &PregeneratedAnswer::new("Refunds are processed within five business days of approval [c1]."),
            &store,
        )?;

        assert!(outcome.response.allowed);
        assert_eq!(store.get_trace(query_id)?.as_ref(), Some(&outcome.trace));

        let Err(GateError::Audit(message)) = store.record(&outcome.trace) else {
            return Err(anyhow!("expected duplicate trace to surface as an audit error"));
        };
        assert!(message.contains("trace already recorded"));
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_writes_and_reads_preserve_integrity() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("answer-gate-concurrency-{}.sqlite3", Ulid::new()));
        SqliteAuditStore::open(&db_path)?.migrate()?;

        let writer_threads = 4;
        let writes_per_thread = 10;
        let shared = Arc::new(SqliteAuditStore::open(&db_path)?);
        let mut handles = Vec::new();

        for worker in 0..writer_threads {
            let writer_path = db_path.clone();
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || -> Result<()> {
                let own = SqliteAuditStore::open(&writer_path)?;
                for index in 0..writes_per_thread {
                    let trace = allowed_trace(i64::from(worker * 100 + index))?;
                    if index % 2 == 0 {
                        own.record_trace(&trace)?;
                    } else {
                        shared.record(&trace)?;
                    }
                }
                Ok(())
            }));
        }

        let reader_path = db_path.clone();
        handles.push(thread::spawn(move || -> Result<()> {
            let store = SqliteAuditStore::open(&reader_path)?;
            for _ in 0..20 {
                let _ = store.list_traces(&TraceFilter::default())?;
            }
            Ok(())
        }));

        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            thread_result?;
        }

        let store = SqliteAuditStore::open(&db_path)?;
        let expected = usize::try_from(writer_threads * writes_per_thread)?;
        assert_eq!(store.list_traces(&TraceFilter::default())?.len(), expected);
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());

        drop(shared);
        drop(store);
        for suffix in ["", "-wal", "-shm"] {
            let path = std::path::PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
