use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::{json, Value};

const REFUND_TEXT: &str = "Refunds are processed within five business days of approval.";
const SUPPORTED_ANSWER: &str = "Refunds are processed within five business days of approval [c1].";
const UNSUPPORTED_ANSWER: &str = "Refunds are instant for every order [c1].";
const FIXED_AS_OF: &str = "2023-11-14T22:13:20Z";

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_ag<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_ag"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute ag binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_ag(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "ag command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn as_bool(value: &Value, key: &str) -> bool {
    value
        .get(key)
        .and_then(Value::as_bool)
        .unwrap_or_else(|| panic!("missing boolean field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write {}: {err}", path.display()));
}

/// Config with a minimum context size small enough for one-sentence passages.
fn write_config(sandbox: &Path) -> PathBuf {
    let path = sandbox.join("gate.yaml");
    write_file(&path, "context:\n  min_chars: 20\njudge:\n  kind: literal\n");
    path
}

fn write_gate_request(sandbox: &Path, name: &str, answer: &str) -> PathBuf {
    let path = sandbox.join(name);
    let request = json!({
        "query": "How long do refunds take?",
        "candidates": [
            {"chunk_id": "c1", "text": REFUND_TEXT, "distance": 0.12},
            {"chunk_id": "legal", "text": "Copyright 2024 Example Corp. All rights reserved.", "distance": 0.3}
        ],
        "answer": answer,
        "usage": {"prompt_tokens": 120, "completion_tokens": 18, "total_tokens": 138}
    });
    write_file(&path, &request.to_string());
    path
}

fn gate_run(db: &Path, config: &Path, request: &Path) -> Value {
    run_json([
        "--db",
        path_str(db),
        "--config",
        path_str(config),
        "gate",
        "run",
        "--in",
        path_str(request),
        "--as-of",
        FIXED_AS_OF,
    ])
}

// Test IDs: TCLI-001
#[test]
fn gate_run_presents_supported_answer_and_withholds_unsupported_one() {
    let sandbox = unique_temp_dir("answer-gate-cli-gate");
    let db = sandbox.join("gate.sqlite3");
    let config = write_config(&sandbox);

    let supported = gate_run(&db, &config, &write_gate_request(&sandbox, "ok.json", SUPPORTED_ANSWER));
    assert_eq!(as_str(&supported, "contract_version"), "cli.v1");
    let response = &supported["response"];
    assert!(as_bool(response, "allowed"));
    assert_eq!(as_str(response, "mode"), "full");
    assert_eq!(response["citations"], json!(["c1"]));
    let trace = &supported["trace"];
    assert_eq!(as_str(&trace["timestamps"], "started_at"), FIXED_AS_OF);
    assert_eq!(as_i64(&trace["stats"], "dropped_chunks"), 1);
    assert_eq!(as_i64(&trace["stats"], "total_tokens"), 138);

    let unsupported =
        gate_run(&db, &config, &write_gate_request(&sandbox, "bad.json", UNSUPPORTED_ANSWER));
    let response = &unsupported["response"];
    assert!(!as_bool(response, "allowed"));
    assert!(response["answer_text"].is_null());
    assert!(response["citations"].is_null());
    assert!(!unsupported["trace"]["failure_code"].is_null());

    let refused = gate_run(
        &db,
        &config,
        &write_gate_request(&sandbox, "uncited.json", "Refunds are processed quickly."),
    );
    assert_eq!(as_str(&refused["response"], "refusal_reason"), "missing_or_invalid_citations");
    assert_eq!(as_str(&refused["trace"], "failure_code"), "missing_citation");
    assert!(refused["trace"]["presentation_mode"].is_null());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[test]
fn audit_commands_list_show_summarize_and_clear_traces() {
    let sandbox = unique_temp_dir("answer-gate-cli-audit");
    let db = sandbox.join("audit.sqlite3");
    let config = write_config(&sandbox);

    let shown = gate_run(&db, &config, &write_gate_request(&sandbox, "ok.json", SUPPORTED_ANSWER));
    let _ = gate_run(&db, &config, &write_gate_request(&sandbox, "bad.json", UNSUPPORTED_ANSWER));
    let query_id = as_str(&shown["trace"], "query_id").to_string();

    let listed = run_json(["--db", path_str(&db), "audit", "list"]);
    assert_eq!(as_i64(&listed, "count"), 2);

    let allowed_only = run_json(["--db", path_str(&db), "audit", "list", "--allowed", "true"]);
    assert_eq!(as_i64(&allowed_only, "count"), 1);
    assert_eq!(as_str(&allowed_only["traces"][0], "query_id"), query_id);

    let limited = run_json(["--db", path_str(&db), "audit", "list", "--limit", "1"]);
    assert_eq!(as_i64(&limited, "count"), 1);

    let detail = run_json(["--db", path_str(&db), "audit", "show", "--query-id", &query_id]);
    assert_eq!(as_str(&detail, "query_id"), query_id);
    assert_eq!(detail["layer_signals"], shown["trace"]["layer_signals"]);

    let summary = run_json(["--db", path_str(&db), "audit", "summary"]);
    assert_eq!(as_i64(&summary, "total_traces"), 2);
    assert_eq!(as_i64(&summary, "allowed_traces"), 1);
    assert_eq!(as_i64(&summary, "withheld_traces"), 1);

    let cleared = run_json(["--db", path_str(&db), "audit", "clear"]);
    assert_eq!(as_i64(&cleared, "deleted_traces"), 2);
    let listed = run_json(["--db", path_str(&db), "audit", "list"]);
    assert_eq!(as_i64(&listed, "count"), 0);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn claims_and_citations_commands_need_no_database() {
    let sandbox = unique_temp_dir("answer-gate-cli-text");
    let db = sandbox.join("unused.sqlite3");
    let answer = "Refunds take five days [c1]. I think it may be faster in some regions. Shipping is free [c2, c3].";

    let claims = run_json(["--db", path_str(&db), "claims", "extract", "--answer", answer]);
    assert_eq!(as_i64(&claims, "claim_count"), 2);
    assert_eq!(as_str(&claims["claims"][0], "text"), "Refunds take five days [c1].");
    assert_eq!(as_i64(&claims["claims"][1], "claim_id"), 2);

    let segmented =
        run_json(["--db", path_str(&db), "claims", "extract", "--answer", answer, "--segmented"]);
    assert_eq!(as_i64(&segmented, "claim_count"), 2);
    assert_eq!(as_str(&segmented["claims"][0], "text"), "Refunds take five days.");

    let citations = run_json(["--db", path_str(&db), "citations", "parse", "--answer", answer]);
    let entries = citations["entries"]
        .as_array()
        .unwrap_or_else(|| panic!("entries should be an array: {citations}"));
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1]["citation_ids"], json!(["c2", "c3"]));

    assert!(!db.exists());
    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[test]
fn context_build_reports_admitted_and_dropped_passages() {
    let sandbox = unique_temp_dir("answer-gate-cli-context");
    let db = sandbox.join("unused.sqlite3");
    let config = write_config(&sandbox);
    let request = sandbox.join("context.json");
    write_file(
        &request,
        &json!({
            "query": "How long do refunds take?",
            "candidates": [
                {"chunk_id": "c1", "text": REFUND_TEXT, "distance": 0.1},
                {"chunk_id": "c1", "text": REFUND_TEXT, "distance": 0.2},
                {"chunk_id": "empty", "text": "   "},
                {"chunk_id": "title", "text": "Refund Policy"}
            ]
        })
        .to_string(),
    );

    let pack = run_json([
        "--db",
        path_str(&db),
        "--config",
        path_str(&config),
        "context",
        "build",
        "--in",
        path_str(&request),
    ]);
    assert!(as_bool(&pack, "is_valid"));
    assert_eq!(as_i64(&pack["stats"], "approved_count"), 1);
    assert_eq!(as_i64(&pack["stats"], "dropped_count"), 3);
    let dropped_reasons = pack["dropped_chunks"]
        .as_array()
        .unwrap_or_else(|| panic!("dropped_chunks should be an array: {pack}"))
        .iter()
        .map(|chunk| as_str(chunk, "reason").to_string())
        .collect::<Vec<_>>();
    assert!(dropped_reasons.contains(&"duplicate chunk_id".to_string()));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-005, TCLI-006
#[test]
fn db_commands_cover_migrate_integrity_backup_restore_export_import() {
    let sandbox = unique_temp_dir("answer-gate-cli-db");
    let db_a = sandbox.join("a.sqlite3");
    let db_b = sandbox.join("b.sqlite3");
    let export_dir = sandbox.join("export");
    let backup_file = sandbox.join("backup.sqlite3");
    let config = write_config(&sandbox);

    let schema_before = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db_a), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run["would_apply_versions"], json!([1, 2]));
    let schema_after_dry_run = run_json(["--db", path_str(&db_a), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_after_dry_run, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db_a), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let _ = gate_run(&db_a, &config, &write_gate_request(&sandbox, "ok.json", SUPPORTED_ANSWER));

    let integrity = run_json(["--db", path_str(&db_a), "db", "integrity-check"]);
    assert!(as_bool(&integrity, "quick_check_ok"));

    let exported = run_json(["--db", path_str(&db_a), "db", "export", "--out", path_str(&export_dir)]);
    assert!(export_dir.join("manifest.json").exists());
    assert!(exported["manifest"].is_object());

    let imported =
        run_json(["--db", path_str(&db_b), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(&imported["summary"], "imported_traces"), 1);
    let reimported =
        run_json(["--db", path_str(&db_b), "db", "import", "--in", path_str(&export_dir)]);
    assert_eq!(as_i64(&reimported["summary"], "skipped_existing_traces"), 1);

    let backup =
        run_json(["--db", path_str(&db_a), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");

    let _ = run_json(["--db", path_str(&db_a), "audit", "clear"]);
    let restored =
        run_json(["--db", path_str(&db_a), "db", "restore", "--in", path_str(&backup_file)]);
    assert_eq!(as_i64(&restored, "current_version"), 2);
    let listed = run_json(["--db", path_str(&db_a), "audit", "list"]);
    assert_eq!(as_i64(&listed, "count"), 1);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-007
#[test]
fn malformed_inputs_fail_with_nonzero_status() {
    let sandbox = unique_temp_dir("answer-gate-cli-errors");
    let db = sandbox.join("errors.sqlite3");

    let bad_id = run_ag(["--db", path_str(&db), "audit", "show", "--query-id", "not-a-ulid"]);
    assert!(!bad_id.status.success());
    assert!(String::from_utf8_lossy(&bad_id.stderr).contains("query_id MUST be a ULID"));

    let toml = sandbox.join("gate.toml");
    write_file(&toml, "context = {}");
    let bad_config =
        run_ag(["--db", path_str(&db), "--config", path_str(&toml), "audit", "summary"]);
    assert!(!bad_config.status.success());
    assert!(String::from_utf8_lossy(&bad_config.stderr).contains("unsupported config extension"));

    let request = write_gate_request(&sandbox, "ok.json", SUPPORTED_ANSWER);
    let bad_time = run_ag([
        "--db",
        path_str(&db),
        "gate",
        "run",
        "--in",
        path_str(&request),
        "--as-of",
        "2023-11-14T22:13:20+02:00",
    ]);
    assert!(!bad_time.status.success());
    assert!(String::from_utf8_lossy(&bad_time.stderr).contains("timestamp MUST use UTC offset Z"));

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCON-001
#[test]
fn cli_outputs_validate_against_versioned_schemas() {
    let sandbox = unique_temp_dir("answer-gate-contract-schemas");
    let db = sandbox.join("schema.sqlite3");
    let config = write_config(&sandbox);

    let schema_version = run_json(["--db", path_str(&db), "db", "schema-version"]);
    validate_schema("db-schema-version.response.schema.json", &schema_version);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    validate_schema("db-migrate.response.schema.json", &dry_run);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    validate_schema("db-migrate.response.schema.json", &migrate);

    let claims = run_json([
        "--db",
        path_str(&db),
        "claims",
        "extract",
        "--answer",
        SUPPORTED_ANSWER,
        "--segmented",
    ]);
    validate_schema("claims-extract.response.schema.json", &claims);

    let shown = gate_run(&db, &config, &write_gate_request(&sandbox, "ok.json", SUPPORTED_ANSWER));
    validate_schema("gate-run.response.schema.json", &shown);
    let refused = gate_run(
        &db,
        &config,
        &write_gate_request(&sandbox, "uncited.json", "Refunds are processed quickly."),
    );
    validate_schema("gate-run.response.schema.json", &refused);

    let query_id = as_str(&shown["trace"], "query_id").to_string();
    let detail = run_json(["--db", path_str(&db), "audit", "show", "--query-id", &query_id]);
    validate_schema("decision-trace.response.schema.json", &detail);

    let summary = run_json(["--db", path_str(&db), "audit", "summary"]);
    validate_schema("audit-summary.response.schema.json", &summary);

    let _ = fs::remove_dir_all(&sandbox);
}
