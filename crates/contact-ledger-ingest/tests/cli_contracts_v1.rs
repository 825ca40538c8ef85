#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use ulid::Ulid;

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_contact-ledger"))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("contact-ledger-contract-{label}-{}.sqlite3", Ulid::new()))
}

fn remove_db(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let _ = fs::remove_file(format!("{}{suffix}", path.display()));
    }
}

fn ledger_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(binary_path());
    command
        .env_remove("RUST_LOG")
        .env_remove("CONTACT_LEDGER_FIELD_MAPPINGS")
        .arg("--db")
        .arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run contact-ledger {:?}: {err}", args),
    }
}

fn ledger_output_with_stdin(db_path: &Path, args: &[&str], stdin: &str) -> Output {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = match Command::new(binary_path())
        .env_remove("RUST_LOG")
        .arg("--db")
        .arg(db_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => panic!("failed to spawn contact-ledger {:?}: {err}", args),
    };

    match child.stdin.take() {
        Some(mut pipe) => {
            if let Err(err) = pipe.write_all(stdin.as_bytes()) {
                panic!("failed to write stdin: {err}");
            }
        }
        None => panic!("stdin was not piped"),
    }

    match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed to wait for contact-ledger: {err}"),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn assert_schema(schema_name: &str, value: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_name);
    let body = fs::read_to_string(&schema_path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", schema_path.display()));
    let schema: Value = serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", schema_path.display()));
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}\nvalue={value}",
            schema_path.display(),
            errors.join("\n")
        );
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["ingest", "submit", "show", "sweep", "--db", "--retention-hours"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain {required}; output={stdout}"
        );
    }
}

#[test]
fn submit_then_show_emits_schema_valid_record() {
    let db_path = temp_db("submit");

    let submitted = ledger_output(
        &db_path,
        &[
            "submit",
            "--source-kind",
            "lifecycle_event",
            "--payload",
            r#"{"contactId":"c1","eventType":"QUEUED","timestamp":"2026-02-07T12:00:00Z","queueInfo":{"queueType":"STANDARD"}}"#,
        ],
    );
    assert!(
        submitted.status.success(),
        "submit failed: {}",
        String::from_utf8_lossy(&submitted.stderr)
    );
    let records = stdout_json(&submitted);
    let records = match records.as_array() {
        Some(values) => values.clone(),
        None => panic!("submit must print an array, got {records}"),
    };
    assert_eq!(records.len(), 1);
    assert_schema("contact-record.schema.json", &records[0]);

    let shown = ledger_output(&db_path, &["show", "--contact-id", "c1"]);
    assert!(shown.status.success());
    let record = stdout_json(&shown);
    assert_schema("contact-record.schema.json", &record);
    assert_eq!(record["contact_id"], json!("c1"));
    assert_eq!(record["revision"], json!(1));
    assert_eq!(record["queued"]["detail"], json!({"queueType": "STANDARD"}));
    assert_eq!(record, records[0]);

    remove_db(&db_path);
}

#[test]
fn show_missing_contact_emits_not_found_envelope() {
    let db_path = temp_db("missing");

    let output = ledger_output(&db_path, &["show", "--contact-id", "nobody"]);
    assert!(!output.status.success());

    let envelope = stdout_json(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    assert_eq!(envelope["error"]["code"], json!("record.not_found"));

    remove_db(&db_path);
}

#[test]
fn submit_malformed_payload_emits_error_envelope() {
    let db_path = temp_db("malformed");

    let output = ledger_output(
        &db_path,
        &[
            "submit",
            "--source-kind",
            "contact_flow_log",
            "--payload",
            r#"{"ContactFlowName":"Main","Timestamp":1}"#,
        ],
    );
    assert!(!output.status.success());

    let envelope = stdout_json(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    assert_eq!(envelope["error"]["code"], json!("event.malformed"));
    assert_eq!(envelope["error"]["details"]["retryable"], json!(false));

    remove_db(&db_path);
}

#[test]
fn ingest_from_stdin_emits_schema_valid_report() {
    let db_path = temp_db("ingest");
    let lines = [
        json!({"source_kind": "lifecycle_event", "payload": {
            "time": "2026-02-07T12:00:50Z",
            "detail": {"contactId": "c2", "eventType": "CONNECTED_TO_AGENT"},
        }}),
        json!({"source_kind": "lifecycle_event", "payload": {
            "contactId": "c2", "eventType": "QUEUED", "timestamp": "2026-02-07T12:00:30Z",
        }}),
        json!({"source_kind": "contact_flow_log", "payload": {"logEvents": [
            {"message": "{\"ContactId\":\"c2\",\"Timestamp\":\"2026-02-07T12:00:40Z\",\"ContactFlowName\":\"Main\"}"},
        ]}}),
        json!({"source_kind": "lifecycle_event", "payload": {"eventType": "QUEUED"}}),
    ];
    let input = lines
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n");

    let output = ledger_output_with_stdin(&db_path, &["ingest", "--workers", "2"], &input);
    assert!(
        output.status.success(),
        "ingest failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report = stdout_json(&output);
    assert_schema("ingest-report.schema.json", &report);
    assert_eq!(report["deliveries"], json!(4));
    assert_eq!(report["merged"], json!(3));
    assert_eq!(report["dropped_malformed"], json!(1));
    assert_eq!(report["failed"], json!(0));

    let shown = ledger_output(&db_path, &["show", "--contact-id", "c2"]);
    let record = stdout_json(&shown);
    assert_schema("contact-record.schema.json", &record);
    assert_eq!(record["latest_status"]["event_type"], json!("CONNECTED_TO_AGENT"));
    assert_eq!(record["latest_contact_flow"]["flow_name"], json!("Main"));

    remove_db(&db_path);
}

#[test]
fn ingest_reads_deliveries_from_input_file() {
    let db_path = temp_db("file");
    let input_path =
        std::env::temp_dir().join(format!("contact-ledger-deliveries-{}.ndjson", Ulid::new()));
    let body = json!({"source_kind": "contact_flow_invocation", "payload": {
        "Details": {
            "ContactData": {"ContactId": "c3"},
            "Parameters": {"Timestamp": "2026-02-07T12:00:00Z", "intent": "billing"},
        },
    }})
    .to_string();
    if let Err(err) = fs::write(&input_path, body) {
        panic!("failed to write deliveries fixture: {err}");
    }

    let input_arg = input_path.to_string_lossy().to_string();
    let output = ledger_output(&db_path, &["ingest", "--input", &input_arg]);
    assert!(output.status.success());
    let report = stdout_json(&output);
    assert_eq!(report["merged"], json!(1));

    let record = stdout_json(&ledger_output(&db_path, &["show", "--contact-id", "c3"]));
    assert_eq!(record["parameters"]["intent"]["value"], json!("billing"));

    remove_db(&db_path);
    let _ = fs::remove_file(&input_path);
}

#[test]
fn sweep_reports_purged_count() {
    let db_path = temp_db("sweep");

    let submitted = ledger_output(
        &db_path,
        &[
            "submit",
            "--source-kind",
            "lifecycle_event",
            "--payload",
            r#"{"contactId":"c4","eventType":"INITIATED","timestamp":1}"#,
        ],
    );
    assert!(submitted.status.success());

    let output = ledger_output(&db_path, &["sweep"]);
    assert!(output.status.success());
    assert_eq!(stdout_json(&output), json!({"purged": 0}));

    remove_db(&db_path);
}

#[test]
fn invalid_configuration_emits_config_invalid_envelope() {
    let db_path = temp_db("config");

    for args in [
        &["--retention-hours", "0", "show", "--contact-id", "c1"][..],
        &["--retention-hours", "0", "sweep"][..],
        &["ingest", "--workers", "0"][..],
    ] {
        let output = ledger_output(&db_path, args);
        assert!(!output.status.success(), "expected failure for {:?}", args);

        let envelope = stdout_json(&output);
        assert_schema("error-envelope.schema.json", &envelope);
        assert_eq!(envelope["error"]["code"], json!("config.invalid"), "args={:?}", args);
        assert_eq!(envelope["error"]["details"]["retryable"], json!(false));
    }
    assert!(!db_path.exists(), "configuration errors must not create the database");

    remove_db(&db_path);
}

#[test]
fn unopenable_database_emits_store_unavailable_envelope() {
    let db_path = std::env::temp_dir()
        .join(format!("contact-ledger-missing-dir-{}", Ulid::new()))
        .join("ledger.sqlite3");

    let output = ledger_output(&db_path, &["show", "--contact-id", "c1"]);
    assert!(!output.status.success());

    let envelope = stdout_json(&output);
    assert_schema("error-envelope.schema.json", &envelope);
    assert_eq!(envelope["error"]["code"], json!("store.unavailable"));
    assert_eq!(envelope["error"]["details"]["retryable"], json!(true));
}
