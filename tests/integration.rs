use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn exg_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("exg");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let records_dir = root.join("records");
    fs::create_dir_all(&records_dir).unwrap();

    fs::write(
        records_dir.join("invoice.json"),
        r#"{
  "document_fingerprint": "sha256-abc",
  "fields": {
    "subtotal": { "data": { "kind": "amount", "value": 100.0 }, "confidence": 0.9, "provenance": "document_analysis" }
  },
  "line_items": [ { "amount": 60.0 }, { "amount": 39.99 } ]
}"#,
    )
    .unwrap();

    fs::write(
        records_dir.join("analysis.json"),
        r#"{
  "fields": {
    "invoice_number": { "data": { "kind": "text", "value": "INV-42" }, "confidence": 0.97, "provenance": "document_analysis" },
    "subtotal": { "data": { "kind": "amount", "value": 100.0 }, "confidence": 0.95, "provenance": "document_analysis" }
  },
  "line_items": [ { "amount": 60.0 }, { "amount": 40.0 } ],
  "text": "Invoice INV-42"
}"#,
    )
    .unwrap();

    fs::write(records_dir.join("scan.pdf"), b"%PDF-1.4 fake document bytes").unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/exg.sqlite"

[fallback]
enabled = false

[server]
bind = "127.0.0.1:7440"
"#,
        root.display()
    );

    let config_path = config_dir.join("exg.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_exg(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = exg_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run exg binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn records_file(config_path: &Path, name: &str) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("records")
        .join(name)
        .display()
        .to_string()
}

/// Init and ingest the sample invoice; returns the new record id.
fn ingest_sample(config_path: &Path) -> String {
    let (_, stderr, success) = run_exg(config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    let (stdout, stderr, success) = run_exg(
        config_path,
        &["ingest", &records_file(config_path, "invoice.json")],
    );
    assert!(success, "ingest failed: {}", stderr);
    stdout.trim().to_string()
}

#[test]
fn test_init_creates_database() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_exg(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_exg(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_exg(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_and_show() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);
    assert!(!id.is_empty());

    let (stdout, _, success) = run_exg(&config_path, &["show", &id]);
    assert!(success);
    let record: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(record["processing_state"], "PENDING");
    assert_eq!(record["review_version"], 0);
    assert_eq!(record["document_fingerprint"], "sha256-abc");
}

#[test]
fn test_ingest_with_document_fingerprints_bytes() {
    let (_tmp, config_path) = setup_test_env();
    run_exg(&config_path, &["init"]);
    let (stdout, _, success) = run_exg(
        &config_path,
        &[
            "ingest",
            &records_file(&config_path, "invoice.json"),
            "--document",
            &records_file(&config_path, "scan.pdf"),
        ],
    );
    assert!(success);
    let (shown, _, _) = run_exg(&config_path, &["show", stdout.trim()]);
    let record: serde_json::Value = serde_json::from_str(&shown).unwrap();
    let fingerprint = record["document_fingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.len(), 64);
    assert_ne!(fingerprint, "sha256-abc");
}

#[test]
fn test_show_missing_record() {
    let (_tmp, config_path) = setup_test_env();
    run_exg(&config_path, &["init"]);

    let (_, stderr, success) = run_exg(&config_path, &["show", "nonexistent-id"]);
    assert!(!success, "show with missing ID should fail");
    assert!(
        stderr.contains("not found"),
        "Should report not found, got: {}",
        stderr
    );
}

#[test]
fn test_second_claim_fails_with_state_conflict() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (stdout, _, success) = run_exg(&config_path, &["claim", &id]);
    assert!(success);
    assert!(stdout.contains("claimed"));

    let (_, stderr, success) = run_exg(&config_path, &["claim", &id]);
    assert!(!success);
    assert!(stderr.contains("state_conflict"), "got: {}", stderr);
}

#[test]
fn test_transition_follows_lifecycle() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (_, stderr, success) = run_exg(
        &config_path,
        &["transition", &id, "--from", "PENDING", "--to", "STAGED"],
    );
    assert!(!success);
    assert!(stderr.contains("illegal transition"), "got: {}", stderr);

    let (_, _, success) = run_exg(
        &config_path,
        &["transition", &id, "--from", "PENDING", "--to", "PROCESSING"],
    );
    assert!(success);

    let (_, _, success) = run_exg(
        &config_path,
        &["transition", &id, "--from", "PROCESSING,EXTRACTED", "--to", "ERROR"],
    );
    assert!(success);
}

#[test]
fn test_stale_patch_reports_current_version() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (stdout, stderr, success) = run_exg(
        &config_path,
        &["patch", &id, "--expected-version", "0", "--fields", r#"{"vendor_name": "Acme"}"#],
    );
    assert!(success, "patch failed: {}", stderr);
    assert!(stdout.contains("\"version\": 1"));

    let (_, stderr, success) = run_exg(
        &config_path,
        &["patch", &id, "--expected-version", "0", "--fields", r#"{"vendor_name": "Other"}"#],
    );
    assert!(!success);
    assert!(stderr.contains("version_conflict"), "got: {}", stderr);
    assert!(stderr.contains("current version 1"), "got: {}", stderr);
}

#[test]
fn test_check_reports_subtotal_discrepancy() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (stdout, stderr, success) = run_exg(&config_path, &["check", &id]);
    assert!(success);
    let report: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(report["all_valid"], false);
    assert!(stderr.contains("subtotal"));
}

#[test]
fn test_process_extracts_record() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (stdout, stderr, success) = run_exg(
        &config_path,
        &["process", &id, "--analysis", &records_file(&config_path, "analysis.json")],
    );
    assert!(success, "process failed: {}", stderr);
    let outcome: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(outcome["outcome"], "extracted");
    assert_eq!(outcome["version"], 1);
    assert_eq!(outcome["consistency"]["all_valid"], true);

    let (shown, _, _) = run_exg(&config_path, &["show", &id]);
    let record: serde_json::Value = serde_json::from_str(&shown).unwrap();
    assert_eq!(record["processing_state"], "EXTRACTED");
    assert_eq!(record["fields"]["invoice_number"]["data"]["value"], "INV-42");

    // Already extracted: cannot be claimed again.
    let (_, _, success) = run_exg(
        &config_path,
        &["process", &id, "--analysis", &records_file(&config_path, "analysis.json")],
    );
    assert!(!success);
}

#[test]
fn test_process_with_bad_analysis_moves_to_error() {
    let (_tmp, config_path) = setup_test_env();
    let id = ingest_sample(&config_path);

    let (_, _, success) = run_exg(&config_path, &["process", &id, "--analysis", "/nonexistent.json"]);
    assert!(!success);

    let (shown, _, _) = run_exg(&config_path, &["show", &id]);
    let record: serde_json::Value = serde_json::from_str(&shown).unwrap();
    assert_eq!(record["processing_state"], "ERROR");
}

#[test]
fn test_missing_config_fails() {
    let (_, stderr, success) = run_exg(Path::new("/nonexistent/exg.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
