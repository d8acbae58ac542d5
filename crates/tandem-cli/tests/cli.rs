//! End-to-end tests for the `tandem` binary.

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const SCENARIO: &str = r#"{
    "id": "cli-1",
    "tables": [{
        "name": "orders",
        "schema": [{"name": "id", "type": "integer"}, {"name": "amount", "type": "float"}],
        "data": [{"id": 1, "amount": 12.5}, {"id": 2, "amount": 7.0}, {"id": 3, "amount": 30.0}]
    }]
}"#;

fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

fn tandem() -> Command {
    Command::cargo_bin("tandem").unwrap()
}

fn results(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn test_run_sql_and_script_cells() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);

    let output = tandem()
        .arg("run")
        .arg(&scenario)
        .args(["-c", "sql:CREATE TABLE big AS SELECT * FROM orders WHERE amount > 10"])
        .args(["-c", "script:big.len()"])
        .args(["-c", "script:let top = orders.sort_by(\"amount\", false).head(1);\\ntop[0].id"])
        .args(["-c", "sql:SELECT id FROM top"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let results = results(&output.stdout);
    assert_eq!(results.len(), 4);
    assert_eq!(results[0]["type"], "text");
    assert_eq!(results[1]["data"], "2");
    assert_eq!(results[2]["data"], "3");
    assert_eq!(results[3]["type"], "table");
    // mirrored numbers are stored as REAL
    assert_eq!(results[3]["data"][0]["id"].as_f64(), Some(3.0));
}

#[test]
fn test_failed_cell_sets_exit_status() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);

    tandem()
        .arg("run")
        .arg(&scenario)
        .args(["-c", "sql:SELECT * FROM missing"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("\"type\":\"error\""))
        .stderr(predicate::str::contains("1 of 1 cells failed"));
}

#[test]
fn test_config_applies_preview_cap() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);
    let config = write(&dir, "config.json", r#"{"preview_rows": 1}"#);

    let output = tandem()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&scenario)
        .args(["-c", "sql:SELECT * FROM orders"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let results = results(&output.stdout);
    assert_eq!(results[0]["data"].as_array().unwrap().len(), 1);
    assert_eq!(results[0]["totalRows"], 3);
}

#[test]
fn test_symbols_lists_columns() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);

    tandem()
        .arg("symbols")
        .arg(&scenario)
        .args(["--lang", "sql"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"tables\""))
        .stdout(predicate::str::contains("\"amount\""));
}

#[test]
fn test_status_reports_prelude_failure() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);
    let config = write(&dir, "config.json", r#"{"prelude": "let = ;"}"#);

    tandem()
        .arg("status")
        .arg(&scenario)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"error\""));
}

#[test]
fn test_status_ready() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", SCENARIO);

    tandem()
        .arg("status")
        .arg(&scenario)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"status\": \"ready\""));
}

#[test]
fn test_malformed_scenario_is_reported() {
    let dir = TempDir::new().unwrap();
    let scenario = write(&dir, "scenario.json", r#"{"id": "x"}"#);

    tandem()
        .arg("status")
        .arg(&scenario)
        .assert()
        .failure()
        .stderr(predicate::str::contains("neither `tables` nor `sampleData`"));
}
