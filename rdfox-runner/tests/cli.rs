//! CLI tests for `rdfox-runner run` and `rdfox-runner query`.
//!
//! The stub binary stands in for RDFox through `RDFOX_EXECUTABLE`.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use rdfox_runner::{RunnerConfig, exit_codes};
use rdfox_runner::io::config::ENV_EXECUTABLE;
use rdfox_runner::test_support::{FOAF, people_ntriples};

fn runner(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_rdfox-runner"))
        .current_dir(dir)
        .env(ENV_EXECUTABLE, env!("CARGO_BIN_EXE_stub-rdfox"))
        .args(args)
        .output()
        .expect("run rdfox-runner")
}

fn write(dir: &Path, name: &str, content: &str) {
    fs::write(dir.join(name), content).expect("write fixture");
}

#[test]
fn run_prints_collected_outputs_as_json() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "people.nt", &people_ntriples());
    write(
        dir,
        "names.rq",
        &format!("PREFIX foaf: <{FOAF}>\nSELECT ?name WHERE {{ ?p foaf:name ?name }}\n"),
    );
    write(
        dir,
        "script.rdfox",
        "dstore create default\nimport facts.nt\nset output names.tsv\nanswer names.rq\n",
    );

    let out = runner(
        dir,
        &[
            "run",
            "--input",
            "facts.nt=people.nt",
            "--input",
            "names.rq=names.rq",
            "--script",
            "script.rdfox",
            "--output",
            "names=names.tsv",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));

    let collected: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    let names = collected["names"].as_str().expect("names output");
    assert!(names.starts_with("?name\n"));
    assert_eq!(names.lines().count(), 4);
}

#[test]
fn run_with_fatal_script_exits_with_process_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "script.rdfox", "dstore create default\nimport nowhere.nt\n");

    let out = runner(dir, &["run", "--script", "script.rdfox"]);
    assert_eq!(out.status.code(), Some(exit_codes::PROCESS_FAILED));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("fatal error"), "{stderr}");
}

#[test]
fn run_with_escaping_input_is_invalid() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "script.rdfox", "quit\n");

    let out = runner(
        dir,
        &["run", "--input", "../evil.txt=script.rdfox", "--script", "script.rdfox"],
    );
    assert_eq!(out.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn shell_command_runs_in_working_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "in.txt", "payload");

    let out = runner(
        dir,
        &[
            "run",
            "--input",
            "copy.txt=in.txt",
            "--shell",
            "tr a-z A-Z < copy.txt > upper.txt",
            "--output",
            "upper=upper.txt",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let collected: serde_json::Value = serde_json::from_slice(&out.stdout).expect("json");
    assert_eq!(collected["upper"], "PAYLOAD");
}

#[test]
fn query_prints_raw_answer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "people.nt", &people_ntriples());
    write(
        dir,
        "script.rdfox",
        "dstore create default\nimport facts.nt\nendpoint start\n",
    );

    let query = format!("PREFIX foaf: <{FOAF}>\nSELECT ?name WHERE {{ ?p foaf:name ?name }}");
    let out = runner(
        dir,
        &[
            "query",
            "--input",
            "facts.nt=people.nt",
            "--script",
            "script.rdfox",
            "--query",
            &query,
            "--format",
            "text/tab-separated-values",
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.starts_with("?name\n"));
    assert!(stdout.contains("\"Alice\""));
}

#[test]
fn malformed_query_exits_with_endpoint_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    write(dir, "script.rdfox", "dstore create default\nendpoint start\n");

    let out = runner(
        dir,
        &["query", "--script", "script.rdfox", "--query", "SELECT ?x WHERE ?x"],
    );
    assert_eq!(out.status.code(), Some(exit_codes::ENDPOINT));
}

#[test]
fn init_config_writes_effective_config_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let args = ["--config", "conf/runner.toml", "init-config"];

    let out = runner(dir, &args);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let written = fs::read_to_string(dir.join("conf/runner.toml")).expect("config");
    let config: RunnerConfig = toml::from_str(&written).expect("toml");
    assert_eq!(config.executable, env!("CARGO_BIN_EXE_stub-rdfox"));

    let again = runner(dir, &args);
    assert_eq!(again.status.code(), Some(exit_codes::INVALID));
    let forced = runner(dir, &["--config", "conf/runner.toml", "init-config", "--force"]);
    assert!(forced.status.success());
}
