//! Generic supervision: a non-RDFox command with a custom readiness line.

#![cfg(unix)]

use std::io::Read;
use std::sync::{Arc, Mutex};

use rdfox_runner::core::types::CommandSpec;
use rdfox_runner::io::readiness::MarkerCheck;
use rdfox_runner::test_support::fast_config;
use rdfox_runner::{InputSpec, RunBuilder, RunnerConfig};

fn serve_dir() -> RunBuilder {
    RunBuilder::new(fast_config(env!("CARGO_BIN_EXE_stub-rdfox")))
        .input(InputSpec::text("a.txt", "hello world"))
        .input(InputSpec::reader("nested/b.txt", &b"from a stream"[..]))
        .command(CommandSpec::new(env!("CARGO_BIN_EXE_stub-rdfox")).arg("serve-dir"))
        .endpoint_with(MarkerCheck::new(r"Serving directory .* on port (\d+)").expect("regex"))
}

fn fetch(url: &str) -> Result<String, ureq::Error> {
    let mut body = String::new();
    ureq::get(url)
        .call()?
        .into_reader()
        .read_to_string(&mut body)
        .expect("read body");
    Ok(body)
}

#[test]
fn serves_staged_files_until_closed() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut run = serve_dir()
        .on_line(move |line| sink.lock().expect("lock").push(line.to_string()))
        .start()
        .expect("start");
    assert!(run.is_alive());

    let base = run.endpoint().expect("endpoint").base_url().to_string();
    assert_eq!(fetch(&format!("{base}/a.txt")).expect("a.txt"), "hello world");
    assert_eq!(
        fetch(&format!("{base}/nested/b.txt")).expect("b.txt"),
        "from a stream"
    );

    let dir = run.working_dir().to_path_buf();
    run.close().expect("close");

    assert!(!dir.exists());
    assert!(fetch(&format!("{base}/a.txt")).is_err());
    let seen = seen.lock().expect("lock");
    assert!(seen.iter().any(|line| line.starts_with("Serving directory")));
}

#[test]
fn closing_stdin_lets_server_exit() {
    let mut run = serve_dir().start().expect("start");
    run.close_stdin();
    // The server exits on stdin EOF.
    let code = run.wait(None).expect("wait");
    assert_eq!(code, Some(0));
    assert!(!run.is_alive());
    run.close().expect("close");
}

#[test]
fn kept_working_dir_survives_close() {
    let config = RunnerConfig {
        keep_working_dir: true,
        ..fast_config(env!("CARGO_BIN_EXE_stub-rdfox"))
    };
    let run = RunBuilder::new(config)
        .input(InputSpec::text("a.txt", "kept"))
        .command(CommandSpec::shell("true"))
        .wait_before_enter(true)
        .start()
        .expect("start");
    let dir = run.working_dir().to_path_buf();
    run.close().expect("close");

    assert_eq!(std::fs::read_to_string(dir.join("a.txt")).expect("read"), "kept");
    std::fs::remove_dir_all(&dir).expect("cleanup");
}

#[test]
fn dropping_a_run_tears_it_down() {
    let run = serve_dir().start().expect("start");
    let dir = run.working_dir().to_path_buf();
    let base = run.endpoint().expect("endpoint").base_url().to_string();
    drop(run);
    assert!(!dir.exists());
    assert!(fetch(&format!("{base}/a.txt")).is_err());
}
