//! End-to-end runs against the `stub-rdfox` binary.
//!
//! Each test stages `facts.nt`, starts the stub's REST endpoint through the
//! orchestrator and talks to it with the endpoint client.

#![cfg(unix)]

use std::collections::BTreeSet;

use rdfox_runner::core::results::{AnswerFormat, QueryResult, Term, Triple, parse_ntriples};
use rdfox_runner::endpoint::EndpointError;
use rdfox_runner::error::{ProcessError, RunError};
use rdfox_runner::test_support::{EX, FOAF, endpoint_script, fast_config, people_ntriples};
use rdfox_runner::{InputSpec, Run, RunBuilder, RunnerConfig, with_run};

const NAMES: &str = "SELECT ?name WHERE { ?p foaf:name ?name }";

fn config() -> RunnerConfig {
    fast_config(env!("CARGO_BIN_EXE_stub-rdfox"))
}

fn builder(script: &[&str]) -> RunBuilder {
    RunBuilder::new(config())
        .input(InputSpec::text("facts.nt", people_ntriples()))
        .rdfox_script(script)
        .endpoint()
        .prefix("foaf", FOAF)
        .prefix("ex", EX)
}

fn start() -> Run {
    builder(&endpoint_script()).start().expect("start run")
}

fn names(result: &QueryResult) -> BTreeSet<String> {
    result
        .records()
        .iter()
        .filter_map(|record| record.get("name").map(|t| t.value().to_string()))
        .collect()
}

#[test]
fn query_returns_loaded_facts() {
    let run = start();
    let endpoint = run.endpoint().expect("endpoint");

    let records = endpoint.query_records(NAMES).expect("query");
    assert_eq!(records.len(), 3);
    let json = endpoint.query(NAMES, &AnswerFormat::SparqlJson).expect("json");
    assert_eq!(
        names(&json),
        BTreeSet::from(["Alice".to_string(), "Bob".to_string(), "Carol".to_string()])
    );

    run.close().expect("close");
}

#[test]
fn raw_answer_parses_like_structured_query() {
    let run = start();
    let endpoint = run.endpoint().expect("endpoint");

    let raw = endpoint.query_raw(NAMES, &AnswerFormat::Tsv).expect("raw");
    assert!(raw.content_type.starts_with("text/tab-separated-values"));
    assert!(raw.text().starts_with("?name\n"));
    let from_raw = raw.parse().expect("parse tsv");
    let structured = endpoint.query(NAMES, &AnswerFormat::SparqlJson).expect("json");
    assert_eq!(from_raw, structured);

    run.close().expect("close");
}

#[test]
fn server_info_sets_capabilities() {
    let run = start();
    let info = run.server_info().expect("server info");
    assert_eq!(info.version.as_deref(), Some("7.0-stub"));
    assert!(info.extra.contains_key("edition"));
    assert!(run.capabilities().add_content_operation);
    run.close().expect("close");
}

#[test]
fn add_triples_and_read_facts_back() {
    let run = start();
    let endpoint = run.endpoint().expect("endpoint");

    let dave = Triple::new(
        Term::iri(format!("{EX}dave")),
        Term::iri(format!("{FOAF}name")),
        Term::literal("Dave"),
    );
    endpoint.add_triples(&[dave.clone()]).expect("add");

    let facts = endpoint.facts(&AnswerFormat::NTriples).expect("facts");
    let facts = parse_ntriples(&facts).expect("n-triples");
    assert_eq!(facts.len(), 5);
    assert!(facts.contains(&dave));

    run.close().expect("close");
}

#[test]
fn legacy_service_gets_legacy_add_parameter() {
    let mut script = vec!["set server.version 4.2"];
    script.extend(endpoint_script());
    let run = builder(&script).start().expect("start");

    assert!(!run.capabilities().add_content_operation);
    let endpoint = run.endpoint().expect("endpoint");
    let eve = Triple::new(
        Term::iri(format!("{EX}eve")),
        Term::iri(format!("{FOAF}name")),
        Term::literal("Eve"),
    );
    endpoint.add_triples(&[eve]).expect("add with mode=add");
    assert_eq!(endpoint.query_records(NAMES).expect("query").len(), 4);

    run.close().expect("close");
}

#[test]
fn update_inserts_and_deletes() {
    let run = start();
    let endpoint = run.endpoint().expect("endpoint");
    let ask = "ASK { ex:dave foaf:name \"Dave\" }";

    endpoint
        .update("INSERT DATA { ex:dave foaf:name \"Dave\" }")
        .expect("insert");
    let answer = endpoint.query(ask, &AnswerFormat::SparqlJson).expect("ask");
    assert_eq!(answer, QueryResult::Boolean(true));

    endpoint
        .update("DELETE DATA { ex:dave foaf:name \"Dave\" }")
        .expect("delete");
    let answer = endpoint.query(ask, &AnswerFormat::SparqlJson).expect("ask");
    assert_eq!(answer, QueryResult::Boolean(false));

    run.close().expect("close");
}

#[test]
fn malformed_query_is_a_syntax_error_and_run_survives() {
    let mut run = start();
    let endpoint = run.endpoint().expect("endpoint").clone();

    let err = endpoint
        .query("SELECT ?x WHERE ?x", &AnswerFormat::SparqlJson)
        .expect_err("bad query");
    match err {
        EndpointError::QuerySyntax { query, message } => {
            assert!(query.contains("SELECT ?x WHERE ?x"));
            assert!(query.starts_with("PREFIX foaf:"));
            assert!(message.contains("ParsingException"));
        }
        other => panic!("expected syntax error, got {other:?}"),
    }

    assert!(run.check_health().is_ok());
    assert_eq!(endpoint.query_records(NAMES).expect("query").len(), 3);
    run.close().expect("close");
}

#[test]
fn missing_import_fails_fast() {
    let err = RunBuilder::new(config())
        .rdfox_script(&["dstore create default", "import missing.nt", "endpoint start"])
        .endpoint()
        .start()
        .expect_err("fatal");
    match err {
        RunError::Process(ProcessError::Fatal { line }) => {
            assert!(line.starts_with("An error occurred"), "{line}");
        }
        other => panic!("expected fatal error, got {other:?}"),
    }
}

#[test]
fn teardown_removes_sandbox_and_stops_endpoint() {
    let run = start();
    let dir = run.working_dir().to_path_buf();
    let endpoint = run.endpoint().expect("endpoint").clone();
    assert!(dir.join("facts.nt").exists());
    assert!(dir.join("__master.rdfox").exists());

    run.close().expect("close");
    assert!(!dir.exists());
    assert!(matches!(
        endpoint.query_records(NAMES),
        Err(EndpointError::Transport { .. })
    ));
}

#[test]
fn with_run_returns_body_value() {
    let count = with_run(builder(&endpoint_script()), |run| -> Result<usize, RunError> {
        let endpoint = run.endpoint().expect("endpoint");
        Ok(endpoint.query_records(NAMES)?.len())
    })
    .expect("run");
    assert_eq!(count, 3);
}

#[test]
fn script_answers_are_written_into_the_sandbox() {
    let mut run = RunBuilder::new(config())
        .input(InputSpec::text("facts.nt", people_ntriples()))
        .input(InputSpec::text(
            "names.rq",
            format!("PREFIX foaf: <{FOAF}>\n{NAMES}\n"),
        ))
        .rdfox_script(&[
            "dstore create default",
            "import facts.nt",
            "set output names.tsv",
            "answer names.rq",
            "quit",
        ])
        .wait_before_enter(true)
        .start()
        .expect("start");

    assert_eq!(run.exit_code(), Some(0));
    let answers = run.read_output_string("names.tsv").expect("answers");
    assert!(answers.starts_with("?name\n"));
    assert_eq!(answers.lines().count(), 4);
    assert!(run.transcript().contains("Number of query answers: 3"));
    run.close().expect("close");
}
