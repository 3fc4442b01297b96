//! Test-only helpers: fast configs and a small RDF fixture.

use std::path::Path;

use crate::core::results::{Term, Triple};
use crate::io::config::RunnerConfig;

pub const FOAF: &str = "http://xmlns.com/foaf/0.1/";
pub const EX: &str = "http://example.org/";

/// Config with short timeouts, running `executable` as RDFox.
pub fn fast_config(executable: impl AsRef<Path>) -> RunnerConfig {
    RunnerConfig {
        executable: executable.as_ref().display().to_string(),
        readiness_timeout_secs: 10,
        grace_period_secs: 2,
        poll_interval_ms: 10,
        command_timeout_secs: 20,
        http_timeout_secs: 5,
        ..RunnerConfig::default()
    }
}

/// Three people, two of whom know each other, as N-Triples.
pub fn people_ntriples() -> String {
    let mut doc = String::new();
    for triple in people() {
        doc.push_str(&triple.to_ntriples());
        doc.push('\n');
    }
    doc
}

pub fn people() -> Vec<Triple> {
    let person = |name: &str| Term::iri(format!("{EX}{name}"));
    let foaf = |local: &str| Term::iri(format!("{FOAF}{local}"));
    vec![
        Triple::new(person("alice"), foaf("name"), Term::literal("Alice")),
        Triple::new(person("bob"), foaf("name"), Term::literal("Bob")),
        Triple::new(person("carol"), foaf("name"), Term::literal("Carol")),
        Triple::new(person("alice"), foaf("knows"), person("bob")),
    ]
}

/// Script that loads `facts.nt` into a fresh datastore and starts the endpoint.
pub fn endpoint_script() -> Vec<&'static str> {
    vec![
        "dstore create default",
        "import facts.nt",
        "set endpoint.port 0",
        "endpoint start",
    ]
}
