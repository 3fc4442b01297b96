//! Line-oriented shell understanding a small subset of RDFox commands.
//!
//! Output mimics RDFox closely enough for the runner's fatal-error and
//! readiness patterns: failures print `An error occurred while executing the
//! command:` followed by the cause, and `endpoint start` prints the
//! "REST endpoint was successfully started" line with the bound port.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use rdfox_runner::core::results::parse_ntriples;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::query::{evaluate, parse_query, render};
use crate::server::{Store, rest_router};

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The command failed; `on-error stop` ends the current script.
    Failed,
    Exit(i32),
}

pub struct Shell {
    store: Store,
    active: Option<String>,
    stop_on_error: bool,
    port: u16,
    answer_format: String,
    output: Option<PathBuf>,
    server: Option<JoinHandle<()>>,
}

impl Default for Shell {
    fn default() -> Self {
        Self::new()
    }
}

impl Shell {
    pub fn new() -> Self {
        Self {
            store: Store::new(),
            active: None,
            stop_on_error: true,
            port: 0,
            answer_format: "text/tab-separated-values".to_string(),
            output: None,
            server: None,
        }
    }

    /// Run every line of a script file. Stops at the first failure when
    /// `on-error` is `stop`.
    pub async fn exec_file(&mut self, path: &str) -> Flow {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => {
                return self.fail(
                    &format!("exec {path}"),
                    &format!("File with name '{path}' cannot be found."),
                );
            }
        };
        for line in text.lines() {
            match self.execute(line).await {
                Flow::Continue => {}
                Flow::Failed if !self.stop_on_error => {}
                other => return other,
            }
        }
        Flow::Continue
    }

    pub async fn execute(&mut self, line: &str) -> Flow {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Flow::Continue;
        }
        debug!(command = %line, "executing");
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match command {
            "echo" => {
                println!("{rest}");
                Flow::Continue
            }
            "set" => self.set(line, rest),
            "dstore" => self.dstore(line, rest),
            "active" => {
                if self.store.exists(rest) {
                    self.active = Some(rest.to_string());
                    Flow::Continue
                } else {
                    self.fail(line, &format!("Data store '{rest}' is unknown."))
                }
            }
            "import" => self.import(line, rest),
            "answer" => self.answer(line, rest),
            "endpoint" => self.endpoint(line, rest).await,
            "exec" => Box::pin(self.exec_file(rest)).await,
            "sleep" => match rest.parse::<u64>() {
                Ok(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Flow::Continue
                }
                Err(_) => self.fail(line, "Expected a number of milliseconds."),
            },
            "quit" => Flow::Exit(0),
            "exit" => Flow::Exit(rest.parse().unwrap_or(1)),
            _ => {
                println!("Error: command '{command}' is unknown.");
                Flow::Failed
            }
        }
    }

    /// Whether the endpoint task is running.
    pub fn serving(&self) -> bool {
        self.server.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn set(&mut self, line: &str, rest: &str) -> Flow {
        let (key, value) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let value = value.trim().trim_matches('"');
        match key {
            "on-error" => match value {
                "stop" => self.stop_on_error = true,
                "continue" => self.stop_on_error = false,
                _ => return self.fail(line, "Expected 'stop' or 'continue'."),
            },
            "endpoint.port" => match value.parse() {
                Ok(port) => self.port = port,
                Err(_) => return self.fail(line, &format!("Invalid port '{value}'.")),
            },
            "query.answer-format" => self.answer_format = value.to_string(),
            "output" => {
                self.output = match value {
                    "" | "out" => None,
                    path => Some(PathBuf::from(path)),
                };
            }
            "server.version" => self.store.set_version(value),
            _ => {}
        }
        println!("{key} = \"{value}\"");
        Flow::Continue
    }

    fn dstore(&mut self, line: &str, rest: &str) -> Flow {
        let mut words = rest.split_whitespace();
        match (words.next(), words.next()) {
            (Some("create"), Some(name)) => {
                if !self.store.create(name) {
                    return self.fail(line, &format!("Data store '{name}' already exists."));
                }
                self.active = Some(name.to_string());
                println!("A new data store '{name}' was created and initialized.");
                Flow::Continue
            }
            _ => self.fail(line, "Expected 'dstore create <name>'."),
        }
    }

    fn import(&mut self, line: &str, rest: &str) -> Flow {
        let Some(active) = self.active.clone() else {
            return self.fail(line, "No data store is active.");
        };
        let path = rest.trim_start_matches('+').trim().trim_matches('"');
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return self.fail(line, &format!("File with name '{path}' cannot be found.")),
        };
        match parse_ntriples(&text) {
            Ok(triples) => {
                let added = self.store.add(&active, triples).unwrap_or_default();
                println!("Adding data on file {path}");
                println!("Import operation took 0.001 s. Processed {added} facts.");
                Flow::Continue
            }
            Err(err) => self.fail(line, &format!("{path}: {err}")),
        }
    }

    fn answer(&mut self, line: &str, rest: &str) -> Flow {
        let Some(active) = self.active.clone() else {
            return self.fail(line, "No data store is active.");
        };
        let text = match fs::read_to_string(rest) {
            Ok(text) => text,
            Err(_) => return self.fail(line, &format!("File with name '{rest}' cannot be found.")),
        };
        let query = match parse_query(&text) {
            Ok(q) => q,
            Err(message) => return self.fail(line, &format!("ParsingException: {message}")),
        };
        let facts = self.store.facts(&active).unwrap_or_default();
        let result = evaluate(&query, &facts);
        let Some(body) = render(&result, &self.answer_format) else {
            return self.fail(line, &format!("Unknown answer format '{}'.", self.answer_format));
        };
        match &self.output {
            Some(path) => {
                if let Err(err) = fs::write(path, &body) {
                    return self.fail(line, &format!("Cannot write '{}': {err}", path.display()));
                }
            }
            None => print!("{body}"),
        }
        println!("Number of query answers: {}", result.len());
        Flow::Continue
    }

    async fn endpoint(&mut self, line: &str, rest: &str) -> Flow {
        match rest {
            "start" => {
                if self.serving() {
                    return self.fail(line, "The endpoint is already running.");
                }
                let listener = match TcpListener::bind(("127.0.0.1", self.port)).await {
                    Ok(l) => l,
                    Err(err) => {
                        error!(err = %err, port = self.port, "bind failed");
                        println!(
                            "The server could not start listening on port {}: {err}",
                            self.port
                        );
                        return Flow::Failed;
                    }
                };
                let port = match listener.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(err) => return self.fail(line, &err.to_string()),
                };
                let app = rest_router(self.store.clone());
                self.server = Some(tokio::spawn(async move {
                    if let Err(err) = axum::serve(listener, app).await {
                        error!(err = %err, "endpoint stopped");
                    }
                }));
                println!(
                    "The REST endpoint was successfully started at port number/service name {port} with 1 threads."
                );
                Flow::Continue
            }
            "stop" => {
                if let Some(handle) = self.server.take() {
                    handle.abort();
                }
                println!("The REST endpoint was successfully stopped.");
                Flow::Continue
            }
            _ => self.fail(line, "Expected 'endpoint start' or 'endpoint stop'."),
        }
    }

    fn fail(&self, line: &str, cause: &str) -> Flow {
        println!("An error occurred while executing the command:");
        println!("    {line}");
        println!("{cause}");
        Flow::Failed
    }
}
