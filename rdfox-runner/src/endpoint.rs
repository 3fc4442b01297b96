//! Blocking client for the RDFox REST endpoint.
//!
//! Every call is independent: the client holds no connection state beyond the
//! `ureq` agent's pool, so it can be cloned freely and used without a
//! supervised process.

use std::collections::BTreeMap;
use std::io::Read;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, instrument};

use crate::core::results::{
    AnswerFormat, QueryResult, ResultParseError, Term, Triple, to_ntriples_document,
};
use crate::core::version::{Capabilities, ServiceVersion};

pub const DEFAULT_DATASTORE: &str = "default";
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("endpoint returned HTTP {status}: {body}")]
    Query { status: u16, body: String },
    #[error("query could not be parsed: {message}")]
    QuerySyntax { query: String, message: String },
    #[error("could not parse {format} answer")]
    Parse {
        format: String,
        #[source]
        source: ResultParseError,
    },
}

/// Unparsed answer with the content type the service declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAnswer {
    pub content_type: String,
    pub body: Vec<u8>,
}

impl RawAnswer {
    pub fn format(&self) -> AnswerFormat {
        AnswerFormat::from_mime(&self.content_type)
    }

    /// Parse using the declared content type.
    pub fn parse(&self) -> Result<QueryResult, EndpointError> {
        let format = self.format();
        QueryResult::parse(&format, &self.body).map_err(|source| EndpointError::Parse {
            format: format.to_string(),
            source,
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Response of `GET /`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ServerInfo {
    pub fn parsed_version(&self) -> Option<ServiceVersion> {
        self.version.as_deref().and_then(ServiceVersion::parse)
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities::for_version(self.parsed_version())
    }
}

#[derive(Debug, Clone)]
pub struct EndpointClient {
    base: String,
    datastore: String,
    prefixes: Vec<(String, String)>,
    agent: ureq::Agent,
    capabilities: Capabilities,
}

impl EndpointClient {
    /// Client for a service at `base_url` (e.g. `http://127.0.0.1:12110`).
    pub fn new(base_url: impl Into<String>) -> Self {
        let base = base_url.into().trim_end_matches('/').to_string();
        Self {
            base,
            datastore: DEFAULT_DATASTORE.to_string(),
            prefixes: Vec::new(),
            agent: make_agent(DEFAULT_HTTP_TIMEOUT),
            capabilities: Capabilities::default(),
        }
    }

    /// Client for a port number or service name reported by the process.
    pub fn for_service(host: &str, service: &str) -> Self {
        Self::new(format!("http://{host}:{service}"))
    }

    pub fn with_datastore(mut self, datastore: impl Into<String>) -> Self {
        self.datastore = datastore.into();
        self
    }

    /// Bind `prefix:` to `iri` in every query and update.
    pub fn with_prefix(mut self, prefix: impl Into<String>, iri: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let iri = iri.into();
        match self.prefixes.iter_mut().find(|(p, _)| *p == prefix) {
            Some(slot) => slot.1 = iri,
            None => self.prefixes.push((prefix, iri)),
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = make_agent(timeout);
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base
    }

    pub fn datastore(&self) -> &str {
        &self.datastore
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Run a query and parse the answer.
    pub fn query(&self, query: &str, format: &AnswerFormat) -> Result<QueryResult, EndpointError> {
        self.query_raw(query, format)?.parse()
    }

    /// Run a query and return the body untouched.
    #[instrument(skip_all, fields(format = %format))]
    pub fn query_raw(&self, query: &str, format: &AnswerFormat) -> Result<RawAnswer, EndpointError> {
        let full = self.with_prologue(query);
        debug!(query = %full, "sending query");
        let request = self
            .agent
            .get(&self.sparql_url())
            .query("query", &full)
            .set("Accept", format.mime());
        let response = self.send(request, None).map_err(|e| syntax_error(e, &full))?;
        let answer = read_answer(response, format)?;
        debug!(
            content_type = %answer.content_type,
            bytes = answer.body.len(),
            "query answered"
        );
        Ok(answer)
    }

    /// SELECT answers as `variable -> term` maps.
    pub fn query_records(&self, query: &str) -> Result<Vec<BTreeMap<String, Term>>, EndpointError> {
        Ok(self.query(query, &AnswerFormat::SparqlJson)?.records())
    }

    /// Apply a SPARQL update.
    #[instrument(skip_all)]
    pub fn update(&self, update: &str) -> Result<(), EndpointError> {
        let full = self.with_prologue(update);
        debug!(update = %full, "sending update");
        let request = self
            .agent
            .post(&self.sparql_url())
            .set("Content-Type", "application/sparql-update");
        self.send(request, Some(&full))
            .map_err(|e| syntax_error(e, &full))?;
        Ok(())
    }

    /// Add triples to the datastore content.
    #[instrument(skip_all, fields(count = triples.len()))]
    pub fn add_triples(&self, triples: &[Triple]) -> Result<(), EndpointError> {
        let (param, value) = self.capabilities.add_content_param();
        let request = self
            .agent
            .request("PATCH", &self.content_url())
            .query(param, value)
            .set("Content-Type", AnswerFormat::NTriples.mime());
        self.send(request, Some(&to_ntriples_document(triples)))?;
        debug!("triples added");
        Ok(())
    }

    /// All derived and explicit facts, serialized in `format`.
    #[instrument(skip_all, fields(format = %format))]
    pub fn facts(&self, format: &AnswerFormat) -> Result<String, EndpointError> {
        let request = self
            .agent
            .get(&self.content_url())
            .query("fact-domain", "IDB")
            .set("Accept", format.mime());
        let response = self.send(request, None)?;
        let answer = read_answer(response, format)?;
        Ok(answer.text())
    }

    /// Service description from `GET /`.
    pub fn server_info(&self) -> Result<ServerInfo, EndpointError> {
        let url = format!("{}/", self.base);
        let request = self.agent.get(&url).set("Accept", "application/json");
        let response = self.send(request, None)?;
        let answer = read_answer(response, &AnswerFormat::Other("application/json".to_string()))?;
        serde_json::from_slice(&answer.body).map_err(|e| EndpointError::Parse {
            format: answer.content_type,
            source: ResultParseError::from(e),
        })
    }

    fn sparql_url(&self) -> String {
        format!("{}/datastores/{}/sparql", self.base, self.datastore)
    }

    fn content_url(&self) -> String {
        format!("{}/datastores/{}/content", self.base, self.datastore)
    }

    fn with_prologue(&self, text: &str) -> String {
        if self.prefixes.is_empty() {
            return text.to_string();
        }
        let mut out = String::new();
        for (prefix, iri) in &self.prefixes {
            out.push_str(&format!("PREFIX {prefix}: <{iri}>\n"));
        }
        out.push_str(text);
        out
    }

    fn send(
        &self,
        request: ureq::Request,
        body: Option<&str>,
    ) -> Result<ureq::Response, EndpointError> {
        let url = request.url().to_string();
        let result = match body {
            Some(body) => request.send_string(body),
            None => request.call(),
        };
        match result {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                error!(status, url = %url, "endpoint returned an error");
                Err(EndpointError::Query { status, body })
            }
            Err(ureq::Error::Transport(transport)) => {
                debug!(err = %transport, url = %url, "endpoint unreachable");
                Err(EndpointError::Transport {
                    url,
                    source: Box::new(transport),
                })
            }
        }
    }
}

fn make_agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn read_answer(response: ureq::Response, requested: &AnswerFormat) -> Result<RawAnswer, EndpointError> {
    let url = response.get_url().to_string();
    let content_type = response
        .header("Content-Type")
        .map_or_else(|| requested.mime().to_string(), str::to_string);
    let mut body = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut body)
        .map_err(|e| EndpointError::Transport {
            url,
            source: Box::new(e),
        })?;
    Ok(RawAnswer { content_type, body })
}

/// Turn a RDFox `ParsingException` into [`EndpointError::QuerySyntax`] and log
/// the query with line numbers.
fn syntax_error(err: EndpointError, query: &str) -> EndpointError {
    match err {
        EndpointError::Query { status: 400, body } if body.contains("ParsingException") => {
            error!("query error: {}", body.trim_end());
            for (i, line) in query.lines().enumerate() {
                error!("line {}: {}", i + 1, line);
            }
            EndpointError::QuerySyntax {
                query: query.to_string(),
                message: body,
            }
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn urls_follow_datastore() {
        let client = EndpointClient::new("http://127.0.0.1:12110/").with_datastore("family");
        assert_eq!(client.base_url(), "http://127.0.0.1:12110");
        assert_eq!(
            client.sparql_url(),
            "http://127.0.0.1:12110/datastores/family/sparql"
        );
        assert_eq!(
            client.content_url(),
            "http://127.0.0.1:12110/datastores/family/content"
        );
    }

    #[test]
    fn prefixes_are_prepended_once_each() {
        let client = EndpointClient::for_service("localhost", "8080")
            .with_prefix("ex", "http://example.org/old#")
            .with_prefix("foaf", "http://xmlns.com/foaf/0.1/")
            .with_prefix("ex", "http://example.org/#");
        let full = client.with_prologue("SELECT ?s WHERE { ?s a ex:Thing }");
        assert_eq!(
            full,
            "PREFIX ex: <http://example.org/#>\nPREFIX foaf: <http://xmlns.com/foaf/0.1/>\nSELECT ?s WHERE { ?s a ex:Thing }"
        );
    }

    #[test]
    fn parsing_exception_becomes_syntax_error() {
        let err = syntax_error(
            EndpointError::Query {
                status: 400,
                body: "ParsingException: '{' expected.".to_string(),
            },
            "SELECT ?s WHERE",
        );
        match err {
            EndpointError::QuerySyntax { query, message } => {
                assert_eq!(query, "SELECT ?s WHERE");
                assert!(message.contains("'{' expected"));
            }
            other => panic!("unexpected {other:?}"),
        }

        let other = syntax_error(
            EndpointError::Query {
                status: 500,
                body: "ParsingException".to_string(),
            },
            "q",
        );
        assert!(matches!(other, EndpointError::Query { status: 500, .. }));
    }

    #[test]
    fn unreachable_service_is_a_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let client = EndpointClient::for_service("127.0.0.1", &port.to_string())
            .with_timeout(Duration::from_secs(2));
        let err = client
            .query_raw("ASK {}", &AnswerFormat::SparqlJson)
            .expect_err("nothing listening");
        assert!(matches!(err, EndpointError::Transport { .. }), "{err:?}");
    }

    #[test]
    fn raw_answer_parses_by_declared_type() {
        let raw = RawAnswer {
            content_type: "application/sparql-results+json; charset=UTF-8".to_string(),
            body: br#"{"head":{},"boolean":true}"#.to_vec(),
        };
        assert_eq!(raw.parse().expect("parse"), QueryResult::Boolean(true));

        let unknown = RawAnswer {
            content_type: "text/turtle".to_string(),
            body: Vec::new(),
        };
        assert!(matches!(unknown.parse(), Err(EndpointError::Parse { .. })));
    }

    #[test]
    fn server_info_keeps_unknown_fields() {
        let info: ServerInfo =
            serde_json::from_str(r#"{"version":"5.4","edition":"stub"}"#).expect("json");
        assert_eq!(info.parsed_version(), Some(ServiceVersion::new(5, 4, 0)));
        assert_eq!(info.capabilities().add_content_param(), ("operation", "add-content"));
        assert!(info.extra.contains_key("edition"));
    }
}
