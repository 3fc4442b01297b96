//! REST endpoint and static file server.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use rdfox_runner::core::results::{AnswerFormat, Triple, parse_ntriples, to_ntriples_document};
use rdfox_runner::core::version::{Capabilities, ServiceVersion};
use serde_json::json;
use tower_http::services::ServeDir;
use tracing::{debug, warn};

use crate::query::{Update, evaluate, parse_query, parse_update, render};

pub const DEFAULT_VERSION: &str = "7.0-stub";

/// Datastores and server settings shared by the shell and the endpoint.
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<Mutex<StoreState>>,
}

#[derive(Debug)]
struct StoreState {
    version: String,
    datastores: BTreeMap<String, Vec<Triple>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreState {
                version: DEFAULT_VERSION.to_string(),
                datastores: BTreeMap::new(),
            })),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut StoreState) -> T) -> T {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn set_version(&self, version: &str) {
        self.with(|s| s.version = version.to_string());
    }

    pub fn version(&self) -> String {
        self.with(|s| s.version.clone())
    }

    /// Returns `false` if the datastore already exists.
    pub fn create(&self, name: &str) -> bool {
        self.with(|s| {
            if s.datastores.contains_key(name) {
                return false;
            }
            s.datastores.insert(name.to_string(), Vec::new());
            true
        })
    }

    pub fn exists(&self, name: &str) -> bool {
        self.with(|s| s.datastores.contains_key(name))
    }

    /// Add triples, skipping duplicates. Returns how many were new.
    pub fn add(&self, name: &str, triples: Vec<Triple>) -> Option<usize> {
        self.with(|s| {
            let facts = s.datastores.get_mut(name)?;
            let before = facts.len();
            for triple in triples {
                if !facts.contains(&triple) {
                    facts.push(triple);
                }
            }
            Some(facts.len() - before)
        })
    }

    pub fn remove(&self, name: &str, triples: &[Triple]) -> Option<usize> {
        self.with(|s| {
            let facts = s.datastores.get_mut(name)?;
            let before = facts.len();
            facts.retain(|t| !triples.contains(t));
            Some(before - facts.len())
        })
    }

    pub fn facts(&self, name: &str) -> Option<Vec<Triple>> {
        self.with(|s| s.datastores.get(name).cloned())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

pub fn rest_router(store: Store) -> Router {
    Router::new()
        .route("/", get(server_info))
        .route(
            "/datastores/{ds}/sparql",
            get(sparql_query).post(sparql_update),
        )
        .route("/datastores/{ds}/content", get(content).patch(add_content))
        .with_state(store)
}

pub fn static_router(root: PathBuf) -> Router {
    Router::new().fallback_service(ServeDir::new(root))
}

async fn server_info(State(store): State<Store>) -> Json<serde_json::Value> {
    Json(json!({ "version": store.version(), "edition": "stub" }))
}

async fn sparql_query(
    State(store): State<Store>,
    Path(ds): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let Some(facts) = store.facts(&ds) else {
        return unknown_datastore(&ds);
    };
    let Some(text) = params.get("query") else {
        return (StatusCode::BAD_REQUEST, "Missing 'query' parameter.").into_response();
    };
    let query = match parse_query(text) {
        Ok(q) => q,
        Err(message) => {
            debug!(message = %message, "rejecting query");
            return (StatusCode::BAD_REQUEST, format!("ParsingException: {message}"))
                .into_response();
        }
    };
    let mime = accepted(&headers, "application/sparql-results+json");
    let result = evaluate(&query, &facts);
    match render(&result, &mime) {
        Some(body) => ([(header::CONTENT_TYPE, mime)], body).into_response(),
        None => (
            StatusCode::NOT_ACCEPTABLE,
            format!("Answer format '{mime}' is not supported."),
        )
            .into_response(),
    }
}

async fn sparql_update(
    State(store): State<Store>,
    Path(ds): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !store.exists(&ds) {
        return unknown_datastore(&ds);
    }
    let content_type = header_value(&headers, header::CONTENT_TYPE.as_str());
    if !content_type.starts_with("application/sparql-update") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Expected application/sparql-update.",
        )
            .into_response();
    }
    match parse_update(&body) {
        Ok(Update::Insert(triples)) => {
            store.add(&ds, triples);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Update::Delete(triples)) => {
            store.remove(&ds, &triples);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(message) => {
            (StatusCode::BAD_REQUEST, format!("ParsingException: {message}")).into_response()
        }
    }
}

async fn content(
    State(store): State<Store>,
    Path(ds): Path<String>,
    headers: HeaderMap,
) -> Response {
    let Some(facts) = store.facts(&ds) else {
        return unknown_datastore(&ds);
    };
    let mime = accepted(&headers, AnswerFormat::NTriples.mime());
    match mime.as_str() {
        "application/n-triples" | "text/turtle" | "text/plain" => {
            ([(header::CONTENT_TYPE, mime)], to_ntriples_document(&facts)).into_response()
        }
        _ => (
            StatusCode::NOT_ACCEPTABLE,
            format!("Format '{mime}' is not supported."),
        )
            .into_response(),
    }
}

/// `PATCH` with the add parameter matching the advertised version.
async fn add_content(
    State(store): State<Store>,
    Path(ds): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: String,
) -> Response {
    if !store.exists(&ds) {
        return unknown_datastore(&ds);
    }
    let capabilities = Capabilities::for_version(ServiceVersion::parse(&store.version()));
    let (key, value) = capabilities.add_content_param();
    if params.get(key).map(String::as_str) != Some(value) {
        warn!(?params, "content PATCH without the expected parameter");
        return (
            StatusCode::BAD_REQUEST,
            format!("Expected parameter {key}={value}."),
        )
            .into_response();
    }
    match parse_ntriples(&body) {
        Ok(triples) => {
            let added = store.add(&ds, triples).unwrap_or_default();
            debug!(added, "content added");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            (StatusCode::BAD_REQUEST, format!("ParsingException: {err}")).into_response()
        }
    }
}

fn unknown_datastore(ds: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        format!("Data store '{ds}' is unknown."),
    )
        .into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// First media type in `Accept`, ignoring parameters; `fallback` for `*/*`.
fn accepted(headers: &HeaderMap, fallback: &str) -> String {
    let accept = header_value(headers, header::ACCEPT.as_str());
    let first = accept
        .split(',')
        .next()
        .and_then(|m| m.split(';').next())
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if first.is_empty() || first == "*/*" {
        fallback.to_string()
    } else {
        first
    }
}
