//! RDF terms and SPARQL answer parsing.
//!
//! Supported answer formats:
//! - `application/sparql-results+json` (bindings and boolean answers)
//! - `text/tab-separated-values` (terms in N-Triples/Turtle syntax)
//! - `text/csv` (plain values; see [`parse_csv`] for how term kinds are guessed)
//! - `application/n-triples` (construct/describe answers and store contents)

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const XSD_INTEGER: &str = "http://www.w3.org/2001/XMLSchema#integer";
pub const XSD_DECIMAL: &str = "http://www.w3.org/2001/XMLSchema#decimal";
pub const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";
pub const XSD_BOOLEAN: &str = "http://www.w3.org/2001/XMLSchema#boolean";

/// An RDF term as it appears in query answers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Term {
    Iri {
        value: String,
    },
    Blank {
        value: String,
    },
    Literal {
        value: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        datatype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
}

impl Term {
    pub fn iri(value: impl Into<String>) -> Self {
        Term::Iri {
            value: value.into(),
        }
    }

    pub fn blank(value: impl Into<String>) -> Self {
        Term::Blank {
            value: value.into(),
        }
    }

    /// Plain literal without datatype or language tag.
    pub fn literal(value: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: None,
            language: None,
        }
    }

    pub fn typed(value: impl Into<String>, datatype: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: Some(datatype.into()),
            language: None,
        }
    }

    pub fn lang(value: impl Into<String>, language: impl Into<String>) -> Self {
        Term::Literal {
            value: value.into(),
            datatype: None,
            language: Some(language.into()),
        }
    }

    pub fn integer(value: i64) -> Self {
        Self::typed(value.to_string(), XSD_INTEGER)
    }

    /// Lexical value: the IRI, the blank node label or the literal text.
    pub fn value(&self) -> &str {
        match self {
            Term::Iri { value } | Term::Blank { value } | Term::Literal { value, .. } => value,
        }
    }

    pub fn is_iri(&self) -> bool {
        matches!(self, Term::Iri { .. })
    }

    /// Integer value of an `xsd:integer` (or untyped numeric) literal.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Term::Literal { value, .. } => value.parse().ok(),
            _ => None,
        }
    }

    /// N-Triples rendering of the term.
    pub fn to_ntriples(&self) -> String {
        match self {
            Term::Iri { value } => format!("<{value}>"),
            Term::Blank { value } => format!("_:{value}"),
            Term::Literal {
                value,
                datatype,
                language,
            } => {
                let mut out = format!("\"{}\"", escape_literal(value));
                if let Some(lang) = language {
                    out.push('@');
                    out.push_str(lang);
                } else if let Some(dt) = datatype {
                    out.push_str("^^<");
                    out.push_str(dt);
                    out.push('>');
                }
                out
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ntriples())
    }
}

/// Subject, predicate, object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Triple {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl Triple {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// One N-Triples statement, terminated by ` .` (no newline).
    pub fn to_ntriples(&self) -> String {
        format!(
            "{} {} {} .",
            self.subject.to_ntriples(),
            self.predicate.to_ntriples(),
            self.object.to_ntriples()
        )
    }
}

/// Serialize triples as an N-Triples document.
pub fn to_ntriples_document(triples: &[Triple]) -> String {
    let mut out = String::new();
    for triple in triples {
        out.push_str(&triple.to_ntriples());
        out.push('\n');
    }
    out
}

/// Answer format requested from the endpoint (sent as `Accept`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AnswerFormat {
    SparqlJson,
    Csv,
    Tsv,
    NTriples,
    /// Any other media type. Raw queries work; structured parsing does not.
    Other(String),
}

impl AnswerFormat {
    pub fn mime(&self) -> &str {
        match self {
            AnswerFormat::SparqlJson => "application/sparql-results+json",
            AnswerFormat::Csv => "text/csv",
            AnswerFormat::Tsv => "text/tab-separated-values",
            AnswerFormat::NTriples => "application/n-triples",
            AnswerFormat::Other(mime) => mime,
        }
    }

    /// Classify a media type, ignoring parameters such as `charset`.
    pub fn from_mime(mime: &str) -> Self {
        let essence = mime
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/sparql-results+json" | "application/json" => AnswerFormat::SparqlJson,
            "text/csv" => AnswerFormat::Csv,
            "text/tab-separated-values" => AnswerFormat::Tsv,
            "application/n-triples" | "text/plain" => AnswerFormat::NTriples,
            _ => AnswerFormat::Other(essence),
        }
    }
}

impl FromStr for AnswerFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from_mime(s))
    }
}

impl fmt::Display for AnswerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// Structured answer to a query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryResult {
    /// SELECT answers. `None` marks an unbound variable.
    Bindings {
        vars: Vec<String>,
        rows: Vec<Vec<Option<Term>>>,
    },
    /// ASK answers.
    Boolean(bool),
    /// CONSTRUCT/DESCRIBE answers.
    Triples(Vec<Triple>),
}

impl QueryResult {
    /// Parse `body` according to `format`.
    pub fn parse(format: &AnswerFormat, body: &[u8]) -> Result<Self, ResultParseError> {
        let text = std::str::from_utf8(body).map_err(|_| ResultParseError::Utf8)?;
        match format {
            AnswerFormat::SparqlJson => parse_sparql_json(text),
            AnswerFormat::Csv => parse_csv(text),
            AnswerFormat::Tsv => parse_tsv(text),
            AnswerFormat::NTriples => parse_ntriples(text).map(QueryResult::Triples),
            AnswerFormat::Other(mime) => Err(ResultParseError::Unsupported(mime.clone())),
        }
    }

    /// Rows as `variable -> term` maps. Unbound variables are left out.
    /// Boolean and triple answers yield no records.
    pub fn records(&self) -> Vec<BTreeMap<String, Term>> {
        match self {
            QueryResult::Bindings { vars, rows } => rows
                .iter()
                .map(|row| {
                    vars.iter()
                        .zip(row)
                        .filter_map(|(var, term)| term.clone().map(|t| (var.clone(), t)))
                        .collect()
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryResult::Bindings { rows, .. } => rows.len(),
            QueryResult::Boolean(_) => 1,
            QueryResult::Triples(triples) => triples.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum ResultParseError {
    #[error("response body is not valid UTF-8")]
    Utf8,
    #[error("malformed SPARQL JSON results")]
    Json(#[from] serde_json::Error),
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("no parser for answer format {0}")]
    Unsupported(String),
}

fn syntax(line: usize, message: impl Into<String>) -> ResultParseError {
    ResultParseError::Syntax {
        line,
        message: message.into(),
    }
}

#[derive(Deserialize)]
struct JsonResults {
    #[serde(default)]
    head: JsonHead,
    #[serde(default)]
    results: Option<JsonBindings>,
    #[serde(default)]
    boolean: Option<bool>,
}

#[derive(Deserialize, Default)]
struct JsonHead {
    #[serde(default)]
    vars: Vec<String>,
}

#[derive(Deserialize)]
struct JsonBindings {
    bindings: Vec<BTreeMap<String, JsonTerm>>,
}

#[derive(Deserialize)]
struct JsonTerm {
    #[serde(rename = "type")]
    kind: String,
    value: String,
    #[serde(default)]
    datatype: Option<String>,
    #[serde(default, rename = "xml:lang")]
    lang: Option<String>,
}

impl JsonTerm {
    fn into_term(self) -> Result<Term, ResultParseError> {
        match self.kind.as_str() {
            "uri" => Ok(Term::iri(self.value)),
            "bnode" => Ok(Term::blank(self.value)),
            "literal" | "typed-literal" => Ok(Term::Literal {
                value: self.value,
                datatype: self.datatype,
                language: self.lang,
            }),
            other => Err(syntax(0, format!("unknown term type '{other}'"))),
        }
    }
}

/// Parse `application/sparql-results+json`.
pub fn parse_sparql_json(text: &str) -> Result<QueryResult, ResultParseError> {
    let parsed: JsonResults = serde_json::from_str(text)?;
    if let Some(answer) = parsed.boolean {
        return Ok(QueryResult::Boolean(answer));
    }
    let bindings = parsed
        .results
        .ok_or_else(|| syntax(0, "missing `results` and `boolean`"))?;
    let vars = parsed.head.vars;
    let mut rows = Vec::with_capacity(bindings.bindings.len());
    for mut binding in bindings.bindings {
        let mut row = Vec::with_capacity(vars.len());
        for var in &vars {
            row.push(binding.remove(var).map(JsonTerm::into_term).transpose()?);
        }
        rows.push(row);
    }
    Ok(QueryResult::Bindings { vars, rows })
}

/// Parse `text/tab-separated-values` SPARQL answers.
///
/// The header lists `?var` names; cells hold terms in N-Triples syntax, with
/// Turtle's bare numbers and booleans also accepted. Empty cells are unbound.
pub fn parse_tsv(text: &str) -> Result<QueryResult, ResultParseError> {
    let mut lines = text.lines();
    let header = lines.next().unwrap_or_default();
    let vars: Vec<String> = header
        .split('\t')
        .filter(|v| !v.is_empty())
        .map(|v| v.trim_start_matches(['?', '$']).to_string())
        .collect();
    let mut rows = Vec::new();
    for (idx, line) in lines.enumerate() {
        if line.is_empty() {
            continue;
        }
        let line_no = idx + 2;
        let mut row = Vec::with_capacity(vars.len());
        for cell in line.split('\t') {
            let cell = cell.trim();
            if cell.is_empty() {
                row.push(None);
                continue;
            }
            let (term, rest) = parse_term(cell, true).map_err(|m| syntax(line_no, m))?;
            if !rest.trim().is_empty() {
                return Err(syntax(line_no, format!("trailing input '{}'", rest.trim())));
            }
            row.push(Some(term));
        }
        if row.len() != vars.len() {
            return Err(syntax(
                line_no,
                format!("expected {} cells, found {}", vars.len(), row.len()),
            ));
        }
        rows.push(row);
    }
    Ok(QueryResult::Bindings { vars, rows })
}

/// Parse `text/csv` SPARQL answers.
///
/// CSV drops term kinds: blank nodes keep their `_:` prefix, values shaped like
/// an absolute IRI (scheme followed by `:` and no whitespace) become IRIs, and
/// everything else becomes a plain literal. Empty cells are unbound.
pub fn parse_csv(text: &str) -> Result<QueryResult, ResultParseError> {
    let records = split_csv(text)?;
    let mut iter = records.into_iter();
    let vars = iter.next().unwrap_or_default();
    let mut rows = Vec::new();
    for (idx, record) in iter.enumerate() {
        if record.len() == 1 && record[0].is_empty() {
            continue;
        }
        if record.len() != vars.len() {
            return Err(syntax(
                idx + 2,
                format!("expected {} fields, found {}", vars.len(), record.len()),
            ));
        }
        rows.push(record.into_iter().map(|cell| csv_term(&cell)).collect());
    }
    Ok(QueryResult::Bindings { vars, rows })
}

fn csv_term(cell: &str) -> Option<Term> {
    if cell.is_empty() {
        return None;
    }
    if let Some(label) = cell.strip_prefix("_:") {
        return Some(Term::blank(label));
    }
    if looks_like_iri(cell) {
        return Some(Term::iri(cell));
    }
    Some(Term::literal(cell))
}

fn looks_like_iri(value: &str) -> bool {
    let Some((scheme, rest)) = value.split_once(':') else {
        return false;
    };
    let mut chars = scheme.chars();
    let starts_alpha = chars.next().is_some_and(|c| c.is_ascii_alphabetic());
    starts_alpha
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        && !rest.is_empty()
        && !value.chars().any(char::is_whitespace)
}

/// Split RFC 4180 CSV into records. Quoted fields may contain separators,
/// newlines and doubled quotes.
fn split_csv(text: &str) -> Result<Vec<Vec<String>>, ResultParseError> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                line += 1;
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(c),
        }
    }
    if in_quotes {
        return Err(syntax(line, "unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

/// Parse an N-Triples document. Blank lines and `#` comments are skipped.
pub fn parse_ntriples(text: &str) -> Result<Vec<Triple>, ResultParseError> {
    let mut triples = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        triples.push(parse_statement(trimmed).map_err(|m| syntax(idx + 1, m))?);
    }
    Ok(triples)
}

/// Parse one `s p o .` statement.
pub fn parse_statement(line: &str) -> Result<Triple, String> {
    let (subject, rest) = parse_term(line, false)?;
    let (predicate, rest) = parse_term(rest, false)?;
    let (object, rest) = parse_term(rest, false)?;
    let rest = rest.trim();
    if rest != "." {
        return Err(format!("expected '.' at end of statement, found '{rest}'"));
    }
    if matches!(subject, Term::Literal { .. }) {
        return Err("literal in subject position".to_string());
    }
    if !predicate.is_iri() {
        return Err("predicate must be an IRI".to_string());
    }
    Ok(Triple::new(subject, predicate, object))
}

/// Parse one term from the start of `input`, returning it and the remaining
/// text. `bare` enables Turtle's unquoted numbers and booleans.
pub fn parse_term(input: &str, bare: bool) -> Result<(Term, &str), String> {
    let input = input.trim_start();
    if let Some(rest) = input.strip_prefix('<') {
        let end = rest.find('>').ok_or("unterminated IRI")?;
        return Ok((Term::iri(&rest[..end]), &rest[end + 1..]));
    }
    if let Some(rest) = input.strip_prefix("_:") {
        let end = rest
            .find(|c: char| c.is_whitespace())
            .unwrap_or(rest.len());
        let label = &rest[..end];
        if label.is_empty() {
            return Err("empty blank node label".to_string());
        }
        return Ok((Term::blank(label), &rest[end..]));
    }
    if let Some(rest) = input.strip_prefix('"') {
        let (value, rest) = parse_quoted(rest)?;
        if let Some(tail) = rest.strip_prefix('@') {
            let end = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-'))
                .unwrap_or(tail.len());
            if end == 0 {
                return Err("empty language tag".to_string());
            }
            return Ok((Term::lang(value, &tail[..end]), &tail[end..]));
        }
        if let Some(tail) = rest.strip_prefix("^^<") {
            let end = tail.find('>').ok_or("unterminated datatype IRI")?;
            return Ok((Term::typed(value, &tail[..end]), &tail[end + 1..]));
        }
        return Ok((Term::literal(value), rest));
    }
    if bare {
        let end = input
            .find(|c: char| c.is_whitespace())
            .unwrap_or(input.len());
        let token = &input[..end];
        if let Some(term) = bare_literal(token) {
            return Ok((term, &input[end..]));
        }
    }
    let preview: String = input.chars().take(20).collect();
    Err(format!("unexpected input '{preview}'"))
}

fn bare_literal(token: &str) -> Option<Term> {
    match token {
        "true" | "false" => return Some(Term::typed(token, XSD_BOOLEAN)),
        _ => {}
    }
    let digits = token.trim_start_matches(['+', '-']);
    if digits.is_empty() {
        return None;
    }
    if digits.chars().all(|c| c.is_ascii_digit()) {
        return Some(Term::typed(token, XSD_INTEGER));
    }
    if token.contains(['e', 'E']) && token.parse::<f64>().is_ok() {
        return Some(Term::typed(token, XSD_DOUBLE));
    }
    if digits.contains('.') && digits.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Some(Term::typed(token, XSD_DECIMAL));
    }
    None
}

fn parse_quoted(input: &str) -> Result<(String, &str), String> {
    let mut value = String::new();
    let mut chars = input.char_indices();
    while let Some((idx, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &input[idx + 1..])),
            '\\' => {
                let (_, esc) = chars.next().ok_or("dangling escape")?;
                match esc {
                    't' => value.push('\t'),
                    'b' => value.push('\u{8}'),
                    'n' => value.push('\n'),
                    'r' => value.push('\r'),
                    'f' => value.push('\u{c}'),
                    '"' => value.push('"'),
                    '\'' => value.push('\''),
                    '\\' => value.push('\\'),
                    'u' | 'U' => {
                        let width = if esc == 'u' { 4 } else { 8 };
                        let hex: String = chars.by_ref().take(width).map(|(_, h)| h).collect();
                        let code = u32::from_str_radix(&hex, 16)
                            .map_err(|_| format!("bad unicode escape '{hex}'"))?;
                        value.push(char::from_u32(code).ok_or("invalid code point")?);
                    }
                    other => return Err(format!("unknown escape '\\{other}'")),
                }
            }
            _ => value.push(c),
        }
    }
    Err("unterminated literal".to_string())
}

fn escape_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
