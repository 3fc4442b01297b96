//! Just enough SPARQL for the stub: prefixes, basic graph patterns, SELECT,
//! ASK, INSERT DATA and DELETE DATA.

use std::collections::{BTreeMap, HashMap};

use rdfox_runner::core::results::{QueryResult, Term, Triple, parse_term};
use serde_json::{Value, json};

const RDF_TYPE: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#type";

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Dot,
    Star,
    Var(String),
    Term(Term),
    Word(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Var(String),
    Term(Term),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    subject: Node,
    predicate: Node,
    object: Node,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// `vars` is `None` for `SELECT *`.
    Select {
        vars: Option<Vec<String>>,
        distinct: bool,
        patterns: Vec<Pattern>,
    },
    Ask {
        patterns: Vec<Pattern>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Insert(Vec<Triple>),
    Delete(Vec<Triple>),
}

pub fn parse_query(text: &str) -> Result<Query, String> {
    let mut parser = Parser::new(text)?;
    parser.prologue()?;
    let query = match parser.keyword()?.as_str() {
        "SELECT" => {
            let distinct = parser.eat_keyword("DISTINCT");
            let mut vars = Vec::new();
            let mut star = false;
            loop {
                match parser.peek() {
                    Some(Token::Var(name)) => {
                        vars.push(name.clone());
                        parser.pos += 1;
                    }
                    Some(Token::Star) if vars.is_empty() => {
                        star = true;
                        parser.pos += 1;
                    }
                    _ => break,
                }
            }
            if !star && vars.is_empty() {
                return Err("variable or '*' expected.".to_string());
            }
            parser.eat_keyword("WHERE");
            let patterns = parser.group()?;
            Query::Select {
                vars: (!star).then_some(vars),
                distinct,
                patterns,
            }
        }
        "ASK" => {
            parser.eat_keyword("WHERE");
            Query::Ask {
                patterns: parser.group()?,
            }
        }
        other => return Err(format!("unsupported query form '{other}'.")),
    };
    parser.finish()?;
    Ok(query)
}

pub fn parse_update(text: &str) -> Result<Update, String> {
    let mut parser = Parser::new(text)?;
    parser.prologue()?;
    let form = parser.keyword()?;
    if !parser.eat_keyword("DATA") {
        return Err("'DATA' expected.".to_string());
    }
    let patterns = parser.group()?;
    parser.finish()?;
    let triples = patterns
        .into_iter()
        .map(ground)
        .collect::<Result<Vec<_>, _>>()?;
    match form.as_str() {
        "INSERT" => Ok(Update::Insert(triples)),
        "DELETE" => Ok(Update::Delete(triples)),
        other => Err(format!("unsupported update form '{other}'.")),
    }
}

fn ground(pattern: Pattern) -> Result<Triple, String> {
    match (pattern.subject, pattern.predicate, pattern.object) {
        (Node::Term(s), Node::Term(p), Node::Term(o)) => Ok(Triple::new(s, p, o)),
        _ => Err("variables are not allowed in DATA blocks.".to_string()),
    }
}

/// Evaluate against the datastore content.
pub fn evaluate(query: &Query, facts: &[Triple]) -> QueryResult {
    match query {
        Query::Ask { patterns } => {
            let mut solutions = Vec::new();
            solve(patterns, facts, &BTreeMap::new(), &mut solutions);
            QueryResult::Boolean(!solutions.is_empty())
        }
        Query::Select {
            vars,
            distinct,
            patterns,
        } => {
            let vars = vars.clone().unwrap_or_else(|| pattern_vars(patterns));
            let mut solutions = Vec::new();
            solve(patterns, facts, &BTreeMap::new(), &mut solutions);
            let mut rows: Vec<Vec<Option<Term>>> = Vec::new();
            for solution in solutions {
                let row: Vec<Option<Term>> = vars.iter().map(|v| solution.get(v).cloned()).collect();
                if *distinct && rows.contains(&row) {
                    continue;
                }
                rows.push(row);
            }
            QueryResult::Bindings { vars, rows }
        }
    }
}

fn pattern_vars(patterns: &[Pattern]) -> Vec<String> {
    let mut vars: Vec<String> = Vec::new();
    for pattern in patterns {
        for node in [&pattern.subject, &pattern.predicate, &pattern.object] {
            if let Node::Var(name) = node
                && !vars.contains(name)
            {
                vars.push(name.clone());
            }
        }
    }
    vars
}

fn solve(
    patterns: &[Pattern],
    facts: &[Triple],
    binding: &BTreeMap<String, Term>,
    out: &mut Vec<BTreeMap<String, Term>>,
) {
    let Some((first, rest)) = patterns.split_first() else {
        out.push(binding.clone());
        return;
    };
    for fact in facts {
        let mut extended = binding.clone();
        if unify(&first.subject, &fact.subject, &mut extended)
            && unify(&first.predicate, &fact.predicate, &mut extended)
            && unify(&first.object, &fact.object, &mut extended)
        {
            solve(rest, facts, &extended, out);
        }
    }
}

fn unify(node: &Node, term: &Term, binding: &mut BTreeMap<String, Term>) -> bool {
    match node {
        Node::Term(expected) => expected == term,
        Node::Var(name) => match binding.get(name) {
            Some(bound) => bound == term,
            None => {
                binding.insert(name.clone(), term.clone());
                true
            }
        },
    }
}

/// Serialize an answer in the requested media type.
pub fn render(result: &QueryResult, mime: &str) -> Option<String> {
    match mime {
        "application/sparql-results+json" | "application/json" => Some(render_json(result)),
        "text/tab-separated-values" => Some(render_tsv(result)),
        "text/csv" => Some(render_csv(result)),
        _ => None,
    }
}

fn render_json(result: &QueryResult) -> String {
    let value = match result {
        QueryResult::Boolean(answer) => json!({ "head": {}, "boolean": answer }),
        QueryResult::Bindings { vars, rows } => {
            let bindings: Vec<Value> = rows
                .iter()
                .map(|row| {
                    let mut binding = serde_json::Map::new();
                    for (var, term) in vars.iter().zip(row) {
                        if let Some(term) = term {
                            binding.insert(var.clone(), term_json(term));
                        }
                    }
                    Value::Object(binding)
                })
                .collect();
            json!({ "head": { "vars": vars }, "results": { "bindings": bindings } })
        }
        QueryResult::Triples(_) => json!({ "head": {}, "results": { "bindings": [] } }),
    };
    value.to_string()
}

fn term_json(term: &Term) -> Value {
    match term {
        Term::Iri { value } => json!({ "type": "uri", "value": value }),
        Term::Blank { value } => json!({ "type": "bnode", "value": value }),
        Term::Literal {
            value,
            datatype,
            language,
        } => {
            let mut out = json!({ "type": "literal", "value": value });
            if let Some(datatype) = datatype {
                out["datatype"] = json!(datatype);
            }
            if let Some(language) = language {
                out["xml:lang"] = json!(language);
            }
            out
        }
    }
}

fn render_tsv(result: &QueryResult) -> String {
    match result {
        QueryResult::Bindings { vars, rows } => {
            let mut out = vars
                .iter()
                .map(|v| format!("?{v}"))
                .collect::<Vec<_>>()
                .join("\t");
            out.push('\n');
            for row in rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|t| t.as_ref().map(Term::to_ntriples).unwrap_or_default())
                    .collect();
                out.push_str(&cells.join("\t"));
                out.push('\n');
            }
            out
        }
        QueryResult::Boolean(answer) => format!("{answer}\n"),
        QueryResult::Triples(_) => String::new(),
    }
}

fn render_csv(result: &QueryResult) -> String {
    match result {
        QueryResult::Bindings { vars, rows } => {
            let mut out = vars.join(",");
            out.push_str("\r\n");
            for row in rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|t| t.as_ref().map(|t| csv_cell(t.value())).unwrap_or_default())
                    .collect();
                out.push_str(&cells.join(","));
                out.push_str("\r\n");
            }
            out
        }
        QueryResult::Boolean(answer) => format!("{answer}\r\n"),
        QueryResult::Triples(_) => String::new(),
    }
}

fn csv_cell(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    prefixes: HashMap<String, String>,
}

impl Parser {
    fn new(text: &str) -> Result<Self, String> {
        Ok(Self {
            tokens: tokenize(text)?,
            pos: 0,
            prefixes: HashMap::new(),
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn keyword(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Word(word)) => Ok(word.to_ascii_uppercase()),
            other => Err(format!("keyword expected, found {other:?}.")),
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Word(word)) if word.eq_ignore_ascii_case(keyword) => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn prologue(&mut self) -> Result<(), String> {
        while self.eat_keyword("PREFIX") {
            let name = match self.next() {
                Some(Token::Word(word)) if word.ends_with(':') => {
                    word.trim_end_matches(':').to_string()
                }
                _ => return Err("prefix name expected.".to_string()),
            };
            let iri = match self.next() {
                Some(Token::Term(Term::Iri { value })) => value,
                _ => return Err("IRI expected.".to_string()),
            };
            self.prefixes.insert(name, iri);
        }
        Ok(())
    }

    /// `{ pattern (. pattern)* .? }`
    fn group(&mut self) -> Result<Vec<Pattern>, String> {
        if self.next() != Some(Token::Open) {
            return Err("'{' expected.".to_string());
        }
        let mut patterns = Vec::new();
        loop {
            match self.peek() {
                Some(Token::Close) => {
                    self.pos += 1;
                    return Ok(patterns);
                }
                None => return Err("'}' expected.".to_string()),
                _ => {}
            }
            let subject = self.node()?;
            let predicate = self.node()?;
            let object = self.node()?;
            patterns.push(Pattern {
                subject,
                predicate,
                object,
            });
            if self.peek() == Some(&Token::Dot) {
                self.pos += 1;
            }
        }
    }

    fn node(&mut self) -> Result<Node, String> {
        match self.next() {
            Some(Token::Var(name)) => Ok(Node::Var(name)),
            Some(Token::Term(term)) => Ok(Node::Term(term)),
            Some(Token::Word(word)) if word == "a" => Ok(Node::Term(Term::iri(RDF_TYPE))),
            Some(Token::Word(word)) => match word.split_once(':') {
                Some((prefix, local)) => {
                    let base = self
                        .prefixes
                        .get(prefix)
                        .ok_or_else(|| format!("prefix '{prefix}' is not bound."))?;
                    Ok(Node::Term(Term::iri(format!("{base}{local}"))))
                }
                None => Err(format!("unexpected '{word}'.")),
            },
            Some(other) => Err(format!("term expected, found {other:?}.")),
            None => Err("unexpected end of query.".to_string()),
        }
    }

    fn finish(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected trailing {token:?}.")),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut rest = text;
    loop {
        rest = rest.trim_start();
        let Some(c) = rest.chars().next() else {
            return Ok(tokens);
        };
        let single = match c {
            '{' => Some(Token::Open),
            '}' => Some(Token::Close),
            '.' => Some(Token::Dot),
            '*' => Some(Token::Star),
            _ => None,
        };
        if let Some(token) = single {
            tokens.push(token);
            rest = &rest[1..];
            continue;
        }
        if c == '#' {
            rest = rest.find('\n').map_or("", |idx| &rest[idx..]);
            continue;
        }
        if c == '?' || c == '$' {
            let name = word_at(&rest[1..]);
            if name.is_empty() {
                return Err("variable name expected.".to_string());
            }
            tokens.push(Token::Var(name.to_string()));
            rest = &rest[1 + name.len()..];
            continue;
        }
        let starts_term = c == '<'
            || c == '"'
            || rest.starts_with("_:")
            || c.is_ascii_digit()
            || ((c == '+' || c == '-') && rest[1..].starts_with(|d: char| d.is_ascii_digit()));
        if starts_term {
            let (term, after) = parse_term(rest, true)?;
            tokens.push(Token::Term(term));
            rest = after;
            continue;
        }
        let word = word_at(rest);
        if word.is_empty() {
            return Err(format!("unexpected character '{c}'."));
        }
        tokens.push(Token::Word(word.to_string()));
        rest = &rest[word.len()..];
    }
}

fn word_at(input: &str) -> &str {
    let end = input
        .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | ':')))
        .unwrap_or(input.len());
    &input[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts() -> Vec<Triple> {
        let ex = |local: &str| Term::iri(format!("http://example.org/{local}"));
        vec![
            Triple::new(ex("alice"), ex("knows"), ex("bob")),
            Triple::new(ex("bob"), ex("knows"), ex("carol")),
            Triple::new(ex("alice"), ex("name"), Term::literal("Alice")),
        ]
    }

    #[test]
    fn select_joins_patterns() {
        let query = parse_query(
            "PREFIX ex: <http://example.org/>\nSELECT ?a ?c WHERE { ?a ex:knows ?b . ?b ex:knows ?c }",
        )
        .expect("parse");
        let result = evaluate(&query, &facts());
        assert_eq!(
            result,
            QueryResult::Bindings {
                vars: vec!["a".to_string(), "c".to_string()],
                rows: vec![vec![
                    Some(Term::iri("http://example.org/alice")),
                    Some(Term::iri("http://example.org/carol")),
                ]],
            }
        );
    }

    #[test]
    fn ask_and_star() {
        let ask = parse_query("ASK { <http://example.org/alice> ?p \"Alice\" }").expect("ask");
        assert_eq!(evaluate(&ask, &facts()), QueryResult::Boolean(true));

        let star = parse_query("SELECT * { ?s <http://example.org/knows> ?o }").expect("star");
        assert_eq!(evaluate(&star, &facts()).len(), 2);
    }

    #[test]
    fn missing_brace_is_reported() {
        let err = parse_query("SELECT ?s WHERE ?s ?p ?o").expect_err("no brace");
        assert_eq!(err, "'{' expected.");
    }

    #[test]
    fn insert_data_requires_ground_triples() {
        let update =
            parse_update("INSERT DATA { <http://ex/a> <http://ex/p> 5 . }").expect("update");
        assert_eq!(
            update,
            Update::Insert(vec![Triple::new(
                Term::iri("http://ex/a"),
                Term::iri("http://ex/p"),
                Term::integer(5),
            )])
        );
        assert!(parse_update("INSERT DATA { ?s <http://ex/p> 1 }").is_err());
    }

    #[test]
    fn renders_tsv_with_header() {
        let query = parse_query("SELECT ?n { ?s <http://example.org/name> ?n }").expect("parse");
        let tsv = render(&evaluate(&query, &facts()), "text/tab-separated-values").expect("tsv");
        assert_eq!(tsv, "?n\n\"Alice\"\n");
    }
}
