//! Line predicates applied to process output.
//!
//! Matching follows "match at line start" semantics: a pattern must match a
//! prefix of the line, not an arbitrary substring.

use regex::Regex;

/// Lines RDFox prints when a command fails or the shell gives up.
pub const DEFAULT_ERROR_PATTERN: &str = r"Error: .*|File with name '.*' cannot be found|An error occurred while executing the command:|The server could not start listening";

/// Line RDFox prints once the REST endpoint accepts connections. Group 1 is the
/// port number or service name.
pub const DEFAULT_ENDPOINT_PATTERN: &str =
    r"The REST endpoint was successfully started at port number/service name (\S+)";

/// Decides whether an output line reports a fatal error.
#[derive(Debug, Clone)]
pub struct FatalPredicate {
    regex: Regex,
}

impl FatalPredicate {
    /// Build from a regex anchored at the start of each line.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: anchored(pattern)?,
        })
    }

    /// Match lines that start with `marker`, taken literally.
    pub fn starts_with(marker: &str) -> Self {
        Self {
            regex: Regex::new(&format!("^{}", regex::escape(marker)))
                .unwrap_or_else(|_| never_matches()),
        }
    }

    pub fn rdfox_default() -> Self {
        Self::new(DEFAULT_ERROR_PATTERN).unwrap_or_else(|_| Self {
            regex: never_matches(),
        })
    }

    pub fn matches(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }
}

impl Default for FatalPredicate {
    fn default() -> Self {
        Self::rdfox_default()
    }
}

/// Wrap `pattern` so it only matches at the start of a line.
pub fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})"))
}

/// `None` when `line` does not match; otherwise the first capture group, if
/// the regex has one and it participated.
pub fn capture_service(regex: &Regex, line: &str) -> Option<Option<String>> {
    let caps = regex.captures(line)?;
    Some(caps.get(1).map(|m| m.as_str().to_string()))
}

fn never_matches() -> Regex {
    // `[^\s\S]` is a valid class that matches nothing.
    Regex::new(r"[^\s\S]").unwrap_or_else(|_| unreachable!("static regex"))
}
