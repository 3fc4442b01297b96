//! Error taxonomy for staging, supervision and teardown.
//!
//! Endpoint call failures live in [`crate::endpoint::EndpointError`]; they are
//! per-call and do not end a run on their own.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointError;

/// Bad input mapping or unreadable source. No process is started.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("input path {0} escapes the sandbox root")]
    PathEscapes(PathBuf),
    #[error("input path {0} is reserved")]
    ReservedPath(PathBuf),
    #[error("input path {0} is listed more than once")]
    DuplicatePath(PathBuf),
    #[error("input source {0} does not exist")]
    MissingSource(PathBuf),
    #[error("stream source for {0} was already consumed")]
    SourceConsumed(PathBuf),
    #[error("create sandbox directory")]
    CreateDir(#[source] io::Error),
    #[error("stage {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The process could not be launched.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("process already started")]
    AlreadyStarted,
    #[error("no command or script given")]
    NoCommand,
    #[error("create output pipe")]
    Pipe(#[source] io::Error),
    #[error("spawn {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("start output watcher")]
    Watcher(#[source] io::Error),
}

/// The process reported a fatal condition or ended unexpectedly.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process reported a fatal error: {line}")]
    Fatal { line: String },
    #[error("process exited unexpectedly (exit code {code:?})")]
    Exited { code: Option<i32> },
}

/// A declared output could not be read back from the sandbox.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output {path} not found in sandbox")]
    NotFound {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("output path {0} escapes the sandbox root")]
    PathEscapes(PathBuf),
    #[error("sandbox has already been removed")]
    Destroyed,
    #[error("read output {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Teardown failure. Reported, but never allowed to replace a primary error.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("stop process")]
    Stop(#[source] io::Error),
    #[error("remove sandbox {path}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("teardown failed: {}", join_messages(.0))]
    Multiple(Vec<CleanupError>),
}

impl CleanupError {
    /// Collapse collected failures; `None` when there were none.
    pub fn from_all(mut errors: Vec<CleanupError>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(CleanupError::Multiple(errors)),
        }
    }
}

fn join_messages(errors: &[CleanupError]) -> String {
    errors
        .iter()
        .map(|e| match std::error::Error::source(e) {
            Some(source) => format!("{e}: {source}"),
            None => e.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Everything a run can fail with.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Slow start: the process is alive but never signalled readiness.
    #[error("process did not become ready within {timeout:?}")]
    ReadinessTimeout { timeout: Duration },
    #[error("process did not finish within {timeout:?}")]
    CommandTimeout { timeout: Duration },
    #[error("readiness signal did not name a port and no endpoint port is configured")]
    UnknownEndpointAddress,
    #[error("invalid output pattern")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error(transparent)]
    Output(#[from] OutputError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
}
