//! Shared deterministic types for the supervisor and orchestrator.
//!
//! These types describe commands and lifecycle outcomes. They carry no OS
//! handles so they can be built, compared and logged freely.

use std::ffi::OsString;
use std::fmt;

/// Program plus arguments to launch inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    /// Extra environment variables set on top of the inherited environment.
    pub env: Vec<(OsString, OsString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run `script` through `sh -c`.
    pub fn shell(script: &str) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Lifecycle of a supervised process.
///
/// `NotStarted -> Running -> {Exited, Terminated, FailedFast} -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Running,
    /// The process exited on its own with the given code (negative signal number
    /// when killed by a signal on unix).
    Exited(Option<i32>),
    /// The supervisor had to signal the process to end it.
    Terminated,
    /// A fatal marker was observed in the process output.
    FailedFast,
    /// `stop` completed and the OS handle has been released.
    Stopped,
}

/// What a readiness check observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Port number or service name reported by the process, when known.
    pub service: Option<String>,
}

/// Result of waiting for a process to become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready(Readiness),
    /// Carries the output line that matched the fatal predicate.
    FailedFast(String),
    ExitedEarly(Option<i32>),
    TimedOut,
}
