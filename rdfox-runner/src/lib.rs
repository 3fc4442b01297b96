//! Run RDFox, or any command, in a throwaway working directory.
//!
//! A run stages input files into a temporary directory, launches the process
//! there, watches its output for fatal errors, optionally waits for its REST
//! endpoint, and tears everything down when it is done:
//!
//! - **[`core`]**: Pure logic (output patterns, script building, RDF terms and
//!   answer parsing, version gating). No I/O.
//! - **[`io`]**: Sandbox staging, the output watcher, process supervision and
//!   configuration.
//! - **[`endpoint`]**: Blocking client for the SPARQL/REST endpoint.
//! - **[`orchestrator`]** and **[`collect`]**: Scoped runs built from the above.

pub mod collect;
pub mod core;
pub mod endpoint;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use crate::core::types::{CommandSpec, ProcessState, Readiness, WaitOutcome};
pub use crate::endpoint::{EndpointClient, EndpointError, RawAnswer, ServerInfo};
pub use crate::error::RunError;
pub use crate::io::config::RunnerConfig;
pub use crate::io::sandbox::InputSpec;
pub use crate::orchestrator::{Run, RunBuilder, with_run};
