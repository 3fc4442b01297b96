//! Stable exit codes for `rdfox-runner` commands.

use crate::error::RunError;

/// The run completed and outputs were printed.
pub const OK: i32 = 0;
/// Bad arguments, configuration or inputs; nothing was started.
pub const INVALID: i32 = 1;
/// The process reported a fatal error or exited unexpectedly.
pub const PROCESS_FAILED: i32 = 2;
/// The process did not become ready or did not finish in time.
pub const TIMEOUT: i32 = 3;
/// The endpoint rejected a request or could not be reached.
pub const ENDPOINT: i32 = 4;

/// Exit code reported for a failed run.
pub fn for_run_error(err: &RunError) -> i32 {
    match err {
        RunError::Staging(_) | RunError::Pattern(_) | RunError::Output(_) => INVALID,
        RunError::Startup(_) | RunError::Process(_) | RunError::Cleanup(_) => PROCESS_FAILED,
        RunError::ReadinessTimeout { .. } | RunError::CommandTimeout { .. } => TIMEOUT,
        RunError::UnknownEndpointAddress | RunError::Endpoint(_) => ENDPOINT,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProcessError, StagingError};
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn error_kinds_map_to_distinct_codes() {
        let staging = RunError::Staging(StagingError::PathEscapes(PathBuf::from("../x")));
        let fatal = RunError::Process(ProcessError::Fatal {
            line: "Error: x".to_string(),
        });
        let slow = RunError::ReadinessTimeout {
            timeout: Duration::from_secs(1),
        };
        assert_eq!(for_run_error(&staging), INVALID);
        assert_eq!(for_run_error(&fatal), PROCESS_FAILED);
        assert_eq!(for_run_error(&slow), TIMEOUT);
        assert_eq!(for_run_error(&RunError::UnknownEndpointAddress), ENDPOINT);
    }
}
