//! Batch mode: stage inputs, run to completion, collect outputs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{error, info, instrument};

use crate::core::script;
use crate::core::types::CommandSpec;
use crate::error::{ProcessError, RunError};
use crate::io::config::RunnerConfig;
use crate::io::sandbox::InputSpec;
use crate::orchestrator::{Run, RunBuilder, with_run};

/// Run `command` in a fresh sandbox and return the content of each labelled
/// output file.
///
/// Stdin is closed right after start. A fatal output line or a non-zero
/// exit code is a [`ProcessError`].
#[instrument(skip_all, fields(command = %command, outputs = outputs.len()))]
pub fn run_in_dir(
    inputs: Vec<InputSpec>,
    outputs: &BTreeMap<String, PathBuf>,
    command: CommandSpec,
    config: &RunnerConfig,
) -> Result<BTreeMap<String, String>, RunError> {
    let builder = RunBuilder::new(config.clone())
        .inputs(inputs)
        .command(command);
    with_run(builder, |run| finish_and_collect(run, outputs, config))
}

/// Run RDFox on the script `lines` and return the content of each labelled
/// output file. A trailing `quit` is added when missing.
#[instrument(skip_all, fields(lines = lines.len(), outputs = outputs.len()))]
pub fn run_collecting_output<S: AsRef<str>>(
    inputs: Vec<InputSpec>,
    outputs: &BTreeMap<String, PathBuf>,
    lines: &[S],
    config: &RunnerConfig,
) -> Result<BTreeMap<String, String>, RunError> {
    let builder = RunBuilder::new(config.clone())
        .inputs(inputs)
        .rdfox_script(&script::with_quit(lines));
    with_run(builder, |run| finish_and_collect(run, outputs, config))
}

fn finish_and_collect(
    run: &mut Run,
    outputs: &BTreeMap<String, PathBuf>,
    config: &RunnerConfig,
) -> Result<BTreeMap<String, String>, RunError> {
    run.close_stdin();
    let code = run.wait(Some(config.command_timeout()))?;
    if code != Some(0) {
        error!(exit_code = ?code, "command failed");
        return Err(ProcessError::Exited { code }.into());
    }

    let mut collected = BTreeMap::new();
    for (label, path) in outputs {
        collected.insert(label.clone(), run.read_output_string(path)?);
    }
    info!(collected = collected.len(), "collected outputs");
    Ok(collected)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::OutputError;
    use crate::test_support::fast_config;

    fn config() -> RunnerConfig {
        RunnerConfig {
            command_timeout_secs: 5,
            grace_period_secs: 1,
            ..fast_config("RDFox")
        }
    }

    fn outputs(pairs: &[(&str, &str)]) -> BTreeMap<String, PathBuf> {
        pairs
            .iter()
            .map(|(label, path)| (label.to_string(), PathBuf::from(path)))
            .collect()
    }

    #[test]
    fn collects_labelled_outputs() {
        let collected = run_in_dir(
            vec![InputSpec::text("in.txt", "a\nb\n")],
            &outputs(&[("lines", "out/count.txt")]),
            CommandSpec::shell("mkdir out && wc -l < in.txt | tr -d ' ' > out/count.txt"),
            &config(),
        )
        .expect("run");
        assert_eq!(collected["lines"], "2\n");
    }

    #[test]
    fn non_zero_exit_is_an_error() {
        let err = run_in_dir(
            Vec::new(),
            &BTreeMap::new(),
            CommandSpec::shell("mv missing.txt elsewhere.txt"),
            &config(),
        )
        .expect_err("mv fails");
        assert!(
            matches!(err, RunError::Process(ProcessError::Exited { code: Some(c) }) if c >= 1),
            "{err:?}"
        );
    }

    #[test]
    fn missing_output_is_reported() {
        let err = run_in_dir(
            Vec::new(),
            &outputs(&[("x", "never-written.txt")]),
            CommandSpec::shell("true"),
            &config(),
        )
        .expect_err("no output");
        assert!(matches!(
            err,
            RunError::Output(OutputError::NotFound { .. })
        ));
    }

    #[test]
    fn slow_command_times_out() {
        let cfg = RunnerConfig {
            command_timeout_secs: 1,
            ..config()
        };
        let err = run_in_dir(
            Vec::new(),
            &BTreeMap::new(),
            CommandSpec::shell("sleep 30"),
            &cfg,
        )
        .expect_err("timeout");
        assert!(matches!(err, RunError::CommandTimeout { .. }));
    }
}
