//! A staged, supervised process with an optional endpoint, as one scoped value.
//!
//! [`RunBuilder::start`] stages inputs, launches the command and waits for the
//! endpoint. The returned [`Run`] tears everything down on [`Run::close`] or
//! on drop: stop the process, then remove the sandbox.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::core::script::{self, MASTER_SCRIPT};
use crate::core::types::{CommandSpec, Readiness, WaitOutcome};
use crate::core::version::Capabilities;
use crate::endpoint::{EndpointClient, ServerInfo};
use crate::error::{CleanupError, OutputError, ProcessError, RunError, StagingError, StartupError};
use crate::io::config::RunnerConfig;
use crate::io::process::ProcessSupervisor;
use crate::io::readiness::ReadinessCheck;
use crate::io::sandbox::{InputSpec, Sandbox};
use crate::io::watcher::{LineCallback, Transcript};

/// How the endpoint's readiness is detected.
enum EndpointMode {
    None,
    /// The configured readiness pattern.
    Configured,
    Custom(Box<dyn ReadinessCheck + Send>),
}

/// Collects everything needed to start a [`Run`].
pub struct RunBuilder {
    config: RunnerConfig,
    inputs: Vec<InputSpec>,
    working_dir: Option<PathBuf>,
    command: Option<CommandSpec>,
    script: Option<Vec<String>>,
    endpoint: EndpointMode,
    prefixes: Vec<(String, String)>,
    wait_before_enter: bool,
    wait_before_exit: bool,
    on_line: Option<LineCallback>,
}

impl RunBuilder {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            inputs: Vec::new(),
            working_dir: None,
            command: None,
            script: None,
            endpoint: EndpointMode::None,
            prefixes: Vec::new(),
            wait_before_enter: false,
            wait_before_exit: false,
            on_line: None,
        }
    }

    pub fn input(mut self, input: InputSpec) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn inputs(mut self, inputs: impl IntoIterator<Item = InputSpec>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Run in `dir` instead of a temporary directory. It is created if
    /// missing and left in place at teardown.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Run an arbitrary command instead of RDFox.
    pub fn command(mut self, command: CommandSpec) -> Self {
        self.command = Some(command);
        self
    }

    /// Run RDFox on these shell script lines.
    pub fn rdfox_script<S: AsRef<str>>(mut self, lines: &[S]) -> Self {
        self.script = Some(lines.iter().map(|l| l.as_ref().to_string()).collect());
        self
    }

    /// Wait for the configured endpoint readiness line.
    pub fn endpoint(mut self) -> Self {
        self.endpoint = EndpointMode::Configured;
        self
    }

    /// Wait for readiness using `check`.
    pub fn endpoint_with(mut self, check: impl ReadinessCheck + Send + 'static) -> Self {
        self.endpoint = EndpointMode::Custom(Box::new(check));
        self
    }

    /// Port used when the readiness signal does not name one.
    pub fn endpoint_port(mut self, port: u16) -> Self {
        self.config.endpoint_port = Some(port);
        self
    }

    /// Bind a prefix on the endpoint client.
    pub fn prefix(mut self, prefix: impl Into<String>, iri: impl Into<String>) -> Self {
        self.prefixes.push((prefix.into(), iri.into()));
        self
    }

    /// Wait for the command to finish before `start` returns.
    pub fn wait_before_enter(mut self, wait: bool) -> Self {
        self.wait_before_enter = wait;
        self
    }

    /// Wait for the command to finish before stopping it at teardown.
    pub fn wait_before_exit(mut self, wait: bool) -> Self {
        self.wait_before_exit = wait;
        self
    }

    /// Receive every output line as it is read.
    pub fn on_line(mut self, callback: impl Fn(&str) + Send + 'static) -> Self {
        self.on_line = Some(Box::new(callback));
        self
    }

    /// Stage, launch and, if requested, wait for the endpoint.
    ///
    /// Any failure after staging tears the run down before returning.
    #[instrument(skip_all, fields(inputs = self.inputs.len()))]
    pub fn start(self) -> Result<Run, RunError> {
        let RunBuilder {
            config,
            mut inputs,
            working_dir,
            command,
            script,
            endpoint,
            prefixes,
            wait_before_enter,
            wait_before_exit,
            on_line,
        } = self;

        let predicate = config.fatal_predicate()?;
        let check: Option<Box<dyn ReadinessCheck + Send>> = match endpoint {
            EndpointMode::None => None,
            EndpointMode::Configured => Some(Box::new(config.endpoint_check()?)),
            EndpointMode::Custom(check) => Some(check),
        };

        if let Some(lines) = &script {
            if inputs.iter().any(|i| i.target == Path::new(MASTER_SCRIPT)) {
                return Err(StagingError::ReservedPath(PathBuf::from(MASTER_SCRIPT)).into());
            }
            inputs.push(InputSpec::text(MASTER_SCRIPT, script::master_script(lines)));
        }
        let command = match (command, &script) {
            (Some(command), _) => command,
            (None, Some(_)) => script::rdfox_command(&config.executable),
            (None, None) => return Err(StartupError::NoCommand.into()),
        };

        let sandbox = match working_dir {
            Some(dir) => Sandbox::in_dir(dir)?.with_inputs(&mut inputs)?,
            None => Sandbox::staged(&mut inputs, config.keep_working_dir)?,
        };
        let mut supervisor =
            ProcessSupervisor::new(predicate).with_poll_interval(config.poll_interval());
        if let Some(callback) = on_line {
            supervisor = supervisor.on_line(callback);
        }

        // From here on, dropping `run` tears down.
        let mut run = Run {
            config,
            sandbox,
            supervisor,
            endpoint: None,
            server_info: None,
            wait_before_exit,
        };
        run.supervisor.start(&command, run.sandbox.root())?;
        info!(command = %command, dir = %run.sandbox.root().display(), "run started");

        if wait_before_enter {
            let timeout = run.config.readiness_timeout();
            run.wait(Some(timeout))?;
        }
        if let Some(check) = check {
            let readiness = run.await_ready(check.as_ref())?;
            run.connect(&readiness, prefixes)?;
        }
        Ok(run)
    }
}

/// A live run. Owns the sandbox and the supervised process.
pub struct Run {
    config: RunnerConfig,
    sandbox: Sandbox,
    supervisor: ProcessSupervisor,
    endpoint: Option<EndpointClient>,
    server_info: Option<ServerInfo>,
    wait_before_exit: bool,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("working_dir", &self.sandbox.root())
            .field("supervisor", &self.supervisor)
            .field("endpoint", &self.endpoint.as_ref().map(EndpointClient::base_url))
            .finish_non_exhaustive()
    }
}

impl Run {
    fn await_ready(&mut self, check: &dyn ReadinessCheck) -> Result<Readiness, RunError> {
        let timeout = self.config.readiness_timeout();
        match self.supervisor.wait_ready(check, timeout) {
            WaitOutcome::Ready(readiness) => Ok(readiness),
            WaitOutcome::FailedFast(line) => Err(ProcessError::Fatal { line }.into()),
            WaitOutcome::ExitedEarly(code) => Err(ProcessError::Exited { code }.into()),
            WaitOutcome::TimedOut => Err(RunError::ReadinessTimeout { timeout }),
        }
    }

    fn connect(
        &mut self,
        readiness: &Readiness,
        prefixes: Vec<(String, String)>,
    ) -> Result<(), RunError> {
        let service = readiness
            .service
            .clone()
            .or_else(|| self.config.endpoint_port.map(|p| p.to_string()))
            .ok_or(RunError::UnknownEndpointAddress)?;

        let mut client = EndpointClient::for_service(&self.config.endpoint_host, &service)
            .with_datastore(self.config.datastore.clone())
            .with_timeout(self.config.http_timeout());
        for (prefix, iri) in prefixes {
            client = client.with_prefix(prefix, iri);
        }

        match client.server_info() {
            Ok(info) => {
                let capabilities = info.capabilities();
                info!(
                    version = info.version.as_deref().unwrap_or("unknown"),
                    "connected to endpoint"
                );
                client = client.with_capabilities(capabilities);
                self.server_info = Some(info);
            }
            Err(e) => {
                warn!(err = %e, "could not read server info; assuming current API");
            }
        }
        info!(url = %client.base_url(), "endpoint ready");
        self.endpoint = Some(client);
        Ok(())
    }

    /// Endpoint client, when the run was started with an endpoint.
    pub fn endpoint(&self) -> Option<&EndpointClient> {
        self.endpoint.as_ref()
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    /// Capabilities frozen at readiness.
    pub fn capabilities(&self) -> Capabilities {
        self.endpoint
            .as_ref()
            .map(EndpointClient::capabilities)
            .unwrap_or_default()
    }

    pub fn working_dir(&self) -> &Path {
        self.sandbox.root()
    }

    /// Path of a file inside the working directory.
    pub fn files(&self, relative: impl AsRef<Path>) -> Result<PathBuf, OutputError> {
        self.sandbox.path(relative)
    }

    pub fn read_output(&self, relative: impl AsRef<Path>) -> Result<Vec<u8>, OutputError> {
        self.sandbox.read_output(relative)
    }

    pub fn read_output_string(&self, relative: impl AsRef<Path>) -> Result<String, OutputError> {
        self.sandbox.read_output_string(relative)
    }

    pub fn transcript(&self) -> &Transcript {
        self.supervisor.transcript()
    }

    /// The fatal output line, if one has been seen.
    pub fn error_line(&self) -> Option<String> {
        self.supervisor.error_signal().line()
    }

    /// Fail if the process reported a fatal error or is no longer running.
    pub fn check_health(&mut self) -> Result<(), ProcessError> {
        if let Some(line) = self.error_line() {
            return Err(ProcessError::Fatal { line });
        }
        if !self.supervisor.is_alive() {
            return Err(ProcessError::Exited {
                code: self.supervisor.exit_code(),
            });
        }
        Ok(())
    }

    pub fn is_alive(&mut self) -> bool {
        self.supervisor.is_alive()
    }

    pub fn exit_code(&mut self) -> Option<i32> {
        self.supervisor.exit_code()
    }

    pub fn close_stdin(&mut self) {
        self.supervisor.close_stdin();
    }

    /// Wait for the process to exit by itself and return its exit code.
    ///
    /// A fatal output line is reported as [`ProcessError::Fatal`] even when
    /// the process exits with code 0.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>, RunError> {
        let waited = self
            .supervisor
            .wait_exit(timeout)
            .map_err(|e| RunError::Cleanup(CleanupError::Stop(e)))?;
        if let Some(line) = self.error_line() {
            return Err(ProcessError::Fatal { line }.into());
        }
        match waited {
            Some(code) => {
                debug!(exit_code = ?code, "process finished");
                Ok(code)
            }
            None => Err(RunError::CommandTimeout {
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Stop the process and remove the sandbox, reporting every failure.
    pub fn close(mut self) -> Result<(), CleanupError> {
        let errors = self.teardown();
        match CleanupError::from_all(errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn teardown(&mut self) -> Vec<CleanupError> {
        let mut errors = Vec::new();
        if self.wait_before_exit && self.supervisor.is_alive() {
            let timeout = self.config.readiness_timeout();
            match self.supervisor.wait_exit(Some(timeout)) {
                Ok(Some(_)) => {}
                Ok(None) => error!(
                    timeout_secs = timeout.as_secs(),
                    "process did not finish in time, stopping it"
                ),
                Err(e) => warn!(err = %e, "wait before exit failed"),
            }
        }
        if let Err(e) = self.supervisor.stop(self.config.grace_period()) {
            errors.push(CleanupError::Stop(e));
        }
        if let Err(e) = self.sandbox.destroy() {
            errors.push(e);
        }
        errors
    }
}

impl Drop for Run {
    fn drop(&mut self) {
        for err in self.teardown() {
            warn!(err = %err, "teardown failed");
        }
    }
}

/// Start `builder`, run `body`, and always tear down.
///
/// An error from `body` is returned as is, with teardown failures only logged.
/// When `body` succeeds, a teardown failure becomes the result.
pub fn with_run<T, E, F>(builder: RunBuilder, body: F) -> Result<T, E>
where
    F: FnOnce(&mut Run) -> Result<T, E>,
    E: From<RunError>,
{
    let mut run = builder.start()?;
    let result = body(&mut run);
    let cleanup = run.close();
    match (result, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(RunError::Cleanup(cleanup).into()),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup)) => {
            warn!(err = %cleanup, "teardown failed after run error");
            Err(err)
        }
    }
}
