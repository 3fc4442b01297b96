//! Supervision of one long-running child process.
//!
//! The child runs with the sandbox as working directory, stdin piped and
//! stdout/stderr merged into a single pipe drained by an [`OutputWatcher`].

use std::io;
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::patterns::FatalPredicate;
use crate::core::types::{CommandSpec, ProcessState, WaitOutcome};
use crate::error::StartupError;
use crate::io::readiness::ReadinessCheck;
use crate::io::watcher::{ErrorSignal, LineCallback, OutputWatcher, Transcript};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for the watcher to reach EOF once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns the child process, its stdin and its output watcher.
pub struct ProcessSupervisor {
    predicate: FatalPredicate,
    poll_interval: Duration,
    callback: Option<LineCallback>,
    state: ProcessState,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    watcher: Option<OutputWatcher>,
    status: Option<ExitStatus>,
    transcript: Transcript,
    signal: ErrorSignal,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("state", &self.state)
            .field("pid", &self.child.as_ref().map(Child::id))
            .field("predicate", &self.predicate.pattern())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    pub fn new(predicate: FatalPredicate) -> Self {
        Self {
            predicate,
            poll_interval: DEFAULT_POLL_INTERVAL,
            callback: None,
            state: ProcessState::NotStarted,
            child: None,
            stdin: None,
            watcher: None,
            status: None,
            transcript: Transcript::new(),
            signal: ErrorSignal::new(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Receive every output line as it is read. Must be set before `start`.
    pub fn on_line(mut self, callback: impl Fn(&str) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Spawn `command` in `cwd` and start watching its output.
    #[instrument(skip_all, fields(command = %command))]
    pub fn start(&mut self, command: &CommandSpec, cwd: &Path) -> Result<(), StartupError> {
        if self.state != ProcessState::NotStarted {
            return Err(StartupError::AlreadyStarted);
        }

        let (reader, writer) = io::pipe().map_err(StartupError::Pipe)?;
        let stderr_writer = writer.try_clone().map_err(StartupError::Pipe)?;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k, v)))
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(writer)
            .stderr(stderr_writer);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so signals reach anything the child forks.
            cmd.process_group(0);
        }

        debug!(cwd = %cwd.display(), "spawning child process");
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn command");
                return Err(StartupError::Spawn {
                    program: command.program.to_string_lossy().into_owned(),
                    source: e,
                });
            }
        };
        // The command still holds the write ends; the watcher only sees EOF
        // once every copy is closed.
        drop(cmd);

        self.stdin = child.stdin.take();
        let watcher = match OutputWatcher::spawn(
            reader,
            self.transcript.clone(),
            self.signal.clone(),
            self.predicate.clone(),
            self.callback.take(),
        ) {
            Ok(w) => w,
            Err(e) => {
                error!(err = %e, "failed to start output watcher");
                let _ = child.kill();
                let _ = child.wait();
                return Err(StartupError::Watcher(e));
            }
        };

        info!(pid = child.id(), "process started");
        self.watcher = Some(watcher);
        self.child = Some(child);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Poll until `check` reports readiness, the process fails or exits, or
    /// `timeout` elapses.
    ///
    /// A raised error signal always wins over readiness, also on later calls.
    #[instrument(skip_all, fields(timeout_ms = timeout.as_millis() as u64))]
    pub fn wait_ready(&mut self, check: &dyn ReadinessCheck, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(line) = self.signal.line() {
                self.mark_failed_fast();
                return WaitOutcome::FailedFast(line);
            }
            if self.refresh_status().is_some() {
                self.drain_watcher();
                if let Some(line) = self.signal.line() {
                    self.mark_failed_fast();
                    return WaitOutcome::FailedFast(line);
                }
                let code = self.exit_code();
                warn!(exit_code = ?code, "process exited before becoming ready");
                return WaitOutcome::ExitedEarly(code);
            }
            if let Some(ready) = check.poll(&self.transcript) {
                // The check may have run while a fatal line arrived.
                if let Some(line) = self.signal.line() {
                    self.mark_failed_fast();
                    return WaitOutcome::FailedFast(line);
                }
                info!(service = ?ready.service, "process is ready");
                return WaitOutcome::Ready(ready);
            }
            if !self.sleep_until(deadline) {
                warn!("timed out waiting for readiness");
                return WaitOutcome::TimedOut;
            }
        }
    }

    /// Wait for the process to finish on its own.
    ///
    /// Returns the exit code, or `None` if `timeout` elapsed first. Without a
    /// timeout this blocks until the process exits.
    #[instrument(skip_all, fields(timeout_ms = timeout.map(|t| t.as_millis() as u64)))]
    pub fn wait_exit(&mut self, timeout: Option<Duration>) -> io::Result<Option<Option<i32>>> {
        if self.status.is_none() {
            let Some(child) = self.child.as_mut() else {
                return Ok(None);
            };
            let status = match timeout {
                Some(t) => child.wait_timeout(t)?,
                None => Some(child.wait()?),
            };
            match status {
                Some(status) => self.record_exit(status),
                None => {
                    debug!("process still running after wait");
                    return Ok(None);
                }
            }
        }
        self.drain_watcher();
        Ok(Some(self.exit_code()))
    }

    /// Close the child's stdin so a shell reading commands from it exits.
    pub fn close_stdin(&mut self) {
        if self.stdin.take().is_some() {
            debug!("closed process stdin");
        }
    }

    /// Write raw bytes to the child's stdin.
    pub fn write_stdin(&mut self, data: &[u8]) -> io::Result<()> {
        use std::io::Write;
        match self.stdin.as_mut() {
            Some(stdin) => {
                stdin.write_all(data)?;
                stdin.flush()
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed")),
        }
    }

    /// Close stdin, terminate, wait up to `grace`, then kill. Idempotent.
    #[instrument(skip_all, fields(grace_ms = grace.as_millis() as u64))]
    pub fn stop(&mut self, grace: Duration) -> io::Result<()> {
        self.close_stdin();
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let result = self.reap(&mut child, grace);
        match self.exit_code() {
            Some(code) if code > 0 => error!(exit_code = code, "process exited with error"),
            Some(code) if code < 0 => warn!(exit_code = code, "process was killed"),
            Some(_) => debug!("process exited cleanly"),
            None => {}
        }

        if let Some(mut watcher) = self.watcher.take()
            && !watcher.join_timeout(DRAIN_TIMEOUT)
        {
            warn!("output stream still open after stop; detaching watcher");
        }
        self.state = ProcessState::Stopped;
        result
    }

    fn reap(&mut self, child: &mut Child, grace: Duration) -> io::Result<()> {
        if self.status.is_some() {
            return Ok(());
        }
        if let Some(status) = child.try_wait()? {
            self.record_exit(status);
            return Ok(());
        }

        debug!(pid = child.id(), "terminating process");
        if let Err(e) = terminate(child) {
            warn!(err = %e, "failed to signal process");
        }
        if let Some(status) = child.wait_timeout(grace)? {
            self.status = Some(status);
            self.state = ProcessState::Terminated;
            return Ok(());
        }

        error!(
            grace_ms = grace.as_millis() as u64,
            "process did not terminate in time, killing"
        );
        force_kill(child);
        let status = child.wait()?;
        self.status = Some(status);
        self.state = ProcessState::Terminated;
        Ok(())
    }

    /// Whether the process is still running. Reaps it if it has exited.
    pub fn is_alive(&mut self) -> bool {
        self.child.is_some() && self.refresh_status().is_none()
    }

    /// Exit code once the process has finished; the negated signal number when
    /// it was killed by a signal on unix.
    pub fn exit_code(&mut self) -> Option<i32> {
        self.refresh_status().and_then(|status| status_code(&status))
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn error_signal(&self) -> &ErrorSignal {
        &self.signal
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn refresh_status(&mut self) -> Option<ExitStatus> {
        if self.status.is_none()
            && let Some(child) = self.child.as_mut()
        {
            match child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                Ok(None) => {}
                Err(e) => warn!(err = %e, "failed to poll process status"),
            }
        }
        self.status
    }

    fn record_exit(&mut self, status: ExitStatus) {
        self.status = Some(status);
        if self.state == ProcessState::Running {
            self.state = ProcessState::Exited(status_code(&status));
        }
        debug!(exit_code = ?status_code(&status), "process exited");
    }

    fn mark_failed_fast(&mut self) {
        if !matches!(self.state, ProcessState::Stopped) {
            self.state = ProcessState::FailedFast;
        }
    }

    fn drain_watcher(&mut self) {
        if let Some(watcher) = self.watcher.as_mut()
            && !watcher.join_timeout(DRAIN_TIMEOUT)
        {
            warn!("output stream still open after process exit");
        }
        self.watcher = None;
    }

    /// Sleep one poll interval, capped at `deadline`. Returns `false` once the
    /// deadline has passed.
    fn sleep_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(self.poll_interval.min(deadline - now));
        true
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if self.child.is_some()
            && let Err(e) = self.stop(DEFAULT_GRACE_PERIOD)
        {
            warn!(err = %e, "failed to stop process on drop");
        }
    }
}

fn status_code(status: &ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(-signal);
        }
    }
    status.code()
}

#[cfg(unix)]
fn terminate(child: &Child) -> io::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(i32::try_from(child.id()).map_err(io::Error::other)?);
    killpg(pgid, Signal::SIGTERM).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.kill()
}

fn force_kill(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(child.id())
            && let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL)
        {
            debug!(err = %e, "killpg failed");
        }
    }
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill failed");
    }
}
