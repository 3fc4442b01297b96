//! Background reader for a process's merged output.
//!
//! The watcher drains the pipe continuously so the child never blocks on a
//! full buffer. Each line lands in the [`Transcript`]; the first line matching
//! the fatal predicate raises the [`ErrorSignal`]. Both are the only state
//! shared with the caller thread.

use std::io::{BufRead, BufReader, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::core::patterns::FatalPredicate;

/// Callback invoked with every output line, on the watcher thread.
pub type LineCallback = Box<dyn Fn(&str) + Send + 'static>;

/// Append-only record of output lines, readable while it grows.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    lines: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&self, line: String) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line);
    }

    /// Snapshot of every line so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Lines from index `start` onwards.
    pub fn lines_from(&self, start: usize) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        lines.get(start..).map(<[String]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|line| line.contains(needle))
    }

    /// All lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// One-shot flag carrying the output line that triggered it. Never reset.
#[derive(Debug, Clone, Default)]
pub struct ErrorSignal {
    line: Arc<OnceLock<String>>,
}

impl ErrorSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `true` only for the call that actually set it.
    pub fn raise(&self, line: &str) -> bool {
        self.line.set(line.to_string()).is_ok()
    }

    pub fn is_raised(&self) -> bool {
        self.line.get().is_some()
    }

    /// The triggering line, once raised.
    pub fn line(&self) -> Option<String> {
        self.line.get().cloned()
    }
}

/// Handle to the watcher thread.
#[derive(Debug)]
pub struct OutputWatcher {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl OutputWatcher {
    /// Start draining `reader` on a new thread.
    pub fn spawn<R>(
        reader: R,
        transcript: Transcript,
        signal: ErrorSignal,
        predicate: FatalPredicate,
        callback: Option<LineCallback>,
    ) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("output-watcher".to_string())
                .spawn(move || {
                    watch_lines(reader, &transcript, &signal, &predicate, callback, &stop);
                })?
        };
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the reader loop has ended (stream closed or stopped).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Ask the loop to end after the line it is currently reading.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wait up to `timeout` for the stream to close, then join.
    ///
    /// Returns `false` and detaches the thread if it is still blocked reading,
    /// which happens when a grandchild keeps the pipe open.
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                self.stop();
                self.handle.take();
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("output watcher thread panicked");
        }
        true
    }
}

fn watch_lines<R: Read>(
    reader: R,
    transcript: &Transcript,
    signal: &ErrorSignal,
    predicate: &FatalPredicate,
    callback: Option<LineCallback>,
    stop: &AtomicBool,
) {
    debug!(has_callback = callback.is_some(), "output watcher started");
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(err = %err, "output stream read failed");
                break;
            }
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        debug!("cmd> {line}");

        if let Some(callback) = &callback
            && catch_unwind(AssertUnwindSafe(|| callback(&line))).is_err()
        {
            warn!("output callback panicked");
        }
        if predicate.matches(&line) && signal.raise(&line) {
            error!(line = %line, "fatal error reported by process");
        }
        transcript.push(line);

        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(lines = transcript.len(), "output watcher finished");
}
