//! Readiness checks polled by the supervisor.

use std::cell::Cell;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use regex::Regex;

use crate::core::patterns::{self, DEFAULT_ENDPOINT_PATTERN};
use crate::core::types::Readiness;
use crate::io::watcher::Transcript;

/// Decides whether a started process is ready to serve.
///
/// Called repeatedly from the waiting thread; must not block for long.
pub trait ReadinessCheck {
    fn poll(&self, transcript: &Transcript) -> Option<Readiness>;
}

impl<F> ReadinessCheck for F
where
    F: Fn(&Transcript) -> Option<Readiness>,
{
    fn poll(&self, transcript: &Transcript) -> Option<Readiness> {
        self(transcript)
    }
}

/// Ready once any output line matches a line-start regex. Group 1, when
/// present, names the service.
///
/// Each poll only scans lines added since the previous one, so a check
/// follows a single transcript.
#[derive(Debug, Clone)]
pub struct MarkerCheck {
    regex: Regex,
    scanned: Cell<usize>,
}

impl MarkerCheck {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: patterns::anchored(pattern)?,
            scanned: Cell::new(0),
        })
    }

    /// RDFox's "REST endpoint was successfully started" line.
    pub fn rdfox_endpoint() -> Result<Self, regex::Error> {
        Self::new(DEFAULT_ENDPOINT_PATTERN)
    }
}

impl ReadinessCheck for MarkerCheck {
    fn poll(&self, transcript: &Transcript) -> Option<Readiness> {
        let start = self.scanned.get();
        let fresh = transcript.lines_from(start);
        for (offset, line) in fresh.iter().enumerate() {
            if let Some(service) = patterns::capture_service(&self.regex, line) {
                // Stay on the matching line so later polls agree.
                self.scanned.set(start + offset);
                return Some(Readiness { service });
            }
        }
        self.scanned.set(start + fresh.len());
        None
    }
}

/// Ready once a TCP connection to `addr` succeeds.
#[derive(Debug, Clone, Copy)]
pub struct ConnectCheck {
    pub addr: SocketAddr,
    pub timeout: Duration,
}

impl ConnectCheck {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: Duration::from_millis(200),
        }
    }
}

impl ReadinessCheck for ConnectCheck {
    fn poll(&self, _transcript: &Transcript) -> Option<Readiness> {
        TcpStream::connect_timeout(&self.addr, self.timeout)
            .ok()
            .map(|_| Readiness {
                service: Some(self.addr.port().to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::TcpListener;

    use crate::core::patterns::FatalPredicate;
    use crate::io::watcher::{ErrorSignal, OutputWatcher};

    fn transcript_of(text: &str) -> Transcript {
        let transcript = Transcript::new();
        let mut watcher = OutputWatcher::spawn(
            Cursor::new(text.as_bytes().to_vec()),
            transcript.clone(),
            ErrorSignal::new(),
            FatalPredicate::rdfox_default(),
            None,
        )
        .expect("spawn");
        assert!(watcher.join_timeout(Duration::from_secs(5)));
        transcript
    }

    #[test]
    fn marker_captures_service_name() {
        let check = MarkerCheck::rdfox_endpoint().expect("regex");
        let transcript = transcript_of(
            "Starting\nThe REST endpoint was successfully started at port number/service name 12110 with 8 threads.\n",
        );
        assert_eq!(
            check.poll(&transcript),
            Some(Readiness {
                service: Some("12110".to_string())
            })
        );
    }

    #[test]
    fn marker_must_start_the_line() {
        let marker = || MarkerCheck::new("READY").expect("regex");
        assert_eq!(marker().poll(&transcript_of("not READY\n")), None);
        assert_eq!(
            marker().poll(&transcript_of("READY now\n")),
            Some(Readiness { service: None })
        );
    }

    #[test]
    fn marker_scans_only_new_lines_and_keeps_its_match() {
        let check = MarkerCheck::new("READY").expect("regex");
        let transcript = Transcript::new();
        transcript.push("starting".to_string());
        transcript.push("loading".to_string());
        assert_eq!(check.poll(&transcript), None);
        assert_eq!(check.scanned.get(), 2);

        transcript.push("READY".to_string());
        transcript.push("serving".to_string());
        let ready = Some(Readiness { service: None });
        assert_eq!(check.poll(&transcript), ready);
        assert_eq!(check.scanned.get(), 2);
        assert_eq!(check.poll(&transcript), ready);
    }

    #[test]
    fn connect_check_sees_listening_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let check = ConnectCheck::new(addr);
        let ready = check.poll(&Transcript::new()).expect("ready");
        assert_eq!(ready.service, Some(addr.port().to_string()));
    }

    #[test]
    fn closures_are_checks() {
        let check = |t: &Transcript| t.contains("up").then_some(Readiness { service: None });
        assert!(check.poll(&transcript_of("going up\n")).is_some());
    }
}
