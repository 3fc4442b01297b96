//! Run configuration (TOML).

use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::patterns::{self, DEFAULT_ENDPOINT_PATTERN, DEFAULT_ERROR_PATTERN, FatalPredicate};
use crate::core::script::DEFAULT_EXECUTABLE;
use crate::io::readiness::MarkerCheck;

/// Overrides `executable`.
pub const ENV_EXECUTABLE: &str = "RDFOX_EXECUTABLE";
/// Any non-empty value keeps the sandbox directory after the run.
pub const ENV_KEEP_WORKING_DIR: &str = "RDFOX_RUNNER_KEEP_WORKING_DIR";

/// Settings shared by every run. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunnerConfig {
    /// RDFox binary, looked up on `PATH` when not absolute.
    pub executable: String,

    /// How long to wait for the endpoint to come up.
    pub readiness_timeout_secs: u64,

    /// How long a terminated process gets before it is killed.
    pub grace_period_secs: u64,

    pub poll_interval_ms: u64,

    /// Upper bound for batch runs that wait for the process to finish.
    pub command_timeout_secs: u64,

    /// Per-request timeout for endpoint calls.
    pub http_timeout_secs: u64,

    /// Keep the sandbox directory instead of removing it.
    pub keep_working_dir: bool,

    /// Datastore queried by the endpoint client.
    pub datastore: String,

    /// Host the endpoint is reached on.
    pub endpoint_host: String,

    /// Port used when the readiness line does not name one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_port: Option<u16>,

    pub patterns: PatternConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatternConfig {
    /// Lines starting with a match are fatal.
    pub error: String,
    /// Readiness line; group 1 is the port or service name.
    pub endpoint: String,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            error: DEFAULT_ERROR_PATTERN.to_string(),
            endpoint: DEFAULT_ENDPOINT_PATTERN.to_string(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            executable: DEFAULT_EXECUTABLE.to_string(),
            readiness_timeout_secs: 10,
            grace_period_secs: 5,
            poll_interval_ms: 50,
            command_timeout_secs: 60 * 60,
            http_timeout_secs: 30,
            keep_working_dir: false,
            datastore: "default".to_string(),
            endpoint_host: "127.0.0.1".to_string(),
            endpoint_port: None,
            patterns: PatternConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.executable.trim().is_empty() {
            return Err(anyhow!("executable must not be empty"));
        }
        if self.readiness_timeout_secs == 0 {
            return Err(anyhow!("readiness_timeout_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.http_timeout_secs == 0 {
            return Err(anyhow!("http_timeout_secs must be > 0"));
        }
        if self.datastore.trim().is_empty() {
            return Err(anyhow!("datastore must not be empty"));
        }
        if self.endpoint_host.trim().is_empty() {
            return Err(anyhow!("endpoint_host must not be empty"));
        }
        patterns::anchored(&self.patterns.error).context("patterns.error is not a valid regex")?;
        patterns::anchored(&self.patterns.endpoint)
            .context("patterns.endpoint is not a valid regex")?;
        Ok(())
    }

    /// Apply `RDFOX_EXECUTABLE` and `RDFOX_RUNNER_KEEP_WORKING_DIR`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(exe) = lookup(ENV_EXECUTABLE).filter(|v| !v.trim().is_empty()) {
            self.executable = exe;
        }
        if lookup(ENV_KEEP_WORKING_DIR).is_some_and(|v| !v.is_empty()) {
            self.keep_working_dir = true;
        }
        self
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn fatal_predicate(&self) -> Result<FatalPredicate, regex::Error> {
        FatalPredicate::new(&self.patterns.error)
    }

    pub fn endpoint_check(&self) -> Result<MarkerCheck, regex::Error> {
        MarkerCheck::new(&self.patterns.endpoint)
    }
}

/// Load config from a TOML file, then apply environment overrides.
///
/// If the file is missing, starts from `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    let cfg = if path.exists() {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        toml::from_str::<RunnerConfig>(&contents)
            .with_context(|| format!("parse {}", path.display()))?
    } else {
        RunnerConfig::default()
    };
    let cfg = cfg.with_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

/// Write `cfg` as TOML, replacing the file atomically.
///
/// An existing file is only replaced with `overwrite`.
pub fn write_config(path: &Path, cfg: &RunnerConfig, overwrite: bool) -> Result<()> {
    if path.exists() && !overwrite {
        bail!("{} already exists", path.display());
    }
    cfg.validate()?;
    let contents = toml::to_string_pretty(cfg).context("serialize config toml")?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write {}", tmp.path().display()))?;
    tmp.persist(path)
        .with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
