//! Live link report shared with other processes.
//!
//! While `run` is active the supervisor publishes a JSON report at the
//! configured `status_file`; `inetman status` reads it back to show what the
//! running supervisor sees. The report is replaced whole on every tick and
//! deleted at exit, so a missing file means nobody is publishing.
use crate::timer::ElapsedTimer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// Where the supervisor stands with the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Starting,
    /// Down, with a connect attempt still inside its grace period.
    Connecting,
    Connected,
    Disconnected,
    ShuttingDown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LinkState::Starting => "starting",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::ShuttingDown => "shutting down",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    pub pid: u32,
    pub profile: String,
    pub interface: String,
    pub state: LinkState,
    /// Current connection time as rendered by the timer.
    pub connected_for: String,
    pub connected_secs: u64,
    /// Credited total, in seconds.
    pub cumulative_time: u64,
    pub link_up_since: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LinkReport {
    /// Report for this process, as of now.
    pub fn capture(
        profile: &str,
        interface: &str,
        state: LinkState,
        timer: &ElapsedTimer,
        cumulative_time: u64,
        link_up_since: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            pid: std::process::id(),
            profile: profile.to_string(),
            interface: interface.to_string(),
            state,
            connected_for: timer.to_string(),
            connected_secs: timer.elapsed_secs(),
            cumulative_time,
            link_up_since,
            updated_at: Utc::now(),
        }
    }
}

pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Replace the published report. Readers see the old or the new report,
    /// never a mix.
    pub fn publish(&self, report: &LinkReport) -> Result<(), StatusError> {
        let json = serde_json::to_vec_pretty(report).map_err(StatusError::Encode)?;

        let dir = match self.path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d,
            _ => Path::new("."),
        };
        let io_err = |source: std::io::Error| StatusError::Io {
            path: self.path.clone(),
            source,
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
        tmp.write_all(&json).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// The last published report, or `None` when nothing is published.
    pub fn read(&self) -> Result<Option<LinkReport>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StatusError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|source| StatusError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Withdraw the report.
    pub fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed status file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove status file")
            }
        }
    }
}

#[derive(Debug)]
pub enum StatusError {
    Encode(serde_json::Error),
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::Encode(source) => write!(f, "failed to encode link report: {source}"),
            StatusError::Decode { path, source } => {
                write!(f, "malformed status file {}: {source}", path.display())
            }
            StatusError::Io { path, source } => {
                write!(f, "status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Encode(source) => Some(source),
            StatusError::Decode { source, .. } => Some(source),
            StatusError::Io { source, .. } => Some(source),
        }
    }
}
