//! Connected-time tracking.
//!
//! The timer only carries intent between ticks: whether the link is believed
//! to be up and since when. It is never persisted.
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::time::Duration;
use tokio::time::Instant;

/// Default pattern used by [`ElapsedTimer::format`] and `Display`.
pub const DEFAULT_FORMAT: &str = "%H:%M:%S";

/// Requested timer state, as driven by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStatus {
    On,
    Off,
}

/// Tracks the time elapsed since the link came up.
#[derive(Debug, Clone)]
pub struct ElapsedTimer {
    start: Instant,
    running: bool,
    format: String,
}

impl ElapsedTimer {
    /// A stopped timer with its start set to now.
    pub fn new() -> Self {
        Self::with_format(DEFAULT_FORMAT)
    }

    /// A stopped timer rendering with the given strftime-style pattern.
    pub fn with_format(format: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            running: false,
            format: format.into(),
        }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Mark the timer running without touching the start instant.
    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn restart(&mut self) {
        self.reset();
        self.start();
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn set_status(&mut self, status: TimerStatus) {
        match status {
            TimerStatus::On => self.restart(),
            TimerStatus::Off => self.stop(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Time since the last restart, or zero when stopped.
    pub fn elapsed(&self) -> Duration {
        if self.running {
            Instant::now().saturating_duration_since(self.start)
        } else {
            Duration::ZERO
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }

    /// Render the elapsed time through a strftime-style pattern.
    ///
    /// The pattern is applied to the epoch shifted by the elapsed time, so
    /// `%H:%M:%S` yields `00:00:00` for a stopped timer and wraps after a day.
    /// An invalid pattern falls back to [`DEFAULT_FORMAT`].
    pub fn format(&self, pattern: &str) -> String {
        render(self.elapsed_secs(), pattern)
    }
}

impl Default for ElapsedTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ElapsedTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(&self.format))
    }
}

impl PartialEq<Duration> for ElapsedTimer {
    fn eq(&self, other: &Duration) -> bool {
        self.elapsed() == *other
    }
}

impl PartialOrd<Duration> for ElapsedTimer {
    fn partial_cmp(&self, other: &Duration) -> Option<Ordering> {
        Some(self.elapsed().cmp(other))
    }
}

/// Stand-in for "never" when a deadline would overflow the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + after`, saturating decades ahead instead of overflowing.
pub fn deadline_after(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Render a number of seconds the way the timer does.
pub fn render(secs: u64, pattern: &str) -> String {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX);
    let Some(moment) = DateTime::<Utc>::from_timestamp(secs, 0) else {
        return String::from("--:--:--");
    };
    let mut out = String::new();
    if write!(out, "{}", moment.format(pattern)).is_ok() {
        return out;
    }
    tracing::debug!(pattern, "invalid time format, using default");
    moment.format(DEFAULT_FORMAT).to_string()
}
