//! Interface presence polling.
use crate::timer::deadline_after;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where the kernel publishes one entry per network interface.
pub const SYSFS_NET_DIR: &str = "/sys/class/net";

/// Default delay between two presence checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Answers "does network interface X exist right now".
///
/// Implementations must not block for long; the probe does the waiting.
pub trait InterfaceLookup: Send + Sync {
    fn exists(&self, name: &str) -> bool;
}

/// Looks interfaces up as entries under a sysfs-style directory.
#[derive(Debug, Clone)]
pub struct SysfsLookup {
    root: PathBuf,
}

impl SysfsLookup {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SysfsLookup {
    fn default() -> Self {
        Self::new(SYSFS_NET_DIR)
    }
}

impl InterfaceLookup for SysfsLookup {
    fn exists(&self, name: &str) -> bool {
        // An empty or path-like name would resolve to the directory itself
        // or escape it.
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return false;
        }
        self.root.join(name).exists()
    }
}

/// Bounded, cancellable polling for an interface.
#[derive(Clone)]
pub struct InterfaceProbe {
    lookup: Arc<dyn InterfaceLookup>,
    poll_interval: Duration,
    cancel: CancellationToken,
}

impl InterfaceProbe {
    pub fn new(lookup: Arc<dyn InterfaceLookup>, cancel: CancellationToken) -> Self {
        Self {
            lookup,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cancel,
        }
    }

    /// Override the delay between checks (a zero interval is bumped to 1ms).
    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Poll until `name` exists or `timeout` elapses.
    ///
    /// Always checks at least once, even with a zero timeout. Returns `true`
    /// as soon as the interface is seen. Cancellation ends the wait early
    /// with `false`.
    pub async fn is_present(&self, name: &str, timeout: Duration) -> bool {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut checks = 0u32;
        loop {
            checks += 1;
            if self.lookup.exists(name) {
                tracing::trace!(interface = name, checks, "interface present");
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::trace!(interface = name, checks, "interface not present");
                return false;
            }

            let step = self.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!(interface = name, "presence check cancelled");
                    return false;
                }
                _ = tokio::time::sleep(step) => {}
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeLookup;
    use super::*;
    use tempfile::tempdir;

    fn probe_with(lookup: Arc<FakeLookup>) -> InterfaceProbe {
        InterfaceProbe::new(lookup, CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn test_present_returns_immediately() {
        let lookup = Arc::new(FakeLookup::new(true));
        let probe = probe_with(lookup.clone());
        let start = Instant::now();
        assert!(probe.is_present("ppp0", Duration::from_secs(20)).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(lookup.checks(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_waits_full_timeout() {
        let lookup = Arc::new(FakeLookup::new(false));
        let probe = probe_with(lookup.clone());
        let start = Instant::now();
        assert!(!probe.is_present("ppp0", Duration::from_secs(5)).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(6));
        assert!(lookup.checks() >= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_timeout_still_checks_once() {
        let lookup = Arc::new(FakeLookup::new(false));
        let probe = probe_with(lookup.clone());
        assert!(!probe.is_present("ppp0", Duration::ZERO).await);
        assert_eq!(lookup.checks(), 1);

        lookup.set_present(true);
        assert!(probe.is_present("ppp0", Duration::ZERO).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_when_interface_appears() {
        let lookup = Arc::new(FakeLookup::default());
        let start = Instant::now();
        lookup.appear_at(start + Duration::from_secs(3));
        let probe = probe_with(lookup.clone());

        assert!(probe.is_present("ppp0", Duration::from_secs(20)).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited <= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_ends_wait() {
        let lookup = Arc::new(FakeLookup::new(false));
        let cancel = CancellationToken::new();
        let probe = InterfaceProbe::new(lookup, cancel.clone());
        cancel.cancel();

        let start = Instant::now();
        assert!(!probe.is_present("ppp0", Duration::from_secs(60)).await);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_poll_interval() {
        let lookup = Arc::new(FakeLookup::new(false));
        let probe = probe_with(lookup.clone()).with_poll_interval(Duration::from_millis(250));
        assert!(!probe.is_present("ppp0", Duration::from_secs(1)).await);
        // t=0, 0.25, 0.5, 0.75, 1.0
        assert_eq!(lookup.checks(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_timeout_does_not_overflow() {
        let lookup = Arc::new(FakeLookup::new(true));
        let probe = probe_with(lookup.clone());
        assert!(probe.is_present("ppp0", Duration::MAX).await);

        lookup.set_present(false);
        let cancel = CancellationToken::new();
        let probe = InterfaceProbe::new(lookup, cancel.clone());
        let stop = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            cancel.cancel();
        });
        assert!(!probe.is_present("ppp0", Duration::from_secs(u64::MAX)).await);
        stop.await.unwrap();
    }

    #[test]
    fn test_sysfs_lookup_checks_directory_entries() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("ppp0")).unwrap();
        let lookup = SysfsLookup::new(dir.path());

        assert!(lookup.exists("ppp0"));
        assert!(!lookup.exists("ppp1"));
        assert!(!lookup.exists(""));
        assert!(!lookup.exists(".."));
        assert!(!lookup.exists("ppp0/../ppp0"));
    }

    #[test]
    fn test_sysfs_lookup_missing_root() {
        let lookup = SysfsLookup::new("/nonexistent/sys/class/net");
        assert!(!lookup.exists("ppp0"));
    }
}
