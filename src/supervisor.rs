//! The supervisor loop.
//!
//! Every `check_interval` the supervisor probes the interface and reacts to
//! changes: the timer follows the link, a link that drops after the grace
//! period gets the off command (when `run_off_if_fails` is set), and a link
//! that is down gets the on command (when `auto_connect` is set). Connected
//! time is credited to `cumulative_time` in whole slots.
use crate::controller::ConnectionController;
use crate::settings::{keys, SettingsStore, Tunables};
use crate::status::{LinkReport, LinkState, StatusFile};
use crate::timer::{deadline_after, ElapsedTimer, TimerStatus};
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct Supervisor {
    store: SettingsStore,
    tunables: Tunables,
    controller: ConnectionController,
    timer: ElapsedTimer,
    cancel: CancellationToken,
    status_file: Option<StatusFile>,
    /// Failure-triggered off commands are suppressed until then.
    grace_until: Instant,
    last_connect: Option<Instant>,
    link_up: bool,
    /// Part of the current run already added to `cumulative`.
    credited: Duration,
    cumulative: u64,
    session_start: Option<DateTime<Utc>>,
}

impl Supervisor {
    pub fn new(
        store: SettingsStore,
        controller: ConnectionController,
        cancel: CancellationToken,
    ) -> Self {
        let tunables = Tunables::from_store(&store);
        let cumulative = store.get_value(keys::CUMULATIVE_TIME, 0u64);
        let status_file = tunables.status_file.clone().map(StatusFile::new);
        Self {
            grace_until: deadline_after(Instant::now(), tunables.check_grace_time),
            store,
            tunables,
            controller,
            timer: ElapsedTimer::default(),
            cancel,
            status_file,
            last_connect: None,
            link_up: false,
            credited: Duration::ZERO,
            cumulative,
            session_start: None,
        }
    }

    #[cfg(test)]
    pub fn timer(&self) -> &ElapsedTimer {
        &self.timer
    }

    /// Total credited connection time, in seconds.
    pub fn cumulative_time(&self) -> u64 {
        self.cumulative
    }

    #[cfg(test)]
    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    /// Tick until cancelled, then shut down.
    pub async fn run(&mut self) {
        tracing::info!(
            profile = self.store.active_section(),
            interface = %self.tunables.interface,
            check_interval_secs = self.tunables.check_interval.as_secs(),
            grace_secs = self.tunables.check_grace_time.as_secs(),
            cumulative_time = self.cumulative,
            "supervisor starting"
        );
        self.write_status(LinkState::Starting);

        while !self.cancel.is_cancelled() {
            self.tick().await;

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.tunables.check_interval) => {}
            }
        }

        self.shutdown().await;
    }

    /// One supervision step.
    pub async fn tick(&mut self) {
        let present = self.controller.is_connected().await;
        if self.cancel.is_cancelled() {
            // A cancelled probe says nothing about the link.
            return;
        }
        let now = Instant::now();
        let in_grace = now < self.grace_until;

        match (self.link_up, present) {
            (false, true) => {
                tracing::info!(interface = %self.tunables.interface, "interface is up");
                self.timer.set_status(TimerStatus::On);
                self.credited = Duration::ZERO;
                self.session_start = Some(Utc::now());
            }
            (true, false) => {
                self.fold_elapsed();
                tracing::warn!(
                    interface = %self.tunables.interface,
                    connected_for = %self.timer,
                    "interface went away"
                );
                self.timer.set_status(TimerStatus::Off);
                self.session_start = None;

                if in_grace {
                    tracing::info!("within grace period, not running off command");
                } else if self.tunables.run_off_if_fails {
                    self.controller.run_off().await;
                }
            }
            _ => {}
        }
        self.link_up = present;

        if !present && self.tunables.auto_connect && self.connect_due(now) {
            self.last_connect = Some(now);
            self.grace_until = self
                .grace_until
                .max(deadline_after(now, self.tunables.check_grace_time));
            self.controller.connect(false).await;
        }

        self.fold_elapsed();
        self.write_status(self.link_state());
    }

    /// No connect attempt is still inside its grace period.
    fn connect_due(&self, now: Instant) -> bool {
        match self.last_connect {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.tunables.check_grace_time,
        }
    }

    fn link_state(&self) -> LinkState {
        if self.link_up {
            LinkState::Connected
        } else if self.last_connect.is_some() && Instant::now() < self.grace_until {
            LinkState::Connecting
        } else {
            LinkState::Disconnected
        }
    }

    /// Credit whole slots of the current run to `cumulative_time`.
    ///
    /// Only whole slots are added; the remainder stays uncredited until a
    /// later fold covers another full slot.
    fn fold_elapsed(&mut self) {
        if !self.timer.is_running() {
            return;
        }
        let slot = self.tunables.cumulative_time_slot.max(1);
        let pending = self.timer.elapsed().saturating_sub(self.credited).as_secs();
        let add = (pending / slot) * slot;
        if add == 0 {
            return;
        }

        self.credited += Duration::from_secs(add);
        self.cumulative = self.cumulative.saturating_add(add);
        tracing::debug!(added = add, cumulative_time = self.cumulative, "credited connected time");

        let stored = i64::try_from(self.cumulative).unwrap_or(i64::MAX);
        self.store.set_value(keys::CUMULATIVE_TIME, stored);
        if let Err(e) = self.store.save() {
            tracing::error!(error = %e, "failed to save cumulative time");
        }
    }

    async fn shutdown(&mut self) {
        tracing::info!("supervisor shutting down");
        self.write_status(LinkState::ShuttingDown);
        self.fold_elapsed();

        if self.tunables.run_off_at_exit && self.timer.is_running() {
            tracing::info!("link still up, running off command before exit");
            self.controller.disconnect().await;
        }
        self.timer.set_status(TimerStatus::Off);

        if let Some(status) = &self.status_file {
            status.clear();
        }
        tracing::info!(cumulative_time = self.cumulative, "supervisor stopped");
    }

    fn write_status(&self, state: LinkState) {
        let Some(status) = &self.status_file else {
            return;
        };
        let report = LinkReport::capture(
            self.store.active_section(),
            &self.tunables.interface,
            state,
            &self.timer,
            self.cumulative,
            self.session_start,
        );
        if let Err(e) = status.publish(&report) {
            tracing::warn!(error = %e, "failed to write status file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerConfig;
    use crate::probe::testing::FakeLookup;
    use crate::probe::InterfaceProbe;
    use crate::runner::testing::RecordingLauncher;
    use crate::runner::CommandRunner;
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const INTERVAL: u64 = 60;
    const GRACE: u64 = 300;

    struct Harness {
        _dir: TempDir,
        lookup: Arc<FakeLookup>,
        launcher: Arc<RecordingLauncher>,
        cancel: CancellationToken,
        supervisor: Supervisor,
    }

    fn harness(present: bool, configure: impl FnOnce(&mut SettingsStore)) -> Harness {
        let dir = tempdir().unwrap();
        let mut store = SettingsStore::load_or_create(dir.path().join("inetman.toml")).unwrap();
        store.set_value(keys::CHECK_INTERVAL, INTERVAL as i64);
        store.set_value(keys::CHECK_GRACE_TIME, GRACE as i64);
        configure(&mut store);

        let lookup = Arc::new(FakeLookup::new(present));
        let launcher = Arc::new(RecordingLauncher::default());
        let cancel = CancellationToken::new();

        let tunables = Tunables::from_store(&store);
        let controller = ConnectionController::new(
            ControllerConfig::from(&tunables),
            CommandRunner::new(launcher.clone(), false),
            InterfaceProbe::new(lookup.clone(), cancel.clone()),
        );
        let supervisor = Supervisor::new(store, controller, cancel.clone());

        Harness {
            _dir: dir,
            lookup,
            launcher,
            cancel,
            supervisor,
        }
    }

    async fn interval() {
        tokio::time::sleep(Duration::from_secs(INTERVAL)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_interface_connects_once_then_counts_time() {
        let mut h = harness(false, |_| {});

        h.supervisor.tick().await;
        assert_eq!(h.launcher.count("pon"), 1);
        assert!(!h.supervisor.timer().is_running());

        // still down, but the connect attempt is inside its grace period
        interval().await;
        h.supervisor.tick().await;
        assert_eq!(h.launcher.count("pon"), 1);

        h.lookup.set_present(true);
        interval().await;
        h.supervisor.tick().await;
        assert!(h.supervisor.timer().is_running());

        let n = 4;
        for _ in 0..n {
            interval().await;
            h.supervisor.tick().await;
        }
        assert_eq!(h.supervisor.cumulative_time(), n * INTERVAL);
        assert_eq!(h.launcher.count("pon"), 1);
        assert_eq!(h.launcher.count("poff"), 0);

        let reloaded = SettingsStore::load(h.supervisor.store().path()).unwrap();
        assert_eq!(reloaded.get_value(keys::CUMULATIVE_TIME, 0u64), n * INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_time_continues_from_stored_value() {
        let mut h = harness(true, |s| s.set_value(keys::CUMULATIVE_TIME, 1000));

        h.supervisor.tick().await;
        interval().await;
        h.supervisor.tick().await;
        assert_eq!(h.supervisor.cumulative_time(), 1000 + INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cumulative_time_credits_whole_slots_only() {
        let mut h = harness(true, |s| s.set_value(keys::CUMULATIVE_TIME_SLOT, 25));

        h.supervisor.tick().await;
        interval().await;
        h.supervisor.tick().await;
        // 60s connected: two 25s slots credited, 10s carried
        assert_eq!(h.supervisor.cumulative_time(), 50);

        interval().await;
        h.supervisor.tick().await;
        // 120s connected: the carried 10s completes a slot
        assert_eq!(h.supervisor.cumulative_time(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_grace_runs_off_once() {
        let mut h = harness(true, |s| s.set_value(keys::AUTO_CONNECT, false));

        h.supervisor.tick().await;
        assert!(h.supervisor.timer().is_running());

        tokio::time::sleep(Duration::from_secs(GRACE)).await;
        h.supervisor.tick().await;
        h.lookup.set_present(false);
        interval().await;
        h.supervisor.tick().await;

        assert_eq!(h.launcher.count("poff"), 1);
        assert!(!h.supervisor.timer().is_running());
        assert_eq!(h.supervisor.timer().elapsed(), Duration::ZERO);

        // staying down does not repeat the off command
        interval().await;
        h.supervisor.tick().await;
        assert_eq!(h.launcher.count("poff"), 1);
        assert_eq!(h.launcher.count("pon"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_credits_time_up_to_the_drop() {
        let mut h = harness(true, |s| s.set_value(keys::AUTO_CONNECT, false));

        h.supervisor.tick().await;
        interval().await;
        h.supervisor.tick().await;
        h.lookup.set_present(false);
        interval().await;
        h.supervisor.tick().await;

        // noticed one interval (plus the 1s presence check) after the last
        // tick; that time still counts
        assert_eq!(h.supervisor.cumulative_time(), 2 * INTERVAL + 1);
        interval().await;
        h.supervisor.tick().await;
        assert_eq!(h.supervisor.cumulative_time(), 2 * INTERVAL + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_during_grace_does_not_run_off() {
        let mut h = harness(true, |_| {});

        h.supervisor.tick().await;
        h.lookup.set_present(false);
        interval().await;
        h.supervisor.tick().await;

        assert_eq!(h.launcher.count("poff"), 0);
        assert!(!h.supervisor.timer().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_without_run_off_policy() {
        let mut h = harness(true, |s| {
            s.set_value(keys::RUN_OFF_IF_FAILS, false);
            s.set_value(keys::AUTO_CONNECT, false);
        });

        h.supervisor.tick().await;
        tokio::time::sleep(Duration::from_secs(GRACE + 1)).await;
        h.lookup.set_present(false);
        h.supervisor.tick().await;

        assert!(h.launcher.calls().is_empty());
        assert!(!h.supervisor.timer().is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_grace_reconnects() {
        let mut h = harness(true, |_| {});

        h.supervisor.tick().await;
        tokio::time::sleep(Duration::from_secs(GRACE + 1)).await;
        h.lookup.set_present(false);
        h.supervisor.tick().await;

        let programs: Vec<String> = h.launcher.calls().into_iter().map(|c| c[0].clone()).collect();
        assert_eq!(programs, vec!["poff", "pon"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_link_up_runs_off_once() {
        let mut h = harness(true, |_| {});
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3 * INTERVAL + 1)).await;
            cancel.cancel();
        });

        h.supervisor.run().await;

        assert_eq!(h.launcher.count("poff"), 1);
        assert_eq!(h.launcher.count("pon"), 0);
        assert!(!h.supervisor.timer().is_running());
        assert_eq!(h.supervisor.cumulative_time(), 3 * INTERVAL + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_run_off_at_exit() {
        let mut h = harness(true, |s| s.set_value(keys::RUN_OFF_AT_EXIT, false));
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(INTERVAL)).await;
            cancel.cancel();
        });

        h.supervisor.run().await;
        assert!(h.launcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_with_link_down_runs_nothing() {
        let mut h = harness(false, |s| s.set_value(keys::AUTO_CONNECT, false));
        h.cancel.cancel();

        h.supervisor.run().await;
        assert!(h.launcher.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_presence_check_is_not_a_drop() {
        let mut h = harness(true, |s| s.set_value(keys::AUTO_CONNECT, false));
        h.supervisor.tick().await;
        tokio::time::sleep(Duration::from_secs(GRACE + 1)).await;

        // the link goes away and shutdown arrives halfway through the 1s check
        h.lookup.set_present(false);
        let cancel = h.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cancel.cancel();
        });
        h.supervisor.tick().await;

        assert!(h.cancel.is_cancelled());
        assert!(h.supervisor.timer().is_running());
        assert!(h.launcher.calls().is_empty());

        h.supervisor.run().await;
        assert!(h.launcher.count("poff") <= 1);
        assert_eq!(h.launcher.count("pon"), 0);
        assert!(!h.supervisor.timer().is_running());
        assert!(h.supervisor.cumulative_time() >= GRACE + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_grace_time_does_not_overflow() {
        let mut h = harness(true, |s| s.set_value(keys::CHECK_GRACE_TIME, i64::MAX));

        h.supervisor.tick().await;
        h.lookup.set_present(false);
        interval().await;
        h.supervisor.tick().await;

        // the drop falls inside the grace period; one connect attempt is made
        assert_eq!(h.launcher.count("poff"), 0);
        assert_eq!(h.launcher.count("pon"), 1);

        interval().await;
        h.supervisor.tick().await;
        assert_eq!(h.launcher.count("pon"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_file_written_and_removed() {
        let dir = tempdir().unwrap();
        let status_path = dir.path().join("inetman.status");
        let path_value = status_path.to_string_lossy().into_owned();
        let mut h = harness(true, move |s| s.set_value(keys::STATUS_FILE, path_value));

        h.supervisor.tick().await;
        let contents = std::fs::read_to_string(&status_path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["state"], "connected");
        assert_eq!(parsed["interface"], "ppp0");
        assert_eq!(parsed["profile"], "inetman");

        h.cancel.cancel();
        h.supervisor.run().await;
        assert!(!status_path.exists());
    }
}
