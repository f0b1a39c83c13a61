//! Bringing the link up and down.
//!
//! The controller keeps no connection state of its own: whether the link is
//! up is asked of the probe every time.
use crate::probe::InterfaceProbe;
use crate::runner::{CommandOutcome, CommandRunner};
use crate::settings::Tunables;
use std::time::Duration;
use tokio::sync::Mutex;

/// Probe timeout used to decide whether the link is currently up.
pub const STATUS_TIMEOUT: Duration = Duration::from_secs(1);

/// What the controller needs from the settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub interface: String,
    pub on_command: String,
    pub off_command: String,
    /// How long `connect(true)` waits for the interface to show up.
    pub connect_timeout: Duration,
}

impl From<&Tunables> for ControllerConfig {
    fn from(t: &Tunables) -> Self {
        Self {
            interface: t.interface.clone(),
            on_command: t.on_command.clone(),
            off_command: t.off_command.clone(),
            connect_timeout: t.connect_timeout,
        }
    }
}

/// Runs the on/off commands, one at a time.
pub struct ConnectionController {
    config: ControllerConfig,
    runner: CommandRunner,
    probe: InterfaceProbe,
    in_flight: Mutex<()>,
}

impl ConnectionController {
    pub fn new(config: ControllerConfig, runner: CommandRunner, probe: InterfaceProbe) -> Self {
        Self {
            config,
            runner,
            probe,
            in_flight: Mutex::new(()),
        }
    }

    /// Whether the watched interface exists (short probe).
    pub async fn is_connected(&self) -> bool {
        self.probe
            .is_present(&self.config.interface, STATUS_TIMEOUT)
            .await
    }

    /// Run the `on` command unless the link is already up.
    ///
    /// With `wait`, keeps polling the interface for up to the connect
    /// timeout after the command ran. Returns `None` when no command was
    /// issued.
    pub async fn connect(&self, wait: bool) -> Option<CommandOutcome> {
        let _guard = self.in_flight.lock().await;
        if self.is_connected().await {
            tracing::debug!(interface = %self.config.interface, "already connected");
            return None;
        }

        tracing::info!(
            interface = %self.config.interface,
            command = %self.config.on_command,
            "connecting"
        );
        let outcome = self.runner.execute(&self.config.on_command).await;
        log_outcome("on", &self.config.on_command, &outcome);

        if wait {
            let up = self
                .probe
                .is_present(&self.config.interface, self.config.connect_timeout)
                .await;
            if up {
                tracing::info!(interface = %self.config.interface, "interface is up");
            } else {
                tracing::warn!(
                    interface = %self.config.interface,
                    timeout_secs = self.config.connect_timeout.as_secs(),
                    "interface did not come up"
                );
            }
        }
        Some(outcome)
    }

    /// Run the `off` command if the link is up.
    pub async fn disconnect(&self) -> Option<CommandOutcome> {
        let _guard = self.in_flight.lock().await;
        if !self.is_connected().await {
            tracing::debug!(interface = %self.config.interface, "already disconnected");
            return None;
        }
        Some(self.off().await)
    }

    /// Run the `off` command whether or not the interface is still there.
    ///
    /// Used after the link dropped on its own, to let the off command clean up.
    pub async fn run_off(&self) -> CommandOutcome {
        let _guard = self.in_flight.lock().await;
        self.off().await
    }

    async fn off(&self) -> CommandOutcome {
        tracing::info!(
            interface = %self.config.interface,
            command = %self.config.off_command,
            "disconnecting"
        );
        let outcome = self.runner.execute(&self.config.off_command).await;
        log_outcome("off", &self.config.off_command, &outcome);
        outcome
    }
}

fn log_outcome(which: &str, command: &str, outcome: &CommandOutcome) {
    match outcome.status {
        Some(0) => tracing::debug!(which, command, output = %outcome.output.trim_end(), "command succeeded"),
        Some(status) => tracing::warn!(
            which,
            command,
            status,
            output = %outcome.output.trim_end(),
            "command exited with nonzero status"
        ),
        None => tracing::warn!(which, command, error = %outcome.output, "command could not be run"),
    }
}
