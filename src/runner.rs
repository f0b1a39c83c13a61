//! External command execution for the connect/disconnect commands.
//!
//! Command lines are split with shell-word rules (quotes and backslash
//! escapes honoured) but never handed to a shell, so there is no globbing,
//! variable expansion or redirection.
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// Result of running (or trying to run) a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Exit status; `None` when the command could not be launched.
    pub status: Option<i32>,
    /// Captured standard output, or the launch failure description.
    pub output: String,
}

impl CommandOutcome {
    fn not_launched(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            output: reason.into(),
        }
    }

    /// The command ran and exited with status 0.
    pub fn succeeded(&self) -> bool {
        self.status == Some(0)
    }
}

/// What a launched child reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Spawns a program and waits for it to exit.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn launch(&self, program: &str, args: &[String]) -> std::io::Result<LaunchOutput>;
}

/// Launches real child processes through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioLauncher;

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn launch(&self, program: &str, args: &[String]) -> std::io::Result<LaunchOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(LaunchOutput {
            status: exit_code(&output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Exit code of a finished child, with signal deaths mapped to 128 + signo.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Runs command lines, or only pretends to in dry-run mode.
#[derive(Clone)]
pub struct CommandRunner {
    launcher: Arc<dyn ProcessLauncher>,
    dry_run: bool,
}

impl CommandRunner {
    pub fn new(launcher: Arc<dyn ProcessLauncher>, dry_run: bool) -> Self {
        Self { launcher, dry_run }
    }

    /// A runner that spawns real processes.
    pub fn system(dry_run: bool) -> Self {
        Self::new(Arc::new(TokioLauncher), dry_run)
    }

    /// Run `command_line`, honouring dry-run mode.
    pub async fn execute(&self, command_line: &str) -> CommandOutcome {
        if self.dry_run {
            tracing::info!(command = command_line, "dry run: would run command");
            return CommandOutcome {
                status: Some(0),
                output: String::new(),
            };
        }
        self.execute_forced(command_line).await
    }

    /// Run `command_line` even in dry-run mode.
    pub async fn execute_forced(&self, command_line: &str) -> CommandOutcome {
        let Some(argv) = shlex::split(command_line) else {
            tracing::warn!(command = command_line, "malformed command line");
            return CommandOutcome::not_launched(format!(
                "malformed command line: {command_line}"
            ));
        };
        let Some((program, args)) = argv.split_first() else {
            tracing::warn!("empty command line");
            return CommandOutcome::not_launched("empty command line");
        };

        tracing::debug!(program = %program, args = ?args, "running command");
        match self.launcher.launch(program, args).await {
            Ok(out) => {
                if !out.stderr.is_empty() {
                    tracing::debug!(program = %program, stderr = %out.stderr.trim_end(), "command stderr");
                }
                tracing::debug!(program = %program, status = out.status, "command finished");
                CommandOutcome {
                    status: Some(out.status),
                    output: out.stdout,
                }
            }
            Err(e) => {
                tracing::warn!(program = %program, error = %e, "failed to launch command");
                CommandOutcome::not_launched(format!("failed to launch {program}: {e}"))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{LaunchOutput, ProcessLauncher};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every launch and answers with a fixed status.
    #[derive(Default)]
    pub struct RecordingLauncher {
        calls: Mutex<Vec<Vec<String>>>,
        status: i32,
        fail_with: Option<std::io::ErrorKind>,
    }

    impl RecordingLauncher {
        pub fn with_status(status: i32) -> Self {
            Self {
                status,
                ..Default::default()
            }
        }

        pub fn failing(kind: std::io::ErrorKind) -> Self {
            Self {
                fail_with: Some(kind),
                ..Default::default()
            }
        }

        /// Every launch as `[program, args...]`.
        pub fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }

        /// Launches whose program is `program`.
        pub fn count(&self, program: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|argv| argv.first().map(String::as_str) == Some(program))
                .count()
        }
    }

    #[async_trait]
    impl ProcessLauncher for RecordingLauncher {
        async fn launch(&self, program: &str, args: &[String]) -> std::io::Result<LaunchOutput> {
            let mut argv = vec![program.to_string()];
            argv.extend(args.iter().cloned());
            self.calls.lock().unwrap().push(argv);

            if let Some(kind) = self.fail_with {
                return Err(std::io::Error::new(kind, "simulated launch failure"));
            }
            Ok(LaunchOutput {
                status: self.status,
                stdout: format!("ran {program}\n"),
                stderr: String::new(),
            })
        }
    }
}
