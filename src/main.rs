mod controller;
mod lock;
mod logging;
mod probe;
mod runner;
mod settings;
mod signals;
mod status;
mod supervisor;
mod timer;

use clap::{Parser, Subcommand};
use controller::{ConnectionController, ControllerConfig};
use lock::InstanceLock;
use logging::LogLevel;
use probe::{InterfaceProbe, SysfsLookup};
use runner::{CommandOutcome, CommandRunner};
use settings::{keys, SettingsStore, Tunables, DEFAULT_CONFIG_PATH};
use status::StatusFile;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;

/// Runs pon/poff style commands, watches the interface they bring up and
/// keeps track of the time spent connected.
#[derive(Parser, Debug)]
#[command(name = "inetman", version, about)]
pub struct Cli {
    /// Print logs of the specified level or higher
    #[arg(long, value_enum, default_value = "info", global = true)]
    logging_level: LogLevel,

    /// Print logs into the given file instead of stderr
    #[arg(long, value_name = "FILE", global = true)]
    logging_file: Option<PathBuf>,

    /// Settings file (created with defaults if missing)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Switch the active profile (created with defaults if missing)
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Log the commands that would run instead of running them
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Supervise the link until interrupted (default)
    Run,
    /// Run the `on` command unless the link is already up
    Connect {
        /// Wait for the interface to appear
        #[arg(short, long)]
        wait: bool,
    },
    /// Run the `off` command if the link is up
    Disconnect,
    /// Print the active profile, link state, cumulative time and supervisor report
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not errors
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    if let Err(e) = logging::init(cli.logging_level, cli.logging_file.as_deref()) {
        eprintln!("inetman: failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("inetman: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut store = SettingsStore::load_or_create(&cli.config)?;
    if let Some(profile) = cli.profile.as_deref() {
        if store.active_section() != profile {
            store.set_active(profile);
            store.save()?;
            tracing::info!(profile, "switched active profile");
        }
    }

    let tunables = Tunables::from_store(&store);
    let cancel = CancellationToken::new();
    let controller = build_controller(&tunables, cli.dry_run, cancel.clone());

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let _lock = InstanceLock::acquire(InstanceLock::path_for(store.path()))?;
            signals::install(cancel.clone())?;
            let mut supervisor = Supervisor::new(store, controller, cancel);
            supervisor.run().await;
            tracing::info!(
                cumulative_time = %format_total(supervisor.cumulative_time()),
                "total connected time"
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Connect { wait } => {
            signals::install(cancel)?;
            let Some(outcome) = controller.connect(wait).await else {
                println!("{} is already up", tunables.interface);
                return Ok(ExitCode::SUCCESS);
            };
            report("on", &outcome);
            let up = !wait || controller.is_connected().await;
            if wait && !up {
                println!("{} did not come up", tunables.interface);
            }
            Ok(exit_code(outcome.succeeded() && up))
        }
        Command::Disconnect => {
            let Some(outcome) = controller.disconnect().await else {
                println!("{} is already down", tunables.interface);
                return Ok(ExitCode::SUCCESS);
            };
            report("off", &outcome);
            Ok(exit_code(outcome.succeeded()))
        }
        Command::Status => {
            let connected = controller.is_connected().await;
            let cumulative = store.get_value(keys::CUMULATIVE_TIME, 0u64);
            println!("profile:         {}", store.active_section());
            println!("settings:        {}", store.path().display());
            println!(
                "interface:       {} ({})",
                tunables.interface,
                if connected { "up" } else { "down" }
            );
            println!(
                "cumulative time: {} ({cumulative}s)",
                format_total(cumulative)
            );
            if let Some(path) = &tunables.status_file {
                match StatusFile::new(path).read() {
                    Ok(Some(report)) => println!(
                        "supervisor:      {} (pid {}, connected for {})",
                        report.state, report.pid, report.connected_for
                    ),
                    Ok(None) => println!("supervisor:      not running"),
                    Err(e) => tracing::warn!(error = %e, "could not read status file"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn build_controller(
    tunables: &Tunables,
    dry_run: bool,
    cancel: CancellationToken,
) -> ConnectionController {
    let runner = CommandRunner::system(dry_run);
    let probe = InterfaceProbe::new(Arc::new(SysfsLookup::default()), cancel);
    ConnectionController::new(ControllerConfig::from(tunables), runner, probe)
}

fn report(which: &str, outcome: &CommandOutcome) {
    let output = outcome.output.trim_end();
    if !output.is_empty() {
        println!("{output}");
    }
    match outcome.status {
        Some(0) => {}
        Some(status) => eprintln!("inetman: `{which}` command exited with status {status}"),
        None => eprintln!("inetman: `{which}` command could not be run"),
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// `H:MM:SS` without wrapping at a day.
fn format_total(secs: u64) -> String {
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
