//! procvisor binary: CLI client subcommands, plus the hidden `init`
//! subcommand that runs the daemon itself.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};

use procvisor::client::commands::{self, RunOnceOpts, TailOpts};
use procvisor::config::duration::parse_duration;
use procvisor::config::{self, settings, Overrides, Settings};
use procvisor::server::{self, Server};

#[derive(Parser)]
#[command(
    name = "procvisor",
    version,
    about = "Run and supervise background services"
)]
struct Cli {
    /// Path to the socket used to talk to the server.
    #[arg(long, global = true, hide = true, value_name = "PATH")]
    fifo: Option<PathBuf>,

    /// Path to the server's log file, or '-' for stdout.
    #[arg(long, global = true, hide = true, value_name = "PATH")]
    log: Option<PathBuf>,

    /// Increase log verbosity; can be used multiple times.
    #[arg(short = 'v', long = "verbose", global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List services
    List {
        /// Only running services
        #[arg(long)]
        running: bool,
        /// Only temporary services
        #[arg(long)]
        temp: bool,
        /// Detailed listing
        #[arg(long)]
        long: bool,
    },

    /// Start a stopped service
    Start {
        /// Follow the service's output after starting
        #[arg(long)]
        tail: bool,
        name: String,
    },

    /// Stop a running service
    Stop {
        /// Show the service's last output after stopping
        #[arg(long)]
        tail: bool,
        /// Wait between escalation signals (INT, TERM, KILL)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
        escalation_interval: Option<Duration>,
        name: String,
    },

    /// Run a program as a new temporary service
    RunOnce {
        /// Service name; defaults to the program's basename
        #[arg(long)]
        name: Option<String>,
        /// Working directory for the service
        #[arg(long)]
        dir: Option<PathBuf>,
        /// Environment entries, passed verbatim
        #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
        /// Remove the service this long after it exits
        #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
        clean_after: Option<Duration>,
        /// Follow the service's output
        #[arg(long)]
        tail: bool,
        /// Program to run
        program: String,
        /// Arguments for the program (after --)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Reload the service definition file
    Reload,

    /// Remove exited temporary services
    Clean {
        /// Only services that exited at least this long ago
        #[arg(long, value_name = "DURATION", value_parser = parse_duration_arg)]
        age: Option<Duration>,
        /// Glob over service names
        pattern: Option<String>,
    },

    /// Show a service's output
    Tail {
        /// Number of lines to start from
        #[arg(short = 'n', long = "lines", default_value_t = 10)]
        lines: usize,
        /// Keep following the current process's output
        #[arg(short = 'f', long = "follow")]
        follow: bool,
        /// Like -f, but keep following across service restarts
        #[arg(short = 'F', long = "follow-restarts")]
        follow_restarts: bool,
        /// Only stdout
        #[arg(long)]
        stdout: bool,
        /// Only stderr
        #[arg(long)]
        stderr: bool,
        /// Restrict output to one process
        #[arg(long)]
        pid: Option<u32>,
        name: String,
    },

    /// Show details about a service
    Info { name: String },

    /// Block until a service stops running
    Wait { name: String },

    /// Print a service's pid
    Pid { name: String },

    /// Stop the server and all services
    Shutdown,

    /// Show client and server versions
    Version,

    /// Run the server (started automatically by clients)
    #[command(hide = true)]
    Init,
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let overrides = Overrides {
        fifo: cli.fifo,
        log: cli.log,
        verbosity: cli.verbose,
    };
    let is_server = matches!(cli.command, Command::Init);
    let settings = Settings::load(&overrides, is_server)?;
    init_tracing(&settings, is_server)?;

    match cli.command {
        Command::Init => run_daemon(settings).await,

        Command::List {
            running,
            temp,
            long,
        } => commands::list(&settings, running, temp, long).await,

        Command::Start { tail, name } => commands::start(&settings, name, tail).await,

        Command::Stop {
            tail,
            escalation_interval,
            name,
        } => commands::stop(&settings, name, escalation_interval, tail).await,

        Command::RunOnce {
            name,
            dir,
            env,
            clean_after,
            tail,
            program,
            args,
        } => {
            commands::run_once(
                &settings,
                RunOnceOpts {
                    name,
                    program,
                    args,
                    dir,
                    env,
                    clean_after,
                    tail,
                },
            )
            .await
        }

        Command::Reload => commands::reload(&settings).await,

        Command::Clean { age, pattern } => commands::clean(&settings, age, pattern).await,

        Command::Tail {
            lines,
            follow,
            follow_restarts,
            stdout,
            stderr,
            pid,
            name,
        } => {
            commands::tail(
                &settings,
                TailOpts {
                    name,
                    lines,
                    follow,
                    follow_restarts,
                    stdout_only: stdout,
                    stderr_only: stderr,
                    pid,
                },
            )
            .await
        }

        Command::Info { name } => commands::info(&settings, name).await,

        Command::Wait { name } => commands::wait(&settings, name).await,

        Command::Pid { name } => commands::pid(&settings, name).await,

        Command::Shutdown => commands::shutdown(&settings).await,

        Command::Version => commands::version(&settings).await,
    }
}

/// The daemon: claim the endpoint, reload the service file, serve until
/// told to stop.
async fn run_daemon(settings: Settings) -> Result<()> {
    let (server, mut updates) = Server::new(settings.clone());

    // The tray UI would consume this stream; without one, keep the channel
    // drained and visible in debug logs.
    tokio::spawn(async move {
        while let Some(info) = updates.recv().await {
            tracing::debug!(
                service = info.name(),
                running = info.running,
                dead = info.dead,
                "service update"
            );
        }
    });

    let listener = server::endpoint::open(&settings.fifo_path)?;

    if let Some(path) = &settings.service_file {
        load_boot_services(&server, path, &settings).await;
    }

    {
        let stop = server.stop_token().clone();
        tokio::spawn(async move {
            if server::endpoint::wait_for_shutdown_signal().await.is_ok() {
                tracing::info!("got interrupt/kill signal");
                stop.cancel();
            }
        });
    }

    server::endpoint::serve(server, listener).await;
    Ok(())
}

/// Loads `services.yml` through the same reconciliation as `reload`.
///
/// A bad file at boot is logged, not fatal; the daemon still has to come up
/// for the client that spawned it.
async fn load_boot_services(server: &Arc<Server>, path: &Path, settings: &Settings) {
    let configs = match config::load_service_file(path, settings.clean_temp_services_after) {
        Ok(configs) => configs,
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "failed to load service file");
            return;
        }
    };

    match server::rpc::reconcile_services(server, configs).await {
        Ok(reply) => tracing::info!(
            new = reply.new_services.len(),
            updated = reply.updated_services.len(),
            "loaded service definitions"
        ),
        Err(err) => {
            tracing::warn!(file = %path.display(), error = %err, "failed to load services")
        }
    }
}

fn init_tracing(config: &Settings, is_server: bool) -> Result<()> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings::tracing_directive(&config.log_level)));

    if is_server && config.log_path != Path::new("-") {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_path)?;
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .try_init();
    } else if is_server {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
    Ok(())
}
