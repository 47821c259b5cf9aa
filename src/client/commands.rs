//! # CLI command runners: thin RPC wrappers plus console rendering.
//!
//! Each function here backs one subcommand: connect, make the call(s),
//! print something a human can read, and let the error path set the exit
//! code. Nothing in this module carries design weight; the daemon does the
//! work.

use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};

use crate::client::Client;
use crate::config::duration::format_duration;
use crate::config::{Settings, Version};
use crate::error::ServerError;
use crate::events::{sort_by_activity, sort_by_name, Info};
use crate::server::rpc::{
    Call, CleanArgs, CleanReply, InfoReply, ListArgs, ListReply, LoadServicesArgs,
    LoadServicesReply, NameArgs, RunArgs, StopArgs, TailArgs, TailReply,
};

/// Options for the `run-once` subcommand.
pub struct RunOnceOpts {
    pub name: Option<String>,
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<std::path::PathBuf>,
    pub env: Vec<(String, String)>,
    pub clean_after: Option<Duration>,
    pub tail: bool,
}

/// Options for the `tail` subcommand.
pub struct TailOpts {
    pub name: String,
    pub lines: usize,
    pub follow: bool,
    pub follow_restarts: bool,
    pub stdout_only: bool,
    pub stderr_only: bool,
    pub pid: Option<u32>,
}

pub async fn list(settings: &Settings, running: bool, temp: bool, long: bool) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: ListReply = client.call(Call::List(ListArgs { running, temp })).await?;

    let mut services = reply.services;
    if long {
        sort_by_name(&mut services);
        for info in &services {
            println!("{}", render_long(info));
        }
    } else {
        sort_by_activity(&mut services);
        for info in &services {
            println!("{}", render_line(info));
        }
    }
    Ok(())
}

pub async fn start(settings: &Settings, name: String, tail: bool) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: InfoReply = client
        .call(Call::Start(NameArgs { name: name.clone() }))
        .await?;
    println!("{}", render_line(&reply.info));

    if tail {
        // From the end of the window onward; the first reply locks onto the
        // process that now owns the stream.
        stream_tail(&mut client, &name, i64::MAX, 0, 0, true, false, true, true).await?;
    }
    Ok(())
}

pub async fn stop(
    settings: &Settings,
    name: String,
    escalation: Option<Duration>,
    tail: bool,
) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: InfoReply = client
        .call(Call::Stop(StopArgs {
            name: name.clone(),
            escalation: escalation.unwrap_or(Duration::ZERO),
        }))
        .await?;
    println!("{}", render_line(&reply.info));

    if tail {
        // One last look at what it said on the way out.
        stream_tail(&mut client, &name, -10, 10, 0, false, false, true, true).await?;
    }
    Ok(())
}

pub async fn run_once(settings: &Settings, opts: RunOnceOpts) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;

    let reply: InfoReply = client
        .call(Call::Run(RunArgs {
            name: opts.name,
            program: opts.program,
            args: opts.args,
            dir: opts.dir.unwrap_or_default(),
            env: opts.env.into_iter().collect(),
            clean_after: opts.clean_after.unwrap_or(Duration::ZERO),
        }))
        .await?;
    println!("{}", render_line(&reply.info));

    if opts.tail {
        let name = reply.info.config.name.clone();
        stream_tail(&mut client, &name, 0, 0, reply.info.pid, true, false, true, true).await?;
    }
    Ok(())
}

pub async fn reload(settings: &Settings) -> Result<()> {
    let path = settings
        .service_file
        .clone()
        .context("no service definition file found (expected ~/.procvisor/services.yml)")?;

    let mut client = Client::connect(settings, true).await?;
    let reply: LoadServicesReply = client
        .call(Call::LoadServices(LoadServicesArgs { path }))
        .await?;

    print_names("New", reply.new_services.iter().map(|i| i.name()));
    print_names("Updated", reply.updated_services.iter().map(|i| i.name()));
    print_names(
        "Deprecated",
        reply.deprecated_services.iter().map(|i| i.name()),
    );
    print_names("Removed", reply.removed_services.iter().map(String::as_str));
    Ok(())
}

pub async fn clean(settings: &Settings, age: Option<Duration>, pattern: Option<String>) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: CleanReply = client
        .call(Call::Clean(CleanArgs {
            pattern: pattern.unwrap_or_default(),
            age: age.unwrap_or(Duration::ZERO),
        }))
        .await?;

    for info in &reply.cleaned {
        println!("Cleaned {}", info.name());
    }
    for failure in &reply.failed {
        eprintln!("Failed to clean {}: {}", failure.info.name(), failure.error);
    }
    if !reply.failed.is_empty() {
        bail!("failed to clean {} service(s)", reply.failed.len());
    }
    Ok(())
}

pub async fn tail(settings: &Settings, opts: TailOpts) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;

    let follow = opts.follow || opts.follow_restarts;
    let show_stdout = !opts.stderr_only;
    let show_stderr = !opts.stdout_only;
    stream_tail(
        &mut client,
        &opts.name,
        -(opts.lines as i64),
        opts.lines,
        opts.pid.unwrap_or(0),
        follow,
        opts.follow_restarts,
        show_stdout,
        show_stderr,
    )
    .await?;
    Ok(())
}

pub async fn info(settings: &Settings, name: String) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: InfoReply = client.call(Call::Info(NameArgs { name })).await?;
    println!("{}", render_long(&reply.info));

    if !reply.info.tail.is_empty() {
        println!("  - recent output:");
        for line in &reply.info.tail {
            println!("      {}", line.text);
        }
    }
    Ok(())
}

pub async fn wait(settings: &Settings, name: String) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: InfoReply = client
        .call(Call::Wait(NameArgs { name: name.clone() }))
        .await?;
    println!("{}", render_line(&reply.info));

    if !reply.info.succeeded {
        bail!("service '{name}' did not succeed");
    }
    Ok(())
}

pub async fn pid(settings: &Settings, name: String) -> Result<()> {
    let mut client = Client::connect(settings, true).await?;
    let reply: InfoReply = client.call(Call::Info(NameArgs { name })).await?;
    println!("{}", reply.info.pid);
    Ok(())
}

pub async fn shutdown(settings: &Settings) -> Result<()> {
    match Client::connect(settings, false).await {
        Ok(mut client) => {
            match client.call::<serde_json::Value>(Call::Exit).await {
                Ok(_) => {}
                // The server may drop the connection while winding down.
                Err(ServerError::ConnectionLost { .. }) => {}
                Err(err) => return Err(err.into()),
            }
            println!("Server shutting down.");
            Ok(())
        }
        Err(ServerError::ConnectFailed { .. }) => {
            println!("No server running.");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn version(settings: &Settings) -> Result<()> {
    println!("client: {}", Version::current());

    match Client::connect(settings, false).await {
        Ok(client) => println!("server: {}", client.server_version),
        Err(ServerError::ConnectFailed { .. }) => println!("server: (not running)"),
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

// ---- Tail plumbing ----

/// Streams tail chunks to the console.
///
/// `pid == 0` with `follow` locks onto whatever process owns the stream at
/// the first response, so a plain `-f` ends when that process does;
/// `across_restarts` keeps the constraint open and never ends on EOF.
#[allow(clippy::too_many_arguments)]
async fn stream_tail(
    client: &mut Client,
    name: &str,
    start_index: i64,
    initial_max: usize,
    pid: u32,
    follow: bool,
    across_restarts: bool,
    show_stdout: bool,
    show_stderr: bool,
) -> Result<(), ServerError> {
    let mut index = start_index;
    let mut pid = pid;
    let mut max_lines = initial_max;

    loop {
        let reply: TailReply = client
            .call(Call::Tail(TailArgs {
                name: name.to_string(),
                pid,
                max_lines,
                index,
                follow,
            }))
            .await?;

        for line in &reply.lines {
            if line.stderr {
                if show_stderr {
                    eprintln!("{}", line.text);
                }
            } else if show_stdout {
                println!("{}", line.text);
            }
        }

        if !follow || (reply.eof && !across_restarts) {
            return Ok(());
        }

        index = reply.next_index as i64;
        max_lines = 0;
        if !across_restarts && pid == 0 {
            pid = reply.next_pid;
        }
    }
}

// ---- Rendering ----

fn ago(t: SystemTime) -> String {
    let elapsed = t.elapsed().unwrap_or_default();
    format!("{} ago", format_duration(Duration::from_secs(elapsed.as_secs())))
}

fn cmd_summary(info: &Info) -> String {
    let base = std::path::Path::new(&info.config.program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| info.config.program.clone());

    let mut cmd = base;
    if !info.config.args.is_empty() {
        cmd = format!("{cmd} {}", info.config.args.join(" "));
    }
    if cmd.chars().count() > 100 {
        cmd = format!("{}…", cmd.chars().take(99).collect::<String>());
    }
    cmd
}

/// One-line summary, list style.
fn render_line(info: &Info) -> String {
    let (bullet, state) = if info.running {
        (
            "⌁",
            format!(
                "started {} pid:{}",
                info.start_time.map(ago).unwrap_or_default(),
                info.pid
            ),
        )
    } else if info.pid == 0 {
        ("●", "unstarted".to_string())
    } else if info.succeeded {
        (
            "✔",
            format!(
                "ended {} pid:{}",
                info.end_time.map(ago).unwrap_or_default(),
                info.pid
            ),
        )
    } else {
        (
            "✘",
            format!(
                "failed {} pid:{}",
                info.end_time.map(ago).unwrap_or_default(),
                info.pid
            ),
        )
    };

    let auto_start = if info.config.auto_start { "↑" } else { " " };
    let restart = if info.config.restart_on_exit { "↺" } else { " " };

    format!(
        "  {bullet} {:<15} {auto_start} {restart}  {state}  cmd:'{}'",
        info.config.name,
        cmd_summary(info)
    )
}

/// Multi-line detail, info style.
fn render_long(info: &Info) -> String {
    let state = if info.running {
        format!("running, pid:{}", info.pid)
    } else {
        "stopped".to_string()
    };

    let start_time = match info.start_time {
        Some(t) => ago(t),
        None => "(hasn't started yet)".to_string(),
    };
    let (exit_time, exit_status) = match info.end_time {
        Some(t) => (
            ago(t),
            if info.succeeded { "succeeded" } else { "failed" }.to_string(),
        ),
        None => ("-".to_string(), "(hasn't exited yet)".to_string()),
    };

    let conf = serde_yaml::to_string(&info.config)
        .unwrap_or_else(|err| format!("(unrenderable: {err})"));
    let conf_indented: String = conf
        .lines()
        .map(|l| format!("      {l}\n"))
        .collect();

    format!(
        "[{}]\n  - state: {}\n  - last exit status: {}\n  - last exit time: {}\n  - last start time: {}\n  - run time: {}\n  - auto-start: {}\n  - restart-on-exit: {}\n  - config:\n{}",
        info.config.name,
        state,
        exit_status,
        exit_time,
        start_time,
        format_duration(info.runtime),
        info.config.auto_start,
        info.config.restart_on_exit,
        conf_indented
    )
}

fn print_names<'a>(label: &str, names: impl Iterator<Item = &'a str>) {
    let joined: Vec<&str> = names.collect();
    if !joined.is_empty() {
        println!("{label}: {}", joined.join(", "));
    }
}
