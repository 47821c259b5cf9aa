//! # Client: short-lived RPC caller, with daemon autostart.
//!
//! Connecting is a rendezvous dance:
//!
//! 1. If the rendezvous file exists, dial it.
//! 2. Otherwise (or when the dial fails) re-execute our own binary with the
//!    hidden `init` subcommand in a fresh process group, echo its early
//!    stdout/stderr prefixed `Server:` until it detaches, and poll-connect
//!    every 500 ms up to a 5 s deadline.
//! 3. On connect, immediately exchange versions and refuse a server that's
//!    too far away (see [`crate::config::version`]).

pub mod commands;

use std::path::Path;
use std::process::Stdio;

use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, Duration, Instant};

use crate::config::{Compatibility, Settings, Version};
use crate::error::ServerError;
use crate::server::rpc::{Call, Request, Response, VersionReply};

/// How often to re-dial while a freshly spawned daemon boots.
const CONNECT_POLL: Duration = Duration::from_millis(500);
/// Give up dialing after this long.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// An RPC connection to the daemon.
pub struct Client {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    next_id: u64,
    /// Reported by the server right after connect.
    pub server_version: Version,
}

impl Client {
    /// Connects to the daemon; optionally boots one if none is reachable.
    pub async fn connect(settings: &Settings, start_server: bool) -> Result<Client, ServerError> {
        let fifo = &settings.fifo_path;

        if fifo_exists(fifo) {
            match UnixStream::connect(fifo).await {
                Ok(stream) => return Client::handshake(stream).await,
                Err(err) => tracing::debug!(error = %err, "error connecting to server"),
            }
        }

        if !start_server {
            return Err(ServerError::ConnectFailed {
                reason: "no server running".to_string(),
            });
        }

        spawn_daemon(settings)?;

        let deadline = Instant::now() + CONNECT_TIMEOUT;
        loop {
            sleep(CONNECT_POLL).await;
            if Instant::now() >= deadline {
                return Err(ServerError::ConnectFailed {
                    reason: "timed out".to_string(),
                });
            }

            if !fifo_exists(fifo) {
                continue;
            }
            match UnixStream::connect(fifo).await {
                Ok(stream) => return Client::handshake(stream).await,
                Err(err) => tracing::debug!(error = %err, "error connecting to server"),
            }
        }
    }

    async fn handshake(stream: UnixStream) -> Result<Client, ServerError> {
        let (read_half, write_half) = stream.into_split();
        let mut client = Client {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
            next_id: 0,
            server_version: Version::current(),
        };

        let reply: VersionReply = client.call(Call::Version).await?;
        client.server_version = reply.version;

        let mine = Version::current();
        match mine.compatibility(&client.server_version) {
            Compatibility::Incompatible => Err(ServerError::VersionIncompatible {
                client: mine.to_string(),
                server: client.server_version.to_string(),
            }),
            Compatibility::PatchSkew => {
                if mine.release_cmp(&client.server_version) == std::cmp::Ordering::Less {
                    eprintln!(
                        "Note: client version ({mine}) is behind server version ({}). Upgrade client.",
                        client.server_version
                    );
                } else {
                    eprintln!(
                        "Note: client version ({mine}) is ahead of server version ({}). Update server by restarting it.",
                        client.server_version
                    );
                }
                Ok(client)
            }
            Compatibility::Ok => Ok(client),
        }
    }

    /// One request, one response.
    ///
    /// EOF mid-call surfaces as `ConnectionLost` naming the method.
    pub async fn call<R: DeserializeOwned>(&mut self, call: Call) -> Result<R, ServerError> {
        let method = call.name();
        self.next_id += 1;
        let request = Request {
            id: self.next_id,
            call,
        };

        let mut payload = serde_json::to_string(&request)
            .map_err(|err| ServerError::Config(format!("failed to encode request: {err}")))?;
        payload.push('\n');

        if self.writer.write_all(payload.as_bytes()).await.is_err() {
            return Err(ServerError::ConnectionLost {
                method: method.to_string(),
            });
        }

        match self.lines.next_line().await {
            Ok(Some(line)) => {
                let response: Response = serde_json::from_str(&line)
                    .map_err(|err| ServerError::Config(format!("bad response: {err}")))?;
                if response.ok {
                    serde_json::from_value(response.data.unwrap_or(serde_json::Value::Null))
                        .map_err(|err| {
                            ServerError::Config(format!("bad reply payload: {err}"))
                        })
                } else {
                    Err(ServerError::Remote(
                        response
                            .error
                            .unwrap_or_else(|| "unknown server error".to_string()),
                    ))
                }
            }
            Ok(None) | Err(_) => Err(ServerError::ConnectionLost {
                method: method.to_string(),
            }),
        }
    }
}

fn fifo_exists(path: &Path) -> bool {
    std::fs::metadata(path).is_ok()
}

/// Boots a daemon by re-executing our own binary with `init`.
///
/// The daemon goes into its own process group so interrupts aimed at this
/// client don't reach it. Its early output is echoed until it detaches.
fn spawn_daemon(settings: &Settings) -> Result<(), ServerError> {
    let exe = std::env::current_exe()?;
    tracing::debug!(exe = %exe.display(), "server might not be running, starting one");

    let mut cmd = tokio::process::Command::new(exe);
    cmd.arg("--fifo")
        .arg(&settings.fifo_path)
        .arg("--log")
        .arg(&settings.log_path)
        .arg("init")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    unsafe {
        cmd.pre_exec(|| {
            let _ = libc::setpgid(0, 0);
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(echo_server_output(stdout, false));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(echo_server_output(stderr, true));
    }
    // Reap if it exits early; a healthy daemon outlives this client.
    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    Ok(())
}

async fn echo_server_output<R>(reader: R, to_stderr: bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if to_stderr {
            eprintln!("Server: {line}");
        } else {
            println!("Server: {line}");
        }
    }
}
