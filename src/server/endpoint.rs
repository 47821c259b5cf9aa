//! # IPC endpoint: the rendezvous file and the accept loop.
//!
//! The daemon owns a UNIX-domain socket at a configured path. The file
//! doubles as the liveness indicator for single-instance enforcement:
//!
//! - **Open**: a rendezvous file whose mtime is younger than twice the
//!   heartbeat means an active daemon still holds the address; a stale one
//!   (hard crash, SIGKILL) is unlinked and the address reclaimed.
//! - **Heartbeat**: while serving, the daemon touches the file's mtime
//!   every [`HEARTBEAT_INTERVAL`](crate::config::settings::HEARTBEAT_INTERVAL).
//! - **Serve**: one accept loop, one session task per connection. The
//!   accept is raced against the stop token, so `exit` wakes a pending
//!   accept without any self-connection tricks.
//! - **Shutdown**: stop accepting, cancel the heartbeat, stop every
//!   running service concurrently, then unlink the socket file.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use filetime::FileTime;
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;

use crate::config::settings::HEARTBEAT_INTERVAL;
use crate::error::ServerError;
use crate::server::{rpc, Server};

/// Claims the rendezvous file and starts listening.
///
/// Fails with `AnotherInstance` when a live daemon already owns the path.
pub fn open(fifo_path: &Path) -> Result<UnixListener, ServerError> {
    match fs::metadata(fifo_path) {
        Ok(meta) => {
            // A missing or future mtime reads as fresh; only a clearly old
            // file is safe to reclaim.
            let stale = meta
                .modified()
                .ok()
                .and_then(|mtime| mtime.elapsed().ok())
                .map(|age| age >= HEARTBEAT_INTERVAL * 2)
                .unwrap_or(false);
            if !stale {
                return Err(ServerError::AnotherInstance);
            }
            tracing::warn!(path = %fifo_path.display(), "removing stale rendezvous file");
            fs::remove_file(fifo_path)?;
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }

    let listener = UnixListener::bind(fifo_path)?;
    let _ = fs::set_permissions(fifo_path, fs::Permissions::from_mode(0o600));
    tracing::info!(path = %fifo_path.display(), "listening on rendezvous file");
    Ok(listener)
}

/// Touches the rendezvous file's mtime until cancelled, so other instances
/// can recover from our crash or hang.
fn spawn_heartbeat(path: PathBuf, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = filetime::set_file_mtime(&path, FileTime::now()) {
                        tracing::warn!(error = %err, "failed to update rendezvous mod time");
                    }
                }
            }
        }
    });
}

/// Serves RPC connections until the stop token fires, then shuts down
/// gracefully.
pub async fn serve(server: Arc<Server>, listener: UnixListener) {
    let stop = server.stop_token().clone();
    let fifo_path = server.settings().fifo_path.clone();

    // Child of the stop token: cancelling the daemon stops the heartbeat.
    spawn_heartbeat(fifo_path.clone(), stop.child_token());

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                tracing::info!("got request to stop");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, _addr)) => {
                    tracing::debug!("accepted a conn");
                    tokio::spawn(rpc::session(Arc::clone(&server), conn));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept conn");
                }
            }
        }
    }

    server.shutdown_services().await;

    drop(listener);
    match fs::remove_file(&fifo_path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(error = %err, "failed to unlink rendezvous file"),
    }

    tracing::info!("all done");
}

/// Completes when the process receives SIGINT, SIGTERM, or SIGQUIT.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn fresh_rendezvous_file_blocks_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.fifo");
        fs::write(&path, b"").expect("touch");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let _guard = rt.enter();

        assert!(matches!(open(&path), Err(ServerError::AnotherInstance)));
    }

    #[test]
    fn stale_rendezvous_file_is_reclaimed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.fifo");
        fs::write(&path, b"").expect("touch");

        let stale = SystemTime::now() - (HEARTBEAT_INTERVAL * 2 + Duration::from_secs(1));
        filetime::set_file_mtime(&path, FileTime::from_system_time(stale)).expect("set mtime");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        let _guard = rt.enter();

        let listener = open(&path).expect("stale file should be reclaimed");
        drop(listener);
    }
}
