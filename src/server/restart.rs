//! # Restart watcher: relaunch on exit with exponential backoff.
//!
//! One watcher task per service with `restart-on-exit`. The loop waits for
//! the service to exit, pauses, and asks the supervisor to start it again;
//! the pause doubles after each restart up to a ceiling and resets once the
//! service has stayed up quietly for a full ceiling interval.
//!
//! ```text
//! pause := MIN_RESTART_PAUSE
//! loop:
//!   cancel            → exit
//!   quiet for MAX     → pause := MIN_RESTART_PAUSE
//!   service exited    →
//!       cancel        → exit
//!       started again → continue (something else restarted it)
//!       after pause   → pause := min(pause*2, MAX); start it
//! ```
//!
//! ## Rules
//! - Registering a name replaces (cancels) any prior watcher for it.
//! - A user stop unregisters first, so auto-restart stays suppressed until
//!   the next user start.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::server::SupervisorOps;
use crate::service::Service;

/// First pause after an exit.
pub const MIN_RESTART_PAUSE: Duration = Duration::from_millis(500);
/// Backoff ceiling, and the quiet interval that resets the pause.
pub const MAX_RESTART_PAUSE: Duration = Duration::from_secs(60);

/// Doubles a pause, clamped to the ceiling.
fn next_pause(pause: Duration) -> Duration {
    (pause * 2).min(MAX_RESTART_PAUSE)
}

/// The set of restart-watched services.
pub struct RestartWatch {
    watchers: DashMap<String, CancellationToken>,
}

impl RestartWatch {
    pub fn new() -> RestartWatch {
        RestartWatch {
            watchers: DashMap::new(),
        }
    }

    /// True if `name` currently has a watcher.
    pub fn is_watched(&self, name: &str) -> bool {
        self.watchers.contains_key(name)
    }

    /// Starts (or replaces) the watcher for a service.
    pub fn register(&self, name: &str, service: Arc<Service>, ops: Weak<dyn SupervisorOps>) {
        tracing::info!(service = %name, "adding service to restart-watch list");

        let token = CancellationToken::new();
        if let Some(old) = self.watchers.insert(name.to_string(), token.clone()) {
            old.cancel();
        }

        tokio::spawn(watch_loop(name.to_string(), service, ops, token));
    }

    /// Cancels and removes the watcher for a service, if any.
    pub fn unregister(&self, name: &str) {
        if let Some((_, token)) = self.watchers.remove(name) {
            tracing::debug!(service = %name, "removing service from restart-watch list");
            token.cancel();
        }
    }
}

impl Default for RestartWatch {
    fn default() -> Self {
        RestartWatch::new()
    }
}

async fn watch_loop(
    name: String,
    service: Arc<Service>,
    ops: Weak<dyn SupervisorOps>,
    cancel: CancellationToken,
) {
    let mut phase = service.subscribe();
    let mut pause = MIN_RESTART_PAUSE;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(MAX_RESTART_PAUSE) => {
                // It's been up for a while; earn the short pause back.
                if pause != MIN_RESTART_PAUSE {
                    tracing::debug!(service = %name, "resetting restart pause");
                    pause = MIN_RESTART_PAUSE;
                }
            }
            exited_ok = async { phase.wait_for(|p| !p.running).await.is_ok() } => {
                if !exited_ok {
                    break;
                }

                let mut started = service.subscribe();
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    res_ok = async { started.wait_for(|p| p.running).await.is_ok() } => {
                        // Something else restarted it during the pause.
                        if !res_ok {
                            break;
                        }
                    }
                    _ = sleep(pause) => {
                        pause = next_pause(pause);
                        let Some(ops) = ops.upgrade() else { break };
                        match ops.start_service(&name).await {
                            Ok(()) => tracing::debug!(service = %name, "restarted service"),
                            Err(err) => tracing::warn!(
                                service = %name,
                                pause_before_next_restart = ?pause,
                                error = %err,
                                "failed to restart service"
                            ),
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(service = %name, "ending restart-watch for service");
}
