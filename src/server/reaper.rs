//! # Temp-service reaper: garbage-collect exited temp services.
//!
//! The reaper rides the event bus inline (see [`crate::events::BusPump`]).
//! For each temp service it keeps at most one pending removal:
//!
//! - any snapshot for a temp service cancels the pending removal, if one is
//!   armed (the service was started, or otherwise changed);
//! - a snapshot showing "exited, not yet dead" arms a new removal that
//!   fires after the service's `clean-after` grace.
//!
//! A `clean-after` of zero means "remove immediately upon exit".

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::events::Info;
use crate::server::SupervisorOps;

/// Watches bus snapshots and schedules temp-service removal.
pub struct Reaper {
    pending: DashMap<String, CancellationToken>,
    ops: Weak<dyn SupervisorOps>,
}

impl Reaper {
    pub fn new(ops: Weak<dyn SupervisorOps>) -> Arc<Reaper> {
        Arc::new(Reaper {
            pending: DashMap::new(),
            ops,
        })
    }

    /// Feeds one snapshot through the reaper.
    pub fn observe(&self, info: &Info) {
        if !info.config.temp {
            return;
        }

        // Any change on a temp service aborts the pending removal.
        if let Some((_, token)) = self.pending.remove(info.name()) {
            token.cancel();
        }

        if info.dead || info.running || info.end_time.is_none() {
            return;
        }

        let token = CancellationToken::new();
        self.pending
            .insert(info.name().to_string(), token.clone());

        let name = info.name().to_string();
        let grace = info.config.clean_after;
        let ops = self.ops.clone();
        tracing::debug!(service = %name, clean_after = ?grace, "watching for service death");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(grace) => {
                    let Some(ops) = ops.upgrade() else { return };
                    tracing::info!(service = %name, "auto-cleaning service after timeout");
                    if let Err(err) = ops.remove_service(&name).await {
                        tracing::warn!(service = %name, error = %err, "failed to auto-clean service");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::{Duration, SystemTime};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::config::ServiceConfig;
    use crate::error::ServerError;

    #[derive(Default)]
    struct StubOps {
        removed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SupervisorOps for StubOps {
        async fn start_service(&self, _name: &str) -> Result<(), ServerError> {
            Ok(())
        }

        async fn remove_service(&self, name: &str) -> Result<(), ServerError> {
            self.removed.lock().await.push(name.to_string());
            Ok(())
        }

        fn publish(&self, _info: Info) {}
    }

    fn temp_info(name: &str, running: bool, exited: bool, grace: Duration) -> Info {
        Info {
            config: ServiceConfig {
                name: name.to_string(),
                program: "true".to_string(),
                args: Vec::new(),
                dir: "/".into(),
                env: BTreeMap::new(),
                auto_start: false,
                restart_on_exit: false,
                temp: true,
                clean_after: grace,
            },
            running,
            pid: 1,
            succeeded: !running,
            dead: false,
            start_time: Some(SystemTime::now()),
            end_time: if exited { Some(SystemTime::now()) } else { None },
            runtime: Duration::ZERO,
            tail: Vec::new(),
        }
    }

    #[tokio::test]
    async fn exited_temp_service_is_removed_after_grace() {
        let ops = Arc::new(StubOps::default());
        let dyn_ops: Arc<dyn SupervisorOps> = ops.clone();
        let weak: Weak<dyn SupervisorOps> = Arc::downgrade(&dyn_ops);
        let reaper = Reaper::new(weak);

        reaper.observe(&temp_info("short-lived", false, true, Duration::from_millis(50)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(*ops.removed.lock().await, vec!["short-lived".to_string()]);
    }

    #[tokio::test]
    async fn new_event_cancels_pending_removal() {
        let ops = Arc::new(StubOps::default());
        let dyn_ops: Arc<dyn SupervisorOps> = ops.clone();
        let weak: Weak<dyn SupervisorOps> = Arc::downgrade(&dyn_ops);
        let reaper = Reaper::new(weak);

        reaper.observe(&temp_info("revived", false, true, Duration::from_millis(200)));
        // A restart arrives before the grace expires.
        reaper.observe(&temp_info("revived", true, false, Duration::from_millis(200)));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(ops.removed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn permanent_services_are_ignored() {
        let ops = Arc::new(StubOps::default());
        let dyn_ops: Arc<dyn SupervisorOps> = ops.clone();
        let weak: Weak<dyn SupervisorOps> = Arc::downgrade(&dyn_ops);
        let reaper = Reaper::new(weak);

        let mut info = temp_info("perm", false, true, Duration::ZERO);
        info.config.temp = false;
        reaper.observe(&info);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ops.removed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn zero_grace_removes_immediately_on_exit() {
        let ops = Arc::new(StubOps::default());
        let dyn_ops: Arc<dyn SupervisorOps> = ops.clone();
        let weak: Weak<dyn SupervisorOps> = Arc::downgrade(&dyn_ops);
        let reaper = Reaper::new(weak);

        reaper.observe(&temp_info("ephemeral", false, true, Duration::ZERO));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*ops.removed.lock().await, vec!["ephemeral".to_string()]);
    }
}
