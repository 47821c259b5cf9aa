//! # Server: the daemon's registry of services and its callbacks.
//!
//! [`Server`] owns the name→service map, the event bus, and the
//! restart-watch set, and implements [`SupervisorOps`] — the narrow
//! interface the watchers (restart, reaper) use to call back in without
//! holding real back-pointers.
//!
//! ## Architecture
//! ```text
//! clients ──► endpoint (accept) ──► rpc session ──► Server
//!                                                     │
//!            Service ──► Bus ──► pump ──┬──► updates_out (UI consumer)
//!                                       └──► Reaper ──► SupervisorOps::remove
//!            RestartWatch ─────────────────────────────► SupervisorOps::start
//! ```
//!
//! ## Rules
//! - The registry lock is never held across a service stop or start.
//! - Removing a service stops it first, then unlinks it, then publishes a
//!   final snapshot with `dead = true`.
//! - A user stop suppresses auto-restart until the next user start.

pub mod endpoint;
mod reaper;
mod restart;
pub mod rpc;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::error::ServerError;
use crate::events::{Bus, Info};
use crate::service::Service;

pub use reaper::Reaper;
pub use restart::{RestartWatch, MAX_RESTART_PAUSE, MIN_RESTART_PAUSE};

/// The callbacks watchers need from the daemon.
///
/// Passing this (weakly) to each watcher at construction avoids reference
/// cycles and makes the watchers trivial to stub in tests.
#[async_trait]
pub trait SupervisorOps: Send + Sync {
    /// Starts a registered service by name, registering its restart
    /// watcher when configured.
    async fn start_service(&self, name: &str) -> Result<(), ServerError>;

    /// Stops (if needed) and removes a service by name. Idempotent.
    async fn remove_service(&self, name: &str) -> Result<(), ServerError>;

    /// Publishes a snapshot to the event bus, best-effort.
    fn publish(&self, info: Info);
}

/// The backend that manages services.
pub struct Server {
    me: Weak<Server>,
    settings: Settings,
    services: RwLock<HashMap<String, Arc<Service>>>,
    bus: Bus,
    restarts: RestartWatch,
    stop: CancellationToken,
}

impl Server {
    /// Creates the server and wires the bus pump to the temp-service
    /// reaper. Returns the outward updates channel for the UI consumer.
    pub fn new(settings: Settings) -> (Arc<Server>, mpsc::Receiver<Info>) {
        let (bus, pump, updates) = Bus::new();

        let server = Arc::new_cyclic(|me| Server {
            me: me.clone(),
            settings,
            services: RwLock::new(HashMap::new()),
            bus,
            restarts: RestartWatch::new(),
            stop: CancellationToken::new(),
        });

        let ops: Weak<dyn SupervisorOps> = server.me.clone();
        let reaper = Reaper::new(ops);
        pump.spawn(move |info| reaper.observe(info));

        (server, updates)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Cancelled when the daemon should stop serving.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn restarts(&self) -> &RestartWatch {
        &self.restarts
    }

    fn ops(&self) -> Weak<dyn SupervisorOps> {
        self.me.clone()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn list(&self) -> Vec<Arc<Service>> {
        self.services.read().await.values().cloned().collect()
    }

    /// Adds a service to the registry.
    ///
    /// Fails if the name is taken and `replace` is false, or if the current
    /// holder is running. Publishes one snapshot and kicks off an async
    /// start when the config says `auto-start`.
    pub async fn add(&self, service: Arc<Service>, replace: bool) -> Result<(), ServerError> {
        let conf = service.config().await;
        let name = conf.name.clone();

        {
            let mut map = self.services.write().await;
            if let Some(current) = map.get(&name) {
                if !replace {
                    return Err(ServerError::AlreadyExists { name });
                }
                if current.running() {
                    return Err(ServerError::CannotReplaceRunning { name });
                }
            }
            map.insert(name.clone(), Arc::clone(&service));
        }

        self.bus.publish(service.info().await);

        if conf.auto_start {
            let ops = self.ops();
            tokio::spawn(async move {
                let Some(ops) = ops.upgrade() else { return };
                if let Err(err) = ops.start_service(&name).await {
                    tracing::warn!(service = %name, error = %err, "failed to auto-start service");
                }
            });
        }

        Ok(())
    }

    /// Stops, unlinks, and announces the death of a service.
    ///
    /// Absent names are a successful no-op. A failed stop aborts the
    /// removal.
    pub async fn remove(&self, name: &str) -> Result<(), ServerError> {
        let Some(service) = self.get(name).await else {
            return Ok(());
        };

        // The watcher must not resurrect the service mid-removal.
        self.restarts.unregister(name);

        service.stop(Duration::ZERO).await?;

        self.services.write().await.remove(name);

        let mut info = service.info().await;
        info.dead = true;
        self.bus.publish(info);

        Ok(())
    }

    /// Mutates a service's temp/clean-after in place.
    ///
    /// Returns false for unknown names.
    pub async fn change_permanence(
        &self,
        name: &str,
        temp: bool,
        clean_after: Duration,
    ) -> bool {
        let Some(service) = self.get(name).await else {
            return false;
        };
        service.set_permanence(temp, clean_after).await;
        true
    }

    /// Start semantics of the RPC surface: start the instance and, when
    /// configured, put it under the restart watcher.
    pub async fn start_registered(&self, name: &str) -> Result<Arc<Service>, ServerError> {
        let service = self.get(name).await.ok_or_else(|| ServerError::NotFound {
            name: name.to_string(),
        })?;

        service.start(&self.bus).await?;

        if service.config().await.restart_on_exit {
            self.restarts.register(name, Arc::clone(&service), self.ops());
        }

        Ok(service)
    }

    /// Stop semantics of the RPC surface: a user stop unregisters the
    /// restart watcher first, so the service stays down.
    pub async fn stop_registered(
        &self,
        name: &str,
        escalation: Duration,
    ) -> Result<Arc<Service>, ServerError> {
        let service = self.get(name).await.ok_or_else(|| ServerError::NotFound {
            name: name.to_string(),
        })?;

        if service.config().await.restart_on_exit {
            self.restarts.unregister(name);
        }

        tracing::info!(service = name, "stopping service");
        service.stop(escalation).await?;
        Ok(service)
    }

    /// Rebinds or clears the restart watcher for a replaced instance, so a
    /// watcher never keeps driving a service that left the registry.
    pub(crate) fn sync_restart_watch(&self, name: &str, service: &Arc<Service>, watch: bool) {
        if !self.restarts.is_watched(name) {
            return;
        }
        if watch {
            self.restarts.register(name, Arc::clone(service), self.ops());
        } else {
            self.restarts.unregister(name);
        }
    }

    /// Registers the restart watcher for a running service whose config
    /// just turned `restart-on-exit` on.
    pub(crate) fn watch_for_restart(&self, name: &str, service: &Arc<Service>) {
        self.restarts.register(name, Arc::clone(service), self.ops());
    }

    /// Concurrently stops every running service and waits for all of them.
    pub async fn shutdown_services(&self) {
        let mut set = JoinSet::new();

        for service in self.list().await {
            if !service.running() {
                continue;
            }
            let name = service.config().await.name;
            self.restarts.unregister(&name);
            set.spawn(async move {
                if let Err(err) = service.stop(Duration::ZERO).await {
                    tracing::warn!(
                        service = %name,
                        error = %err,
                        "failed to stop service during shutdown"
                    );
                }
            });
        }

        while set.join_next().await.is_some() {}
    }
}

#[async_trait]
impl SupervisorOps for Server {
    async fn start_service(&self, name: &str) -> Result<(), ServerError> {
        self.start_registered(name).await.map(|_| ())
    }

    async fn remove_service(&self, name: &str) -> Result<(), ServerError> {
        self.remove(name).await
    }

    fn publish(&self, info: Info) {
        self.bus.publish(info);
    }
}
