//! # Info snapshots: the observable state of one service.
//!
//! An [`Info`] is a flat, copyable projection of a service's config plus its
//! runtime state and a short output tail. Every event on the bus is a full
//! snapshot, never a delta: the bounded fan-out may drop intermediate
//! events, so consumers reconcile by keying on `name`.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};

use crate::config::ServiceConfig;
use crate::service::OutputLine;

/// Number of recent output lines attached to each snapshot.
pub const INFO_TAIL_LINES: usize = 5;

/// A point-in-time description of a service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    pub config: ServiceConfig,

    pub running: bool,
    #[serde(default)]
    pub pid: u32,
    /// True once the service has stopped in a way the user would call
    /// success: a clean exit of a non-restarting service, or a user stop.
    #[serde(default)]
    pub succeeded: bool,
    /// Set on the final snapshot published when a service is removed.
    #[serde(default)]
    pub dead: bool,

    #[serde(default)]
    pub start_time: Option<SystemTime>,
    #[serde(default)]
    pub end_time: Option<SystemTime>,
    /// Time running so far, or the length of the last run.
    #[serde(default, with = "crate::config::duration::serde_compact")]
    pub runtime: Duration,

    /// Up to [`INFO_TAIL_LINES`] most-recent output lines.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tail: Vec<OutputLine>,
}

impl Info {
    /// Service name shorthand.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// True if the service has exited (as opposed to never started).
    pub fn exited(&self) -> bool {
        !self.running && self.end_time.is_some()
    }
}

/// Sorts snapshots by activity: running services first, most recently
/// started on top; then stopped ones, most recently exited on top.
pub fn sort_by_activity(infos: &mut [Info]) {
    infos.sort_by(|a, b| {
        match (a.running, b.running) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            (true, true) => b.start_time.cmp(&a.start_time),
            (false, false) => b.end_time.cmp(&a.end_time),
        }
    });
}

/// Sorts snapshots by service name.
pub fn sort_by_name(infos: &mut [Info]) {
    infos.sort_by(|a, b| a.config.name.cmp(&b.config.name));
}
